//! Ordered route table with first-match resolution.

use parking_lot::RwLock;
use relaybus_core::{ConfigurationError, QueueResolver, QueueUri, Specification, SpecificationFactory};

use super::MessageRoute;
use crate::config::MessageRouteSettings;

/// Routes in insertion order; at most one route per destination URI.
///
/// Resolution is first-match: [`get_route_uris`](Self::get_route_uris)
/// returns the URI of the earliest route satisfied by the message type and
/// never more than one URI, even when later routes also match. Fan-out to
/// several destinations is what publish/subscribe is for.
///
/// Mutation only happens through [`add`](Self::add) and
/// [`import`](Self::import); readers get snapshots.
#[derive(Debug, Default)]
pub struct MessageRouteTable {
    routes: RwLock<Vec<MessageRoute>>,
}

impl MessageRouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from configured route mappings.
    ///
    /// # Errors
    ///
    /// Fails on the first unresolvable URI or invalid specification.
    pub fn from_settings(
        mappings: &[MessageRouteSettings],
        resolver: &dyn QueueResolver,
        factory: &SpecificationFactory,
    ) -> Result<Self, ConfigurationError> {
        let table = Self::new();
        table.import(mappings, resolver, factory)?;
        Ok(table)
    }

    /// Merges configured route mappings into the table.
    ///
    /// Every mapping is resolved and every specification built before the
    /// table is touched, so a failing import leaves the table unchanged.
    /// Importing the same mappings twice never duplicates a route.
    ///
    /// # Errors
    ///
    /// Fails on the first unresolvable URI or invalid specification.
    pub fn import(
        &self,
        mappings: &[MessageRouteSettings],
        resolver: &dyn QueueResolver,
        factory: &SpecificationFactory,
    ) -> Result<(), ConfigurationError> {
        let mut resolved = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let queue = resolver.get_queue(&mapping.uri)?;
            let specifications = mapping
                .specifications
                .iter()
                .map(|s| factory.create(&s.name, &s.value))
                .collect::<Result<Vec<Specification>, _>>()?;
            resolved.push((queue, specifications));
        }

        for (queue, specifications) in resolved {
            let mut route = MessageRoute::new(queue);
            for specification in specifications {
                route.add_specification(specification);
            }
            tracing::debug!(
                uri = %route.uri(),
                specifications = route.specifications().len(),
                "route imported"
            );
            self.add(route);
        }
        Ok(())
    }

    /// URI of the first route satisfied by `message_type`, or empty.
    #[must_use]
    pub fn get_route_uris(&self, message_type: &str) -> Vec<String> {
        self.routes
            .read()
            .iter()
            .find(|route| route.is_satisfied_by(message_type))
            .map(|route| vec![route.uri().to_string()])
            .unwrap_or_default()
    }

    /// First route satisfied by `message_type`.
    #[must_use]
    pub fn resolve(&self, message_type: &str) -> Option<MessageRoute> {
        self.routes
            .read()
            .iter()
            .find(|route| route.is_satisfied_by(message_type))
            .cloned()
    }

    /// Appends `route`, or merges its specifications into the existing route
    /// for the same destination URI.
    pub fn add(&self, route: MessageRoute) {
        let mut routes = self.routes.write();
        if let Some(existing) = routes.iter_mut().find(|r| r.uri() == route.uri()) {
            for specification in route.specifications() {
                existing.add_specification(specification.clone());
            }
        } else {
            routes.push(route);
        }
    }

    /// Route for exactly `uri`, if any. Malformed URIs find nothing.
    #[must_use]
    pub fn find(&self, uri: &str) -> Option<MessageRoute> {
        let uri = QueueUri::parse(uri).ok()?;
        self.routes.read().iter().find(|r| *r.uri() == uri).cloned()
    }

    #[must_use]
    pub fn any(&self) -> bool {
        !self.routes.read().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.any()
    }

    /// Read-only snapshot of all routes in table order.
    #[must_use]
    pub fn routes(&self) -> Vec<MessageRoute> {
        self.routes.read().clone()
    }
}
