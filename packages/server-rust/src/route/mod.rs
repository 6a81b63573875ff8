//! Message routing: which destination queue an outbound message type goes to.
//!
//! - [`MessageRoute`]: a destination queue plus the specifications selecting it
//! - [`MessageRouteTable`]: ordered routes with first-match resolution

pub mod table;

use std::fmt;
use std::sync::Arc;

use relaybus_core::{Queue, QueueUri, Specification};

pub use table::MessageRouteTable;

/// A destination queue and the specifications that select it.
///
/// A route is satisfied when any one of its specifications is; a route with
/// no specifications matches nothing.
#[derive(Clone)]
pub struct MessageRoute {
    queue: Arc<dyn Queue>,
    specifications: Vec<Specification>,
}

impl MessageRoute {
    #[must_use]
    pub fn new(queue: Arc<dyn Queue>) -> Self {
        Self {
            queue,
            specifications: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_specification(mut self, specification: Specification) -> Self {
        self.specifications.push(specification);
        self
    }

    /// Appends a specification. Specifications are never removed or replaced.
    pub fn add_specification(&mut self, specification: Specification) {
        self.specifications.push(specification);
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    #[must_use]
    pub fn uri(&self) -> &QueueUri {
        self.queue.uri()
    }

    #[must_use]
    pub fn specifications(&self) -> &[Specification] {
        &self.specifications
    }

    #[must_use]
    pub fn is_satisfied_by(&self, message_type: &str) -> bool {
        self.specifications
            .iter()
            .any(|s| s.is_satisfied_by(message_type))
    }
}

impl fmt::Debug for MessageRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRoute")
            .field("uri", &self.uri().as_str())
            .field("specifications", &self.specifications)
            .finish()
    }
}
