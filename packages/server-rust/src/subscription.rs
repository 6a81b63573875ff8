//! Subscription lookup consumed by `publish`.
//!
//! Persistence of subscriptions belongs to the implementation; the engine
//! only asks which queues want a given message type.

use dashmap::DashMap;

/// Answers which queue URIs subscribe to a message type.
pub trait SubscriptionService: Send + Sync {
    fn get_subscribed_uris(&self, message_type: &str) -> Vec<String>;
}

/// Subscription service with no subscribers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSubscriptionService;

impl SubscriptionService for NullSubscriptionService {
    fn get_subscribed_uris(&self, _message_type: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Process-local subscription list, keyed by full message type name.
#[derive(Debug, Default)]
pub struct MemorySubscriptionService {
    subscribers: DashMap<String, Vec<String>>,
}

impl MemorySubscriptionService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `uri` as a subscriber of `message_type`; repeated calls are no-ops.
    pub fn subscribe(&self, message_type: &str, uri: &str) {
        let mut entry = self.subscribers.entry(message_type.to_string()).or_default();
        if !entry.iter().any(|existing| existing == uri) {
            entry.push(uri.to_string());
        }
    }

    pub fn unsubscribe(&self, message_type: &str, uri: &str) {
        if let Some(mut entry) = self.subscribers.get_mut(message_type) {
            entry.retain(|existing| existing != uri);
        }
    }
}

impl SubscriptionService for MemorySubscriptionService {
    fn get_subscribed_uris(&self, message_type: &str) -> Vec<String> {
        let (type_name, _) = relaybus_core::message::split_type_name(message_type);
        self.subscribers
            .get(type_name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_service_has_no_subscribers() {
        assert!(NullSubscriptionService
            .get_subscribed_uris("Orders.OrderPlaced")
            .is_empty());
    }

    #[test]
    fn memory_service_deduplicates_subscribers() {
        let service = MemorySubscriptionService::new();
        service.subscribe("Orders.OrderPlaced", "memory://billing");
        service.subscribe("Orders.OrderPlaced", "memory://billing");
        service.subscribe("Orders.OrderPlaced", "memory://shipping");

        assert_eq!(
            service.get_subscribed_uris("Orders.OrderPlaced, Orders.Messages"),
            vec!["memory://billing", "memory://shipping"]
        );

        service.unsubscribe("Orders.OrderPlaced", "memory://billing");
        assert_eq!(
            service.get_subscribed_uris("Orders.OrderPlaced"),
            vec!["memory://shipping"]
        );
    }
}
