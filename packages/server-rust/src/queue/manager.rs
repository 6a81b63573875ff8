//! Scheme-keyed queue factories and the shared URI -> queue cache.

use std::sync::Arc;

use dashmap::DashMap;
use relaybus_core::{
    ConfigurationError, Queue, QueueError, QueueFactory, QueueResolver, QueueUri,
};

use super::memory::MemoryQueueFactory;

/// Resolves queue URIs to live queues, one shared handle per URI.
///
/// Factories are looked up by the URI's scheme. Created queues are cached so
/// routes, inboxes, and the outbox dispatcher all talk to the same instance.
pub struct QueueManager {
    factories: DashMap<String, Arc<dyn QueueFactory>>,
    queues: DashMap<QueueUri, Arc<dyn Queue>>,
}

impl QueueManager {
    /// Creates a manager with no factories.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
            queues: DashMap::new(),
        }
    }

    /// Creates a manager serving the `memory://` scheme.
    #[must_use]
    pub fn with_memory() -> Self {
        let manager = Self::new();
        manager.register_factory(Arc::new(MemoryQueueFactory));
        manager
    }

    /// Registers a factory, replacing any previous one for the same scheme.
    pub fn register_factory(&self, factory: Arc<dyn QueueFactory>) {
        self.factories
            .insert(factory.scheme().to_ascii_lowercase(), factory);
    }

    /// Registers an already-built queue under its own URI.
    pub fn register_queue(&self, queue: Arc<dyn Queue>) {
        self.queues.insert(queue.uri().clone(), queue);
    }

    /// Returns `true` if a queue with this URI is cached.
    #[must_use]
    pub fn contains(&self, uri: &QueueUri) -> bool {
        self.queues.contains_key(uri)
    }

    /// Returns `true` if a factory serves `scheme`.
    #[must_use]
    pub fn supports_scheme(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    /// Schemes with a registered factory, sorted.
    #[must_use]
    pub fn supported_schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Number of queues created or registered so far.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Disposes every cached queue and forgets it.
    ///
    /// A failing queue does not stop the others from being released; all
    /// failures are logged and returned.
    pub fn dispose_all(&self) -> Vec<QueueError> {
        let queues: Vec<Arc<dyn Queue>> = self.queues.iter().map(|e| e.value().clone()).collect();
        self.queues.clear();

        let mut failures = Vec::new();
        for queue in queues {
            if let Err(e) = queue.dispose() {
                tracing::error!(queue = %queue.uri(), error = %e, "failed to dispose queue");
                failures.push(e);
            }
        }
        failures
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueResolver for QueueManager {
    fn get_queue(&self, uri: &str) -> Result<Arc<dyn Queue>, ConfigurationError> {
        let uri = QueueUri::parse(uri)?;

        if let Some(existing) = self.queues.get(&uri) {
            return Ok(existing.value().clone());
        }

        let factory = self
            .factories
            .get(&uri.scheme().to_ascii_lowercase())
            .map(|f| f.value().clone())
            .ok_or_else(|| ConfigurationError::UnsupportedScheme {
                scheme: uri.scheme().to_string(),
                uri: uri.to_string(),
                supported: self.supported_schemes(),
            })?;

        let entry = self
            .queues
            .entry(uri.clone())
            .or_try_insert_with(|| factory.create(&uri))?;
        tracing::debug!(queue = %uri, "queue resolved");
        Ok(entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relaybus_core::TransportMessage;

    use super::*;

    #[test]
    fn same_uri_resolves_to_same_queue() {
        let manager = QueueManager::with_memory();
        let a = manager.get_queue("memory://orders").unwrap();
        let b = manager.get_queue("MEMORY://orders").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.queue_count(), 1);

        a.enqueue(TransportMessage::new("T", Vec::new(), 0)).unwrap();
        assert!(b.get_message(Duration::ZERO).unwrap().is_some());
    }

    #[test]
    fn unknown_scheme_is_unsupported() {
        let manager = QueueManager::with_memory();
        let err = manager.get_queue("rabbitmq://localhost/orders").err().unwrap();
        assert!(matches!(
            err,
            ConfigurationError::UnsupportedScheme { ref scheme, ref supported, .. }
                if scheme == "rabbitmq" && *supported == ["memory"]
        ));
        assert!(err.to_string().contains("supported schemes: [memory]"));
    }

    #[test]
    fn supported_schemes_are_sorted_and_lowercase() {
        let manager = QueueManager::new();
        assert!(manager.supported_schemes().is_empty());
        manager.register_factory(Arc::new(MemoryQueueFactory));
        assert_eq!(manager.supported_schemes(), vec!["memory".to_string()]);
        assert!(manager.supports_scheme("MEMORY"));
    }

    #[test]
    fn malformed_uri_is_invalid() {
        let manager = QueueManager::with_memory();
        let err = manager.get_queue("not a uri").err().unwrap();
        assert!(matches!(err, ConfigurationError::InvalidUri { .. }));
    }

    #[test]
    fn registered_queue_is_returned() {
        let manager = QueueManager::new();
        let queue: Arc<dyn Queue> = Arc::new(super::super::memory::MemoryQueue::new(
            QueueUri::parse("custom://x").unwrap(),
        ));
        manager.register_queue(queue.clone());
        let resolved = manager.get_queue("custom://x").unwrap();
        assert!(Arc::ptr_eq(&queue, &resolved));
    }

    #[test]
    fn dispose_all_releases_queues() {
        let manager = QueueManager::with_memory();
        let queue = manager.get_queue("memory://orders").unwrap();
        assert!(manager.dispose_all().is_empty());
        assert_eq!(manager.queue_count(), 0);
        assert!(queue
            .enqueue(TransportMessage::new("T", Vec::new(), 0))
            .is_err());
    }
}
