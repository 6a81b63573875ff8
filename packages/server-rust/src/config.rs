//! Bus configuration: the raw settings shape and its resolved form.
//!
//! [`ServiceBusSettings`] is plain data (deserializable from JSON) naming
//! queues by URI. [`ServiceBusConfiguration`] is the same information with
//! every URI resolved to a live queue; it is immutable once the bus starts.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use relaybus_core::{ConfigurationError, Queue, QueueResolver};
use serde::{Deserialize, Serialize};

const DEFAULT_THREAD_COUNT: usize = 5;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 250;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 5_000;

fn default_thread_count() -> usize {
    DEFAULT_THREAD_COUNT
}

fn default_outbox_thread_count() -> usize {
    1
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_stop_timeout_ms() -> u64 {
    DEFAULT_STOP_TIMEOUT_MS
}

fn required<'a>(value: &'a str, key: &str) -> Result<&'a str, ConfigurationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigurationError::MissingSetting {
            key: key.to_string(),
        });
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Settings (raw shape)
// ---------------------------------------------------------------------------

/// Top-level settings as read from a configuration source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBusSettings {
    #[serde(default)]
    pub inbox: Option<InboxSettings>,
    #[serde(default)]
    pub outbox: Option<OutboxSettings>,
    #[serde(default)]
    pub message_routes: Vec<MessageRouteSettings>,
    /// Upper bound on how long `stop()` waits for workers to finish.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for ServiceBusSettings {
    fn default() -> Self {
        Self {
            inbox: None,
            outbox: None,
            message_routes: Vec::new(),
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
        }
    }
}

impl ServiceBusSettings {
    /// Parses settings from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidSettings` when the document does not
    /// match the settings shape.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::InvalidSettings {
            reason: e.to_string(),
        })
    }

    /// Reads and parses a JSON settings file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidSettings` when the file cannot be
    /// read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigurationError::InvalidSettings {
            reason: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }
}

/// Inbox section: where inbound messages come from and where failures go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxSettings {
    pub work_queue_uri: String,
    pub error_queue_uri: String,
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Failed attempts tolerated before a message is dead-lettered.
    #[serde(default)]
    pub maximum_failure_count: u32,
    /// Acknowledge messages nobody handles instead of dead-lettering them.
    #[serde(default)]
    pub remove_messages_not_handled: bool,
}

/// Outbox section: staging queue for outbound messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxSettings {
    pub work_queue_uri: String,
    pub error_queue_uri: String,
    #[serde(default = "default_outbox_thread_count")]
    pub thread_count: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub maximum_failure_count: u32,
}

/// One route mapping: a destination URI and the specifications selecting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRouteSettings {
    pub uri: String,
    #[serde(default)]
    pub specifications: Vec<SpecificationSettings>,
}

/// A `(name, value)` pair handed to the specification factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecificationSettings {
    pub name: String,
    pub value: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Resolved inbox: live queues plus processing knobs.
#[derive(Clone)]
pub struct InboxConfiguration {
    pub work_queue: Arc<dyn Queue>,
    pub error_queue: Arc<dyn Queue>,
    pub thread_count: usize,
    pub poll_timeout: Duration,
    pub maximum_failure_count: u32,
    pub remove_messages_not_handled: bool,
}

impl InboxConfiguration {
    /// Inbox with default thread count, poll timeout and failure policy.
    #[must_use]
    pub fn new(work_queue: Arc<dyn Queue>, error_queue: Arc<dyn Queue>) -> Self {
        Self {
            work_queue,
            error_queue,
            thread_count: DEFAULT_THREAD_COUNT,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            maximum_failure_count: 0,
            remove_messages_not_handled: false,
        }
    }

    #[must_use]
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    #[must_use]
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    #[must_use]
    pub fn with_maximum_failure_count(mut self, maximum_failure_count: u32) -> Self {
        self.maximum_failure_count = maximum_failure_count;
        self
    }

    #[must_use]
    pub fn with_remove_messages_not_handled(mut self, remove: bool) -> Self {
        self.remove_messages_not_handled = remove;
        self
    }

    fn resolve(
        settings: &InboxSettings,
        resolver: &dyn QueueResolver,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            work_queue: resolver.get_queue(required(&settings.work_queue_uri, "inbox.work_queue_uri")?)?,
            error_queue: resolver
                .get_queue(required(&settings.error_queue_uri, "inbox.error_queue_uri")?)?,
            thread_count: settings.thread_count,
            poll_timeout: Duration::from_millis(settings.poll_timeout_ms),
            maximum_failure_count: settings.maximum_failure_count,
            remove_messages_not_handled: settings.remove_messages_not_handled,
        })
    }
}

impl fmt::Debug for InboxConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboxConfiguration")
            .field("work_queue", &self.work_queue.uri().as_str())
            .field("error_queue", &self.error_queue.uri().as_str())
            .field("thread_count", &self.thread_count)
            .field("poll_timeout", &self.poll_timeout)
            .field("maximum_failure_count", &self.maximum_failure_count)
            .field("remove_messages_not_handled", &self.remove_messages_not_handled)
            .finish()
    }
}

/// Resolved outbox.
#[derive(Clone)]
pub struct OutboxConfiguration {
    pub work_queue: Arc<dyn Queue>,
    pub error_queue: Arc<dyn Queue>,
    pub thread_count: usize,
    pub poll_timeout: Duration,
    pub maximum_failure_count: u32,
}

impl OutboxConfiguration {
    #[must_use]
    pub fn new(work_queue: Arc<dyn Queue>, error_queue: Arc<dyn Queue>) -> Self {
        Self {
            work_queue,
            error_queue,
            thread_count: 1,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            maximum_failure_count: 0,
        }
    }

    #[must_use]
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    #[must_use]
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    #[must_use]
    pub fn with_maximum_failure_count(mut self, maximum_failure_count: u32) -> Self {
        self.maximum_failure_count = maximum_failure_count;
        self
    }

    fn resolve(
        settings: &OutboxSettings,
        resolver: &dyn QueueResolver,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            work_queue: resolver.get_queue(required(&settings.work_queue_uri, "outbox.work_queue_uri")?)?,
            error_queue: resolver
                .get_queue(required(&settings.error_queue_uri, "outbox.error_queue_uri")?)?,
            thread_count: settings.thread_count,
            poll_timeout: Duration::from_millis(settings.poll_timeout_ms),
            maximum_failure_count: settings.maximum_failure_count,
        })
    }
}

impl fmt::Debug for OutboxConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboxConfiguration")
            .field("work_queue", &self.work_queue.uri().as_str())
            .field("error_queue", &self.error_queue.uri().as_str())
            .field("thread_count", &self.thread_count)
            .field("poll_timeout", &self.poll_timeout)
            .finish_non_exhaustive()
    }
}

/// Everything the engine reads at start-up. Read-only from the engine's side.
#[derive(Debug, Clone)]
pub struct ServiceBusConfiguration {
    pub inbox: Option<InboxConfiguration>,
    pub outbox: Option<OutboxConfiguration>,
    pub stop_timeout: Duration,
}

impl Default for ServiceBusConfiguration {
    fn default() -> Self {
        Self {
            inbox: None,
            outbox: None,
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
        }
    }
}

impl ServiceBusConfiguration {
    #[must_use]
    pub fn has_inbox(&self) -> bool {
        self.inbox.is_some()
    }

    #[must_use]
    pub fn has_outbox(&self) -> bool {
        self.outbox.is_some()
    }

    /// Resolves every queue URI in `settings` and validates thread counts.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigurationError` encountered; nothing is started.
    pub fn resolve(
        settings: &ServiceBusSettings,
        resolver: &dyn QueueResolver,
    ) -> Result<Self, ConfigurationError> {
        let inbox = settings
            .inbox
            .as_ref()
            .map(|s| InboxConfiguration::resolve(s, resolver))
            .transpose()?;
        let outbox = settings
            .outbox
            .as_ref()
            .map(|s| OutboxConfiguration::resolve(s, resolver))
            .transpose()?;

        let configuration = Self {
            inbox,
            outbox,
            stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
        };
        configuration.validate()?;
        Ok(configuration)
    }

    /// Checks invariants that cannot be expressed in the types.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidThreadCount` for a zero thread count.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some(inbox) = &self.inbox {
            if inbox.thread_count == 0 {
                return Err(ConfigurationError::InvalidThreadCount {
                    queue: inbox.work_queue.uri().to_string(),
                });
            }
        }
        if let Some(outbox) = &self.outbox {
            if outbox.thread_count == 0 {
                return Err(ConfigurationError::InvalidThreadCount {
                    queue: outbox.work_queue.uri().to_string(),
                });
            }
        }
        Ok(())
    }
}
