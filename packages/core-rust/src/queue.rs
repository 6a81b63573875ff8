//! Queue contract consumed by the dispatch engine.
//!
//! Transports implement [`Queue`] and expose it through a [`QueueFactory`]
//! registered for one URI scheme. The engine only ever talks to these
//! traits; it never knows whether a queue lives in memory, on disk, or in a
//! broker.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::{ConfigurationError, QueueError};
use crate::message::TransportMessage;

// ---------------------------------------------------------------------------
// QueueUri
// ---------------------------------------------------------------------------

/// Parsed, normalized queue address such as `memory://orders-inbox`.
///
/// Two `QueueUri`s are equal when their normalized forms are equal, so
/// `MEMORY://orders` and `memory://orders` identify the same queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueUri {
    url: Url,
}

impl QueueUri {
    /// Parses a queue URI.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidUri` when `uri` is not an absolute URI.
    pub fn parse(uri: &str) -> Result<Self, ConfigurationError> {
        let url = Url::parse(uri.trim()).map_err(|e| ConfigurationError::InvalidUri {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { url })
    }

    #[must_use]
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Host and path joined, e.g. `orders/inbox` for `memory://orders/inbox`.
    #[must_use]
    pub fn queue_name(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        let path = self.url.path().trim_matches('/');
        match (host.is_empty(), path.is_empty()) {
            (false, false) => format!("{host}/{path}"),
            (false, true) => host.to_string(),
            _ => path.to_string(),
        }
    }

    /// Fails unless this URI uses `supported_scheme`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidScheme` naming both the expected
    /// scheme and the offending URI.
    pub fn require_scheme(&self, supported_scheme: &str) -> Result<(), ConfigurationError> {
        if self.scheme().eq_ignore_ascii_case(supported_scheme) {
            Ok(())
        } else {
            Err(ConfigurationError::InvalidScheme {
                supported_scheme: supported_scheme.to_string(),
                uri: self.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for QueueUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueUri {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Received messages
// ---------------------------------------------------------------------------

/// Opaque handle identifying an unacknowledged message on its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AcknowledgementToken(pub u64);

impl fmt::Display for AcknowledgementToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message taken from a queue but not yet acknowledged or released.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: TransportMessage,
    pub token: AcknowledgementToken,
}

// ---------------------------------------------------------------------------
// Queue / QueueFactory
// ---------------------------------------------------------------------------

/// A named, URI-addressed message queue.
///
/// Implementations must be safe to share between worker threads: one
/// instance serves every worker of an inbox, and several inboxes may share
/// a queue (e.g. work queue doubling as error queue).
pub trait Queue: Send + Sync {
    /// Identity of this queue.
    fn uri(&self) -> &QueueUri;

    /// Appends a message to the queue.
    fn enqueue(&self, message: TransportMessage) -> Result<(), QueueError>;

    /// Takes the next message, blocking up to `timeout`.
    ///
    /// An empty queue yields `Ok(None)`; that is the normal idle condition.
    fn get_message(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Removes a received message permanently.
    fn acknowledge(&self, token: AcknowledgementToken) -> Result<(), QueueError>;

    /// Returns a received message to the queue for redelivery.
    fn release(&self, token: AcknowledgementToken) -> Result<(), QueueError>;

    /// Releases transport resources. Further calls may fail with `QueueError::Disposed`.
    fn dispose(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Creates queues for a single URI scheme.
pub trait QueueFactory: Send + Sync {
    /// The scheme this factory understands, e.g. `"memory"`.
    fn scheme(&self) -> &'static str;

    /// Creates the queue addressed by `uri`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidScheme` when `uri` uses another scheme.
    fn create(&self, uri: &QueueUri) -> Result<Arc<dyn Queue>, ConfigurationError>;
}

/// Resolves configured URIs to live queue handles.
pub trait QueueResolver: Send + Sync {
    /// Returns the queue for `uri`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` for malformed URIs and unsupported schemes.
    fn get_queue(&self, uri: &str) -> Result<Arc<dyn Queue>, ConfigurationError>;
}
