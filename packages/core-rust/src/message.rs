//! Transport envelope carried through queues and pipelines.
//!
//! A [`TransportMessage`] wraps a serialized application message together
//! with the routing and delivery metadata the bus needs: identity, type name,
//! sender/recipient queue URIs, expiry and deferral timestamps, and the
//! failure history accumulated by retries.
//!
//! Message type names may be assembly-qualified, `Full.Type.Name, Assembly`.
//! [`split_type_name`] separates the two halves.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Application message that can travel on the bus.
///
/// `MESSAGE_TYPE` is the routing key: route specifications and handler
/// registrations are matched against it.
pub trait MessageType {
    const MESSAGE_TYPE: &'static str;
}

/// Envelope for one message on a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Unique identity of this message.
    pub message_id: Uuid,
    /// Correlates replies with the message that caused them.
    pub correlation_id: Option<String>,
    /// Routing key of the body, possibly assembly-qualified.
    pub message_type: String,
    /// Work queue of the sending endpoint, used for replies.
    pub sender_uri: Option<String>,
    /// Final destination; set when the message travels through an outbox.
    pub recipient_uri: Option<String>,
    /// Milliseconds since Unix epoch when the message was created.
    pub sent_at_ms: u64,
    /// Messages dequeued after this instant are dropped without handling.
    pub expires_at_ms: Option<u64>,
    /// Messages dequeued before this instant are deferred.
    pub ignore_till_ms: Option<u64>,
    /// Number of failed processing attempts so far.
    pub failure_count: u32,
    /// One entry per failed attempt, oldest first.
    pub failure_messages: Vec<String>,
    /// Free-form application headers.
    pub headers: BTreeMap<String, String>,
    /// Serialized application message.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl TransportMessage {
    /// Creates an envelope with a fresh message id and no delivery constraints.
    #[must_use]
    pub fn new(message_type: impl Into<String>, body: Vec<u8>, sent_at_ms: u64) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            correlation_id: None,
            message_type: message_type.into(),
            sender_uri: None,
            recipient_uri: None,
            sent_at_ms,
            expires_at_ms: None,
            ignore_till_ms: None,
            failure_count: 0,
            failure_messages: Vec::new(),
            headers: BTreeMap::new(),
            body,
        }
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at_ms: u64) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    #[must_use]
    pub fn with_ignore_till(mut self, ignore_till_ms: u64) -> Self {
        self.ignore_till_ms = Some(ignore_till_ms);
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Returns `true` when the expiry instant lies strictly before `now_ms`.
    #[must_use]
    pub fn has_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at < now_ms)
    }

    /// Returns `true` while the message must not be handled yet.
    #[must_use]
    pub fn is_ignoring(&self, now_ms: u64) -> bool {
        self.ignore_till_ms.is_some_and(|till| till > now_ms)
    }

    /// Records a failed processing attempt.
    pub fn register_failure(&mut self, reason: impl Into<String>) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.failure_messages.push(reason.into());
    }

    /// Type name without the assembly qualifier.
    #[must_use]
    pub fn full_type_name(&self) -> &str {
        split_type_name(&self.message_type).0
    }
}

/// Splits `Full.Type.Name, Assembly` into its name and optional assembly.
///
/// Anything after the second comma (version, culture, ...) is ignored.
#[must_use]
pub fn split_type_name(message_type: &str) -> (&str, Option<&str>) {
    let mut parts = message_type.splitn(3, ',');
    let name = parts.next().unwrap_or_default().trim();
    let assembly = parts.next().map(str::trim).filter(|a| !a.is_empty());
    (name, assembly)
}
