//! Outbound message dispatch: send, publish, reply.
//!
//! Recipients come from the route table (send), the subscription service
//! (publish), or the received message's sender URI (reply). When an outbox
//! is configured, messages are staged on it with the recipient stamped on
//! the envelope and the outbox workers forward them; otherwise they are
//! enqueued on the recipient queue directly.

use std::sync::Arc;

use relaybus_core::{
    serializer, ClockSource, ConfigurationError, MessageType, Queue, QueueError, QueueResolver,
    SerializationError, TransportMessage,
};
use serde::Serialize;
use uuid::Uuid;

use crate::route::MessageRouteTable;
use crate::subscription::SubscriptionService;

/// Errors from sending a message.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("no route found for message type '{message_type}'")]
    NoRoute { message_type: String },
    #[error("message '{message_id}' has no sender uri to reply to")]
    NoSender { message_id: Uuid },
    #[error("no inbox is configured for local delivery")]
    NoInbox,
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Sends messages on behalf of the bus and its handlers.
pub struct MessageSender {
    routes: Arc<MessageRouteTable>,
    resolver: Arc<dyn QueueResolver>,
    subscriptions: Arc<dyn SubscriptionService>,
    clock: Arc<dyn ClockSource>,
    inbox_queue: Option<Arc<dyn Queue>>,
    outbox_queue: Option<Arc<dyn Queue>>,
}

impl MessageSender {
    #[must_use]
    pub fn new(
        routes: Arc<MessageRouteTable>,
        resolver: Arc<dyn QueueResolver>,
        subscriptions: Arc<dyn SubscriptionService>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            routes,
            resolver,
            subscriptions,
            clock,
            inbox_queue: None,
            outbox_queue: None,
        }
    }

    /// Sets the local work queue: replies come back here and `send_local` targets it.
    #[must_use]
    pub fn with_inbox(mut self, inbox_queue: Arc<dyn Queue>) -> Self {
        self.inbox_queue = Some(inbox_queue);
        self
    }

    /// Stages every outbound message on `outbox_queue`.
    #[must_use]
    pub fn with_outbox(mut self, outbox_queue: Arc<dyn Queue>) -> Self {
        self.outbox_queue = Some(outbox_queue);
        self
    }

    #[must_use]
    pub fn routes(&self) -> &Arc<MessageRouteTable> {
        &self.routes
    }

    /// Serializes `message` into an envelope stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Serialization` when the body cannot be encoded.
    pub fn encode<M>(&self, message: &M) -> Result<TransportMessage, SendError>
    where
        M: MessageType + Serialize,
    {
        Ok(serializer::encode(message, self.clock.now())?)
    }

    /// Sends to the route selected for `M`. Returns the recipient URIs.
    ///
    /// # Errors
    ///
    /// Returns `SendError::NoRoute` when no route matches.
    pub fn send<M>(&self, message: &M) -> Result<Vec<String>, SendError>
    where
        M: MessageType + Serialize,
    {
        let transport = self.encode(message)?;
        self.send_transport(transport)
    }

    /// Routes an already-built envelope by its message type.
    ///
    /// # Errors
    ///
    /// Returns `SendError::NoRoute` when no route matches.
    pub fn send_transport(&self, message: TransportMessage) -> Result<Vec<String>, SendError> {
        let uris = self.routes.get_route_uris(&message.message_type);
        if uris.is_empty() {
            return Err(SendError::NoRoute {
                message_type: message.message_type,
            });
        }
        for uri in &uris {
            self.dispatch(message.clone(), uri)?;
        }
        Ok(uris)
    }

    /// Sends to an explicit recipient, bypassing the route table.
    ///
    /// # Errors
    ///
    /// Fails when the recipient cannot be resolved or the enqueue fails.
    pub fn send_to<M>(&self, message: &M, uri: &str) -> Result<(), SendError>
    where
        M: MessageType + Serialize,
    {
        let transport = self.encode(message)?;
        self.dispatch(transport, uri)
    }

    /// Enqueues on this endpoint's own work queue.
    ///
    /// # Errors
    ///
    /// Returns `SendError::NoInbox` when no inbox is configured.
    pub fn send_local<M>(&self, message: &M) -> Result<(), SendError>
    where
        M: MessageType + Serialize,
    {
        let inbox = self.inbox_queue.as_ref().ok_or(SendError::NoInbox)?;
        let mut transport = self.encode(message)?;
        transport.sender_uri = Some(inbox.uri().to_string());
        transport.recipient_uri = Some(inbox.uri().to_string());
        inbox.enqueue(transport)?;
        Ok(())
    }

    /// Delivers to every subscriber of `M`. Zero subscribers is not an error.
    ///
    /// # Errors
    ///
    /// Fails on the first subscriber that cannot be reached.
    pub fn publish<M>(&self, message: &M) -> Result<Vec<String>, SendError>
    where
        M: MessageType + Serialize,
    {
        let transport = self.encode(message)?;
        let uris = self.subscriptions.get_subscribed_uris(&transport.message_type);
        if uris.is_empty() {
            tracing::debug!(message_type = %transport.message_type, "published with no subscribers");
        }
        for uri in &uris {
            self.dispatch(transport.clone(), uri)?;
        }
        Ok(uris)
    }

    /// Sends `message` back to the sender of `request`, correlated to it.
    ///
    /// # Errors
    ///
    /// Returns `SendError::NoSender` when `request` carries no sender URI.
    pub fn reply<M>(&self, request: &TransportMessage, message: &M) -> Result<(), SendError>
    where
        M: MessageType + Serialize,
    {
        let sender = request.sender_uri.as_deref().ok_or(SendError::NoSender {
            message_id: request.message_id,
        })?;
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| request.message_id.to_string());
        let transport = self.encode(message)?.with_correlation_id(correlation_id);
        self.dispatch(transport, sender)
    }

    fn dispatch(&self, mut message: TransportMessage, recipient: &str) -> Result<(), SendError> {
        if message.sender_uri.is_none() {
            message.sender_uri = self.inbox_queue.as_ref().map(|q| q.uri().to_string());
        }
        message.recipient_uri = Some(recipient.to_string());

        if let Some(outbox) = &self.outbox_queue {
            tracing::debug!(
                message_id = %message.message_id,
                recipient,
                outbox = %outbox.uri(),
                "message staged on outbox"
            );
            outbox.enqueue(message)?;
        } else {
            let queue = self.resolver.get_queue(recipient)?;
            tracing::debug!(message_id = %message.message_id, recipient, "message sent");
            queue.enqueue(message)?;
        }
        Ok(())
    }
}
