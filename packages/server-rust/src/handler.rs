//! Handler registry and invocation.
//!
//! Handlers are registered per full message type name. The invoker looks up
//! the handlers for an incoming envelope and calls each in registration
//! order; the first handler error stops the run and surfaces as a pipeline
//! fault.

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Context as _;
use dashmap::DashMap;
use relaybus_core::{serializer, MessageType, SerializationError, TransportMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::sender::{MessageSender, SendError};

/// What a handler sees while processing one message.
pub struct HandlerContext<'a> {
    message: &'a TransportMessage,
    sender: &'a MessageSender,
}

impl<'a> HandlerContext<'a> {
    #[must_use]
    pub fn new(message: &'a TransportMessage, sender: &'a MessageSender) -> Self {
        Self { message, sender }
    }

    #[must_use]
    pub fn transport_message(&self) -> &TransportMessage {
        self.message
    }

    /// Decodes the body as `M`.
    ///
    /// # Errors
    ///
    /// Fails when the envelope type is not `M` or the body is malformed.
    pub fn message<M>(&self) -> Result<M, SerializationError>
    where
        M: MessageType + DeserializeOwned,
    {
        serializer::decode(self.message)
    }

    #[must_use]
    pub fn sender(&self) -> &MessageSender {
        self.sender
    }

    /// # Errors
    ///
    /// See [`MessageSender::send`].
    pub fn send<M>(&self, message: &M) -> Result<Vec<String>, SendError>
    where
        M: MessageType + Serialize,
    {
        self.sender.send(message)
    }

    /// # Errors
    ///
    /// See [`MessageSender::publish`].
    pub fn publish<M>(&self, message: &M) -> Result<Vec<String>, SendError>
    where
        M: MessageType + Serialize,
    {
        self.sender.publish(message)
    }

    /// Replies to the sender of the message being handled.
    ///
    /// # Errors
    ///
    /// See [`MessageSender::reply`].
    pub fn reply<M>(&self, message: &M) -> Result<(), SendError>
    where
        M: MessageType + Serialize,
    {
        self.sender.reply(self.message, message)
    }
}

/// Processes messages of one type.
pub trait MessageHandler: Send + Sync {
    /// # Errors
    ///
    /// Any error faults the pipeline for this message.
    fn handle(&self, ctx: &HandlerContext<'_>) -> anyhow::Result<()>;
}

struct TypedHandler<M, F> {
    f: F,
    _marker: PhantomData<fn() -> M>,
}

impl<M, F> MessageHandler for TypedHandler<M, F>
where
    M: MessageType + DeserializeOwned,
    F: Fn(&HandlerContext<'_>, M) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, ctx: &HandlerContext<'_>) -> anyhow::Result<()> {
        let message = ctx.message::<M>()?;
        (self.f)(ctx, message)
    }
}

/// Result of an invocation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeResult {
    Invoked { handlers: usize },
    NoHandler,
}

impl InvokeResult {
    #[must_use]
    pub fn is_invoked(&self) -> bool {
        matches!(self, Self::Invoked { .. })
    }
}

/// Dispatches a message to its handlers.
pub trait HandlerInvoker: Send + Sync {
    /// # Errors
    ///
    /// Returns the first handler error.
    fn invoke(&self, ctx: &HandlerContext<'_>) -> anyhow::Result<InvokeResult>;
}

/// Registry-backed invoker that also counts invocations per message type.
#[derive(Default)]
pub struct DefaultMessageHandlerInvoker {
    handlers: DashMap<String, Vec<Arc<dyn MessageHandler>>>,
    invocations: DashMap<String, u64>,
}

impl DefaultMessageHandlerInvoker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure that receives the decoded message.
    pub fn register<M, F>(&self, f: F)
    where
        M: MessageType + DeserializeOwned + 'static,
        F: Fn(&HandlerContext<'_>, M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_handler(
            M::MESSAGE_TYPE,
            Arc::new(TypedHandler {
                f,
                _marker: PhantomData,
            }),
        );
    }

    pub fn register_handler(&self, message_type: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers
            .entry(message_type.to_string())
            .or_default()
            .push(handler);
    }

    #[must_use]
    pub fn has_handler(&self, message_type: &str) -> bool {
        self.handlers
            .get(message_type)
            .is_some_and(|entry| !entry.is_empty())
    }

    /// Number of handler calls made for `message_type`, successful or not.
    #[must_use]
    pub fn invocation_count(&self, message_type: &str) -> u64 {
        self.invocations.get(message_type).map_or(0, |count| *count)
    }
}

impl HandlerInvoker for DefaultMessageHandlerInvoker {
    fn invoke(&self, ctx: &HandlerContext<'_>) -> anyhow::Result<InvokeResult> {
        let message_type = ctx.transport_message().full_type_name();
        // Clone out of the map so handlers can register more handlers.
        let Some(handlers) = self.handlers.get(message_type).map(|e| e.value().clone()) else {
            return Ok(InvokeResult::NoHandler);
        };
        if handlers.is_empty() {
            return Ok(InvokeResult::NoHandler);
        }

        for handler in &handlers {
            *self.invocations.entry(message_type.to_string()).or_insert(0) += 1;
            handler
                .handle(ctx)
                .with_context(|| format!("handler for '{message_type}' failed"))?;
        }
        Ok(InvokeResult::Invoked {
            handlers: handlers.len(),
        })
    }
}
