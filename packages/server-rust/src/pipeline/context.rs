//! Per-message mutable state threaded through a pipeline run.

use std::fmt;
use std::sync::Arc;

use relaybus_core::{Queue, ReceivedMessage, TransportMessage};

use crate::handler::InvokeResult;

/// Why a pipeline stopped early without faulting.
///
/// An aborted message counts as handled: the worker acknowledges it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The message expired before it was dequeued.
    Expired,
    /// The message is not due yet and was put back on the work queue.
    Deferred { until_ms: u64 },
    /// No handler is registered and unhandled messages are being removed.
    Unhandled,
    /// A fault was absorbed by re-enqueueing the message for another attempt.
    Retried { failure_count: u32 },
    /// Application-defined reason.
    Custom(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => f.write_str("expired"),
            Self::Deferred { until_ms } => write!(f, "deferred until {until_ms}"),
            Self::Unhandled => f.write_str("unhandled"),
            Self::Retried { failure_count } => write!(f, "retried after {failure_count} failure(s)"),
            Self::Custom(reason) => f.write_str(reason),
        }
    }
}

/// Lifecycle of a single pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Running,
    Completed,
    Aborted,
    Faulted,
}

/// Mutable state for one message.
///
/// Created by the worker for each dequeued message and dropped once the
/// message has been disposed of. Observers communicate only through it.
pub struct PipelineContext {
    received: ReceivedMessage,
    work_queue: Arc<dyn Queue>,
    error_queue: Arc<dyn Queue>,
    state: PipelineState,
    abort_reason: Option<AbortReason>,
    invoke_result: Option<InvokeResult>,
}

impl PipelineContext {
    #[must_use]
    pub fn new(
        received: ReceivedMessage,
        work_queue: Arc<dyn Queue>,
        error_queue: Arc<dyn Queue>,
    ) -> Self {
        Self {
            received,
            work_queue,
            error_queue,
            state: PipelineState::Pending,
            abort_reason: None,
            invoke_result: None,
        }
    }

    #[must_use]
    pub fn message(&self) -> &TransportMessage {
        &self.received.message
    }

    pub fn message_mut(&mut self) -> &mut TransportMessage {
        &mut self.received.message
    }

    #[must_use]
    pub fn received(&self) -> &ReceivedMessage {
        &self.received
    }

    #[must_use]
    pub fn into_received(self) -> ReceivedMessage {
        self.received
    }

    #[must_use]
    pub fn work_queue(&self) -> &Arc<dyn Queue> {
        &self.work_queue
    }

    #[must_use]
    pub fn error_queue(&self) -> &Arc<dyn Queue> {
        &self.error_queue
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: PipelineState) {
        self.state = state;
    }

    /// Stops the pipeline after the current observer returns.
    ///
    /// The first reason wins; later calls are ignored.
    pub fn abort(&mut self, reason: AbortReason) {
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason);
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }

    #[must_use]
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        self.abort_reason.as_ref()
    }

    pub fn set_invoke_result(&mut self, result: InvokeResult) {
        self.invoke_result = Some(result);
    }

    /// Outcome of handler invocation, once the handle stage has run.
    #[must_use]
    pub fn invoke_result(&self) -> Option<&InvokeResult> {
        self.invoke_result.as_ref()
    }
}

impl fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineContext")
            .field("message_id", &self.received.message.message_id)
            .field("message_type", &self.received.message.message_type)
            .field("work_queue", &self.work_queue.uri().as_str())
            .field("state", &self.state)
            .field("abort_reason", &self.abort_reason)
            .field("invoke_result", &self.invoke_result)
            .finish()
    }
}
