//! Outbox forwarding: staged messages are delivered to their recipient queue.

use std::sync::Arc;

use relaybus_core::QueueResolver;

use super::inbox::RetryObserver;
use super::{ProcessingError, DISPATCH_STAGE};
use crate::config::OutboxConfiguration;
use crate::pipeline::{Observer, Pipeline, PipelineBuilder, PipelineContext};

/// Enqueues the message on the queue named by its recipient URI.
pub struct DispatchObserver {
    resolver: Arc<dyn QueueResolver>,
}

impl DispatchObserver {
    #[must_use]
    pub fn new(resolver: Arc<dyn QueueResolver>) -> Self {
        Self { resolver }
    }
}

impl Observer for DispatchObserver {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    fn execute(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        let message = ctx.message();
        let recipient = message
            .recipient_uri
            .as_deref()
            .ok_or(ProcessingError::MissingRecipient {
                message_id: message.message_id,
            })?;
        let queue = self.resolver.get_queue(recipient)?;
        queue.enqueue(message.clone())?;
        tracing::debug!(message_id = %message.message_id, recipient, "outbox message forwarded");
        Ok(())
    }
}

/// Default outbox layout: a single `dispatch` stage with retry on fault.
#[must_use]
pub fn outbox_pipeline(
    config: &OutboxConfiguration,
    resolver: Arc<dyn QueueResolver>,
) -> PipelineBuilder {
    Pipeline::builder("outbox")
        .stage(DISPATCH_STAGE)
        .observer(Arc::new(DispatchObserver::new(resolver)))
        .on_fault(Arc::new(RetryObserver::new(config.maximum_failure_count)))
}
