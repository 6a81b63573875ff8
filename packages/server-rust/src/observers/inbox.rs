//! Observers for the inbox pipeline: read, handle, acknowledge.

use std::sync::Arc;

use relaybus_core::ClockSource;

use super::{ProcessingError, ACKNOWLEDGE_STAGE, HANDLE_STAGE, READ_STAGE};
use crate::config::InboxConfiguration;
use crate::handler::{HandlerContext, HandlerInvoker, InvokeResult};
use crate::pipeline::{
    AbortReason, FaultObserver, Observer, Pipeline, PipelineBuilder, PipelineContext,
    PipelineFault,
};
use crate::sender::MessageSender;

/// Aborts messages whose expiry has passed.
pub struct ExpiryObserver {
    clock: Arc<dyn ClockSource>,
}

impl ExpiryObserver {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self { clock }
    }
}

impl Observer for ExpiryObserver {
    fn name(&self) -> &'static str {
        "expiry"
    }

    fn execute(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        if ctx.message().has_expired(self.clock.now()) {
            tracing::debug!(
                message_id = %ctx.message().message_id,
                message_type = %ctx.message().message_type,
                "message expired"
            );
            ctx.abort(AbortReason::Expired);
        }
        Ok(())
    }
}

/// Puts messages that are not due yet back on the work queue.
pub struct DeferralObserver {
    clock: Arc<dyn ClockSource>,
}

impl DeferralObserver {
    #[must_use]
    pub fn new(clock: Arc<dyn ClockSource>) -> Self {
        Self { clock }
    }
}

impl Observer for DeferralObserver {
    fn name(&self) -> &'static str {
        "deferral"
    }

    fn execute(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        let now = self.clock.now();
        let Some(until_ms) = ctx.message().ignore_till_ms.filter(|&till| till > now) else {
            return Ok(());
        };
        let message = ctx.message().clone();
        ctx.work_queue().enqueue(message)?;
        ctx.abort(AbortReason::Deferred { until_ms });
        Ok(())
    }
}

/// Invokes the registered handlers and records the result on the context.
pub struct HandleMessageObserver {
    invoker: Arc<dyn HandlerInvoker>,
    sender: Arc<MessageSender>,
}

impl HandleMessageObserver {
    #[must_use]
    pub fn new(invoker: Arc<dyn HandlerInvoker>, sender: Arc<MessageSender>) -> Self {
        Self { invoker, sender }
    }
}

impl Observer for HandleMessageObserver {
    fn name(&self) -> &'static str {
        "handle_message"
    }

    fn execute(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        let result = self
            .invoker
            .invoke(&HandlerContext::new(ctx.message(), &self.sender))?;
        ctx.set_invoke_result(result);
        Ok(())
    }
}

/// Decides what happens to a message nobody handled.
pub struct UninvokedObserver {
    remove_messages_not_handled: bool,
}

impl UninvokedObserver {
    #[must_use]
    pub fn new(remove_messages_not_handled: bool) -> Self {
        Self {
            remove_messages_not_handled,
        }
    }
}

impl Observer for UninvokedObserver {
    fn name(&self) -> &'static str {
        "uninvoked"
    }

    fn execute(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        if ctx.invoke_result().is_some_and(InvokeResult::is_invoked) {
            return Ok(());
        }
        let message_type = ctx.message().message_type.clone();
        if self.remove_messages_not_handled {
            tracing::warn!(
                message_id = %ctx.message().message_id,
                message_type = %message_type,
                "no handler registered; message removed"
            );
            ctx.abort(AbortReason::Unhandled);
            Ok(())
        } else {
            Err(ProcessingError::MissingHandler { message_type }.into())
        }
    }
}

/// Re-enqueues faulted messages until `maximum_failure_count` attempts were made.
pub struct RetryObserver {
    maximum_failure_count: u32,
}

impl RetryObserver {
    #[must_use]
    pub fn new(maximum_failure_count: u32) -> Self {
        Self {
            maximum_failure_count,
        }
    }
}

impl FaultObserver for RetryObserver {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn on_fault(&self, ctx: &mut PipelineContext, fault: &PipelineFault) -> anyhow::Result<()> {
        let failure_count = ctx.message().failure_count.saturating_add(1);
        if failure_count >= self.maximum_failure_count {
            return Ok(());
        }

        let mut message = ctx.message().clone();
        message.register_failure(fault.to_string());
        ctx.work_queue().enqueue(message)?;
        tracing::info!(
            message_id = %ctx.message().message_id,
            failure_count,
            maximum_failure_count = self.maximum_failure_count,
            "message scheduled for retry"
        );
        ctx.abort(AbortReason::Retried { failure_count });
        Ok(())
    }
}

/// Default inbox layout: `read` (expiry, deferral), `handle` (handlers,
/// uninvoked check), `acknowledge` (empty), with retry on fault.
#[must_use]
pub fn inbox_pipeline(
    config: &InboxConfiguration,
    invoker: Arc<dyn HandlerInvoker>,
    sender: Arc<MessageSender>,
    clock: Arc<dyn ClockSource>,
) -> PipelineBuilder {
    Pipeline::builder("inbox")
        .stage(READ_STAGE)
        .observer(Arc::new(ExpiryObserver::new(clock.clone())))
        .observer(Arc::new(DeferralObserver::new(clock)))
        .stage(HANDLE_STAGE)
        .observer(Arc::new(HandleMessageObserver::new(invoker, sender)))
        .observer(Arc::new(UninvokedObserver::new(
            config.remove_messages_not_handled,
        )))
        .stage(ACKNOWLEDGE_STAGE)
        .on_fault(Arc::new(RetryObserver::new(config.maximum_failure_count)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relaybus_core::{
        serializer, ManualClock, MessageType, Queue, QueueResolver, TransportMessage,
    };
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::handler::DefaultMessageHandlerInvoker;
    use crate::pipeline::PipelineOutcome;
    use crate::queue::QueueManager;
    use crate::route::MessageRouteTable;
    use crate::subscription::NullSubscriptionService;

    #[derive(Debug, Serialize, Deserialize)]
    struct Tick {
        n: u32,
    }

    impl MessageType for Tick {
        const MESSAGE_TYPE: &'static str = "Tests.Tick";
    }

    struct Fixture {
        manager: Arc<QueueManager>,
        clock: Arc<ManualClock>,
        invoker: Arc<DefaultMessageHandlerInvoker>,
        config: InboxConfiguration,
    }

    impl Fixture {
        fn new() -> Self {
            let manager = Arc::new(QueueManager::with_memory());
            let config = InboxConfiguration::new(
                manager.get_queue("memory://work").unwrap(),
                manager.get_queue("memory://error").unwrap(),
            );
            Self {
                manager,
                clock: Arc::new(ManualClock::new(10_000)),
                invoker: Arc::new(DefaultMessageHandlerInvoker::new()),
                config,
            }
        }

        fn pipeline(&self) -> Pipeline {
            let sender = Arc::new(MessageSender::new(
                Arc::new(MessageRouteTable::new()),
                self.manager.clone(),
                Arc::new(NullSubscriptionService),
                self.clock.clone(),
            ));
            inbox_pipeline(&self.config, self.invoker.clone(), sender, self.clock.clone()).build()
        }

        fn run(&self, message: TransportMessage) -> (PipelineOutcome, PipelineContext) {
            let work = self.config.work_queue.clone();
            work.enqueue(message).unwrap();
            let received = work.get_message(Duration::ZERO).unwrap().unwrap();
            let mut ctx =
                PipelineContext::new(received, work, self.config.error_queue.clone());
            let outcome = self.pipeline().execute(&mut ctx);
            (outcome, ctx)
        }

        fn work_len(&self) -> usize {
            let mut n = 0;
            while self
                .config
                .work_queue
                .get_message(Duration::ZERO)
                .unwrap()
                .is_some()
            {
                n += 1;
            }
            n
        }
    }

    fn tick() -> TransportMessage {
        serializer::encode(&Tick { n: 1 }, 0).unwrap()
    }

    #[test]
    fn default_layout() {
        let f = Fixture::new();
        let pipeline = f.pipeline();
        let names: Vec<&str> = pipeline.stages().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec![READ_STAGE, HANDLE_STAGE, ACKNOWLEDGE_STAGE]);
        assert_eq!(pipeline.stages()[0].observer_names(), vec!["expiry", "deferral"]);
        assert_eq!(
            pipeline.stages()[1].observer_names(),
            vec!["handle_message", "uninvoked"]
        );
    }

    // ---- read stage ----

    #[test]
    fn expired_message_is_not_handled() {
        let f = Fixture::new();
        f.invoker.register::<Tick, _>(|_, _| Ok(()));

        let (outcome, _) = f.run(tick().with_expiry(9_999));

        assert!(matches!(outcome, PipelineOutcome::Aborted(AbortReason::Expired)));
        assert_eq!(f.invoker.invocation_count("Tests.Tick"), 0);
    }

    #[test]
    fn deferred_message_goes_back_to_work_queue() {
        let f = Fixture::new();
        f.invoker.register::<Tick, _>(|_, _| Ok(()));

        let (outcome, _) = f.run(tick().with_ignore_till(20_000));

        assert!(matches!(
            outcome,
            PipelineOutcome::Aborted(AbortReason::Deferred { until_ms: 20_000 })
        ));
        assert_eq!(f.invoker.invocation_count("Tests.Tick"), 0);
        assert_eq!(f.work_len(), 1);
    }

    #[test]
    fn due_message_is_handled() {
        let f = Fixture::new();
        f.invoker.register::<Tick, _>(|_, _| Ok(()));

        let (outcome, ctx) = f.run(tick().with_ignore_till(10_000).with_expiry(10_000));

        assert!(matches!(outcome, PipelineOutcome::Completed));
        assert_eq!(ctx.invoke_result(), Some(&InvokeResult::Invoked { handlers: 1 }));
    }

    // ---- handle stage ----

    #[test]
    fn missing_handler_faults_by_default() {
        let f = Fixture::new();
        let (outcome, _) = f.run(tick());
        let fault = match outcome {
            PipelineOutcome::Faulted(fault) => fault,
            other => panic!("expected fault, got {other:?}"),
        };
        assert_eq!(fault.stage, HANDLE_STAGE);
        assert_eq!(fault.observer, "uninvoked");
        assert!(fault.error.downcast_ref::<ProcessingError>().is_some());
    }

    #[test]
    fn missing_handler_aborts_when_removal_enabled() {
        let mut f = Fixture::new();
        f.config = f.config.clone().with_remove_messages_not_handled(true);
        let (outcome, _) = f.run(tick());
        assert!(matches!(outcome, PipelineOutcome::Aborted(AbortReason::Unhandled)));
    }

    // ---- retry ----

    #[test]
    fn retry_re_enqueues_below_maximum() {
        let mut f = Fixture::new();
        f.config = f.config.clone().with_maximum_failure_count(3);
        f.invoker.register::<Tick, _>(|_, _| anyhow::bail!("flaky"));

        let (outcome, _) = f.run(tick());

        assert!(matches!(
            outcome,
            PipelineOutcome::Aborted(AbortReason::Retried { failure_count: 1 })
        ));
        let retried = f
            .config
            .work_queue
            .get_message(Duration::ZERO)
            .unwrap()
            .unwrap()
            .message;
        assert_eq!(retried.failure_count, 1);
        assert!(retried.failure_messages[0].contains("flaky"));
    }

    #[test]
    fn retry_gives_up_at_maximum() {
        let mut f = Fixture::new();
        f.config = f.config.clone().with_maximum_failure_count(3);
        f.invoker.register::<Tick, _>(|_, _| anyhow::bail!("flaky"));

        let mut message = tick();
        message.failure_count = 2;
        let (outcome, _) = f.run(message);

        assert!(matches!(outcome, PipelineOutcome::Faulted(_)));
        assert_eq!(f.work_len(), 0);
    }
}
