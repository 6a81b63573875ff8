//! `RelayBus` Server: inbox/outbox worker pools, pipelines, and message routing.

pub mod bus;
pub mod config;
pub mod handler;
pub mod observers;
pub mod pipeline;
pub mod queue;
pub mod route;
pub mod sender;
pub mod subscription;
pub mod worker;

pub use bus::{BusError, BusState, BusStats, ServiceBus, ServiceBusBuilder};
pub use config::{
    InboxConfiguration, OutboxConfiguration, ServiceBusConfiguration, ServiceBusSettings,
};
pub use handler::{
    DefaultMessageHandlerInvoker, HandlerContext, HandlerInvoker, InvokeResult, MessageHandler,
};
pub use pipeline::{
    AbortReason, Observer, Pipeline, PipelineBuilder, PipelineContext, PipelineOutcome,
};
pub use queue::{MemoryQueue, QueueManager};
pub use route::{MessageRoute, MessageRouteTable};
pub use sender::{MessageSender, SendError};
pub use subscription::{MemorySubscriptionService, NullSubscriptionService, SubscriptionService};
pub use worker::{ProcessorStats, ProcessorStatsSnapshot};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}
