//! Message pipeline: ordered stages of observers run against one message.
//!
//! - [`chain`]: `Pipeline`, `PipelineBuilder`, the `Observer` traits, outcomes
//! - [`context`]: `PipelineContext`, the per-message mutable state

pub mod chain;
pub mod context;

pub use chain::{
    FaultObserver, FnObserver, Observer, Pipeline, PipelineBuilder, PipelineError,
    PipelineFault, PipelineOutcome, Stage,
};
pub use context::{AbortReason, PipelineContext, PipelineState};
