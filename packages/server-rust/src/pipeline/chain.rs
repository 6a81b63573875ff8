//! Stage/observer chain and its execution rules.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use super::context::{AbortReason, PipelineContext, PipelineState};

// ---------------------------------------------------------------------------
// Observer traits
// ---------------------------------------------------------------------------

/// One step of a stage.
///
/// Observers hold no per-message state; everything mutable lives in the
/// [`PipelineContext`]. Returning `Err` (or panicking) faults the pipeline.
pub trait Observer: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(&self, ctx: &mut PipelineContext) -> anyhow::Result<()>;
}

/// Runs after an observer faults, before the outcome is reported.
///
/// A fault observer that calls [`PipelineContext::abort`] converts the fault
/// into an abort, e.g. after scheduling a retry.
pub trait FaultObserver: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_fault(&self, ctx: &mut PipelineContext, fault: &PipelineFault) -> anyhow::Result<()>;
}

/// Adapter turning a closure into an [`Observer`].
pub struct FnObserver<F> {
    name: &'static str,
    f: F,
}

impl<F> FnObserver<F>
where
    F: Fn(&mut PipelineContext) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> Observer for FnObserver<F>
where
    F: Fn(&mut PipelineContext) -> anyhow::Result<()> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(&self, ctx: &mut PipelineContext) -> anyhow::Result<()> {
        (self.f)(ctx)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// An observer failure captured by the pipeline.
#[derive(Debug)]
pub struct PipelineFault {
    pub stage: String,
    pub observer: &'static str,
    pub error: anyhow::Error,
}

impl fmt::Display for PipelineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] {:#}", self.stage, self.observer, self.error)
    }
}

/// Terminal result of one pipeline run.
#[derive(Debug)]
pub enum PipelineOutcome {
    Completed,
    Aborted(AbortReason),
    Faulted(PipelineFault),
}

impl PipelineOutcome {
    /// Label used for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Aborted(_) => "aborted",
            Self::Faulted(_) => "faulted",
        }
    }
}

/// Errors from assembling a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline '{pipeline}' has no stage named '{stage}'")]
    UnknownStage { pipeline: String, stage: String },
    #[error("pipeline '{pipeline}' already has a stage named '{stage}'")]
    DuplicateStage { pipeline: String, stage: String },
}

// ---------------------------------------------------------------------------
// Stage / Pipeline
// ---------------------------------------------------------------------------

/// A named, ordered group of observers.
#[derive(Clone)]
pub struct Stage {
    name: String,
    observers: Vec<Arc<dyn Observer>>,
}

impl Stage {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Observer names in execution order.
    #[must_use]
    pub fn observer_names(&self) -> Vec<&'static str> {
        self.observers.iter().map(|o| o.name()).collect()
    }
}

/// An immutable stage graph, cheap to clone and safe to share across workers.
///
/// Stages run in order and observers within a stage run in registration
/// order. After every observer the context is checked: an abort ends the
/// run as [`PipelineOutcome::Aborted`]; an error or panic ends it as
/// [`PipelineOutcome::Faulted`] once the fault observers have had their say.
/// The pipeline never retries on its own.
#[derive(Clone)]
pub struct Pipeline {
    name: Arc<str>,
    stages: Arc<[Stage]>,
    fault_observers: Arc<[Arc<dyn FaultObserver>]>,
}

impl Pipeline {
    #[must_use]
    pub fn builder(name: &str) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Drives `ctx` through every stage.
    pub fn execute(&self, ctx: &mut PipelineContext) -> PipelineOutcome {
        ctx.set_state(PipelineState::Running);

        for stage in self.stages.iter() {
            for observer in &stage.observers {
                if let Err(error) = run_observer(observer.as_ref(), ctx) {
                    let fault = PipelineFault {
                        stage: stage.name.clone(),
                        observer: observer.name(),
                        error,
                    };
                    return self.fault(ctx, fault);
                }

                if let Some(reason) = ctx.abort_reason() {
                    tracing::debug!(
                        pipeline = %self.name,
                        stage = %stage.name,
                        observer = observer.name(),
                        message_id = %ctx.message().message_id,
                        reason = %reason,
                        "pipeline aborted"
                    );
                    let reason = reason.clone();
                    ctx.set_state(PipelineState::Aborted);
                    return PipelineOutcome::Aborted(reason);
                }
            }
        }

        ctx.set_state(PipelineState::Completed);
        PipelineOutcome::Completed
    }

    fn fault(&self, ctx: &mut PipelineContext, fault: PipelineFault) -> PipelineOutcome {
        tracing::warn!(
            pipeline = %self.name,
            stage = %fault.stage,
            observer = fault.observer,
            message_id = %ctx.message().message_id,
            message_type = %ctx.message().message_type,
            error = %format!("{:#}", fault.error),
            "observer faulted"
        );

        for fault_observer in self.fault_observers.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| fault_observer.on_fault(ctx, &fault)))
                .unwrap_or_else(|panic| Err(panic_error(&*panic)));
            if let Err(e) = result {
                tracing::error!(
                    pipeline = %self.name,
                    fault_observer = fault_observer.name(),
                    error = %format!("{e:#}"),
                    "fault observer failed"
                );
            }
            if ctx.is_aborted() {
                break;
            }
        }

        if let Some(reason) = ctx.abort_reason().cloned() {
            ctx.set_state(PipelineState::Aborted);
            PipelineOutcome::Aborted(reason)
        } else {
            ctx.set_state(PipelineState::Faulted);
            PipelineOutcome::Faulted(fault)
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stages: Vec<(&str, Vec<&'static str>)> = self
            .stages
            .iter()
            .map(|s| (s.name(), s.observer_names()))
            .collect();
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &stages)
            .field("fault_observers", &self.fault_observers.len())
            .finish()
    }
}

fn run_observer(observer: &dyn Observer, ctx: &mut PipelineContext) -> anyhow::Result<()> {
    catch_unwind(AssertUnwindSafe(|| observer.execute(ctx)))
        .unwrap_or_else(|panic| Err(panic_error(&*panic)))
}

fn panic_error(panic: &(dyn Any + Send)) -> anyhow::Error {
    let text = panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    anyhow::anyhow!("observer panicked: {text}")
}

// ---------------------------------------------------------------------------
// PipelineBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`Pipeline`].
///
/// `observer` appends to the current stage (the one last named with
/// [`stage`](Self::stage)); the `*_in` and
/// `insert_stage_*` methods extend an existing layout by name.
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Stage>,
    current: Option<usize>,
    fault_observers: Vec<Arc<dyn FaultObserver>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stages: Vec::new(),
            current: None,
            fault_observers: Vec::new(),
        }
    }

    /// Appends a stage and makes it current. Naming an existing stage only
    /// makes it current again.
    #[must_use]
    pub fn stage(mut self, name: &str) -> Self {
        if let Some(pos) = self.position(name) {
            self.current = Some(pos);
        } else {
            self.stages.push(Stage {
                name: name.to_string(),
                observers: Vec::new(),
            });
            self.current = Some(self.stages.len() - 1);
        }
        self
    }

    /// Appends an observer to the current stage, creating a `default` stage if none exists.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        if self.current.is_none() {
            self = self.stage("default");
        }
        if let Some(stage) = self.current.and_then(|pos| self.stages.get_mut(pos)) {
            stage.observers.push(observer);
        }
        self
    }

    /// Appends an observer to the named stage.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::UnknownStage` if no such stage exists.
    pub fn observer_in(
        mut self,
        stage: &str,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, PipelineError> {
        let pos = self.require(stage)?;
        self.stages[pos].observers.push(observer);
        Ok(self)
    }

    /// Inserts an empty stage directly before `existing`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` / `DuplicateStage` on a bad layout.
    pub fn insert_stage_before(self, existing: &str, name: &str) -> Result<Self, PipelineError> {
        self.insert_stage(existing, name, 0)
    }

    /// Inserts an empty stage directly after `existing`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownStage` / `DuplicateStage` on a bad layout.
    pub fn insert_stage_after(self, existing: &str, name: &str) -> Result<Self, PipelineError> {
        self.insert_stage(existing, name, 1)
    }

    /// Registers a fault observer; they run in registration order.
    #[must_use]
    pub fn on_fault(mut self, observer: Arc<dyn FaultObserver>) -> Self {
        self.fault_observers.push(observer);
        self
    }

    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline {
            name: Arc::from(self.name),
            stages: self.stages.into(),
            fault_observers: self.fault_observers.into(),
        }
    }

    fn insert_stage(
        mut self,
        existing: &str,
        name: &str,
        offset: usize,
    ) -> Result<Self, PipelineError> {
        if self.position(name).is_some() {
            return Err(PipelineError::DuplicateStage {
                pipeline: self.name,
                stage: name.to_string(),
            });
        }
        let at = self.require(existing)? + offset;
        self.stages.insert(
            at,
            Stage {
                name: name.to_string(),
                observers: Vec::new(),
            },
        );
        if let Some(current) = self.current.as_mut() {
            if *current >= at {
                *current += 1;
            }
        }
        Ok(self)
    }

    fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == stage)
    }

    fn require(&self, stage: &str) -> Result<usize, PipelineError> {
        self.position(stage).ok_or_else(|| PipelineError::UnknownStage {
            pipeline: self.name.clone(),
            stage: stage.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
