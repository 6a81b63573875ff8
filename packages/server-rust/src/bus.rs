//! The service bus: lifecycle over the inbox and outbox worker pools.
//!
//! State machine: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! `stop` may be followed by another `start`; `dispose` additionally
//! releases every queue and is final.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use relaybus_core::{
    ClockSource, ConfigurationError, Queue, QueueError, SpecificationFactory, SystemClock,
};
use tracing::{error, info, warn};

use crate::config::{ServiceBusConfiguration, ServiceBusSettings};
use crate::handler::{DefaultMessageHandlerInvoker, HandlerInvoker};
use crate::observers;
use crate::pipeline::{Pipeline, PipelineBuilder, PipelineError};
use crate::queue::QueueManager;
use crate::route::{MessageRoute, MessageRouteTable};
use crate::sender::MessageSender;
use crate::subscription::{NullSubscriptionService, SubscriptionService};
use crate::worker::{PoolSettings, ProcessorStats, ProcessorStatsSnapshot, WorkerPool};

// ---------------------------------------------------------------------------
// BusState / BusError
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`ServiceBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Errors from building or driving a [`ServiceBus`].
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("bus is {actual:?}, expected {expected:?}")]
    InvalidState { expected: BusState, actual: BusState },
    #[error("bus has been disposed")]
    Disposed,
    #[error("failed to spawn {pool} worker")]
    WorkerSpawn {
        pool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{unfinished} worker(s) did not stop within {timeout:?}")]
    StopTimeout { unfinished: usize, timeout: Duration },
}

/// Processing counters for both pools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub inbox: ProcessorStatsSnapshot,
    pub outbox: ProcessorStatsSnapshot,
}

// ---------------------------------------------------------------------------
// ServiceBus
// ---------------------------------------------------------------------------

/// A configured message-processing endpoint.
///
/// Built with [`ServiceBus::builder`]. Dropping the bus disposes it.
pub struct ServiceBus {
    configuration: ServiceBusConfiguration,
    inbox_pipeline: Option<Pipeline>,
    outbox_pipeline: Option<Pipeline>,
    routes: Arc<MessageRouteTable>,
    sender: Arc<MessageSender>,
    queue_manager: Arc<QueueManager>,
    state: ArcSwap<BusState>,
    pools: Mutex<Vec<WorkerPool>>,
    inbox_stats: Arc<ProcessorStats>,
    outbox_stats: Arc<ProcessorStats>,
    disposed: AtomicBool,
}

impl ServiceBus {
    #[must_use]
    pub fn builder() -> ServiceBusBuilder {
        ServiceBusBuilder::default()
    }

    #[must_use]
    pub fn state(&self) -> BusState {
        **self.state.load()
    }

    #[must_use]
    pub fn configuration(&self) -> &ServiceBusConfiguration {
        &self.configuration
    }

    #[must_use]
    pub fn routes(&self) -> &Arc<MessageRouteTable> {
        &self.routes
    }

    #[must_use]
    pub fn sender(&self) -> &Arc<MessageSender> {
        &self.sender
    }

    #[must_use]
    pub fn queue_manager(&self) -> &Arc<QueueManager> {
        &self.queue_manager
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        BusStats {
            inbox: self.inbox_stats.snapshot(),
            outbox: self.outbox_stats.snapshot(),
        }
    }

    /// Spawns the configured worker pools.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the bus is stopped, `Disposed` after
    /// [`dispose`](Self::dispose), `WorkerSpawn` if a thread cannot be
    /// created (already-spawned workers are stopped again).
    pub fn start(&self) -> Result<(), BusError> {
        let mut pools = self.pools.lock();
        if self.disposed.load(Ordering::SeqCst) {
            return Err(BusError::Disposed);
        }
        let actual = self.state();
        if actual != BusState::Stopped {
            return Err(BusError::InvalidState {
                expected: BusState::Stopped,
                actual,
            });
        }
        self.state.store(Arc::new(BusState::Starting));

        let pending = [
            self.configuration.inbox.as_ref().zip(self.inbox_pipeline.as_ref()).map(|(c, p)| {
                let settings = PoolSettings {
                    name: "inbox",
                    work_queue: Arc::clone(&c.work_queue),
                    error_queue: Arc::clone(&c.error_queue),
                    thread_count: c.thread_count,
                    poll_timeout: c.poll_timeout,
                };
                (settings, p, Arc::clone(&self.inbox_stats))
            }),
            self.configuration.outbox.as_ref().zip(self.outbox_pipeline.as_ref()).map(|(c, p)| {
                let settings = PoolSettings {
                    name: "outbox",
                    work_queue: Arc::clone(&c.work_queue),
                    error_queue: Arc::clone(&c.error_queue),
                    thread_count: c.thread_count,
                    poll_timeout: c.poll_timeout,
                };
                (settings, p, Arc::clone(&self.outbox_stats))
            }),
        ];

        for (settings, pipeline, stats) in pending.into_iter().flatten() {
            match WorkerPool::start(&settings, pipeline, stats) {
                Ok(pool) => {
                    info!(
                        pool = settings.name,
                        queue = %settings.work_queue.uri(),
                        threads = pool.thread_count(),
                        "worker pool started"
                    );
                    pools.push(pool);
                }
                Err(source) => {
                    self.shutdown_pools(&mut pools);
                    self.state.store(Arc::new(BusState::Stopped));
                    return Err(BusError::WorkerSpawn {
                        pool: settings.name,
                        source,
                    });
                }
            }
        }

        self.state.store(Arc::new(BusState::Running));
        info!("service bus running");
        Ok(())
    }

    /// Stops every worker after its in-flight message and joins them.
    ///
    /// Calling `stop` on a bus that is not running is a no-op. The bus is
    /// always `Stopped` afterwards.
    ///
    /// # Errors
    ///
    /// `StopTimeout` if some workers were still busy when the configured
    /// stop timeout ran out; those threads are left to finish on their own.
    pub fn stop(&self) -> Result<(), BusError> {
        let mut pools = self.pools.lock();
        self.stop_locked(&mut pools)
    }

    /// Stops the bus and releases every queue. Idempotent.
    ///
    /// The bus is marked disposed before the pools lock is released, so a
    /// concurrent [`start`](Self::start) either completes first and is
    /// stopped here, or observes the disposal and fails with `Disposed`.
    /// Release failures are logged and do not prevent the remaining queues
    /// from being released.
    pub fn dispose(&self) {
        {
            let mut pools = self.pools.lock();
            if let Err(e) = self.stop_locked(&mut pools) {
                warn!(error = %e, "stop during dispose");
            }
            if self.disposed.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        let failures = self.queue_manager.dispose_all();
        if failures.is_empty() {
            info!("service bus disposed");
        } else {
            error!(failures = failures.len(), "service bus disposed with queue release failures");
        }
    }

    fn stop_locked(&self, pools: &mut Vec<WorkerPool>) -> Result<(), BusError> {
        if self.state() == BusState::Stopped {
            return Ok(());
        }
        self.state.store(Arc::new(BusState::Stopping));
        info!("service bus stopping");

        let unfinished = self.shutdown_pools(pools);
        self.state.store(Arc::new(BusState::Stopped));

        if unfinished > 0 {
            warn!(
                unfinished,
                timeout_ms = u64::try_from(self.configuration.stop_timeout.as_millis())
                    .unwrap_or(u64::MAX),
                "workers did not stop cleanly"
            );
            return Err(BusError::StopTimeout {
                unfinished,
                timeout: self.configuration.stop_timeout,
            });
        }
        info!("service bus stopped");
        Ok(())
    }

    fn shutdown_pools(&self, pools: &mut Vec<WorkerPool>) -> usize {
        for pool in pools.iter() {
            pool.signal_stop();
        }
        let deadline = Instant::now() + self.configuration.stop_timeout;
        pools
            .drain(..)
            .map(|mut pool| pool.join(deadline.saturating_duration_since(Instant::now())))
            .sum()
    }
}

impl Drop for ServiceBus {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ---------------------------------------------------------------------------
// ServiceBusBuilder
// ---------------------------------------------------------------------------

type PipelineCustomizer = Box<dyn FnOnce(PipelineBuilder) -> Result<PipelineBuilder, PipelineError>>;

/// Wires a [`ServiceBus`] from settings or a resolved configuration.
///
/// Unset collaborators default to a memory-backed [`QueueManager`], a
/// [`DefaultMessageHandlerInvoker`], a [`NullSubscriptionService`] and the
/// system clock.
#[derive(Default)]
pub struct ServiceBusBuilder {
    settings: Option<ServiceBusSettings>,
    configuration: Option<ServiceBusConfiguration>,
    queue_manager: Option<Arc<QueueManager>>,
    invoker: Option<Arc<dyn HandlerInvoker>>,
    subscriptions: Option<Arc<dyn SubscriptionService>>,
    clock: Option<Arc<dyn ClockSource>>,
    routes: Vec<MessageRoute>,
    inbox_customizer: Option<PipelineCustomizer>,
    outbox_customizer: Option<PipelineCustomizer>,
}

impl ServiceBusBuilder {
    /// Raw settings; queues and routes are resolved in [`build`](Self::build).
    #[must_use]
    pub fn settings(mut self, settings: ServiceBusSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Already-resolved configuration. Takes precedence over the inbox and
    /// outbox sections of [`settings`](Self::settings); routes from the
    /// settings are still imported.
    #[must_use]
    pub fn configuration(mut self, configuration: ServiceBusConfiguration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    #[must_use]
    pub fn queue_manager(mut self, queue_manager: Arc<QueueManager>) -> Self {
        self.queue_manager = Some(queue_manager);
        self
    }

    #[must_use]
    pub fn handler_invoker(mut self, invoker: Arc<dyn HandlerInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    #[must_use]
    pub fn subscription_service(mut self, subscriptions: Arc<dyn SubscriptionService>) -> Self {
        self.subscriptions = Some(subscriptions);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Adds a route on top of the configured ones.
    #[must_use]
    pub fn route(mut self, route: MessageRoute) -> Self {
        self.routes.push(route);
        self
    }

    /// Adjusts the default inbox pipeline before it is built.
    #[must_use]
    pub fn customize_inbox_pipeline<F>(mut self, f: F) -> Self
    where
        F: FnOnce(PipelineBuilder) -> Result<PipelineBuilder, PipelineError> + 'static,
    {
        self.inbox_customizer = Some(Box::new(f));
        self
    }

    /// Adjusts the default outbox pipeline before it is built.
    #[must_use]
    pub fn customize_outbox_pipeline<F>(mut self, f: F) -> Self
    where
        F: FnOnce(PipelineBuilder) -> Result<PipelineBuilder, PipelineError> + 'static,
    {
        self.outbox_customizer = Some(Box::new(f));
        self
    }

    /// Resolves queues and routes and assembles the pipelines.
    ///
    /// Nothing is started; a configuration error leaves no threads behind.
    ///
    /// # Errors
    ///
    /// `Configuration` for unresolvable URIs, unknown specifications or a
    /// zero thread count; `Pipeline` if a customizer names a missing stage.
    pub fn build(self) -> Result<ServiceBus, BusError> {
        let queue_manager = self
            .queue_manager
            .unwrap_or_else(|| Arc::new(QueueManager::with_memory()));
        let invoker = self
            .invoker
            .unwrap_or_else(|| Arc::new(DefaultMessageHandlerInvoker::new()));
        let subscriptions = self
            .subscriptions
            .unwrap_or_else(|| Arc::new(NullSubscriptionService));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let configuration = match (self.configuration, &self.settings) {
            (Some(configuration), _) => configuration,
            (None, Some(settings)) => {
                ServiceBusConfiguration::resolve(settings, queue_manager.as_ref())?
            }
            (None, None) => ServiceBusConfiguration::default(),
        };
        configuration.validate()?;

        // Queues handed in directly become resolvable by URI and are
        // released with the rest on dispose.
        for queue in configured_queues(&configuration) {
            if !queue_manager.contains(queue.uri()) {
                queue_manager.register_queue(queue);
            }
        }

        let routes = Arc::new(MessageRouteTable::new());
        if let Some(settings) = &self.settings {
            routes.import(
                &settings.message_routes,
                queue_manager.as_ref(),
                &SpecificationFactory,
            )?;
        }
        for route in self.routes {
            if !queue_manager.contains(route.uri()) {
                queue_manager.register_queue(Arc::clone(route.queue()));
            }
            routes.add(route);
        }

        let mut sender = MessageSender::new(
            Arc::clone(&routes),
            queue_manager.clone(),
            subscriptions,
            Arc::clone(&clock),
        );
        if let Some(inbox) = &configuration.inbox {
            sender = sender.with_inbox(Arc::clone(&inbox.work_queue));
        }
        if let Some(outbox) = &configuration.outbox {
            sender = sender.with_outbox(Arc::clone(&outbox.work_queue));
        }
        let sender = Arc::new(sender);

        let inbox_pipeline = configuration
            .inbox
            .as_ref()
            .map(|inbox| {
                let builder = observers::inbox_pipeline(inbox, invoker, Arc::clone(&sender), clock);
                customize(builder, self.inbox_customizer)
            })
            .transpose()?;
        let outbox_pipeline = configuration
            .outbox
            .as_ref()
            .map(|outbox| {
                let builder = observers::outbox_pipeline(outbox, queue_manager.clone());
                customize(builder, self.outbox_customizer)
            })
            .transpose()?;

        info!(
            inbox = configuration.has_inbox(),
            outbox = configuration.has_outbox(),
            routes = routes.len(),
            "service bus configured"
        );

        Ok(ServiceBus {
            configuration,
            inbox_pipeline,
            outbox_pipeline,
            routes,
            sender,
            queue_manager,
            state: ArcSwap::from_pointee(BusState::Stopped),
            pools: Mutex::new(Vec::new()),
            inbox_stats: Arc::new(ProcessorStats::default()),
            outbox_stats: Arc::new(ProcessorStats::default()),
            disposed: AtomicBool::new(false),
        })
    }
}

fn customize(
    builder: PipelineBuilder,
    customizer: Option<PipelineCustomizer>,
) -> Result<Pipeline, PipelineError> {
    let builder = match customizer {
        Some(f) => f(builder)?,
        None => builder,
    };
    Ok(builder.build())
}

fn configured_queues(configuration: &ServiceBusConfiguration) -> Vec<Arc<dyn Queue>> {
    let mut queues = Vec::new();
    if let Some(inbox) = &configuration.inbox {
        queues.push(Arc::clone(&inbox.work_queue));
        queues.push(Arc::clone(&inbox.error_queue));
    }
    if let Some(outbox) = &configuration.outbox {
        queues.push(Arc::clone(&outbox.work_queue));
        queues.push(Arc::clone(&outbox.error_queue));
    }
    queues
}
