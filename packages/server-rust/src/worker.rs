//! Worker pools: N threads draining one work queue through a pipeline.
//!
//! Each worker owns a clone of the pool's [`Pipeline`] (the stage graph is
//! shared and immutable) and builds a fresh [`PipelineContext`] per message.
//! Workers check the stop flag between messages only; an in-flight handler
//! is never interrupted.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use relaybus_core::{Queue, ReceivedMessage};
use tracing::{debug, error, info_span, warn};

use crate::pipeline::{AbortReason, Pipeline, PipelineContext, PipelineOutcome};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What a worker does after a message has been through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Acknowledged, or dead-lettered and acknowledged.
    Settled,
    /// Re-enqueued by the deferral observer because it is not due yet.
    Deferred,
    /// Faulted and put back on the work queue; it will be seen again at once.
    Released,
}

// ---------------------------------------------------------------------------
// ProcessorStats
// ---------------------------------------------------------------------------

/// Per-pool processing counters.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    received: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    faulted: AtomicU64,
    dead_lettered: AtomicU64,
    released: AtomicU64,
}

/// Point-in-time copy of [`ProcessorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStatsSnapshot {
    pub received: u64,
    pub completed: u64,
    pub aborted: u64,
    pub faulted: u64,
    pub dead_lettered: u64,
    /// Faulted messages put back on the work queue because the error queue refused them.
    pub released: u64,
}

impl ProcessorStatsSnapshot {
    /// Messages that reached a terminal outcome.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.completed + self.aborted + self.faulted
    }
}

impl ProcessorStats {
    #[must_use]
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &PipelineOutcome) {
        let counter = match outcome {
            PipelineOutcome::Completed => &self.completed,
            PipelineOutcome::Aborted(_) => &self.aborted,
            PipelineOutcome::Faulted(_) => &self.faulted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// Queues and knobs for one pool.
#[derive(Clone)]
pub struct PoolSettings {
    /// `inbox` or `outbox`; used for thread names, spans and metric labels.
    pub name: &'static str,
    pub work_queue: Arc<dyn Queue>,
    pub error_queue: Arc<dyn Queue>,
    pub thread_count: usize,
    pub poll_timeout: Duration,
}

/// A running set of worker threads.
pub struct WorkerPool {
    name: &'static str,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `settings.thread_count` named worker threads.
    ///
    /// If a spawn fails, the threads already started are stopped before the
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns the OS error from [`thread::Builder::spawn`].
    pub fn start(
        settings: &PoolSettings,
        pipeline: &Pipeline,
        stats: Arc<ProcessorStats>,
    ) -> std::io::Result<Self> {
        let mut pool = Self {
            name: settings.name,
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::with_capacity(settings.thread_count),
        };

        for index in 0..settings.thread_count {
            let worker = Worker {
                index,
                settings: settings.clone(),
                pipeline: pipeline.clone(),
                stats: Arc::clone(&stats),
                stop: Arc::clone(&pool.stop),
            };
            let spawned = thread::Builder::new()
                .name(format!("relaybus-{}-{index}", settings.name))
                .spawn(move || worker.run());
            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.signal_stop();
                    pool.join(settings.poll_timeout * 2);
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }

    /// Tells every worker to exit after its current message.
    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Joins the workers, waiting at most `timeout` in total.
    ///
    /// Returns the number of workers still running when the wait ran out;
    /// those threads are detached.
    pub fn join(&mut self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let running = self.handles.iter().filter(|h| !h.is_finished()).count();
            if running == 0 || Instant::now() >= deadline {
                break;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        let mut unfinished = 0;
        for handle in self.handles.drain(..) {
            if !handle.is_finished() {
                unfinished += 1;
                continue;
            }
            if handle.join().is_err() {
                error!(pool = self.name, "worker thread panicked");
            }
        }
        unfinished
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.signal_stop();
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

struct Worker {
    index: usize,
    settings: PoolSettings,
    pipeline: Pipeline,
    stats: Arc<ProcessorStats>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        let span = info_span!(
            "inbox_worker",
            pool = self.settings.name,
            queue = %self.settings.work_queue.uri(),
            worker = self.index,
        );
        let _entered = span.enter();
        debug!("worker started");

        while !self.stopping() {
            let received = match self.settings.work_queue.get_message(self.settings.poll_timeout) {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(e) => {
                    if self.stopping() {
                        break;
                    }
                    warn!(error = %e, "dequeue failed");
                    self.pause(self.settings.poll_timeout);
                    continue;
                }
            };

            match self.process(received) {
                Disposition::Settled => {}
                Disposition::Deferred | Disposition::Released => {
                    self.pause(self.settings.poll_timeout);
                }
            }
        }

        debug!("worker stopped");
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleeps for up to `duration`, waking early when stop is signalled.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(JOIN_POLL_INTERVAL));
        }
    }

    fn process(&self, received: ReceivedMessage) -> Disposition {
        let pool = self.settings.name;
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relaybus_messages_received_total", "pool" => pool).increment(1);

        let token = received.token;
        let work_queue = &self.settings.work_queue;
        let mut ctx = PipelineContext::new(
            received,
            Arc::clone(work_queue),
            Arc::clone(&self.settings.error_queue),
        );
        let outcome = self.pipeline.execute(&mut ctx);

        self.stats.record(&outcome);
        metrics::counter!(
            "relaybus_messages_processed_total",
            "pool" => pool,
            "outcome" => outcome.label()
        )
        .increment(1);

        match &outcome {
            PipelineOutcome::Completed | PipelineOutcome::Aborted(_) => {
                if let Err(e) = work_queue.acknowledge(token) {
                    error!(error = %e, "acknowledge failed");
                }
                if matches!(outcome, PipelineOutcome::Aborted(AbortReason::Deferred { .. })) {
                    Disposition::Deferred
                } else {
                    Disposition::Settled
                }
            }
            PipelineOutcome::Faulted(fault) => {
                let mut message = ctx.into_received().message;
                let message_id = message.message_id;
                message.register_failure(fault.to_string());
                match self.settings.error_queue.enqueue(message) {
                    Ok(()) => {
                        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("relaybus_messages_dead_lettered_total", "pool" => pool)
                            .increment(1);
                        warn!(
                            %message_id,
                            error_queue = %self.settings.error_queue.uri(),
                            "message moved to error queue"
                        );
                        if let Err(e) = work_queue.acknowledge(token) {
                            error!(error = %e, %message_id, "acknowledge failed");
                        }
                        Disposition::Settled
                    }
                    Err(e) => {
                        error!(error = %e, %message_id, "error queue enqueue failed; releasing message");
                        self.stats.released.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = work_queue.release(token) {
                            error!(error = %e, %message_id, "release failed");
                        }
                        Disposition::Released
                    }
                }
            }
        }
    }
}
