//! Worker pool.
//!
//! A pool runs `n` worker units. Each unit pops a task from the engine's
//! ready-queue, invokes the step handler and reports the outcome back to the
//! engine, until told to stop. At most `n` handlers run at once.
//!
//! When the engine config sets an `archive_interval`, the pool also runs a
//! housekeeping task that calls [`WorkflowEngine::archive_completed`] on that
//! interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::executor::WorkflowEngine;
use crate::EngineError;

/// Starts worker units for one engine. A pool can be started once.
pub struct WorkerPool {
    engine: WorkflowEngine,
    started: AtomicBool,
}

impl WorkerPool {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self { engine, started: AtomicBool::new(false) }
    }

    /// Spawn `concurrency` worker units.
    ///
    /// # Errors
    /// [`EngineError::AlreadyStarted`] on a second call,
    /// [`EngineError::Config`] if `concurrency` is zero.
    pub fn start(&self, concurrency: usize) -> Result<WorkerHandle, EngineError> {
        if concurrency == 0 {
            return Err(EngineError::Config("worker concurrency must be at least 1".into()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let units = (0..concurrency)
            .map(|unit| tokio::spawn(run_unit(unit, self.engine.clone(), shutdown_rx.clone())))
            .collect();
        let archiver = self
            .engine
            .config()
            .archive_interval
            .filter(|every| !every.is_zero())
            .map(|every| tokio::spawn(run_archiver(every, self.engine.clone(), shutdown_rx.clone())));

        info!(concurrency, "worker pool started");
        Ok(WorkerHandle { shutdown, units, archiver })
    }

    /// Validate the engine config and start `max_concurrency` units.
    pub fn start_configured(&self) -> Result<WorkerHandle, EngineError> {
        self.engine.config().validate()?;
        self.start(self.engine.config().max_concurrency)
    }
}

/// Running pool.
///
/// Dropping the handle also stops the units, without waiting for in-flight
/// steps; call [`stop`](Self::stop) to wait for them.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    units: Vec<JoinHandle<()>>,
    archiver: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn concurrency(&self) -> usize {
        self.units.len()
    }

    /// Stop taking new tasks and wait for in-flight steps to be recorded.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        for unit in self.units.into_iter().chain(self.archiver) {
            if let Err(err) = unit.await {
                warn!(error = %err, "worker unit ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

async fn run_unit(unit: usize, engine: WorkflowEngine, mut shutdown: watch::Receiver<bool>) {
    debug!(unit, "worker unit started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let task = tokio::select! {
            biased;
            // Also fires when the handle is dropped.
            _ = shutdown.changed() => break,
            task = engine.queue().pop() => task,
        };
        debug!(unit, run_id = %task.run_id, step = %task.step, attempt = task.attempt, "task dequeued");
        engine.process(task).await;
    }
    debug!(unit, "worker unit stopped");
}

async fn run_archiver(every: Duration, engine: WorkflowEngine, mut shutdown: watch::Receiver<bool>) {
    let mut ticks = tokio::time::interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticks.tick() => {
                engine.archive_completed().await;
            }
        }
    }
}
