//! Elastic worker pool
//!
//! Each worker is an independent polling loop: on every tick it claims at most
//! one due job, executes it, and finishes it. Workers never share an in-process
//! lock; the store's transactions are the only coordination between them.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::PoolError;
use crate::store::ScheduleStore;

mod executor;


pub use executor::{ActionExecutor, LoggingExecutor};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

struct WorkerShared {
    store: Arc<dyn ScheduleStore>,
    executor: Arc<dyn ActionExecutor>,
    poll_interval: Duration,
}

struct WorkerHandle {
    id: usize,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct PoolState {
    active: Vec<WorkerHandle>,
    /// Workers told to stop by `remove_workers` that may still be finishing a tick.
    retiring: Vec<JoinHandle<()>>,
    next_worker_id: usize,
    stopped: bool,
}

pub struct WorkerPool {
    shared: Arc<WorkerShared>,
    shutdown: CancellationToken,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    /// Create an idle pool. A zero `poll_interval` falls back to
    /// [`DEFAULT_POLL_INTERVAL`]; anything above [`MAX_POLL_INTERVAL`] is
    /// capped.
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        executor: Arc<dyn ActionExecutor>,
        poll_interval: Duration,
    ) -> Self {
        let poll_interval = if poll_interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            poll_interval.min(MAX_POLL_INTERVAL)
        };

        Self {
            shared: Arc::new(WorkerShared {
                store,
                executor,
                poll_interval,
            }),
            shutdown: CancellationToken::new(),
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.shared.poll_interval
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the initial `n` workers. Fails if any worker is already running.
    pub fn start(&self, n: usize) -> Result<(), PoolError> {
        let mut state = self.lock();
        if state.stopped {
            return Err(PoolError::Stopped);
        }
        if !state.active.is_empty() {
            return Err(PoolError::AlreadyStarted(state.active.len()));
        }
        self.spawn_workers(&mut state, n);
        info!(workers = n, "worker pool started");
        Ok(())
    }

    pub fn add_workers(&self, n: usize) -> Result<(), PoolError> {
        let mut state = self.lock();
        if state.stopped {
            return Err(PoolError::Stopped);
        }
        self.spawn_workers(&mut state, n);
        info!(added = n, running = state.active.len(), "workers added");
        Ok(())
    }

    /// Ask `n` distinct workers to exit at their next tick boundary.
    ///
    /// Fails without touching any worker if fewer than `n` are running.
    pub fn remove_workers(&self, n: usize) -> Result<(), PoolError> {
        let mut state = self.lock();
        let running = state.active.len();
        if n > running {
            return Err(PoolError::NotEnoughWorkers {
                running,
                requested: n,
            });
        }

        state.retiring.retain(|join| !join.is_finished());
        for worker in state.active.split_off(running - n) {
            debug!(worker_id = worker.id, "stop signal sent to worker");
            worker.cancel.cancel();
            state.retiring.push(worker.join);
        }
        info!(removed = n, running = state.active.len(), "workers removed");
        Ok(())
    }

    pub fn running_workers(&self) -> usize {
        self.lock().active.len()
    }

    /// Signal every worker to exit and wait until all of them have.
    ///
    /// In-flight ticks run to completion. The pool cannot be restarted.
    pub async fn stop(&self) {
        let joins: Vec<JoinHandle<()>> = {
            let mut state = self.lock();
            state.stopped = true;
            self.shutdown.cancel();

            let mut joins: Vec<_> = state.active.drain(..).map(|w| w.join).collect();
            joins.append(&mut state.retiring);
            joins
        };

        info!(workers = joins.len(), "stopping worker pool");
        for join in joins {
            if let Err(err) = join.await {
                error!(error = ?err, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }

    fn spawn_workers(&self, state: &mut PoolState, n: usize) {
        for _ in 0..n {
            state.next_worker_id += 1;
            let id = state.next_worker_id;
            let cancel = self.shutdown.child_token();
            let join = tokio::spawn(run_worker(id, Arc::clone(&self.shared), cancel.clone()));
            state.active.push(WorkerHandle { id, cancel, join });
        }
    }
}

async fn run_worker(worker_id: usize, shared: Arc<WorkerShared>, cancel: CancellationToken) {
    debug!(worker_id, "worker started");

    let period = shared.poll_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => shared.process_next(worker_id).await,
        }
    }

    debug!(worker_id, "worker stopped");
}

impl WorkerShared {
    /// One tick: claim → execute → finish. Failures are logged; the next tick
    /// is the retry.
    async fn process_next(&self, worker_id: usize) {
        let job = match self.store.take_job_into_work().await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(err) => {
                error!(worker_id, error = ?err, "failed to take job into work");
                return;
            }
        };

        debug!(
            worker_id,
            job_id = job.id,
            queue_key = %job.queue_key,
            action = %job.action,
            "job claimed"
        );

        if let Err(err) = self.executor.execute(&job).await {
            warn!(
                worker_id,
                job_id = job.id,
                action = %job.action,
                error = ?err,
                "job action failed"
            );
        }

        if let Err(err) = self.store.finish_job(&job).await {
            error!(worker_id, job_id = job.id, error = ?err, "failed to finish job");
        }
    }
}
