//! Heartbeat monitor
//!
//! Periodically finds running jobs whose claim is older than the configured
//! maximum running duration and renews them, which returns the job to `new`
//! and its queue to `ready`. This is the only recovery path for a worker that
//! crashed or hung mid-execution.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::store::ScheduleStore;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_RUNNING: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_RENEW_CONCURRENCY: usize = 10;
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const MAX_RUNNING_LIMIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between scans.
    pub poll_interval: Duration,
    /// A claim older than this is treated as abandoned.
    pub max_running: Duration,
    /// Maximum renewals in flight at once.
    pub renew_concurrency: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_running: DEFAULT_MAX_RUNNING,
            renew_concurrency: DEFAULT_RENEW_CONCURRENCY,
        }
    }
}

impl From<&MonitorConfig> for HeartbeatConfig {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_running: config.max_running(),
            renew_concurrency: config.renew_concurrency,
        }
    }
}

struct MonitorShared {
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    config: HeartbeatConfig,
}

struct RunningLoop {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct HeartbeatMonitor {
    shared: Arc<MonitorShared>,
    running: Mutex<Option<RunningLoop>>,
}

impl HeartbeatMonitor {
    pub fn new(store: Arc<dyn ScheduleStore>, config: HeartbeatConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Zero values in `config` fall back to the defaults. A poll interval
    /// above [`MAX_POLL_INTERVAL`] is capped.
    pub fn with_clock(
        store: Arc<dyn ScheduleStore>,
        mut config: HeartbeatConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if config.poll_interval.is_zero() {
            config.poll_interval = DEFAULT_POLL_INTERVAL;
        }
        config.poll_interval = config.poll_interval.min(MAX_POLL_INTERVAL);
        if config.renew_concurrency == 0 {
            config.renew_concurrency = DEFAULT_RENEW_CONCURRENCY;
        }

        Self {
            shared: Arc::new(MonitorShared {
                store,
                clock,
                config,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.shared.config
    }

    pub fn start(&self) -> Result<(), MonitorError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(MonitorError::AlreadyStarted);
        }

        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_monitor(Arc::clone(&self.shared), cancel.clone()));
        *running = Some(RunningLoop { cancel, join });
        Ok(())
    }

    /// Stop the loop, waiting for the current scan (if any) to finish.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(err) = running.join.await {
            error!(error = ?err, "heartbeat monitor task panicked");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Run a single scan and return how many jobs were renewed.
    pub async fn check_once(&self) -> usize {
        self.shared.check_once().await
    }
}

async fn run_monitor(shared: Arc<MonitorShared>, cancel: CancellationToken) {
    info!(
        interval_ms = shared.config.poll_interval.as_millis() as u64,
        max_running_secs = shared.config.max_running.as_secs(),
        renew_concurrency = shared.config.renew_concurrency,
        "heartbeat monitor started"
    );

    let period = shared.config.poll_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                shared.check_once().await;
            }
        }
    }

    info!("heartbeat monitor stopped");
}

impl MonitorShared {
    async fn check_once(&self) -> usize {
        let max_running = match chrono::Duration::from_std(self.config.max_running) {
            Ok(max_running) => max_running,
            Err(err) => {
                error!(error = ?err, "invalid max running duration");
                return 0;
            }
        };
        let Some(cutoff) = self.clock.now().checked_sub_signed(max_running) else {
            error!(
                max_running_secs = self.config.max_running.as_secs(),
                "max running duration underflows the staleness cutoff"
            );
            return 0;
        };

        let jobs = match self.store.list_overdue_running(cutoff).await {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(error = ?err, "failed to get running jobs for too long");
                return 0;
            }
        };

        if jobs.is_empty() {
            return 0;
        }

        info!(
            overdue = jobs.len(),
            cutoff = %cutoff,
            "renewing jobs running for too long"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.renew_concurrency));
        let mut renewals = JoinSet::new();

        for job in jobs {
            // The semaphore is never closed, so acquiring cannot fail.
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let store = Arc::clone(&self.store);
            renewals.spawn(async move {
                let _permit = permit;
                match store.renew_job(&job).await {
                    Ok(()) => {
                        debug!(job_id = job.id, queue_key = %job.queue_key, "job renewed");
                        true
                    }
                    Err(err) => {
                        warn!(job_id = job.id, error = ?err, "failed to renew job");
                        false
                    }
                }
            });
        }

        let mut renewed = 0;
        while let Some(result) = renewals.join_next().await {
            match result {
                Ok(true) => renewed += 1,
                Ok(false) => {}
                Err(err) => error!(error = ?err, "renewal task panicked"),
            }
        }

        renewed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use crate::types::{Job, JobListFilter, JobState, NewJob, Queue, QueueState};

    fn new_job(queue: &str, due_at: DateTime<Utc>) -> NewJob {
        NewJob {
            queue_key: queue.to_string(),
            due_at,
            action: format!("{queue}-action"),
        }
    }

    fn monitor_for(store: Arc<dyn ScheduleStore>, clock: Arc<ManualClock>) -> HeartbeatMonitor {
        HeartbeatMonitor::with_clock(store, HeartbeatConfig::default(), clock)
    }

    #[tokio::test]
    async fn test_abandoned_job_is_renewed_and_reclaimable() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let monitor = monitor_for(store.clone(), clock.clone());

        store
            .insert_job(new_job("q1", now - ChronoDuration::seconds(1)))
            .await
            .unwrap();
        let claimed = store.take_job_into_work().await.unwrap().unwrap();
        assert_eq!(claimed.last_claimed_at, Some(now));

        // Not yet stale.
        clock.advance(ChronoDuration::minutes(4));
        assert_eq!(monitor.check_once().await, 0);
        assert_eq!(
            store.get_job(claimed.id).await.unwrap().unwrap().state,
            JobState::Running
        );

        clock.advance(ChronoDuration::minutes(2));
        assert_eq!(monitor.check_once().await, 1);

        let job = store.get_job(claimed.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::New);
        let queue = store.get_queue("q1").await.unwrap().unwrap();
        assert_eq!(queue.state, QueueState::Ready);
        store.assert_consistent();

        let reclaimed = store.take_job_into_work().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.last_claimed_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_no_overdue_jobs_is_noop() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let monitor = monitor_for(store.clone(), clock);

        assert_eq!(monitor.check_once().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_renews_many_stale_jobs() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));

        for i in 0..25 {
            store
                .insert_job(new_job(&format!("q{i}"), now - ChronoDuration::seconds(1)))
                .await
                .unwrap();
        }
        while store.take_job_into_work().await.unwrap().is_some() {}

        clock.advance(ChronoDuration::minutes(10));
        let monitor = monitor_for(store.clone(), clock);
        assert_eq!(monitor.check_once().await, 25);

        let running = store
            .list_jobs(JobListFilter {
                state: Some(JobState::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(running.is_empty());
        store.assert_consistent();
    }

    /// Counts concurrent renewals and fails one chosen job.
    struct ProbeStore {
        inner: MemoryStore,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        fail_job: i64,
    }

    #[async_trait]
    impl ScheduleStore for ProbeStore {
        async fn insert_job(&self, job: NewJob) -> Result<Job, StoreError> {
            self.inner.insert_job(job).await
        }

        async fn take_job_into_work(&self) -> Result<Option<Job>, StoreError> {
            self.inner.take_job_into_work().await
        }

        async fn finish_job(&self, job: &Job) -> Result<(), StoreError> {
            self.inner.finish_job(job).await
        }

        async fn renew_job(&self, job: &Job) -> Result<(), StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if job.id == self.fail_job {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.renew_job(job).await
        }

        async fn list_overdue_running(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<Vec<Job>, StoreError> {
            self.inner.list_overdue_running(cutoff).await
        }

        async fn get_job(&self, job_id: i64) -> Result<Option<Job>, StoreError> {
            self.inner.get_job(job_id).await
        }

        async fn get_queue(&self, queue_key: &str) -> Result<Option<Queue>, StoreError> {
            self.inner.get_queue(queue_key).await
        }

        async fn list_jobs(&self, filter: JobListFilter) -> Result<Vec<Job>, StoreError> {
            self.inner.list_jobs(filter).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_renewals_bounded_and_isolated() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let inner = MemoryStore::with_clock(clock.clone());
        for i in 0..30 {
            inner
                .insert_job(new_job(&format!("q{i}"), now - ChronoDuration::seconds(1)))
                .await
                .unwrap();
        }
        while inner.take_job_into_work().await.unwrap().is_some() {}

        let store = Arc::new(ProbeStore {
            inner,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            fail_job: 7,
        });
        clock.advance(ChronoDuration::minutes(6));

        let config = HeartbeatConfig {
            renew_concurrency: 4,
            ..Default::default()
        };
        let monitor = HeartbeatMonitor::with_clock(store.clone(), config, clock);

        assert_eq!(monitor.check_once().await, 29);
        assert!(store.peak.load(Ordering::SeqCst) <= 4);

        let failed = store.get_job(7).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Running);
        store.inner.assert_consistent();
    }

    #[tokio::test]
    async fn test_start_twice_and_stop() {
        let store = Arc::new(MemoryStore::new());
        let monitor = HeartbeatMonitor::new(store, HeartbeatConfig::default());

        monitor.start().unwrap();
        assert!(monitor.is_running());
        assert_eq!(monitor.start(), Err(MonitorError::AlreadyStarted));

        monitor.stop().await;
        assert!(!monitor.is_running());

        // Stopping an idle monitor is a no-op.
        monitor.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_renews_on_tick() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_job(new_job("q1", Utc::now() - ChronoDuration::seconds(1)))
            .await
            .unwrap();
        let claimed = store.take_job_into_work().await.unwrap().unwrap();

        let config = HeartbeatConfig {
            poll_interval: std::time::Duration::from_millis(10),
            max_running: std::time::Duration::ZERO,
            renew_concurrency: 2,
        };
        let monitor = HeartbeatMonitor::new(store.clone(), config);
        monitor.start().unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                let job = store.get_job(claimed.id).await.unwrap().unwrap();
                if job.state == JobState::New {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("monitor did not renew the job");

        monitor.stop().await;
        store.assert_consistent();
    }

    #[tokio::test]
    async fn test_unrepresentable_cutoff_skips_scan() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_job(new_job("q1", Utc::now() - ChronoDuration::seconds(1)))
            .await
            .unwrap();
        let claimed = store.take_job_into_work().await.unwrap().unwrap();

        let config = HeartbeatConfig {
            max_running: std::time::Duration::from_secs(9_000_000_000_000),
            ..Default::default()
        };
        let monitor = HeartbeatMonitor::new(store.clone(), config);

        assert_eq!(monitor.check_once().await, 0);
        let job = store.get_job(claimed.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
    }

    #[tokio::test]
    async fn test_oversized_poll_interval_is_capped() {
        let config = HeartbeatConfig {
            poll_interval: std::time::Duration::from_secs(u64::MAX),
            ..Default::default()
        };
        let monitor = HeartbeatMonitor::new(Arc::new(MemoryStore::new()), config);
        assert_eq!(monitor.config().poll_interval, MAX_POLL_INTERVAL);

        monitor.start().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let alive = monitor
            .running
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|running| !running.join.is_finished());
        assert!(alive, "monitor loop exited");

        monitor.stop().await;
    }

    #[test]
    fn test_config_from_monitor_section() {
        let section = MonitorConfig {
            poll_interval_secs: 15,
            max_running_secs: 90,
            renew_concurrency: 3,
        };
        let config = HeartbeatConfig::from(&section);
        assert_eq!(config.poll_interval, std::time::Duration::from_secs(15));
        assert_eq!(config.max_running, std::time::Duration::from_secs(90));
        assert_eq!(config.renew_concurrency, 3);
    }
}
