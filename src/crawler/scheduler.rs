use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

use super::executor::Executor;
use crate::db::Store;
use crate::model::{Job, JobSettlement, LogLevel, RetryPolicy};

pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(120);

/// How long a timed-out execution may take to observe its cancellation.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_secs(5),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Claims pending jobs, runs them on the executor with bounded concurrency,
/// and settles each one according to the retry policy.
pub struct Scheduler {
    store: Arc<dyn Store>,
    executor: Arc<dyn Executor>,
    settings: SchedulerSettings,
    slots: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn Executor>,
        mut settings: SchedulerSettings,
    ) -> Self {
        settings.concurrency = settings.concurrency.max(1);
        Self {
            store,
            executor,
            slots: Arc::new(Semaphore::new(settings.concurrency)),
            settings,
            tracker: TaskTracker::new(),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Tick until `shutdown` fires, then wait for in-flight jobs to return.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.settings.poll_interval.as_secs(),
            concurrency = self.settings.concurrency,
            "job scheduler started"
        );
        let period = self.settings.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once(&shutdown).await {
                        error!(?err, "claim job error");
                    }
                }
            }
        }
        info!("job scheduler stopping");
        self.wait_idle().await;
    }

    /// Claim and dispatch jobs while an execution slot is free and pending
    /// jobs remain. Returns the number of jobs dispatched.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<usize> {
        let mut dispatched = 0;
        while !shutdown.is_cancelled() {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let Some(job) = self.store.claim_next_job().await? else {
                break;
            };

            let store = self.store.clone();
            let executor = self.executor.clone();
            let settings = self.settings;
            let cancel = shutdown.child_token();
            self.tracker.spawn(async move {
                run_job(store.as_ref(), executor.as_ref(), &settings, job, &cancel).await;
                drop(permit);
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Wait until every dispatched execution has been settled.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[instrument(skip_all, fields(job_id = job.id, account_id = job.account_id))]
async fn run_job(
    store: &dyn Store,
    executor: &dyn Executor,
    settings: &SchedulerSettings,
    job: Job,
    cancel: &CancellationToken,
) {
    info!(retry_count = job.retry_count, "task started");
    append_log(store, job.id, LogLevel::Info, "task started").await;

    let timeout = settings.job_timeout;
    let execution = executor.execute(&job, cancel);
    tokio::pin!(execution);
    let outcome = tokio::select! {
        result = &mut execution => result,
        _ = tokio::time::sleep(timeout) => {
            // Deadline passed: signal the executor and give it a bounded
            // window to unwind before the future is dropped.
            cancel.cancel();
            if tokio::time::timeout(CANCEL_GRACE, &mut execution).await.is_err() {
                warn!(grace = ?CANCEL_GRACE, "executor ignored cancellation");
            }
            Err(anyhow::anyhow!("execution timed out after {:?}", timeout))
        }
    };

    let finished_at = Utc::now();
    match outcome {
        Ok(()) => {
            let settlement = JobSettlement::Succeeded { finished_at };
            if let Err(err) = store.settle_job(job.id, &settlement).await {
                error!(?err, "task succeeded but update failed");
            }
            append_log(store, job.id, LogLevel::Info, "task completed").await;
            info!("task completed");
        }
        Err(err) => {
            let message = format!("{:#}", err);
            append_log(store, job.id, LogLevel::Error, &message).await;
            let settlement = settings
                .retry
                .on_failure(job.retry_count, message.clone(), finished_at);
            warn!(
                retry_count = job.retry_count,
                next_status = settlement.status().as_str(),
                error = %message,
                "task failed"
            );
            if let Err(err) = store.settle_job(job.id, &settlement).await {
                error!(?err, "task failure update error");
            }
        }
    }
}

async fn append_log(store: &dyn Store, job_id: i64, level: LogLevel, message: &str) {
    if let Err(err) = store.append_job_log(job_id, level, message).await {
        error!(?err, job_id, "task log error");
    }
}
