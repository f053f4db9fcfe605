//! Recurring sweep scheduler.
//!
//! Uses `tokio-cron-scheduler` for interval and cron triggers. Sweeps never
//! overlap: a tick that fires while the previous sweep is still running is
//! skipped and recorded.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

use super::sweep::Poller;
use crate::storage::{Event, EventKind, EventSeverity, sources};

/// Minimum allowed interval (1 second).
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout for stopping the scheduler itself.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid schedule.
    #[error("config error: {0}")]
    Config(String),

    /// Scheduler backend failure.
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

/// When sweeps run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fixed interval between ticks, clamped to a minimum of 1 second.
    Interval(Duration),

    /// Cron expression: `sec min hour day month weekday` (6-field).
    /// Example: `"0 */5 * * * *"` = every 5 minutes at second 0
    Cron(String),
}

impl Schedule {
    /// Create an interval schedule.
    ///
    /// Interval is clamped to a minimum of 1 second.
    pub fn interval(duration: Duration) -> Self {
        if duration < MIN_INTERVAL {
            tracing::warn!(min_interval = ?MIN_INTERVAL,
                "Interval duration is less than minimum allowed. Using minimum duration."
            );
            Self::Interval(MIN_INTERVAL)
        } else {
            Self::Interval(duration)
        }
    }

    /// Create a cron schedule with immediate validation.
    ///
    /// # Errors
    /// Returns `SchedulerError::Config` if the cron expression is invalid.
    pub fn cron(expr: impl AsRef<str>) -> Result<Self, SchedulerError> {
        use std::str::FromStr;

        let expr = expr.as_ref();
        cron::Schedule::from_str(expr)
            .map_err(|e| SchedulerError::Config(format!("invalid cron expression: {e}")))?;

        Ok(Self::Cron(expr.to_string()))
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "every {}", humantime::format_duration(*d)),
            Self::Cron(expr) => write!(f, "cron: {}", expr),
        }
    }
}

/// Drives [`Poller::run_sweep`] on a [`Schedule`].
///
/// State is Idle or Running; the `running` lock is held for the duration of a
/// sweep and is the only thing ticks contend on.
pub struct PollScheduler {
    scheduler: JobScheduler,
    poller: Poller,
    schedule: Schedule,
    running: Arc<Mutex<()>>,
    cancel: CancellationToken,
    job_id: Option<uuid::Uuid>,
}

impl std::fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollScheduler")
            .field("schedule", &self.schedule)
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

impl PollScheduler {
    /// Create a scheduler. Nothing runs until [`start`](Self::start).
    pub async fn new(poller: Poller, schedule: Schedule) -> Result<Self, SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;

        Ok(Self {
            scheduler,
            poller,
            schedule,
            running: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
            job_id: None,
        })
    }

    /// Whether a sweep is in progress.
    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Register the sweep job and start ticking.
    pub async fn start(&mut self) -> Result<uuid::Uuid, SchedulerError> {
        let job = self.create_job()?;
        let job_id = self
            .scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        self.scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        self.job_id = Some(job_id);

        self.poller
            .emit(
                Event::new(
                    sources::SCHEDULER,
                    EventKind::System,
                    EventSeverity::Info,
                    "Poll scheduler started",
                )
                .with_payload("job_id", job_id.to_string())
                .with_payload("schedule", self.schedule.to_string()),
            )
            .await;
        tracing::info!(schedule = %self.schedule, job_id = %job_id, "Poll scheduler started");
        Ok(job_id)
    }

    /// Stop scheduling, cancel the running sweep and wait for it to wind down.
    ///
    /// The running sweep gets its own grace period; `timeout` bounds how long
    /// stopping the scheduler backend may take.
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), SchedulerError> {
        let stopped = tokio::time::timeout(timeout, self.scheduler.shutdown()).await;
        self.cancel.cancel();

        let wait = timeout + self.poller.settings().grace_period;
        let drained = tokio::time::timeout(wait, self.running.lock()).await.is_ok();

        let (severity, message) = match (&stopped, drained) {
            (Ok(Ok(())), true) => {
                tracing::info!("Poll scheduler shutdown complete");
                (EventSeverity::Info, "Poll scheduler shutdown complete")
            }
            _ => {
                tracing::warn!(drained, "Poll scheduler shutdown incomplete");
                (EventSeverity::Warn, "Poll scheduler shutdown incomplete")
            }
        };
        self.poller
            .emit(
                Event::new(sources::SCHEDULER, EventKind::System, severity, message)
                    .with_payload("drained", drained)
                    .with_payload("timed_out", stopped.is_err()),
            )
            .await;

        match stopped {
            Ok(Err(e)) => Err(SchedulerError::Scheduler(e.to_string())),
            _ => Ok(()),
        }
    }

    fn create_job(&self) -> Result<Job, SchedulerError> {
        let poller = self.poller.clone();
        let running = Arc::clone(&self.running);
        let cancel = self.cancel.clone();

        let callback = move |_: uuid::Uuid, _: JobScheduler| {
            let (poller, running, cancel) = (poller.clone(), Arc::clone(&running), cancel.clone());
            Box::pin(async move { run_tick(&poller, &running, &cancel).await })
                as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        };

        match &self.schedule {
            Schedule::Interval(d) => Job::new_repeated_async(*d, callback),
            Schedule::Cron(expr) => Job::new_cron_job_async(expr, callback),
        }
        .map_err(|e| SchedulerError::Scheduler(e.to_string()))
    }
}

/// One scheduler tick: run a sweep unless one is already running.
async fn run_tick(poller: &Poller, running: &Mutex<()>, cancel: &CancellationToken) {
    if cancel.is_cancelled() {
        return;
    }
    let Ok(_guard) = running.try_lock() else {
        tracing::warn!("Previous sweep still running; tick skipped");
        poller
            .emit(Event::new(
                sources::SCHEDULER,
                EventKind::System,
                EventSeverity::Warn,
                "Sweep tick skipped: previous sweep still running",
            ))
            .await;
        return;
    };

    if let Err(e) = poller.run_sweep(cancel).await {
        tracing::error!(error = %e, "Sweep could not start");
        poller
            .emit(
                Event::new(
                    sources::SCHEDULER,
                    EventKind::Error,
                    EventSeverity::Error,
                    format!("Sweep could not start: {e}"),
                )
                .with_payload("error", e.to_string()),
            )
            .await;
    }
}
