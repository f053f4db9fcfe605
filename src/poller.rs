//! Telemetry Poller
//!
//! Recurring, failure-isolated collection across the whole registry.
//!
//! - [`Poller`]: `run_sweep_once` / `run_sweep` with a bounded worker pool
//! - [`PollScheduler`]: Interval or cron trigger, overlapping ticks skipped

mod scheduler;
mod sweep;

pub use scheduler::{DEFAULT_SHUTDOWN_TIMEOUT, MIN_INTERVAL, PollScheduler, Schedule, SchedulerError};
pub use sweep::{
    DEFAULT_CONCURRENCY, DEFAULT_DEVICE_TIMEOUT, DEFAULT_GRACE_PERIOD, DeviceOutcome, PollError,
    Poller, PollerSettings, SweepReport,
};
