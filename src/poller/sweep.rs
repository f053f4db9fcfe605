//! One sweep across the registry.
//!
//! Every device is polled in its own task behind a bounded semaphore. A
//! device's failure is captured in its [`DeviceOutcome`] and never reaches
//! the other tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::device::{SessionError, SessionFactory, SystemResources};
use crate::error::ErrorKind;
use crate::sink::{MetricsSample, MetricsSink, SinkError};
use crate::storage::{
    DeviceRecord, Event, EventKind, EventSeverity, EventWriter, RegistryError, StorageAdmin,
    sources,
};

/// Default number of devices polled at once.
pub const DEFAULT_CONCURRENCY: usize = 16;

/// Default deadline for one device (connect, query, sink write).
pub const DEFAULT_DEVICE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time in-flight devices get after cancellation.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Sweep tuning.
#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub concurrency: usize,
    pub device_timeout: Duration,
    pub grace_period: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            device_timeout: DEFAULT_DEVICE_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Why one device's poll failed.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("device poll exceeded {0:?}")]
    Timeout(Duration),

    #[error("device task panicked: {0}")]
    Panicked(String),
}

impl PollError {
    /// Failure category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Session(e) => e.kind(),
            Self::Sink(_) => ErrorKind::Sink,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Panicked(_) => ErrorKind::Panic,
        }
    }
}

/// Result of polling one device.
#[derive(Debug)]
pub struct DeviceOutcome {
    pub device_id: i64,
    pub name: String,
    pub duration: Duration,
    pub result: Result<(), PollError>,
}

/// Aggregate result of one sweep.
#[derive(Debug)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// One entry per device that finished, succeeded, failed or panicked.
    pub outcomes: Vec<DeviceOutcome>,
    /// Devices never started because the sweep was cancelled.
    pub skipped: usize,
    /// Devices still running when the grace period ran out.
    pub abandoned: usize,
    /// Device tasks that panicked; each also has a failed outcome.
    pub panicked: usize,
}

impl SweepReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// Failed outcomes only.
    pub fn failures(&self) -> impl Iterator<Item = &DeviceOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    /// True when every device was polled successfully.
    pub fn is_clean(&self) -> bool {
        self.failed() == 0 && self.skipped == 0 && self.abandoned == 0 && self.panicked == 0
    }

    /// JSON summary for logs and the CLI.
    pub fn summary(&self) -> serde_json::Value {
        let failures: Vec<_> = self
            .failures()
            .filter_map(|o| {
                o.result.as_ref().err().map(|e| {
                    serde_json::json!({
                        "device_id": o.device_id,
                        "device": o.name,
                        "kind": e.kind(),
                        "error": e.to_string(),
                    })
                })
            })
            .collect();

        serde_json::json!({
            "started_at": self.started_at.to_rfc3339(),
            "duration_ms": self.duration.as_millis() as u64,
            "succeeded": self.succeeded(),
            "failed": self.failed(),
            "skipped": self.skipped,
            "abandoned": self.abandoned,
            "panicked": self.panicked,
            "failures": failures,
        })
    }
}

/// Telemetry poller.
///
/// Cheap to clone; clones share the session factory, sink and event log.
#[derive(Clone)]
pub struct Poller {
    sessions: SessionFactory,
    sink: Arc<dyn MetricsSink>,
    events: Option<EventWriter>,
    retention: Option<(StorageAdmin, u32)>,
    settings: PollerSettings,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("sessions", &self.sessions)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Poller {
    pub fn new(sessions: SessionFactory, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            sessions,
            sink,
            events: None,
            retention: None,
            settings: PollerSettings::default(),
        }
    }

    /// Record failures and sweep summaries in the event log.
    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Prune samples and events older than `retention_days` after each
    /// sweep. Zero keeps everything.
    pub fn with_retention(mut self, admin: StorageAdmin, retention_days: u32) -> Self {
        self.retention = (retention_days > 0).then_some((admin, retention_days));
        self
    }

    pub fn with_settings(mut self, settings: PollerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    pub fn sessions(&self) -> &SessionFactory {
        &self.sessions
    }

    /// Run one complete sweep. Entry point for external job runners.
    ///
    /// # Errors
    /// Only a failure to read the device list is returned; per-device
    /// failures are reported in the [`SweepReport`].
    pub async fn run_sweep_once(&self) -> Result<SweepReport, RegistryError> {
        self.run_sweep(&CancellationToken::new()).await
    }

    /// Run one sweep that stops on `cancel`.
    ///
    /// After cancellation no new device is started; devices already running
    /// get the grace period to finish and are then abandoned.
    pub async fn run_sweep(&self, cancel: &CancellationToken) -> Result<SweepReport, RegistryError> {
        let started_at = Utc::now();
        let start = Instant::now();

        let devices = self.sessions.devices().list_devices().await?;
        tracing::debug!(devices = devices.len(), "Sweep started");

        let permits = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        let mut running = HashMap::new();
        let mut skipped = 0;

        let mut queue = devices.into_iter();
        while let Some(record) = queue.next() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                skipped = 1 + queue.len();
                break;
            };

            let identity = (record.id, record.name.clone(), Instant::now());
            let worker = self.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                worker.poll_device(record).await
            });
            running.insert(handle.id(), identity);
        }

        let mut outcomes = Vec::new();
        let mut abandoned = 0;
        let mut panicked = 0;

        let grace = self.settings.grace_period;
        let deadline = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => match joined {
                    None => break,
                    Some(Ok((id, outcome))) => {
                        running.remove(&id);
                        outcomes.push(outcome);
                    }
                    Some(Err(e)) => {
                        panicked += 1;
                        if let Some((device_id, name, started)) = running.remove(&e.id()) {
                            let error = PollError::Panicked(panic_message(e));
                            let duration = started.elapsed();
                            self.report_failure(device_id, &name, &error, duration).await;
                            outcomes.push(DeviceOutcome {
                                device_id,
                                name,
                                duration,
                                result: Err(error),
                            });
                        } else {
                            tracing::error!(error = %e, "Untracked device task failed");
                        }
                    }
                },
                _ = &mut deadline => {
                    abandoned = tasks.len();
                    tracing::warn!(abandoned, grace = ?grace, "Grace period elapsed; abandoning in-flight devices");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        let report = SweepReport {
            started_at,
            duration: start.elapsed(),
            outcomes,
            skipped,
            abandoned,
            panicked,
        };
        self.record_summary(&report).await;
        self.apply_retention().await;
        Ok(report)
    }

    async fn poll_device(&self, record: DeviceRecord) -> DeviceOutcome {
        let start = Instant::now();
        let timeout = self.settings.device_timeout;

        let result = match tokio::time::timeout(timeout, self.collect(&record)).await {
            Ok(result) => result,
            Err(_) => Err(PollError::Timeout(timeout)),
        };
        let duration = start.elapsed();

        match &result {
            Ok(()) => {
                tracing::debug!(
                    device_id = record.id,
                    device = %record.name,
                    duration_ms = duration.as_millis() as u64,
                    "Device polled"
                );
            }
            Err(e) => self.report_failure(record.id, &record.name, e, duration).await,
        }

        DeviceOutcome {
            device_id: record.id,
            name: record.name,
            duration,
            result,
        }
    }

    async fn collect(&self, record: &DeviceRecord) -> Result<(), PollError> {
        let payload = self.sessions.query_record(record, &SystemResources).await?;
        self.sink.write(MetricsSample::new(record.id, payload)).await?;
        Ok(())
    }

    async fn report_failure(&self, device_id: i64, name: &str, error: &PollError, duration: Duration) {
        let kind = error.kind();
        tracing::warn!(
            device_id,
            device = %name,
            kind = %kind,
            error = %error,
            "Device poll failed"
        );

        // Undecryptable secrets mean key drift, not a flaky device.
        let (event_kind, severity) = match kind {
            ErrorKind::Decryption => (EventKind::Alert, EventSeverity::Critical),
            _ => (EventKind::Error, EventSeverity::Error),
        };
        self.emit(
            Event::new(
                sources::POLLER,
                event_kind,
                severity,
                format!("Poll of '{}' failed: {}", name, error),
            )
            .with_payload("device_id", device_id)
            .with_payload("device", name)
            .with_payload("kind", kind.as_ref())
            .with_payload("error", error.to_string())
            .with_payload("duration_ms", duration.as_millis() as u64),
        )
        .await;
    }

    async fn record_summary(&self, report: &SweepReport) {
        let duration_ms = report.duration.as_millis() as u64;
        let (severity, message) = if report.is_clean() {
            tracing::info!(
                succeeded = report.succeeded(),
                duration_ms,
                "Sweep completed"
            );
            (EventSeverity::Info, "Sweep completed")
        } else {
            tracing::warn!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                skipped = report.skipped,
                abandoned = report.abandoned,
                duration_ms,
                "Sweep completed with failures"
            );
            (EventSeverity::Warn, "Sweep completed with failures")
        };

        let mut event = Event::new(sources::POLLER, EventKind::System, severity, message);
        event.payload = report.summary();
        self.emit(event).await;
    }

    async fn apply_retention(&self) {
        let Some((admin, days)) = &self.retention else {
            return;
        };
        let samples = admin.cleanup_metric_samples(*days).await;
        let events = admin.cleanup_events(*days).await;
        match (samples, events) {
            (Ok(samples), Ok(events)) if samples + events > 0 => {
                tracing::info!(samples, events, retention_days = *days, "Expired rows removed");
            }
            (Ok(_), Ok(_)) => {}
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Retention cleanup failed");
            }
        }
    }

    pub(crate) async fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.emit(event).await;
        }
    }
}

/// Text of a task panic, if it carried one.
fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{KeyRing, SecretCipher};
    use crate::device::{Credentials, DeviceConnector, DeviceError, DeviceSession, Record};
    use crate::storage::{EventQuery, MEMORY_PATH, NewDevice, StorageBuilder, StorageHandles};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Answers `/system/resource/print`; addresses listed in `down` refuse,
    /// addresses in `slow` hang, addresses in `broken` panic on connect.
    #[derive(Default)]
    struct Lab {
        down: Vec<String>,
        slow: Vec<String>,
        broken: Vec<String>,
    }

    struct LabSession {
        slow: bool,
    }

    #[async_trait]
    impl DeviceSession for LabSession {
        async fn run_command(
            &mut self,
            _command: &str,
            _args: &[(&str, &str)],
        ) -> Result<Vec<Record>, DeviceError> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let mut record = Record::new();
            record.insert("cpu".into(), 5.into());
            Ok(vec![record])
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl DeviceConnector for Lab {
        fn transport(&self) -> &str {
            "lab"
        }

        async fn connect(
            &self,
            credentials: &Credentials,
        ) -> Result<Box<dyn DeviceSession>, DeviceError> {
            if self.broken.contains(&credentials.address) {
                panic!("connector bug for {}", credentials.address);
            }
            if self.down.contains(&credentials.address) {
                return Err(DeviceError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            Ok(Box::new(LabSession {
                slow: self.slow.contains(&credentials.address),
            }))
        }
    }

    #[derive(Default)]
    struct MemorySink {
        samples: Mutex<Vec<MetricsSample>>,
        reject: bool,
    }

    #[async_trait]
    impl MetricsSink for MemorySink {
        async fn write(&self, sample: MetricsSample) -> Result<(), SinkError> {
            if self.reject {
                return Err(SinkError::Unavailable("down for maintenance".into()));
            }
            self.samples.lock().unwrap().push(sample);
            Ok(())
        }
    }

    async fn storage(keys: &std::path::Path, devices: usize) -> StorageHandles {
        let ring = KeyRing::load_or_init(keys).unwrap();
        let cipher = Arc::new(SecretCipher::new(&ring).unwrap());
        let handles = StorageBuilder::new(MEMORY_PATH).build(cipher).await.unwrap();
        for i in 1..=devices {
            handles
                .device_store
                .add_device(&NewDevice::new(
                    format!("edge-{i}"),
                    format!("10.0.0.{i}"),
                    "admin",
                    "pw",
                ))
                .await
                .unwrap();
        }
        handles
    }

    fn poller(handles: &StorageHandles, lab: Lab, sink: Arc<MemorySink>) -> Poller {
        let sessions = SessionFactory::new(handles.device_store.clone(), Arc::new(lab));
        Poller::new(sessions, sink).with_events(handles.event_writer.clone())
    }

    #[tokio::test]
    async fn test_sweep_isolates_failing_device() {
        let keys = tempfile::tempdir().unwrap();
        let handles = storage(keys.path(), 4).await;
        let sink = Arc::new(MemorySink::default());
        let lab = Lab {
            down: vec!["10.0.0.3".into()],
            ..Default::default()
        };

        let report = poller(&handles, lab, sink.clone()).run_sweep_once().await.unwrap();

        assert_eq!(report.succeeded(), 3);
        assert_eq!(report.failed(), 1);
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.name, "edge-3");
        assert_eq!(failure.result.as_ref().unwrap_err().kind(), ErrorKind::Connection);

        let mut written: Vec<i64> = sink.samples.lock().unwrap().iter().map(|s| s.device_id).collect();
        written.sort();
        assert_eq!(written, [1, 2, 4]);

        let errors = handles
            .event_reader
            .query(EventQuery {
                kind: Some(EventKind::Error),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["device_id"], 3);
        assert_eq!(errors[0].payload["kind"], "connection");
    }

    #[tokio::test]
    async fn test_panicking_device_is_reported() {
        let keys = tempfile::tempdir().unwrap();
        let handles = storage(keys.path(), 3).await;
        let sink = Arc::new(MemorySink::default());
        let lab = Lab {
            broken: vec!["10.0.0.2".into()],
            ..Default::default()
        };

        let report = poller(&handles, lab, sink.clone()).run_sweep_once().await.unwrap();

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.panicked, 1);
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.device_id, 2);
        assert_eq!(failure.name, "edge-2");
        let error = failure.result.as_ref().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Panic);
        assert!(error.to_string().contains("connector bug for 10.0.0.2"));

        let summary = report.summary();
        assert_eq!(summary["failures"][0]["device_id"], 2);
        assert_eq!(summary["failures"][0]["kind"], "panic");

        let errors = handles
            .event_reader
            .query(EventQuery {
                kind: Some(EventKind::Error),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload["device_id"], 2);
        assert_eq!(errors[0].payload["kind"], "panic");
    }

    #[tokio::test]
    async fn test_sweep_prunes_expired_rows() {
        let keys = tempfile::tempdir().unwrap();
        let handles = storage(keys.path(), 1).await;
        let mut expired = MetricsSample::new(1, serde_json::json!({"cpu": 1}));
        expired.collected_at = Utc::now() - chrono::Duration::days(8);
        handles.metric_writer.insert(&expired).await.unwrap();

        let sessions = SessionFactory::new(handles.device_store.clone(), Arc::new(Lab::default()));
        let sink: Arc<dyn MetricsSink> = Arc::new(handles.metric_writer.clone());
        Poller::new(sessions, sink)
            .with_retention(handles.storage_admin.clone(), 7)
            .run_sweep_once()
            .await
            .unwrap();

        let samples = handles
            .metric_reader
            .query(crate::storage::MetricQuery {
                start: Some(Utc::now() - chrono::Duration::days(365)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].payload["cpu"], 5);
    }

    #[tokio::test]
    async fn test_sink_failure_is_per_device() {
        let keys = tempfile::tempdir().unwrap();
        let handles = storage(keys.path(), 2).await;
        let sink = Arc::new(MemorySink {
            reject: true,
            ..Default::default()
        });

        let report = poller(&handles, Lab::default(), sink).run_sweep_once().await.unwrap();

        assert_eq!(report.failed(), 2);
        assert!(report.failures().all(|o| o.result.as_ref().unwrap_err().kind() == ErrorKind::Sink));
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let keys = tempfile::tempdir().unwrap();
        let handles = storage(keys.path(), 0).await;
        let report = poller(&handles, Lab::default(), Arc::new(MemorySink::default()))
            .run_sweep_once()
            .await
            .unwrap();
        assert!(report.outcomes.is_empty());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_device_timeout() {
        let keys = tempfile::tempdir().unwrap();
        let handles = storage(keys.path(), 2).await;
        let lab = Lab {
            slow: vec!["10.0.0.2".into()],
            ..Default::default()
        };
        let settings = PollerSettings {
            device_timeout: Duration::from_millis(100),
            ..Default::default()
        };

        let report = poller(&handles, lab, Arc::new(MemorySink::default()))
            .with_settings(settings)
            .run_sweep_once()
            .await
            .unwrap();

        assert_eq!(report.succeeded(), 1);
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.device_id, 2);
        assert_eq!(failure.result.as_ref().unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancel_abandons_after_grace() {
        let keys = tempfile::tempdir().unwrap();
        let handles = storage(keys.path(), 3).await;
        let lab = Lab {
            slow: vec!["10.0.0.1".into()],
            ..Default::default()
        };
        let settings = PollerSettings {
            concurrency: 1,
            device_timeout: Duration::from_secs(3600),
            grace_period: Duration::from_millis(50),
        };
        let poller = poller(&handles, lab, Arc::new(MemorySink::default())).with_settings(settings);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(5), poller.run_sweep(&cancel))
            .await
            .unwrap()
            .unwrap();

        assert!(report.outcomes.is_empty());
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.skipped, 2);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_summary_json() {
        let keys = tempfile::tempdir().unwrap();
        let handles = storage(keys.path(), 2).await;
        let lab = Lab {
            down: vec!["10.0.0.1".into()],
            ..Default::default()
        };
        let report = poller(&handles, lab, Arc::new(MemorySink::default()))
            .run_sweep_once()
            .await
            .unwrap();

        let summary = report.summary();
        assert_eq!(summary["succeeded"], 1);
        assert_eq!(summary["failed"], 1);
        assert_eq!(summary["failures"][0]["device"], "edge-1");
        assert_eq!(summary["failures"][0]["kind"], "connection");
    }
}
