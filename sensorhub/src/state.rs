//! Shared reading state.
//!
//! Holds the sensor source chosen at startup and the outcome of the most
//! recent publish attempt. Request handlers and the publish scheduler share
//! one [`ReadingState`] through a [`SharedState`] handle.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};

use sensorhub_common::Reading;

use crate::sensor::{SensorBackend, SensorError, SensorSource};

/// Shared reading state handle.
pub type SharedState = Arc<ReadingState>;

/// Format a timestamp as ISO-8601 UTC.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Outcome of a publish attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PublishStatus {
    /// No attempt has been made yet.
    #[default]
    Unset,
    /// The ingestion service accepted the update.
    Success,
    /// The ingestion service answered but rejected the update.
    Failed,
    /// No usable answer: transport error, timeout or sensor failure.
    Error(String),
}

impl PublishStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishStatus::Unset => "unset",
            PublishStatus::Success => "success",
            PublishStatus::Failed => "failed",
            PublishStatus::Error(_) => "error",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            PublishStatus::Error(detail) => Some(detail),
            _ => None,
        }
    }
}

/// The most recent publish attempt, replaced wholesale on every cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LastPublishRecord {
    pub status: PublishStatus,
    pub timestamp: Option<DateTime<Utc>>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub entry_id: Option<String>,
}

impl LastPublishRecord {
    /// Record for a cycle that ended without a usable answer.
    ///
    /// No values are reported since none reached the ingestion service.
    pub fn errored(detail: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            status: PublishStatus::Error(detail.into()),
            timestamp: Some(timestamp),
            temperature: None,
            humidity: None,
            entry_id: None,
        }
    }

    /// Record for a cycle where the sensor could not be read.
    pub fn sensor_unavailable(timestamp: DateTime<Utc>) -> Self {
        Self::errored("sensor unavailable", timestamp)
    }

    /// Record for a cycle that attempted an update with `reading`.
    pub fn attempted(status: PublishStatus, timestamp: DateTime<Utc>, reading: Reading) -> Self {
        Self {
            status,
            timestamp: Some(timestamp),
            temperature: Some(reading.temperature),
            humidity: Some(reading.humidity),
            entry_id: None,
        }
    }

    /// Attach the identifier assigned by the ingestion service.
    pub fn with_entry_id(mut self, entry_id: impl Into<String>) -> Self {
        self.entry_id = Some(entry_id.into());
        self
    }
}

impl Serialize for LastPublishRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("status", self.status.as_str())?;
        if let Some(detail) = self.status.detail() {
            map.serialize_entry("detail", detail)?;
        }
        map.serialize_entry("timestamp", &self.timestamp.as_ref().map(format_timestamp))?;
        map.serialize_entry("temperature", &self.temperature)?;
        map.serialize_entry("humidity", &self.humidity)?;
        if let Some(entry_id) = &self.entry_id {
            map.serialize_entry("entry_id", entry_id)?;
        }
        map.end()
    }
}

/// Publish failure tracking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishStats {
    /// Total publish cycles run.
    pub attempts: u64,
    /// Cycles accepted by the ingestion service.
    pub successes: u64,
    /// Cycles rejected by the ingestion service.
    pub failures: u64,
    /// Cycles that ended in a transport or sensor error.
    pub errors: u64,
    /// Failed or errored cycles since the last success.
    pub consecutive_failures: u64,
}

impl PublishStats {
    fn observe(&mut self, status: &PublishStatus) {
        self.attempts += 1;
        match status {
            PublishStatus::Success => {
                self.successes += 1;
                self.consecutive_failures = 0;
            }
            PublishStatus::Failed => {
                self.failures += 1;
                self.consecutive_failures += 1;
            }
            PublishStatus::Error(_) => {
                self.errors += 1;
                self.consecutive_failures += 1;
            }
            PublishStatus::Unset => {}
        }
    }
}

#[derive(Debug, Default)]
struct PublishState {
    record: LastPublishRecord,
    stats: PublishStats,
}

/// Sensor source plus the last publish outcome.
pub struct ReadingState {
    source: Box<dyn SensorSource>,
    mock_mode: bool,
    publish: RwLock<PublishState>,
}

impl ReadingState {
    /// Create state for the backend selected at startup.
    pub fn new(backend: SensorBackend) -> Self {
        Self::with_source(backend.into_source())
    }

    /// Create state around an existing sensor source.
    pub fn with_source(source: Box<dyn SensorSource>) -> Self {
        Self {
            mock_mode: source.is_mock(),
            source,
            publish: RwLock::new(PublishState::default()),
        }
    }

    /// Wrap in a shared handle.
    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }

    /// Take a reading from the sensor source.
    ///
    /// In mock mode this advances the simulated environment.
    pub fn current_reading(&self) -> Result<Reading, SensorError> {
        self.source.read()
    }

    /// Take a reading without blocking the async runtime.
    ///
    /// Hardware reads wait on the kernel driver, so they run on the blocking
    /// pool. Simulated reads are cheap and run inline.
    pub async fn read_sensor(self: &Arc<Self>) -> Result<Reading, SensorError> {
        if self.mock_mode {
            return self.source.read();
        }

        let state = Arc::clone(self);
        tokio::task::spawn_blocking(move || state.source.read())
            .await
            .map_err(|e| SensorError::Unavailable(format!("sensor read task failed: {}", e)))?
    }

    /// True when readings are simulated, either by request or because the
    /// hardware failed to initialize.
    pub fn is_mock_mode(&self) -> bool {
        self.mock_mode
    }

    /// Consistent copy of the last publish record.
    pub fn last_publish_snapshot(&self) -> LastPublishRecord {
        self.publish.read().record.clone()
    }

    /// Copy of the publish statistics.
    pub fn publish_stats(&self) -> PublishStats {
        self.publish.read().stats.clone()
    }

    /// Record and statistics taken under a single read guard.
    pub fn publish_view(&self) -> (LastPublishRecord, PublishStats) {
        let guard = self.publish.read();
        (guard.record.clone(), guard.stats.clone())
    }

    /// Replace the last publish record and update statistics atomically.
    pub fn record_publish(&self, record: LastPublishRecord) {
        let mut guard = self.publish.write();
        guard.stats.observe(&record.status);
        guard.record = record;
    }
}
