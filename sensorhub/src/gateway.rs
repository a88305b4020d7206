//! Query facade used by the HTTP layer.
//!
//! Answers requests for current readings, host metrics and publisher status.
//! Host metrics are thin wrappers over `sysinfo`, `hostname` and the thermal
//! sysfs file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sysinfo::System;
use tracing::{debug, warn};

use sensorhub_common::{Quantity, round1};

use crate::config::{SystemConfig, ThingSpeakConfig};
use crate::sensor::SensorError;
use crate::state::{LastPublishRecord, PublishStats, SharedState, format_timestamp};

/// CPU usage is measured over this window.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(100);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// A single sensor value as served to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorValue {
    pub value: Option<f64>,
    pub unit: &'static str,
    pub mock: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Both sensor values plus the time they were taken.
#[derive(Debug, Clone, Serialize)]
pub struct AllSensors {
    pub temperature: SensorValue,
    pub humidity: SensorValue,
    pub timestamp: String,
}

/// Host identification.
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub platform: String,
    pub platform_release: String,
    pub architecture: String,
    pub rust_version: String,
}

/// CPU usage and temperature.
#[derive(Debug, Clone, Serialize)]
pub struct CpuInfo {
    pub usage_percent: f64,
    pub count: usize,
    pub temperature_celsius: Option<f64>,
}

/// Memory usage in megabytes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryInfo {
    pub total_mb: f64,
    pub used_mb: f64,
    pub usage_percent: f64,
}

impl MemoryInfo {
    /// Build from raw byte counts. `used` is capped at `total`.
    pub fn from_bytes(total: u64, used: u64) -> Self {
        let used = used.min(total);
        let usage_percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        };

        Self {
            total_mb: round1(total as f64 / BYTES_PER_MB),
            used_mb: round1(used as f64 / BYTES_PER_MB),
            usage_percent: round1(usage_percent),
        }
    }
}

/// Liveness answer.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub timestamp: String,
}

/// Publisher status.
#[derive(Debug, Clone, Serialize)]
pub struct PublishReport {
    pub last_publish: LastPublishRecord,
    pub publish_interval_seconds: u64,
    pub channel_url: Option<String>,
    pub enabled: bool,
    pub stats: PublishStats,
}

/// Read the CPU temperature from a millidegree sysfs file.
pub fn cpu_temperature(path: &Path) -> Option<f64> {
    let raw = std::fs::read_to_string(path).ok()?;
    let milli: i64 = raw.trim().parse().ok()?;
    Some(round1(milli as f64 / 1000.0))
}

fn sample_cpu() -> (f64, usize) {
    let mut system = System::new();
    system.refresh_cpu_all();
    std::thread::sleep(CPU_SAMPLE_WINDOW.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL));
    system.refresh_cpu_usage();

    (
        round1(f64::from(system.global_cpu_usage())),
        system.cpus().len(),
    )
}

/// Facade over the shared reading state and host metrics.
#[derive(Clone)]
pub struct MetricsGateway {
    state: SharedState,
    thermal_path: PathBuf,
    thingspeak: ThingSpeakConfig,
}

impl MetricsGateway {
    /// Create a new gateway.
    pub fn new(state: SharedState, system: &SystemConfig, thingspeak: &ThingSpeakConfig) -> Self {
        Self {
            state,
            thermal_path: system.thermal_path.clone(),
            thingspeak: thingspeak.clone(),
        }
    }

    pub fn is_mock_mode(&self) -> bool {
        self.state.is_mock_mode()
    }

    pub fn thingspeak_enabled(&self) -> bool {
        self.thingspeak.enabled()
    }

    /// Take a fresh reading and report one quantity.
    pub async fn sensor_value(&self, quantity: Quantity) -> Result<SensorValue, SensorError> {
        let reading = self.state.read_sensor().await?;
        Ok(SensorValue {
            value: Some(reading.value(quantity)),
            unit: quantity.unit(),
            mock: self.state.is_mock_mode(),
            error: None,
        })
    }

    /// Report both quantities.
    ///
    /// Each quantity is read separately. A failed read becomes a null value
    /// carrying the error message rather than failing the whole answer.
    pub async fn all_sensors(&self) -> AllSensors {
        AllSensors {
            temperature: self.sensor_value_or_null(Quantity::Temperature).await,
            humidity: self.sensor_value_or_null(Quantity::Humidity).await,
            timestamp: format_timestamp(&Utc::now()),
        }
    }

    async fn sensor_value_or_null(&self, quantity: Quantity) -> SensorValue {
        self.sensor_value(quantity).await.unwrap_or_else(|e| {
            debug!(%quantity, error = %e, "Sensor read failed");
            SensorValue {
                value: None,
                unit: quantity.unit(),
                mock: self.state.is_mock_mode(),
                error: Some(e.to_string()),
            }
        })
    }

    /// Host identification.
    pub fn system_info(&self) -> SystemInfo {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .or_else(System::host_name)
            .unwrap_or_else(|| "unknown".to_string());

        SystemInfo {
            hostname,
            platform: System::name().unwrap_or_else(|| std::env::consts::OS.to_string()),
            platform_release: System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
            architecture: std::env::consts::ARCH.to_string(),
            rust_version: env!("SENSORHUB_RUSTC_VERSION").to_string(),
        }
    }

    /// CPU usage sampled over a short window, core count and temperature.
    pub async fn cpu(&self) -> CpuInfo {
        let (usage_percent, count) = tokio::task::spawn_blocking(sample_cpu)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "CPU sampling task failed");
                (0.0, 0)
            });

        CpuInfo {
            usage_percent,
            count,
            temperature_celsius: cpu_temperature(&self.thermal_path),
        }
    }

    /// Current memory usage.
    pub fn memory(&self) -> MemoryInfo {
        let mut system = System::new();
        system.refresh_memory();
        MemoryInfo::from_bytes(system.total_memory(), system.used_memory())
    }

    pub fn health(&self) -> Health {
        Health {
            status: "healthy",
            timestamp: format_timestamp(&Utc::now()),
        }
    }

    /// Last publish outcome and publisher settings.
    pub fn publish_report(&self) -> PublishReport {
        let (last_publish, stats) = self.state.publish_view();
        PublishReport {
            last_publish,
            publish_interval_seconds: self.thingspeak.publish_interval_secs,
            channel_url: self.thingspeak.channel_url(),
            enabled: self.thingspeak.enabled(),
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{MockSensor, SensorSource};
    use crate::state::ReadingState;
    use sensorhub_common::Reading;

    struct FlakySensor;

    impl SensorSource for FlakySensor {
        fn read(&self) -> Result<Reading, SensorError> {
            Err(SensorError::Unavailable("timeout waiting for sensor".to_string()))
        }

        fn is_mock(&self) -> bool {
            false
        }
    }

    fn gateway(source: Box<dyn SensorSource>) -> MetricsGateway {
        let state = ReadingState::with_source(source).shared();
        MetricsGateway::new(state, &SystemConfig::default(), &ThingSpeakConfig::default())
    }

    #[tokio::test]
    async fn test_sensor_value_mock() {
        let gw = gateway(Box::new(MockSensor::with_seed(2)));
        let value = gw.sensor_value(Quantity::Humidity).await.unwrap();

        assert_eq!(value.unit, "percent");
        assert!(value.mock);
        assert!(value.error.is_none());
        assert!((30.0..=70.0).contains(&value.value.unwrap()));
    }

    #[tokio::test]
    async fn test_sensor_value_failure() {
        let gw = gateway(Box::new(FlakySensor));
        assert!(gw.sensor_value(Quantity::Temperature).await.is_err());
    }

    #[tokio::test]
    async fn test_all_sensors_nulls_failures() {
        let gw = gateway(Box::new(FlakySensor));
        let all = gw.all_sensors().await;

        assert_eq!(all.temperature.value, None);
        assert_eq!(all.temperature.unit, "celsius");
        assert!(!all.temperature.mock);
        assert!(all.temperature.error.as_deref().unwrap().contains("timeout"));
        assert_eq!(all.humidity.value, None);
    }

    #[tokio::test]
    async fn test_all_sensors_steps_walk_twice() {
        let state = ReadingState::with_source(Box::new(MockSensor::with_seed(4))).shared();
        let gw = MetricsGateway::new(
            state.clone(),
            &SystemConfig::default(),
            &ThingSpeakConfig::default(),
        );
        gw.all_sensors().await;

        // Two reads happened; the next read is the third step of the walk.
        let reference = MockSensor::with_seed(4);
        reference.read().unwrap();
        reference.read().unwrap();
        assert_eq!(state.current_reading(), reference.read());
    }

    #[test]
    fn test_cpu_temperature_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");

        std::fs::write(&path, "48312\n").unwrap();
        assert_eq!(cpu_temperature(&path), Some(48.3));

        std::fs::write(&path, "not a number").unwrap();
        assert_eq!(cpu_temperature(&path), None);

        assert_eq!(cpu_temperature(&dir.path().join("missing")), None);
    }

    #[test]
    fn test_memory_from_bytes() {
        let info = MemoryInfo::from_bytes(8 * 1024 * 1024 * 1024, 2 * 1024 * 1024 * 1024);
        assert_eq!(info.total_mb, 8192.0);
        assert_eq!(info.used_mb, 2048.0);
        assert_eq!(info.usage_percent, 25.0);
    }

    #[test]
    fn test_memory_invariants_hold_for_odd_input() {
        let info = MemoryInfo::from_bytes(1024, 4096);
        assert!(info.used_mb <= info.total_mb);
        assert_eq!(info.usage_percent, 100.0);

        let empty = MemoryInfo::from_bytes(0, 0);
        assert_eq!(empty.usage_percent, 0.0);
    }

    #[test]
    fn test_memory_live() {
        let info = gateway(Box::new(MockSensor::with_seed(1))).memory();
        assert!(info.used_mb <= info.total_mb);
        assert!((0.0..=100.0).contains(&info.usage_percent));
    }

    #[test]
    fn test_publish_report_defaults() {
        let report = gateway(Box::new(MockSensor::with_seed(1))).publish_report();

        assert_eq!(report.publish_interval_seconds, 20);
        assert!(report.channel_url.is_none());
        assert!(!report.enabled);
        assert_eq!(report.stats.attempts, 0);
    }

    #[test]
    fn test_system_info() {
        let info = gateway(Box::new(MockSensor::with_seed(1))).system_info();
        assert!(!info.hostname.is_empty());
        assert_eq!(info.architecture, std::env::consts::ARCH);

        // Version of the compiler that built this binary, e.g. "1.86.0".
        let parts: Vec<u32> = info
            .rust_version
            .split(['.', '-'])
            .take(2)
            .map(|part| part.parse().unwrap())
            .collect();
        assert_eq!(parts.len(), 2);
        assert!(parts[0] >= 1);
    }

    #[tokio::test]
    async fn test_cpu_reads_thermal_zone() {
        let dir = tempfile::tempdir().unwrap();
        let thermal_path = dir.path().join("temp");
        std::fs::write(&thermal_path, "51234\n").unwrap();

        let state = ReadingState::with_source(Box::new(MockSensor::with_seed(1))).shared();
        let system = SystemConfig { thermal_path };
        let gw = MetricsGateway::new(state, &system, &ThingSpeakConfig::default());
        let cpu = gw.cpu().await;

        assert!(cpu.count > 0);
        assert!((0.0..=100.0).contains(&cpu.usage_percent));
        assert_eq!(cpu.temperature_celsius, Some(51.2));
    }

    #[tokio::test]
    async fn test_cpu_without_thermal_zone() {
        let dir = tempfile::tempdir().unwrap();
        let state = ReadingState::with_source(Box::new(MockSensor::with_seed(1))).shared();
        let system = SystemConfig {
            thermal_path: dir.path().join("missing"),
        };
        let gw = MetricsGateway::new(state, &system, &ThingSpeakConfig::default());
        let cpu = gw.cpu().await;

        assert!(cpu.count > 0);
        assert!(cpu.temperature_celsius.is_none());
        let json = serde_json::to_value(&cpu).unwrap();
        assert!(json["temperature_celsius"].is_null());
    }
}
