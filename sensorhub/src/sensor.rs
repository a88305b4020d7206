//! Sensor sources: a clamped random-walk simulator and a DHT11 reader.
//!
//! The hardware reader talks to the Linux IIO `dht11` driver, which exposes
//! the sensor as `in_temp_input` / `in_humidityrelative_input` files holding
//! milli-units. The driver performs the single-wire bus transaction itself.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, warn};

use sensorhub_common::Reading;

use crate::config::SensorConfig;

/// Highest BCM GPIO number available on the 40-pin header.
const MAX_BCM_PIN: u8 = 27;

/// IIO device name registered by the kernel DHT11 driver.
const DHT11_DEVICE_NAME: &str = "dht11";

/// Errors raised by sensor sources.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    /// A reading could not be obtained.
    #[error("Sensor unavailable: {0}")]
    Unavailable(String),
    /// The sensor could not be initialized.
    #[error("Sensor initialization failed: {0}")]
    Init(String),
}

/// A source of environmental readings.
pub trait SensorSource: Send + Sync {
    /// Take a reading.
    fn read(&self) -> Result<Reading, SensorError>;

    /// Whether readings are simulated.
    fn is_mock(&self) -> bool;
}

/// Bounds and step sizes of the simulated environment.
pub mod bounds {
    pub const TEMPERATURE_MIN: f64 = 18.0;
    pub const TEMPERATURE_MAX: f64 = 28.0;
    pub const HUMIDITY_MIN: f64 = 30.0;
    pub const HUMIDITY_MAX: f64 = 70.0;
    pub const TEMPERATURE_STEP: f64 = 0.5;
    pub const HUMIDITY_STEP: f64 = 2.0;
    pub const TEMPERATURE_START: f64 = 22.0;
    pub const HUMIDITY_START: f64 = 50.0;
}

/// Simulated environment advanced by the mock sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockEnvironment {
    pub temperature: f64,
    pub humidity: f64,
}

impl Default for MockEnvironment {
    fn default() -> Self {
        Self {
            temperature: bounds::TEMPERATURE_START,
            humidity: bounds::HUMIDITY_START,
        }
    }
}

impl MockEnvironment {
    /// Advance one random-walk step.
    ///
    /// Values are clamped after the perturbation, so they can rest on a
    /// bound for several consecutive steps.
    pub fn step<R: Rng>(&mut self, rng: &mut R) {
        let dt = rng.random_range(-bounds::TEMPERATURE_STEP..=bounds::TEMPERATURE_STEP);
        let dh = rng.random_range(-bounds::HUMIDITY_STEP..=bounds::HUMIDITY_STEP);

        self.temperature = (self.temperature + dt)
            .clamp(bounds::TEMPERATURE_MIN, bounds::TEMPERATURE_MAX);
        self.humidity = (self.humidity + dh).clamp(bounds::HUMIDITY_MIN, bounds::HUMIDITY_MAX);
    }

    /// Current values as a rounded reading.
    pub fn reading(&self) -> Reading {
        Reading::new(self.temperature, self.humidity).rounded()
    }
}

struct MockInner {
    env: MockEnvironment,
    rng: SmallRng,
}

/// Random-walk sensor used when no hardware is available.
///
/// Every read mutates the walk, so two near-simultaneous callers observe
/// two different steps.
pub struct MockSensor {
    inner: Mutex<MockInner>,
}

impl MockSensor {
    /// Create a mock sensor seeded from the OS.
    pub fn new() -> Self {
        Self::with_rng(SmallRng::from_os_rng(), MockEnvironment::default())
    }

    /// Create a deterministic mock sensor.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(SmallRng::seed_from_u64(seed), MockEnvironment::default())
    }

    /// Create a deterministic mock sensor starting from a given environment.
    pub fn with_state(seed: u64, env: MockEnvironment) -> Self {
        Self::with_rng(SmallRng::seed_from_u64(seed), env)
    }

    fn with_rng(rng: SmallRng, env: MockEnvironment) -> Self {
        Self {
            inner: Mutex::new(MockInner { env, rng }),
        }
    }

    /// Copy of the current (unrounded) environment.
    pub fn environment(&self) -> MockEnvironment {
        self.inner.lock().env
    }
}

impl Default for MockSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for MockSensor {
    fn read(&self) -> Result<Reading, SensorError> {
        let mut inner = self.inner.lock();
        let MockInner { env, rng } = &mut *inner;
        env.step(rng);
        Ok(env.reading())
    }

    fn is_mock(&self) -> bool {
        true
    }
}

/// DHT11 sensor read through the Linux IIO subsystem.
///
/// The GPIO line is bound by the `dht11` device-tree overlay
/// (`dtoverlay=dht11,gpiopin=N`), which names the node `dht11@<N in hex>`.
/// The configured pin picks that node when several sensors are present;
/// a lone DHT11 device is used whatever its node name.
#[derive(Debug, Clone)]
pub struct Dht11Sensor {
    device_dir: PathBuf,
}

impl Dht11Sensor {
    /// Locate the DHT11 IIO device for `pin` under `iio_root`.
    pub fn open(pin: u8, iio_root: &Path) -> Result<Self, SensorError> {
        if pin > MAX_BCM_PIN {
            return Err(SensorError::Init(format!(
                "GPIO pin {} is not a valid BCM pin (0-{})",
                pin, MAX_BCM_PIN
            )));
        }

        let entries = fs::read_dir(iio_root).map_err(|e| {
            SensorError::Init(format!("Cannot list {}: {}", iio_root.display(), e))
        })?;

        let mut candidates: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|dir| {
                fs::read_to_string(dir.join("name"))
                    .map(|name| name.trim() == DHT11_DEVICE_NAME)
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort();

        let node = format!("{}@{:x}", DHT11_DEVICE_NAME, pin);
        let on_pin = candidates.iter().position(|dir| {
            fs::canonicalize(dir)
                .map(|real| real.components().any(|c| c.as_os_str() == node.as_str()))
                .unwrap_or(false)
        });

        let device_dir = match (on_pin, candidates.len()) {
            (Some(index), _) => candidates.swap_remove(index),
            (None, 1) => candidates.swap_remove(0),
            (None, 0) => {
                return Err(SensorError::Init(format!(
                    "No {} device under {}",
                    DHT11_DEVICE_NAME,
                    iio_root.display()
                )));
            }
            (None, count) => {
                return Err(SensorError::Init(format!(
                    "{} {} devices under {}, none bound to GPIO {}",
                    count,
                    DHT11_DEVICE_NAME,
                    iio_root.display(),
                    pin
                )));
            }
        };

        info!(pin, device = %device_dir.display(), "Found DHT11 sensor");
        Ok(Self { device_dir })
    }

    /// IIO device directory backing this sensor.
    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    fn read_channel(&self, file: &str) -> Result<f64, SensorError> {
        let path = self.device_dir.join(file);
        let raw = fs::read_to_string(&path)
            .map_err(|e| SensorError::Unavailable(format!("{}: {}", file, e)))?;
        let milli: i64 = raw
            .trim()
            .parse()
            .map_err(|_| SensorError::Unavailable(format!("{}: bad value {:?}", file, raw.trim())))?;
        Ok(milli as f64 / 1000.0)
    }
}

impl SensorSource for Dht11Sensor {
    fn read(&self) -> Result<Reading, SensorError> {
        let temperature = self.read_channel("in_temp_input")?;
        let humidity = self.read_channel("in_humidityrelative_input")?;
        debug!(temperature, humidity, "DHT11 reading");
        Ok(Reading::new(temperature, humidity).rounded())
    }

    fn is_mock(&self) -> bool {
        false
    }
}

/// Sensor backend chosen once at startup.
#[derive(Debug)]
pub enum SensorBackend {
    Mock,
    Hardware(Dht11Sensor),
}

impl SensorBackend {
    /// Build the sensor source for this backend.
    pub fn into_source(self) -> Box<dyn SensorSource> {
        match self {
            SensorBackend::Mock => Box::new(MockSensor::new()),
            SensorBackend::Hardware(sensor) => Box::new(sensor),
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, SensorBackend::Mock)
    }
}

/// Decide between simulated and hardware readings.
///
/// A hardware initialization failure is logged once and falls back to mock
/// mode for the rest of the process lifetime.
pub fn detect_backend(config: &SensorConfig) -> SensorBackend {
    if config.mock {
        info!("Mock sensors enabled");
        return SensorBackend::Mock;
    }

    match Dht11Sensor::open(config.dht_pin, &config.iio_root) {
        Ok(sensor) => SensorBackend::Hardware(sensor),
        Err(e) => {
            warn!(error = %e, pin = config.dht_pin, "Could not initialize sensor, using mock mode instead");
            SensorBackend::Mock
        }
    }
}
