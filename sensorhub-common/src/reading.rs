use serde::{Deserialize, Serialize};

/// A single environmental reading taken from a sensor source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Air temperature in degrees Celsius.
    pub temperature: f64,

    /// Relative humidity in percent.
    pub humidity: f64,
}

impl Reading {
    /// Create a new reading.
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature,
            humidity,
        }
    }

    /// Return a copy with both values rounded to one decimal place.
    pub fn rounded(self) -> Self {
        Self {
            temperature: round1(self.temperature),
            humidity: round1(self.humidity),
        }
    }

    /// Get the value of a single quantity.
    pub fn value(&self, quantity: Quantity) -> f64 {
        match quantity {
            Quantity::Temperature => self.temperature,
            Quantity::Humidity => self.humidity,
        }
    }
}

/// The physical quantities a sensor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    Temperature,
    Humidity,
}

impl Quantity {
    /// Get the string representation used in routes and payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Quantity::Temperature => "temperature",
            Quantity::Humidity => "humidity",
        }
    }

    /// Unit label reported alongside values of this quantity.
    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Temperature => "celsius",
            Quantity::Humidity => "percent",
        }
    }
}

impl std::fmt::Display for Quantity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Round a value to one decimal place.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
