//! Sensor API for a Raspberry Pi node.
//!
//! Serves temperature and humidity readings and host metrics as JSON, and
//! periodically forwards readings to a ThingSpeak channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐     ┌─────────────┐
//! │ SensorSource │────>│ ReadingState │────>│MetricsGateway│────>│ HTTP Server │
//! │ (mock/DHT11) │     │ (shared)     │     │              │     │ (/api/...)  │
//! └──────────────┘     └──────┬───────┘     └──────────────┘     └─────────────┘
//!                             │ ▲
//!                             ▼ │ last publish
//!                      ┌──────────────┐     ┌──────────────┐
//!                      │  Publish     │────>│  ThingSpeak  │
//!                      │  Scheduler   │     │  /update     │
//!                      └──────────────┘     └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! MOCK_SENSORS=true THINGSPEAK_API_KEY=XXXX sensorhub --config sensorhub.json5
//! ```
//!
//! # Configuration
//!
//! See [`config::ServiceConfig`] for configuration options.

pub mod config;
pub mod gateway;
pub mod http;
pub mod publisher;
pub mod sensor;
pub mod state;

pub use config::ServiceConfig;
pub use gateway::MetricsGateway;
pub use http::HttpServer;
pub use publisher::{PublishScheduler, ThingSpeakClient};
pub use sensor::{SensorBackend, SensorSource, detect_backend};
pub use state::{LastPublishRecord, PublishStatus, ReadingState, SharedState};
