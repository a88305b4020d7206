//! Periodic publishing of readings to a ThingSpeak-compatible endpoint.

use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use sensorhub_common::Reading;

use crate::config::ThingSpeakConfig;
use crate::state::{LastPublishRecord, PublishStatus, SharedState};

/// Body the ingestion service returns when it refuses an update.
const REJECTED_BODY: &str = "0";

/// Errors from a single update request.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Network failure, timeout or unreadable response.
    #[error("{0}")]
    Transport(String),
    /// The service answered but did not accept the update.
    #[error("Update rejected (HTTP {status}): {body:?}")]
    Rejected { status: u16, body: String },
}

impl PublishError {
    fn transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            PublishError::Transport(format!("request timed out after {}s", timeout.as_secs()))
        } else {
            // Drop the URL, it carries the API key.
            let err = err.without_url();
            let mut detail = err.to_string();
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                detail.push_str(": ");
                detail.push_str(&cause.to_string());
                source = cause.source();
            }
            PublishError::Transport(detail)
        }
    }
}

/// Client for the ingestion `update` call.
#[derive(Debug, Clone)]
pub struct ThingSpeakClient {
    http: reqwest::Client,
    update_url: String,
    api_key: String,
    timeout: Duration,
}

impl ThingSpeakClient {
    /// Create a client from configuration.
    pub fn new(config: &ThingSpeakConfig) -> Result<Self, PublishError> {
        let timeout = config.timeout();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PublishError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            update_url: format!("{}/update", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            timeout,
        })
    }

    /// Send one reading. Returns the entry id assigned by the service.
    pub async fn update(&self, reading: Reading) -> Result<String, PublishError> {
        let query = [
            ("api_key", self.api_key.clone()),
            ("field1", reading.temperature.to_string()),
            ("field2", reading.humidity.to_string()),
        ];

        let response = self
            .http
            .get(&self.update_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| PublishError::transport(e, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PublishError::transport(e, self.timeout))?;
        let body = body.trim();

        if status != StatusCode::OK || body == REJECTED_BODY {
            return Err(PublishError::Rejected {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        Ok(body.to_string())
    }
}

/// Background task forwarding readings on a fixed interval.
///
/// The interval is slept after each cycle, so the effective period is the
/// interval plus the duration of the update request.
pub struct PublishScheduler {
    state: SharedState,
    client: ThingSpeakClient,
    interval: Duration,
}

impl PublishScheduler {
    /// Create a scheduler.
    pub fn new(state: SharedState, client: ThingSpeakClient, interval: Duration) -> Self {
        Self {
            state,
            client,
            interval,
        }
    }

    /// Create a scheduler from configuration.
    pub fn from_config(state: SharedState, config: &ThingSpeakConfig) -> Result<Self, PublishError> {
        Ok(Self::new(
            state,
            ThingSpeakClient::new(config)?,
            config.publish_interval(),
        ))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one publish cycle and record its outcome.
    pub async fn run_cycle(&self) -> LastPublishRecord {
        let reading = match self.state.read_sensor().await {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "Skipping publish, sensor unavailable");
                let record = LastPublishRecord::sensor_unavailable(Utc::now());
                self.state.record_publish(record.clone());
                return record;
            }
        };

        debug!(
            temperature = reading.temperature,
            humidity = reading.humidity,
            "Publishing reading"
        );

        let result = self.client.update(reading).await;
        let timestamp = Utc::now();

        let record = match result {
            Ok(entry_id) => {
                info!(
                    entry_id = %entry_id,
                    temperature = reading.temperature,
                    humidity = reading.humidity,
                    "Published reading to ThingSpeak"
                );
                LastPublishRecord::attempted(PublishStatus::Success, timestamp, reading)
                    .with_entry_id(entry_id)
            }
            Err(PublishError::Transport(detail)) => {
                warn!(error = %detail, "ThingSpeak publish failed");
                LastPublishRecord::errored(detail, timestamp)
            }
            Err(e @ PublishError::Rejected { .. }) => {
                warn!(error = %e, "ThingSpeak rejected update");
                LastPublishRecord::attempted(PublishStatus::Failed, timestamp, reading)
            }
        };

        self.state.record_publish(record.clone());
        record
    }

    /// Run until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            url = %self.client.update_url,
            "Starting ThingSpeak publisher"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.run_cycle().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("ThingSpeak publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_display() {
        let rejected = PublishError::Rejected {
            status: 200,
            body: "0".to_string(),
        };
        assert!(rejected.to_string().contains("HTTP 200"));

        let transport = PublishError::Transport("connection refused".to_string());
        assert_eq!(transport.to_string(), "connection refused");
    }

    #[test]
    fn test_update_url_normalized() {
        let config = ThingSpeakConfig {
            base_url: "http://localhost:3000/".to_string(),
            ..Default::default()
        };
        let client = ThingSpeakClient::new(&config).unwrap();
        assert_eq!(client.update_url, "http://localhost:3000/update");
        assert_eq!(client.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_scheduler_interval_from_config() {
        let config = ThingSpeakConfig {
            publish_interval_secs: 45,
            ..Default::default()
        };
        let state = crate::state::ReadingState::new(crate::sensor::SensorBackend::Mock).shared();
        let scheduler = PublishScheduler::from_config(state, &config).unwrap();
        assert_eq!(scheduler.interval(), Duration::from_secs(45));
    }
}
