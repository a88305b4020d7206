//! HTTP server for the sensor and system API.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use sensorhub_common::Quantity;

use crate::gateway::MetricsGateway;

/// Service name reported by the index endpoint.
pub const SERVICE_NAME: &str = "Raspberry Pi Sensor API";

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    gateway: MetricsGateway,
}

/// Every registered route, in the order reported by the index endpoint.
fn routes() -> Vec<(&'static str, MethodRouter<AppState>)> {
    vec![
        ("/", get(index_handler)),
        ("/api/sensors/temperature", get(temperature_handler)),
        ("/api/sensors/humidity", get(humidity_handler)),
        ("/api/sensors/all", get(all_sensors_handler)),
        ("/api/system/info", get(system_info_handler)),
        ("/api/system/cpu", get(cpu_handler)),
        ("/api/system/memory", get(memory_handler)),
        ("/api/system/health", get(health_handler)),
        ("/api/thingspeak/status", get(thingspeak_status_handler)),
    ]
}

/// Paths of every registered route.
pub fn endpoints() -> Vec<&'static str> {
    routes().into_iter().map(|(path, _)| path).collect()
}

/// Create the HTTP router.
pub fn create_router(gateway: MetricsGateway) -> Router {
    let state = AppState { gateway };

    routes()
        .into_iter()
        .fold(Router::new(), |router, (path, handler)| {
            router.route(path, handler)
        })
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn sensor_response(gateway: &MetricsGateway, quantity: Quantity) -> Response {
    match gateway.sensor_value(quantity).await {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            warn!(%quantity, error = %e, "Sensor read failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Handler for /api/sensors/temperature.
async fn temperature_handler(State(state): State<AppState>) -> Response {
    sensor_response(&state.gateway, Quantity::Temperature).await
}

/// Handler for /api/sensors/humidity.
async fn humidity_handler(State(state): State<AppState>) -> Response {
    sensor_response(&state.gateway, Quantity::Humidity).await
}

/// Handler for /api/sensors/all. Sensor failures become null fields.
async fn all_sensors_handler(State(state): State<AppState>) -> Response {
    Json(state.gateway.all_sensors().await).into_response()
}

async fn system_info_handler(State(state): State<AppState>) -> Response {
    Json(state.gateway.system_info()).into_response()
}

async fn cpu_handler(State(state): State<AppState>) -> Response {
    Json(state.gateway.cpu().await).into_response()
}

async fn memory_handler(State(state): State<AppState>) -> Response {
    Json(state.gateway.memory()).into_response()
}

async fn health_handler(State(state): State<AppState>) -> Response {
    Json(state.gateway.health()).into_response()
}

async fn thingspeak_status_handler(State(state): State<AppState>) -> Response {
    Json(state.gateway.publish_report()).into_response()
}

/// Handler for the index endpoint.
async fn index_handler(State(state): State<AppState>) -> Response {
    Json(json!({
        "name": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "mock_mode": state.gateway.is_mock_mode(),
        "thingspeak_enabled": state.gateway.thingspeak_enabled(),
        "endpoints": endpoints(),
    }))
    .into_response()
}

/// HTTP server configuration.
pub struct HttpServer {
    gateway: MetricsGateway,
    listen_addr: SocketAddr,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(gateway: MetricsGateway, listen_addr: SocketAddr) -> Self {
        Self {
            gateway,
            listen_addr,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.gateway);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "HTTP server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SystemConfig, ThingSpeakConfig};
    use crate::sensor::{MockSensor, SensorError, SensorSource};
    use crate::state::ReadingState;
    use axum::body::Body;
    use axum::http::Request;
    use sensorhub_common::Reading;
    use tower::ServiceExt;

    struct DeadSensor;

    impl SensorSource for DeadSensor {
        fn read(&self) -> Result<Reading, SensorError> {
            Err(SensorError::Unavailable("no response from DHT11".to_string()))
        }

        fn is_mock(&self) -> bool {
            false
        }
    }

    fn make_router(source: Box<dyn SensorSource>) -> Router {
        let state = ReadingState::with_source(source).shared();
        let gateway =
            MetricsGateway::new(state, &SystemConfig::default(), &ThingSpeakConfig::default());
        create_router(gateway)
    }

    async fn get_json(router: Router, path: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_temperature_endpoint() {
        let router = make_router(Box::new(MockSensor::with_seed(1)));
        let (status, body) = get_json(router, "/api/sensors/temperature").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["unit"], "celsius");
        assert_eq!(body["mock"], true);
        assert!(body["value"].is_f64());
    }

    #[tokio::test]
    async fn test_humidity_endpoint_failure() {
        let router = make_router(Box::new(DeadSensor));
        let (status, body) = get_json(router, "/api/sensors/humidity").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("DHT11"));
    }

    #[tokio::test]
    async fn test_all_endpoint_never_fails() {
        let router = make_router(Box::new(DeadSensor));
        let (status, body) = get_json(router, "/api/sensors/all").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["temperature"]["value"].is_null());
        assert!(body["humidity"]["value"].is_null());
        assert_eq!(body["humidity"]["unit"], "percent");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_index_lists_registered_routes() {
        let router = make_router(Box::new(MockSensor::with_seed(1)));
        let (status, body) = get_json(router.clone(), "/").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], SERVICE_NAME);
        assert_eq!(body["mock_mode"], true);
        assert_eq!(body["thingspeak_enabled"], false);

        let listed: Vec<String> = body["endpoints"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(listed, endpoints());
        assert!(listed.iter().any(|path| path == "/"));
        assert!(listed.iter().any(|path| path == "/api/thingspeak/status"));

        // Every listed path is routed.
        for path in &listed {
            let response = router
                .clone()
                .oneshot(Request::get(path.as_str()).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_ne!(response.status(), StatusCode::NOT_FOUND, "{} not routed", path);
        }

        // Every /api route of the service is listed.
        for quantity in ["temperature", "humidity", "all"] {
            assert!(listed.contains(&format!("/api/sensors/{}", quantity)));
        }
        for metric in ["info", "cpu", "memory", "health"] {
            assert!(listed.contains(&format!("/api/system/{}", metric)));
        }
    }

    #[tokio::test]
    async fn test_system_info_endpoint() {
        let router = make_router(Box::new(MockSensor::with_seed(1)));
        let (status, body) = get_json(router, "/api/system/info").await;

        assert_eq!(status, StatusCode::OK);
        for field in [
            "hostname",
            "platform",
            "platform_release",
            "architecture",
            "rust_version",
        ] {
            assert!(body[field].is_string(), "{} missing", field);
        }
        assert_eq!(body["architecture"], std::env::consts::ARCH);
    }

    #[tokio::test]
    async fn test_cpu_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let thermal_path = dir.path().join("temp");
        std::fs::write(&thermal_path, "51234\n").unwrap();

        let state = ReadingState::with_source(Box::new(MockSensor::with_seed(1))).shared();
        let gateway = MetricsGateway::new(
            state,
            &SystemConfig { thermal_path },
            &ThingSpeakConfig::default(),
        );
        let (status, body) = get_json(create_router(gateway), "/api/system/cpu").await;

        assert_eq!(status, StatusCode::OK);
        let usage = body["usage_percent"].as_f64().unwrap();
        assert!((0.0..=100.0).contains(&usage));
        assert!(body["count"].as_u64().unwrap() > 0);
        assert_eq!(body["temperature_celsius"], 51.2);
    }

    #[tokio::test]
    async fn test_cpu_endpoint_without_thermal_zone() {
        let dir = tempfile::tempdir().unwrap();
        let state = ReadingState::with_source(Box::new(MockSensor::with_seed(1))).shared();
        let system = SystemConfig {
            thermal_path: dir.path().join("missing"),
        };
        let gateway = MetricsGateway::new(state, &system, &ThingSpeakConfig::default());
        let (status, body) = get_json(create_router(gateway), "/api/system/cpu").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.get("temperature_celsius").is_some());
        assert!(body["temperature_celsius"].is_null());
    }

    #[tokio::test]
    async fn test_memory_endpoint() {
        let router = make_router(Box::new(MockSensor::with_seed(1)));
        let (status, body) = get_json(router, "/api/system/memory").await;

        assert_eq!(status, StatusCode::OK);
        let total = body["total_mb"].as_f64().unwrap();
        let used = body["used_mb"].as_f64().unwrap();
        let usage = body["usage_percent"].as_f64().unwrap();
        assert!(total > 0.0);
        assert!(used <= total);
        assert!((0.0..=100.0).contains(&usage));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let router = make_router(Box::new(MockSensor::with_seed(1)));
        let response = router
            .oneshot(Request::get("/api/sensors/pressure").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let router = make_router(Box::new(MockSensor::with_seed(1)));
        let (status, body) = get_json(router, "/api/system/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_thingspeak_status_endpoint() {
        let router = make_router(Box::new(MockSensor::with_seed(1)));
        let (status, body) = get_json(router, "/api/thingspeak/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["last_publish"]["status"], "unset");
        assert_eq!(body["publish_interval_seconds"], 20);
        assert!(body["channel_url"].is_null());
    }
}
