use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::config::{Config, NodeConfig};
use crate::models::node::{
    Alert, AlertQuery, ConfigResponse, EstimateRequest, EstimateResponse, HealthStatus, NodeReading, NodeStatus,
};
use crate::shared_state::AppState;

fn not_found(what: &str) -> axum::response::Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": format!("{} not found", what) }))).into_response()
}

/// POST /api/estimate
/// Expected clean-panel power
///
/// Evaluates the voltage/temperature baseline with the gateway calibration
/// or with the coefficients supplied in the body.
#[utoipa::path(
    post,
    path = "/api/estimate",
    request_body = EstimateRequest,
    responses(
        (status = 200, description = "Expected power", body = EstimateResponse)
    )
)]
pub async fn estimate(
    State(config): State<Arc<Config>>,
    Json(req): Json<EstimateRequest>,
) -> impl IntoResponse {
    let calibration = req.calibration.unwrap_or(config.baseline);
    let response = EstimateResponse {
        expected_power_w: calibration.expected_power(req.panel_voltage_v, req.temperature_c),
        derate: calibration.derate(req.temperature_c),
        calibration,
    };
    Json(response).into_response()
}

/// POST /api/nodes/{id}/readings
/// Ingest a node reading
///
/// Runs the soiling analysis on a reading forwarded from the radio link and
/// returns the resulting node status.
#[utoipa::path(
    post,
    path = "/api/nodes/{id}/readings",
    params(
        ("id" = u16, Path, description = "Node ID")
    ),
    request_body = NodeReading,
    responses(
        (status = 200, description = "Analysed status", body = NodeStatus),
        (status = 404, description = "Unknown node"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn ingest_reading(
    Path(id): Path<u16>,
    State(config): State<Arc<Config>>,
    State(state): State<AppState>,
    Json(reading): Json<NodeReading>,
) -> impl IntoResponse {
    if config.node(id).is_none() {
        return not_found("Node");
    }
    match state.ingest(&config, id, &reading, chrono::Utc::now()) {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": "state unavailable" })))
            .into_response(),
    }
}

/// GET /api/nodes
/// List configured nodes
#[utoipa::path(
    get,
    path = "/api/nodes",
    responses(
        (status = 200, description = "Configured nodes", body = Vec<NodeConfig>)
    )
)]
pub async fn list_nodes(State(config): State<Arc<Config>>) -> impl IntoResponse {
    Json(config.nodes.clone()).into_response()
}

/// GET /api/nodes/{id}/status
/// Latest analysed status of a node
#[utoipa::path(
    get,
    path = "/api/nodes/{id}/status",
    params(
        ("id" = u16, Path, description = "Node ID")
    ),
    responses(
        (status = 200, description = "Latest status", body = NodeStatus),
        (status = 404, description = "Unknown node or no reading yet")
    )
)]
pub async fn get_node_status(
    Path(id): Path<u16>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    match state.get_status(id) {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => not_found("Node status"),
    }
}

/// GET /api/alerts
/// Alerts for every node
#[utoipa::path(
    get,
    path = "/api/alerts",
    params(
        ("active_only" = Option<bool>, Query, description = "Only open alerts")
    ),
    responses(
        (status = 200, description = "Alerts", body = Vec<Alert>)
    )
)]
pub async fn get_all_alerts(
    Query(q): Query<AlertQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    Json(state.get_alerts(None, q.active_only)).into_response()
}

/// GET /api/nodes/{id}/alerts
/// Alerts for one node
#[utoipa::path(
    get,
    path = "/api/nodes/{id}/alerts",
    params(
        ("id" = u16, Path, description = "Node ID"),
        ("active_only" = Option<bool>, Query, description = "Only open alerts")
    ),
    responses(
        (status = 200, description = "Alerts", body = Vec<Alert>),
        (status = 404, description = "Unknown node")
    )
)]
pub async fn get_node_alerts(
    Path(id): Path<u16>,
    Query(q): Query<AlertQuery>,
    State(config): State<Arc<Config>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if config.node(id).is_none() {
        return not_found("Node");
    }
    Json(state.get_alerts(Some(id), q.active_only)).into_response()
}

/// GET /api/config
/// Effective configuration (secrets redacted)
#[utoipa::path(
    get,
    path = "/api/config",
    responses(
        (status = 200, description = "Configuration", body = ConfigResponse)
    )
)]
pub async fn get_config(State(config): State<Arc<Config>>) -> impl IntoResponse {
    Json(ConfigResponse { config: config.redacted() }).into_response()
}

/// GET /api/health
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Gateway health", body = HealthStatus)
    )
)]
pub async fn get_health(
    State(config): State<Arc<Config>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let statuses = state.get_all_status();
    Json(HealthStatus {
        status: "OK".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        nodes_online: statuses.values().filter(|s| s.online).count(),
        nodes_total: config.nodes.len(),
        active_alerts: state.get_active_alerts(None).len(),
        mqtt_connected: state.is_mqtt_connected(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModbusMapping;
    use crate::services::baseline::CalibrationCoefficients;

    fn config() -> Arc<Config> {
        let mut c = Config::default();
        c.nodes.push(NodeConfig {
            id: 1,
            name: "roof".into(),
            calibration: None,
            modbus_mapping: ModbusMapping {
                expected_power_address: 0,
                measured_power_address: 2,
                soiling_loss_address: 4,
                panel_voltage_address: 6,
                temperature_address: 8,
                status_address: 10,
            },
        });
        Arc::new(c)
    }

    fn reading() -> NodeReading {
        NodeReading {
            panel_voltage_v: 20.0,
            panel_current_a: 0.4,
            temperature_c: 25.0,
            ref_adc: None,
            battery_mv: None,
            pump_current_ma: None,
            pump_flow_pps: None,
            protocol_version: 2,
            timestamp: None,
        }
    }

    async fn estimate_body(req: EstimateRequest) -> EstimateResponse {
        let resp = estimate(State(config()), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_estimate_uses_default_calibration() {
        let req = EstimateRequest { panel_voltage_v: 20.0, temperature_c: 45.0, calibration: None };
        let body = estimate_body(req).await;
        assert!((body.expected_power_w - 8.74).abs() < 1e-4, "got {}", body.expected_power_w);
        assert!((body.derate - 0.92).abs() < 1e-6, "got {}", body.derate);
        assert_eq!(body.calibration, CalibrationCoefficients::DEFAULT);
    }

    #[tokio::test]
    async fn test_estimate_with_supplied_calibration() {
        let calibration = CalibrationCoefficients { voltage_offset: 5.0, ..CalibrationCoefficients::DEFAULT };
        let req = EstimateRequest { panel_voltage_v: 10.0, temperature_c: 25.0, calibration: Some(calibration) };
        let body = estimate_body(req).await;
        // (10 - 5) * 0.5 = 2.5 ; 10 * 2.5 * 0.19 = 4.75
        assert!((body.expected_power_w - 4.75).abs() < 1e-4, "got {}", body.expected_power_w);
        assert_eq!(body.derate, 1.0);
        assert_eq!(body.calibration, calibration);
    }

    #[tokio::test]
    async fn test_ingest_unknown_node_is_404() {
        let resp = ingest_reading(Path(99), State(config()), State(AppState::new()), Json(reading()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_ingest_then_status() {
        let state = AppState::new();
        let cfg = config();

        let resp = get_node_status(Path(1), State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ingest_reading(Path(1), State(cfg.clone()), State(state.clone()), Json(reading()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_node_status(Path(1), State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.get_active_alerts(Some(1)).len(), 1);
    }

    #[tokio::test]
    async fn test_node_alerts_unknown_node() {
        let resp = get_node_alerts(
            Path(5),
            Query(AlertQuery { active_only: true }),
            State(config()),
            State(AppState::new()),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_config() {
        let resp = get_health(State(config()), State(AppState::new())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = get_config(State(config())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
