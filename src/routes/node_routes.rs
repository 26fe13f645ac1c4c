use axum::{routing::{get, post}, Router};
use crate::controllers::node_controller::{
    // Baseline model
    estimate,
    // Nodes & telemetry
    list_nodes, ingest_reading, get_node_status,
    // Alerts
    get_all_alerts, get_node_alerts,
    // System
    get_config, get_health,
};
use crate::shared_state::SharedState;

/// Build the `/api/*` sub-router.
/// Handlers extract `State<AppState>` and/or `State<Arc<Config>>` via
/// `FromRef<SharedState>`, so a single `.with_state(shared)` covers both.
pub fn api_routes(shared: SharedState) -> Router {
    Router::new()
        .route("/estimate",              post(estimate))
        .route("/nodes",                 get(list_nodes))
        .route("/nodes/{id}/readings",   post(ingest_reading))
        .route("/nodes/{id}/status",     get(get_node_status))
        .route("/nodes/{id}/alerts",     get(get_node_alerts))
        .route("/alerts",                get(get_all_alerts))
        .route("/config",                get(get_config))
        .route("/health",                get(get_health))
        .with_state(shared)
}
