use utoipa::OpenApi;
use crate::controllers::node_controller;
use crate::models::node;
use crate::config;
use crate::services::baseline;

#[derive(OpenApi)]
#[openapi(
    paths(
        node_controller::estimate,
        node_controller::list_nodes,
        node_controller::ingest_reading,
        node_controller::get_node_status,
        node_controller::get_all_alerts,
        node_controller::get_node_alerts,
        node_controller::get_config,
        node_controller::get_health
    ),
    components(
        schemas(
            baseline::CalibrationCoefficients,
            node::NodeReading,
            node::NodeStatus,
            node::Alert,
            node::EstimateRequest,
            node::EstimateResponse,
            node::HealthStatus,
            config::NodeConfig,
            config::ModbusMapping
        )
    ),
    tags(
        (name = "soiling-monitor", description = "Solar panel soiling monitor gateway API")
    )
)]
pub struct ApiDoc;
