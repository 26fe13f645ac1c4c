mod routes;
mod controllers;
mod services;
mod models;
mod api_docs;
mod shared_state;
mod modbus_server;
mod config;
mod errors;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use axum::{Router, routing::get, response::Html};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_scalar::Scalar;
use crate::api_docs::ApiDoc;
use crate::config::Config;
use crate::routes::node_routes::api_routes;
use crate::shared_state::{AppState, SharedState};

const DEFAULT_CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 1. Load configuration
    let path = std::env::var("SOILING_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = match Config::load(&path) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("Failed to load {}: {}", path, e);
            return Err(e.into());
        }
    };
    tracing::info!(
        nodes = config.nodes.len(),
        sample_period_s = config.sampling.sample_period_s,
        "Configuration loaded from {}", path
    );

    // 2. Initialize shared state
    let state = AppState::new();

    // 3. Silent-node watcher, once per sampling period
    {
        let state = state.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(config.sampling.sample_period_s));
            loop {
                tick.tick().await;
                for id in state.mark_silent(&config, chrono::Utc::now()) {
                    tracing::warn!(node_id = id, "node went silent");
                }
            }
        });
    }

    // 4. MQTT publisher
    tokio::spawn(services::mqtt_service::run_publisher(
        config.mqtt.clone(),
        state.clone(),
        config.nodes.clone(),
    ));

    // 5. Modbus TCP server
    let modbus_addr = SocketAddr::from(([0, 0, 0, 0], config.modbus.port));
    let register_map = modbus_server::build_register_map(&config.nodes);
    let state_modbus = state.clone();
    tokio::spawn(async move {
        if let Err(e) = modbus_server::run_server(modbus_addr, state_modbus, register_map).await {
            tracing::error!("Modbus server error: {}", e);
        }
    });

    // 6. HTTP API
    let shared = SharedState { app: state.clone(), config: config.clone() };
    let app = Router::new()
        .nest("/api", api_routes(shared))
        .route("/scalar", get(|| async {
            Html(Scalar::new(ApiDoc::openapi()).to_html())
        }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("API Server listening on http://{}", addr);
    tracing::info!("Scalar UI: http://{}/scalar", addr);
    tracing::info!("Modbus TCP: {}", modbus_addr);

    axum_server::bind(addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
