/// MQTT telemetry publisher
///
/// Publishes analysed node status as JSON payloads to a configured broker.
/// Topic structure: `{prefix}/{node_id}/status`, `{prefix}/{node_id}/alerts`
/// (retained; emptied once every alert clears) and `{prefix}/system/summary`.

use std::collections::HashSet;
use std::time::Duration;
use rumqttc::{AsyncClient, LastWill, MqttOptions, QoS};
use tokio::time::{Interval, MissedTickBehavior};
use crate::config::{MqttConfig, NodeConfig};
use crate::models::node::{Alert, NodeStatus};
use crate::shared_state::AppState;

pub fn status_topic(prefix: &str, node_id: u16) -> String {
    format!("{}/{}/status", prefix, node_id)
}

pub fn alerts_topic(prefix: &str, node_id: u16) -> String {
    format!("{}/{}/alerts", prefix, node_id)
}

/// Fixed-rate publish clock. Broker traffic must not push the next tick back.
pub fn publish_ticker(interval_s: u64) -> Interval {
    let mut tick = tokio::time::interval(Duration::from_secs(interval_s.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

/// Next payload for a node's retained alerts topic.
///
/// `Some(json)` while alerts are open, `Some(empty)` to drop the retained
/// message once they have cleared, `None` when there is nothing to change.
pub fn alerts_update(active: &[Alert], retained: bool) -> Option<Vec<u8>> {
    if !active.is_empty() {
        serde_json::to_vec(active).ok()
    } else if retained {
        Some(Vec::new())
    } else {
        None
    }
}

pub fn status_payload(node: &NodeConfig, data: &NodeStatus) -> serde_json::Value {
    serde_json::json!({
        "node_id":   node.id,
        "node_name": node.name,
        "timestamp": data.timestamp.to_rfc3339(),
        "online":    data.online,
        "power": {
            "measured_w":  data.measured_power_w,
            "expected_w":  data.expected_power_w,
            "source":      data.expected_source,
            "baseline_w":  data.baseline_power_w,
            "reference_w": data.reference_power_w,
        },
        "panel": {
            "voltage_v":     data.panel_voltage_v,
            "current_a":     data.panel_current_a,
            "temperature_c": data.temperature_c,
            "irradiance_w_m2": data.irradiance_w_m2,
        },
        "soiling": {
            "loss":                data.soiling_loss,
            "days_until_cleaning": data.days_until_cleaning,
        },
        "pump_on":      data.pump_on,
        "battery_mv":   data.battery_mv,
        "battery_low":  data.battery_low,
        "status_flags": data.status_flags,
    })
}

pub async fn run_publisher(
    cfg: MqttConfig,
    state: AppState,
    nodes: Vec<NodeConfig>,
) {
    if !cfg.enabled || cfg.broker_host.is_empty() {
        tracing::info!("[MQTT] Disabled or no broker configured, skipping publisher");
        return;
    }

    let client_id = if cfg.client_id.is_empty() {
        format!("srems-gw-{}", uuid::Uuid::new_v4())
    } else {
        cfg.client_id.clone()
    };

    let interval_s = cfg.publish_interval_s.unwrap_or(10).max(1);
    let prefix     = cfg.topic_prefix.trim_end_matches('/').to_string();
    let system_topic = format!("{}/system/status", prefix);

    tracing::info!(
        "[MQTT] Connecting to {}:{} (client_id={}, interval={}s)",
        cfg.broker_host, cfg.broker_port, client_id, interval_s
    );

    let mut opts = MqttOptions::new(&client_id, &cfg.broker_host, cfg.broker_port);
    opts.set_keep_alive(Duration::from_secs(30));
    opts.set_clean_session(true);
    opts.set_last_will(LastWill::new(
        &system_topic,
        serde_json::json!({ "status": "OFFLINE" }).to_string(),
        QoS::AtLeastOnce,
        true,
    ));

    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(opts, 64);

    let birth_payload = serde_json::json!({
        "status": "ONLINE",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if let Err(e) = client.publish(
        &system_topic,
        QoS::AtLeastOnce,
        true,
        birth_payload.to_string().as_bytes(),
    ).await {
        tracing::error!("[MQTT] Failed to queue birth message: {}", e);
    }

    let mut tick = publish_ticker(interval_s);
    // A previous run may have left alerts retained on the broker.
    let mut retained: HashSet<u16> = nodes.iter().map(|n| n.id).collect();

    loop {
        // Drive the event loop between publish ticks
        tokio::select! {
            _ = tick.tick() => {}
            event = eventloop.poll() => {
                match event {
                    Ok(_) => state.set_mqtt_connected(true),
                    Err(e) => {
                        tracing::warn!("[MQTT] Event loop error: {}, will reconnect", e);
                        state.set_mqtt_connected(false);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
                continue;
            }
        }

        for node in &nodes {
            let active_alerts = state.get_active_alerts(Some(node.id));
            if let Some(alert_payload) = alerts_update(&active_alerts, retained.contains(&node.id)) {
                let alert_topic = alerts_topic(&prefix, node.id);
                match client.publish(&alert_topic, QoS::AtLeastOnce, true, alert_payload).await {
                    Ok(()) if active_alerts.is_empty() => { retained.remove(&node.id); }
                    Ok(()) => { retained.insert(node.id); }
                    Err(e) => {
                        tracing::warn!("[MQTT] Publish error for {}: {}", alert_topic, e);
                        state.set_mqtt_connected(false);
                    }
                }
            }

            let Some(data) = state.get_status(node.id) else { continue };

            let topic = status_topic(&prefix, node.id);
            let payload = status_payload(node, &data);
            if let Err(e) = client.publish(
                &topic,
                QoS::AtMostOnce,
                false,
                payload.to_string().as_bytes(),
            ).await {
                tracing::warn!("[MQTT] Publish error for {}: {}", topic, e);
                state.set_mqtt_connected(false);
            }
        }

        let all = state.get_all_status();
        let losses: Vec<f32> = all.values().filter_map(|d| d.soiling_loss).collect();
        let mean_loss = if losses.is_empty() {
            None
        } else {
            Some(losses.iter().sum::<f32>() / losses.len() as f32)
        };
        let summary = serde_json::json!({
            "timestamp":     chrono::Utc::now().to_rfc3339(),
            "nodes_online":  all.values().filter(|d| d.online).count(),
            "nodes_total":   nodes.len(),
            "measured_w":    all.values().map(|d| d.measured_power_w).sum::<f32>(),
            "expected_w":    all.values().map(|d| d.expected_power_w).sum::<f32>(),
            "mean_soiling_loss": mean_loss,
            "active_alerts": state.get_active_alerts(None).len(),
        });
        let summary_topic = format!("{}/system/summary", prefix);
        if let Err(e) = client.publish(
            &summary_topic,
            QoS::AtMostOnce,
            false,
            summary.to_string().as_bytes(),
        ).await {
            tracing::warn!("[MQTT] Publish error for {}: {}", summary_topic, e);
            state.set_mqtt_connected(false);
        }
    }
}
