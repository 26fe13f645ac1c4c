use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use axum::extract::FromRef;
use chrono::{DateTime, Duration, Utc};

use crate::config::Config;
use crate::models::node::{status_bits, Alert, AlertKind, NodeReading, NodeStatus};
use crate::services::node_service;
use crate::services::soiling::LossHistory;

/// Readings missed before a node is declared silent.
pub const SILENT_AFTER_PERIODS: i64 = 3;
const MAX_ALERTS: usize = 1000;

#[derive(Debug, Default)]
struct NodeEntry {
    status: Option<NodeStatus>,
    history: LossHistory,
}

#[derive(Clone, Debug)]
pub struct AppState {
    /// Per-node latest status and loss history
    nodes: Arc<RwLock<HashMap<u16, NodeEntry>>>,
    /// Raised alerts, newest last
    alerts: Arc<RwLock<Vec<Alert>>>,
    pub mqtt_connected: Arc<AtomicBool>,
    started_at: Instant,
}

/// Router state. Handlers pull `State<AppState>` and/or `State<Arc<Config>>`.
#[derive(Clone)]
pub struct SharedState {
    pub app: AppState,
    pub config: Arc<Config>,
}

impl FromRef<SharedState> for AppState {
    fn from_ref(s: &SharedState) -> Self { s.app.clone() }
}

impl FromRef<SharedState> for Arc<Config> {
    fn from_ref(s: &SharedState) -> Self { s.config.clone() }
}

impl AppState {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(RwLock::new(HashMap::new())),
            alerts: Arc::new(RwLock::new(Vec::new())),
            mqtt_connected: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn is_mqtt_connected(&self) -> bool {
        self.mqtt_connected.load(Ordering::Relaxed)
    }

    pub fn set_mqtt_connected(&self, value: bool) {
        self.mqtt_connected.store(value, Ordering::Relaxed);
    }

    /// Analyses a reading, stores the resulting status and reconciles the
    /// node's alerts. A reading always clears `NodeSilent`.
    pub fn ingest(
        &self,
        config: &Config,
        node_id: u16,
        reading: &NodeReading,
        received_at: DateTime<Utc>,
    ) -> Option<NodeStatus> {
        let analysis = {
            let mut map = self.nodes.write().ok()?;
            let entry = map.entry(node_id).or_default();
            let analysis = node_service::analyze(config, node_id, reading, received_at, &mut entry.history);
            entry.status = Some(analysis.status.clone());
            analysis
        };

        self.sync_alerts(node_id, &analysis.conditions, &AlertKind::ALL, &analysis.status, received_at);
        Some(analysis.status)
    }

    /// Flags nodes whose last reading is older than the silence window.
    /// Returns the ids that went silent on this call.
    pub fn mark_silent(&self, config: &Config, now: DateTime<Utc>) -> Vec<u16> {
        let window = Duration::seconds(config.sampling.sample_period_s as i64 * SILENT_AFTER_PERIODS);
        let mut newly_silent = Vec::new();

        if let Ok(mut map) = self.nodes.write() {
            for (id, entry) in map.iter_mut() {
                if let Some(status) = entry.status.as_mut() {
                    if status.online && now - status.timestamp > window {
                        status.online = false;
                        status.status_flags &= !status_bits::ONLINE;
                        status.status_flags |= status_bits::NODE_SILENT;
                        newly_silent.push((*id, status.clone()));
                    }
                }
            }
        }

        newly_silent
            .into_iter()
            .map(|(id, status)| {
                self.sync_alerts(id, &[AlertKind::NodeSilent], &[AlertKind::NodeSilent], &status, now);
                id
            })
            .collect()
    }

    pub fn get_status(&self, node_id: u16) -> Option<NodeStatus> {
        let map = self.nodes.read().ok()?;
        map.get(&node_id).and_then(|e| e.status.clone())
    }

    pub fn get_all_status(&self) -> HashMap<u16, NodeStatus> {
        if let Ok(map) = self.nodes.read() {
            map.iter()
                .filter_map(|(id, e)| e.status.clone().map(|s| (*id, s)))
                .collect()
        } else {
            HashMap::new()
        }
    }

    pub fn get_alerts(&self, node_id: Option<u16>, active_only: bool) -> Vec<Alert> {
        if let Ok(alerts) = self.alerts.read() {
            alerts
                .iter()
                .filter(|a| node_id.is_none_or(|id| a.node_id == id))
                .filter(|a| !active_only || a.active)
                .cloned()
                .collect()
        } else {
            Vec::new()
        }
    }

    pub fn get_active_alerts(&self, node_id: Option<u16>) -> Vec<Alert> {
        self.get_alerts(node_id, true)
    }

    /// Raises alerts in `active` that are not yet open and clears open
    /// alerts of a kind in `scope` that is no longer active.
    fn sync_alerts(
        &self,
        node_id: u16,
        active: &[AlertKind],
        scope: &[AlertKind],
        status: &NodeStatus,
        now: DateTime<Utc>,
    ) {
        let Ok(mut alerts) = self.alerts.write() else { return };

        for alert in alerts.iter_mut().filter(|a| a.active && a.node_id == node_id) {
            if scope.contains(&alert.kind) && !active.contains(&alert.kind) {
                alert.active = false;
                alert.cleared_at = Some(now);
                tracing::info!(node_id, kind = ?alert.kind, "alert cleared");
            }
        }

        for kind in active {
            let open = alerts.iter().any(|a| a.active && a.node_id == node_id && a.kind == *kind);
            if open {
                continue;
            }
            let alert = Alert {
                id: uuid::Uuid::new_v4().to_string(),
                node_id,
                kind: *kind,
                severity: kind.severity(),
                message: alert_message(*kind, status),
                timestamp: now,
                active: true,
                cleared_at: None,
            };
            tracing::warn!(node_id, kind = ?kind, "{}", alert.message);
            alerts.push(alert);
        }

        if alerts.len() > MAX_ALERTS {
            let mut excess = alerts.len() - MAX_ALERTS;
            alerts.retain(|a| {
                if excess > 0 && !a.active {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }
}

impl Default for AppState {
    fn default() -> Self { Self::new() }
}

fn alert_message(kind: AlertKind, s: &NodeStatus) -> String {
    match kind {
        AlertKind::SoilingLoss => format!(
            "Node {}: soiling loss {:.1}% (measured {:.2} W, expected {:.2} W)",
            s.node_id,
            s.soiling_loss.unwrap_or(0.0) * 100.0,
            s.measured_power_w,
            s.expected_power_w
        ),
        AlertKind::CleaningDue => format!(
            "Node {}: cleaning due in {:.1} days",
            s.node_id,
            s.days_until_cleaning.unwrap_or(0.0)
        ),
        AlertKind::PumpNoFlow => format!("Node {}: pump running without flow", s.node_id),
        AlertKind::BatteryLow => format!(
            "Node {}: battery low ({} mV)",
            s.node_id,
            s.battery_mv.unwrap_or(0)
        ),
        AlertKind::NodeSilent => format!(
            "Node {}: no reading since {}",
            s.node_id,
            s.timestamp.to_rfc3339()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(current_a: f32) -> NodeReading {
        NodeReading {
            panel_voltage_v: 20.0,
            panel_current_a: current_a,
            temperature_c: 25.0,
            ref_adc: None,
            battery_mv: Some(12400),
            pump_current_ma: None,
            pump_flow_pps: None,
            protocol_version: 2,
            timestamp: None,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_ingest_stores_status() {
        let state = AppState::new();
        let cfg = Config::default();
        assert!(state.get_status(1).is_none());
        let s = state.ingest(&cfg, 1, &reading(0.475), t0()).unwrap();
        assert_eq!(s.node_id, 1);
        assert!(state.get_status(1).is_some());
        assert_eq!(state.get_all_status().len(), 1);
        assert!(state.get_alerts(None, false).is_empty());
    }

    #[test]
    fn test_soiling_alert_raised_once_then_cleared() {
        let state = AppState::new();
        let cfg = Config::default();

        state.ingest(&cfg, 1, &reading(0.4), t0());
        state.ingest(&cfg, 1, &reading(0.4), t0() + Duration::minutes(3));
        let active = state.get_active_alerts(Some(1));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, AlertKind::SoilingLoss);

        // Cleaned: history still holds the soiled samples, so only check
        // that the loss alert itself closes.
        state.ingest(&cfg, 1, &reading(0.475), t0() + Duration::minutes(6));
        let all = state.get_alerts(Some(1), false);
        let loss: Vec<_> = all.iter().filter(|a| a.kind == AlertKind::SoilingLoss).collect();
        assert_eq!(loss.len(), 1);
        assert!(!loss[0].active);
        assert!(loss[0].cleared_at.is_some());
    }

    #[test]
    fn test_soiling_alert_survives_the_night() {
        let state = AppState::new();
        let cfg = Config::default();
        let mut dark = reading(0.0);
        dark.panel_voltage_v = 5.0;

        state.ingest(&cfg, 1, &reading(0.4), t0());
        state.ingest(&cfg, 1, &dark, t0() + Duration::minutes(3));
        state.ingest(&cfg, 1, &dark, t0() + Duration::hours(8));
        state.ingest(&cfg, 1, &reading(0.4), t0() + Duration::hours(20));

        let all = state.get_alerts(Some(1), false);
        assert_eq!(all.len(), 1, "alerts: {:?}", all);
        assert_eq!(all[0].kind, AlertKind::SoilingLoss);
        assert!(all[0].active);
        assert_ne!(state.get_status(1).unwrap().status_flags & status_bits::SOILING, 0);
    }

    #[test]
    fn test_silent_node_flagged_and_recovers() {
        let state = AppState::new();
        let cfg = Config::default();
        state.ingest(&cfg, 3, &reading(0.475), t0());

        assert!(state.mark_silent(&cfg, t0() + Duration::seconds(540)).is_empty());
        assert_eq!(state.mark_silent(&cfg, t0() + Duration::seconds(541)), vec![3]);
        // Already flagged: no second alert.
        assert!(state.mark_silent(&cfg, t0() + Duration::seconds(900)).is_empty());

        let s = state.get_status(3).unwrap();
        assert!(!s.online);
        assert_ne!(s.status_flags & status_bits::NODE_SILENT, 0);
        assert_eq!(state.get_active_alerts(Some(3)).len(), 1);

        state.ingest(&cfg, 3, &reading(0.475), t0() + Duration::seconds(1000));
        assert!(state.get_status(3).unwrap().online);
        assert!(state.get_active_alerts(Some(3)).is_empty());
    }

    #[test]
    fn test_alerts_filtered_by_node() {
        let state = AppState::new();
        let cfg = Config::default();
        let mut low = reading(0.475);
        low.battery_mv = Some(11000);
        state.ingest(&cfg, 1, &low, t0());
        state.ingest(&cfg, 2, &reading(0.475), t0());
        assert_eq!(state.get_active_alerts(Some(1)).len(), 1);
        assert!(state.get_active_alerts(Some(2)).is_empty());
        assert_eq!(state.get_active_alerts(None).len(), 1);
    }
}
