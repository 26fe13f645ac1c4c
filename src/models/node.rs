use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::config::Config;
use crate::services::baseline::CalibrationCoefficients;

fn default_protocol_version() -> u8 { 2 }

// ─── Node telemetry (one frame per sampling period) ──────────────────────────

/// A sample forwarded by the gateway radio for one node.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodeReading {
    /// Panel terminal voltage (V)
    pub panel_voltage_v: f32,
    /// Panel output current (A)
    pub panel_current_a: f32,
    /// Panel / ambient temperature (°C)
    pub temperature_c: f32,
    /// Raw reference-cell ADC counts (protocol v2 only)
    #[serde(default)]
    pub ref_adc: Option<u16>,
    #[serde(default)]
    pub battery_mv: Option<u32>,
    #[serde(default)]
    pub pump_current_ma: Option<u32>,
    #[serde(default)]
    pub pump_flow_pps: Option<u32>,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u8,
    /// Node-side timestamp; the gateway receive time is used when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpectedSource {
    ReferenceCell,
    VoltageBaseline,
}

/// Latest analysed state of a node.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodeStatus {
    pub node_id: u16,
    pub timestamp: DateTime<Utc>,
    pub online: bool,

    // ── Raw inputs ───────────────────────────────────────────────────────────
    pub panel_voltage_v: f32,
    pub panel_current_a: f32,
    pub temperature_c: f32,
    pub battery_mv: Option<u32>,

    // ── Power ────────────────────────────────────────────────────────────────
    /// V × I as measured by the node (W)
    pub measured_power_w: f32,
    /// Clean-panel estimate used for soiling (W)
    pub expected_power_w: f32,
    pub expected_source: ExpectedSource,
    /// Voltage/temperature baseline (W)
    pub baseline_power_w: f32,
    /// Reference-cell estimate, when the cell reports daylight (W)
    pub reference_power_w: Option<f32>,
    pub irradiance_w_m2: Option<f32>,

    // ── Soiling ──────────────────────────────────────────────────────────────
    /// Fractional loss vs. expected, `None` at night
    pub soiling_loss: Option<f32>,
    /// Days until the loss crosses the alert threshold, if trending up
    pub days_until_cleaning: Option<f32>,

    // ── Auxiliaries ──────────────────────────────────────────────────────────
    pub pump_on: bool,
    pub battery_low: bool,
    /// Bitmask of active conditions, see [`status_bits`]
    pub status_flags: u16,
}

pub mod status_bits {
    pub const SOILING: u16      = 1 << 0;
    pub const CLEANING_DUE: u16 = 1 << 1;
    pub const PUMP_NO_FLOW: u16 = 1 << 2;
    pub const BATTERY_LOW: u16  = 1 << 3;
    pub const NODE_SILENT: u16  = 1 << 4;
    pub const PUMP_ON: u16      = 1 << 8;
    pub const ONLINE: u16       = 1 << 15;
}

// ─── Alerts ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    SoilingLoss,
    CleaningDue,
    PumpNoFlow,
    BatteryLow,
    NodeSilent,
}

impl AlertKind {
    pub const ALL: [AlertKind; 5] = [
        AlertKind::SoilingLoss,
        AlertKind::CleaningDue,
        AlertKind::PumpNoFlow,
        AlertKind::BatteryLow,
        AlertKind::NodeSilent,
    ];

    pub fn severity(self) -> AlertSeverity {
        match self {
            AlertKind::CleaningDue => AlertSeverity::Info,
            AlertKind::SoilingLoss | AlertKind::BatteryLow => AlertSeverity::Warning,
            AlertKind::PumpNoFlow | AlertKind::NodeSilent => AlertSeverity::Critical,
        }
    }

    pub fn status_bit(self) -> u16 {
        match self {
            AlertKind::SoilingLoss => status_bits::SOILING,
            AlertKind::CleaningDue => status_bits::CLEANING_DUE,
            AlertKind::PumpNoFlow  => status_bits::PUMP_NO_FLOW,
            AlertKind::BatteryLow  => status_bits::BATTERY_LOW,
            AlertKind::NodeSilent  => status_bits::NODE_SILENT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Alert {
    pub id: String,
    pub node_id: u16,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub active: bool,
    pub cleared_at: Option<DateTime<Utc>>,
}

// ─── REST API request / response types ───────────────────────────────────────

#[derive(Debug, Deserialize, ToSchema)]
pub struct EstimateRequest {
    pub panel_voltage_v: f32,
    pub temperature_c: f32,
    /// Defaults to the gateway baseline calibration
    #[serde(default)]
    pub calibration: Option<CalibrationCoefficients>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EstimateResponse {
    pub expected_power_w: f32,
    pub derate: f32,
    pub calibration: CalibrationCoefficients,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AlertQuery {
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub nodes_online: usize,
    pub nodes_total: usize,
    pub active_alerts: usize,
    pub mqtt_connected: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConfigResponse {
    pub config: Config,
}
