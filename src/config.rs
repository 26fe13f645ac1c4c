use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::ConfigError;
use crate::services::baseline::CalibrationCoefficients;

/// Process-wide configuration, built once at startup and never mutated.
///
/// Every section defaults to the values flashed into the nodes, so a file
/// only needs to list what differs on a given site.
#[derive(Debug, Deserialize, Serialize, Clone, Default, ToSchema)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub modbus: ModbusConfig,
    pub mqtt: MqttConfig,
    pub radio: RadioConfig,
    pub identity: IdentityConfig,
    pub access_point: AccessPointConfig,
    pub gsm: GsmConfig,
    pub sampling: SamplingConfig,
    pub thresholds: Thresholds,
    pub reference_cell: ReferenceCellConfig,
    pub baseline: CalibrationCoefficients,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, ToSchema)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self { Self { port: 8080 } }
}

#[derive(Debug, Deserialize, Serialize, Clone, ToSchema)]
#[serde(default)]
pub struct ModbusConfig {
    pub port: u16,
}

impl Default for ModbusConfig {
    fn default() -> Self { Self { port: 5020 } }
}

#[derive(Debug, Deserialize, Serialize, Clone, ToSchema)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_host: String,
    pub broker_port: u16,
    /// Empty means a random `srems-gw-<uuid>` id.
    pub client_id: String,
    pub topic_prefix: String,
    pub publish_interval_s: Option<u64>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_host: String::new(),
            broker_port: 1883,
            client_id: String::new(),
            topic_prefix: "srems".to_string(),
            publish_interval_s: None,
            username: None,
            password: None,
        }
    }
}

/// RFM95 (SX1276/78) wiring on the node.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, ToSchema)]
#[serde(default)]
pub struct RadioConfig {
    pub ss_pin: u8,
    pub rst_pin: u8,
    pub dio0_pin: u8,
    pub band_hz: u32,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self { ss_pin: 18, rst_pin: 14, dio0_pin: 26, band_hz: 868_000_000 }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, ToSchema)]
#[serde(default)]
pub struct IdentityConfig {
    pub device_type: u8,
    /// v2 frames carry the reference-cell ADC.
    pub protocol_version: u8,
}

impl Default for IdentityConfig {
    fn default() -> Self { Self { device_type: 0x01, protocol_version: 0x02 } }
}

#[derive(Debug, Deserialize, Serialize, Clone, ToSchema)]
#[serde(default)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub passphrase: String,
}

impl Default for AccessPointConfig {
    fn default() -> Self {
        Self { ssid: "SREMS-GW".to_string(), passphrase: "srems1234".to_string() }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, ToSchema)]
#[serde(default)]
pub struct GsmConfig {
    pub baud: u32,
    pub tx_pin: u8,
    pub rx_pin: u8,
    pub alert_phone: String,
}

impl Default for GsmConfig {
    fn default() -> Self {
        Self { baud: 9600, tx_pin: 27, rx_pin: 25, alert_phone: "+21625301941".to_string() }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, ToSchema)]
#[serde(default)]
pub struct SamplingConfig {
    pub sample_period_s: u64,
    pub lora_tx_retry: u8,
    pub deep_sleep_enabled: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { sample_period_s: 180, lora_tx_retry: 2, deep_sleep_enabled: true }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, ToSchema)]
#[serde(default)]
pub struct Thresholds {
    /// Fractional loss vs. expected that raises a soiling alert.
    pub soiling_alert: f32,
    /// Warn when cleaning is predicted within this many days.
    pub soiling_predict_days: u32,
    pub pump_flow_min_pps: u32,
    pub pump_current_min_ma: u32,
    pub battery_low_mv: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            soiling_alert: 0.10,
            soiling_predict_days: 3,
            pump_flow_min_pps: 2,
            pump_current_min_ma: 200,
            battery_low_mv: 11600,
        }
    }
}

/// Reference PV cell wired to the node ADC, and the gateway-side model
/// built on it.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, ToSchema)]
#[serde(default)]
pub struct ReferenceCellConfig {
    pub adc_pin: u8,
    /// Raw counts below this are treated as night.
    pub adc_min_valid: u16,
    pub k_w_m2_per_adc: f32,
    pub gain_w_per_w_m2: f32,
    /// Must equal `baseline.temperature_coefficient`.
    pub temp_coef_per_c: f32,
}

impl Default for ReferenceCellConfig {
    fn default() -> Self {
        Self {
            adc_pin: 34,
            adc_min_valid: 50,
            k_w_m2_per_adc: 0.25,
            gain_w_per_w_m2: 1.0,
            temp_coef_per_c: -0.004,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, ToSchema)]
pub struct NodeConfig {
    pub id: u16,
    pub name: String,
    /// Per-site calibration; falls back to `Config::baseline`.
    #[serde(default)]
    pub calibration: Option<CalibrationCoefficients>,
    pub modbus_mapping: ModbusMapping,
}

/// Float values take two registers starting at the given address.
#[derive(Debug, Deserialize, Serialize, Clone, ToSchema)]
pub struct ModbusMapping {
    pub expected_power_address: u16,
    pub measured_power_address: u16,
    pub soiling_loss_address: u16,
    pub panel_voltage_address: u16,
    pub temperature_address: u16,
    pub status_address: u16,
}

impl ModbusMapping {
    /// Every register the mapping occupies.
    pub fn registers(&self) -> Vec<u16> {
        let mut regs = Vec::with_capacity(11);
        for a in [
            self.expected_power_address,
            self.measured_power_address,
            self.soiling_loss_address,
            self.panel_voltage_address,
            self.temperature_address,
        ] {
            regs.push(a);
            regs.push(a.wrapping_add(1));
        }
        regs.push(self.status_address);
        regs
    }
}

const REDACTED: &str = "********";

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_coefficients("baseline", &self.baseline)?;

        // Node-side and gateway-side models must derate identically.
        if self.reference_cell.temp_coef_per_c != self.baseline.temperature_coefficient {
            return Err(format!(
                "reference_cell.temp_coef_per_c ({}) differs from baseline.temperature_coefficient ({})",
                self.reference_cell.temp_coef_per_c, self.baseline.temperature_coefficient
            )
            .into());
        }

        if self.sampling.sample_period_s == 0 {
            return Err("sampling.sample_period_s must be greater than zero".into());
        }
        if !(0.0..=1.0).contains(&self.thresholds.soiling_alert) {
            return Err("thresholds.soiling_alert must be within [0, 1]".into());
        }

        let mut ids = HashSet::new();
        let mut registers = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id) {
                return Err(format!("duplicate node id {}", node.id).into());
            }
            if let Some(c) = &node.calibration {
                check_coefficients(&format!("node {} calibration", node.id), c)?;
                if c.temperature_coefficient != self.reference_cell.temp_coef_per_c {
                    return Err(format!(
                        "node {} temperature_coefficient differs from the shared coefficient",
                        node.id
                    )
                    .into());
                }
            }
            for reg in node.modbus_mapping.registers() {
                if !registers.insert(reg) {
                    return Err(format!("node {} reuses modbus register {}", node.id, reg).into());
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: u16) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Calibration in force for a node.
    pub fn calibration_for(&self, id: u16) -> CalibrationCoefficients {
        self.node(id)
            .and_then(|n| n.calibration)
            .unwrap_or(self.baseline)
    }

    /// Copy safe to expose over the API.
    pub fn redacted(&self) -> Config {
        let mut c = self.clone();
        c.access_point.passphrase = REDACTED.to_string();
        if c.mqtt.password.is_some() {
            c.mqtt.password = Some(REDACTED.to_string());
        }
        c
    }
}

fn check_coefficients(label: &str, c: &CalibrationCoefficients) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&c.nominal_efficiency) {
        return Err(format!("{}: nominal_efficiency {} outside [0, 1]", label, c.nominal_efficiency).into());
    }
    if !(c.voltage_offset >= 0.0) {
        return Err(format!("{}: voltage_offset {} must be >= 0", label, c.voltage_offset).into());
    }
    Ok(())
}
