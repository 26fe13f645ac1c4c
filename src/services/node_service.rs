use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::models::node::{status_bits, AlertKind, ExpectedSource, NodeReading, NodeStatus};
use crate::services::soiling::{self, LossHistory};
use crate::services::{baseline, reference_cell};

/// Result of analysing one reading.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub status: NodeStatus,
    pub conditions: Vec<AlertKind>,
}

/// Runs every model on a node reading and updates its loss history.
///
/// The reference cell is preferred as the expected-power source when the
/// frame carries it and it reports daylight; otherwise the node's voltage
/// baseline calibration is used.
pub fn analyze(
    config: &Config,
    node_id: u16,
    reading: &NodeReading,
    received_at: DateTime<Utc>,
    history: &mut LossHistory,
) -> Analysis {
    // Node clocks drift; a frame from the future would stall the loss history.
    let timestamp = match reading.timestamp {
        Some(t) if t > received_at => {
            tracing::debug!(node_id, node_ts = %t, %received_at, "node timestamp ahead of gateway, clamped");
            received_at
        }
        Some(t) => t,
        None => received_at,
    };
    let coeffs = config.calibration_for(node_id);

    let measured_power_w = reading.panel_voltage_v * reading.panel_current_a;
    let baseline_power_w =
        baseline::estimate_expected_power(reading.panel_voltage_v, reading.temperature_c, &coeffs);

    // v1 frames have no reference cell; anything in the field is garbage.
    let ref_adc = reading.ref_adc.filter(|_| reading.protocol_version >= 2);
    let irradiance_w_m2 = ref_adc.and_then(|adc| reference_cell::irradiance_w_m2(adc, &config.reference_cell));
    let reference_power_w = ref_adc
        .and_then(|adc| reference_cell::expected_power_w(adc, reading.temperature_c, &config.reference_cell));

    let (expected_power_w, expected_source) = match reference_power_w {
        Some(p) => (p, ExpectedSource::ReferenceCell),
        None => (baseline_power_w, ExpectedSource::VoltageBaseline),
    };

    let soiling_loss = soiling::soiling_loss(expected_power_w, measured_power_w);
    if let Some(loss) = soiling_loss {
        history.push(timestamp, loss);
    }
    let days_until_cleaning = history.days_until(config.thresholds.soiling_alert, config.sampling.sample_period_s);

    let t = &config.thresholds;
    // At night the soiling state carries over from the last daylight sample.
    let conditions = soiling::active_conditions(reading, soiling_loss.or(history.latest()), days_until_cleaning, t);
    let pump_on = soiling::pump_on(reading, t);
    let battery_low = soiling::battery_low(reading, t);

    let mut status_flags = status_bits::ONLINE;
    if pump_on {
        status_flags |= status_bits::PUMP_ON;
    }
    for kind in &conditions {
        status_flags |= kind.status_bit();
    }

    tracing::debug!(
        node_id,
        measured_power_w,
        expected_power_w,
        ?expected_source,
        ?soiling_loss,
        "reading analysed"
    );

    Analysis {
        status: NodeStatus {
            node_id,
            timestamp,
            online: true,
            panel_voltage_v: reading.panel_voltage_v,
            panel_current_a: reading.panel_current_a,
            temperature_c: reading.temperature_c,
            battery_mv: reading.battery_mv,
            measured_power_w,
            expected_power_w,
            expected_source,
            baseline_power_w,
            reference_power_w,
            irradiance_w_m2,
            soiling_loss,
            days_until_cleaning,
            pump_on,
            battery_low,
            status_flags,
        },
        conditions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModbusMapping, NodeConfig};
    use crate::services::baseline::CalibrationCoefficients;
    use chrono::TimeZone;

    fn config() -> Config {
        let mut c = Config::default();
        c.nodes.push(NodeConfig {
            id: 2,
            name: "override".into(),
            calibration: Some(CalibrationCoefficients { voltage_offset: 10.0, ..CalibrationCoefficients::DEFAULT }),
            modbus_mapping: ModbusMapping {
                expected_power_address: 0,
                measured_power_address: 2,
                soiling_loss_address: 4,
                panel_voltage_address: 6,
                temperature_address: 8,
                status_address: 10,
            },
        });
        c
    }

    fn reading(v: f32, i: f32) -> NodeReading {
        NodeReading {
            panel_voltage_v: v,
            panel_current_a: i,
            temperature_c: 25.0,
            ref_adc: None,
            battery_mv: Some(12500),
            pump_current_ma: None,
            pump_flow_pps: None,
            protocol_version: 2,
            timestamp: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_clean_panel_via_voltage_baseline() {
        let mut h = LossHistory::new();
        // expected 9.5 W, measured 20 * 0.475 = 9.5 W
        let a = analyze(&config(), 1, &reading(20.0, 0.475), now(), &mut h);
        assert_eq!(a.status.expected_source, ExpectedSource::VoltageBaseline);
        assert!((a.status.expected_power_w - 9.5).abs() < 1e-4);
        assert!(a.status.soiling_loss.unwrap() < 1e-4);
        assert!(a.conditions.is_empty());
        assert_eq!(a.status.status_flags, status_bits::ONLINE);
        assert_eq!(h.len(), 1);
        assert_eq!(a.status.timestamp, now());
    }

    #[test]
    fn test_soiled_panel_raises_condition() {
        let mut h = LossHistory::new();
        // measured 8.0 W vs 9.5 W -> ~15.8 % loss
        let a = analyze(&config(), 1, &reading(20.0, 0.4), now(), &mut h);
        assert!(a.conditions.contains(&AlertKind::SoilingLoss));
        assert_ne!(a.status.status_flags & status_bits::SOILING, 0);
        assert_eq!(a.status.days_until_cleaning, Some(0.0));
    }

    #[test]
    fn test_reference_cell_preferred_when_daylight() {
        let mut h = LossHistory::new();
        let mut r = reading(20.0, 0.475);
        r.ref_adc = Some(40);
        let a = analyze(&config(), 1, &r, now(), &mut h);
        assert_eq!(a.status.expected_source, ExpectedSource::VoltageBaseline);
        assert_eq!(a.status.irradiance_w_m2, None);

        r.ref_adc = Some(400);
        let a = analyze(&config(), 1, &r, now(), &mut h);
        assert_eq!(a.status.expected_source, ExpectedSource::ReferenceCell);
        assert_eq!(a.status.irradiance_w_m2, Some(100.0));
        assert_eq!(a.status.reference_power_w, Some(100.0));
        assert!((a.status.baseline_power_w - 9.5).abs() < 1e-4);
    }

    #[test]
    fn test_v1_frames_ignore_reference_cell() {
        let mut h = LossHistory::new();
        let mut r = reading(20.0, 0.475);
        r.ref_adc = Some(400);
        r.protocol_version = 1;
        let a = analyze(&config(), 1, &r, now(), &mut h);
        assert_eq!(a.status.expected_source, ExpectedSource::VoltageBaseline);
        assert_eq!(a.status.reference_power_w, None);
    }

    #[test]
    fn test_night_reading_skips_history() {
        let mut h = LossHistory::new();
        let a = analyze(&config(), 1, &reading(5.0, 0.0), now(), &mut h);
        assert_eq!(a.status.soiling_loss, None);
        assert_eq!(h.len(), 0);
        assert!(a.conditions.is_empty());
    }

    #[test]
    fn test_night_keeps_soiled_state() {
        let mut h = LossHistory::new();
        let day = analyze(&config(), 1, &reading(20.0, 0.4), now(), &mut h);
        assert_eq!(day.conditions, vec![AlertKind::SoilingLoss]);

        let night = analyze(&config(), 1, &reading(5.0, 0.0), now() + chrono::Duration::minutes(3), &mut h);
        assert_eq!(night.status.soiling_loss, None);
        assert_eq!(night.conditions, vec![AlertKind::SoilingLoss]);
        assert_ne!(night.status.status_flags & status_bits::SOILING, 0);
    }

    #[test]
    fn test_future_timestamp_is_clamped() {
        let mut h = LossHistory::new();
        let mut r = reading(20.0, 0.4);
        r.timestamp = Some(now() + chrono::Duration::hours(6));
        let a = analyze(&config(), 1, &r, now(), &mut h);
        assert_eq!(a.status.timestamp, now());

        // The next frame, stamped by the gateway, still enters the history.
        let b = analyze(&config(), 1, &reading(20.0, 0.4), now() + chrono::Duration::minutes(3), &mut h);
        assert_eq!(b.status.timestamp, now() + chrono::Duration::minutes(3));
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn test_node_calibration_override() {
        let mut h = LossHistory::new();
        // offset 10: (12 - 10) * 0.5 = 1 ; 12 * 1 * 0.19 = 2.28
        let a = analyze(&config(), 2, &reading(12.0, 0.19), now(), &mut h);
        assert!((a.status.baseline_power_w - 2.28).abs() < 1e-4);
        let b = analyze(&config(), 1, &reading(12.0, 0.19), now(), &mut h);
        assert_eq!(b.status.baseline_power_w, 0.0);
    }

    #[test]
    fn test_pump_flags() {
        let mut h = LossHistory::new();
        let mut r = reading(5.0, 0.0);
        r.pump_current_ma = Some(300);
        r.pump_flow_pps = Some(5);
        let a = analyze(&config(), 1, &r, now(), &mut h);
        assert!(a.status.pump_on);
        assert_ne!(a.status.status_flags & status_bits::PUMP_ON, 0);
        assert!(a.conditions.is_empty());
    }
}
