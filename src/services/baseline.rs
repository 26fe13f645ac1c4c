/// ============================================================
///  Clean-panel baseline: expected PV power from panel voltage
///  and temperature.
///
///  Pipeline:
///   1. Temperature derate – linear around the 25 °C reference
///   2. Current proxy      – (V − V_offset) × k, floored at 0
///   3. Power              – V × I_proxy × η₀ × derate
///
///  Cheap enough to run once per sampling interval on a node, and
///  recalibrated in the field from a clear-sky voltage/power pair.
/// ============================================================

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Reference temperature of the nominal efficiency (°C).
pub const REFERENCE_TEMP_C: f32 = 25.0;

/// Site-tuned coefficients of the baseline model.
///
/// Read-only once built; only an offline calibration run produces new ones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CalibrationCoefficients {
    /// Amps per volt above the offset (array dependent).
    pub current_slope: f32,
    /// Conversion efficiency at 25 °C, in [0, 1].
    pub nominal_efficiency: f32,
    /// Fractional derating per °C away from 25 °C (negative for silicon).
    pub temperature_coefficient: f32,
    /// Panel voltage below which there is no meaningful current.
    pub voltage_offset: f32,
}

impl CalibrationCoefficients {
    /// Coefficients shipped with the firmware. Existing field calibrations
    /// are expressed relative to these values.
    pub const DEFAULT: Self = Self {
        current_slope: 0.5,
        nominal_efficiency: 0.19,
        temperature_coefficient: -0.004,
        voltage_offset: 15.0,
    };

    /// Temperature derate factor. Not clamped: above 1 for a cold panel,
    /// negative at absurd temperatures.
    #[inline]
    pub fn derate(&self, temperature_c: f32) -> f32 {
        derate(self.temperature_coefficient, temperature_c)
    }

    /// Expected clean-panel power in watts for this calibration.
    #[inline]
    pub fn expected_power(&self, panel_voltage: f32, temperature_c: f32) -> f32 {
        estimate_expected_power(panel_voltage, temperature_c, self)
    }
}

impl Default for CalibrationCoefficients {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Linear derate shared by every model that references 25 °C.
#[inline]
pub fn derate(temperature_coefficient: f32, temperature_c: f32) -> f32 {
    1.0 + temperature_coefficient * (temperature_c - REFERENCE_TEMP_C)
}

/// Expected power (W) of a clean panel.
///
/// Total over every input: voltages below the offset (or negative) yield 0,
/// extreme temperatures may yield a negative value which callers treat as a
/// sensor fault.
pub fn estimate_expected_power(
    panel_voltage: f32,
    temperature_c: f32,
    coeffs: &CalibrationCoefficients,
) -> f32 {
    let derate = coeffs.derate(temperature_c);
    let mut current_proxy = (panel_voltage - coeffs.voltage_offset) * coeffs.current_slope;
    if current_proxy < 0.0 {
        current_proxy = 0.0;
    }
    panel_voltage * current_proxy * coeffs.nominal_efficiency * derate
}

/// [`estimate_expected_power`] with the firmware default coefficients.
#[cfg(test)]
pub fn estimate_expected_power_default(panel_voltage: f32, temperature_c: f32) -> f32 {
    estimate_expected_power(panel_voltage, temperature_c, &CalibrationCoefficients::DEFAULT)
}
