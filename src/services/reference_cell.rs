/// Gateway-side expected power from the reference PV cell.
///
/// The reference cell stays clean (or is cleaned with the array) so its
/// ADC counts act as an irradiance proxy independent of the main panel.
///
///   G      = ADC × k                  (W/m²)
///   P_exp  = G × gain × derate(T)     (W)

use crate::config::ReferenceCellConfig;
use crate::services::baseline::derate;

/// Irradiance in W/m², `None` below the daylight floor.
pub fn irradiance_w_m2(adc: u16, cfg: &ReferenceCellConfig) -> Option<f32> {
    if adc < cfg.adc_min_valid {
        return None;
    }
    Some(adc as f32 * cfg.k_w_m2_per_adc)
}

/// Expected array power (W) from a reference-cell reading.
pub fn expected_power_w(adc: u16, temperature_c: f32, cfg: &ReferenceCellConfig) -> Option<f32> {
    let g = irradiance_w_m2(adc, cfg)?;
    Some(g * cfg.gain_w_per_w_m2 * derate(cfg.temp_coef_per_c, temperature_c))
}
