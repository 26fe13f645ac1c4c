/// ============================================================
///  Soiling analysis
///
///   loss      = (P_expected − P_measured) / P_expected
///   trend     = least-squares slope of loss over time (per day)
///   due in    = (threshold − loss_now) / trend
///
///  Plus the auxiliary node checks (pump, battery) that share the
///  same alert thresholds.
/// ============================================================

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use crate::config::Thresholds;
use crate::models::node::{AlertKind, NodeReading};

const SECONDS_PER_DAY: f64 = 86_400.0;
/// Window used for the cleaning trend.
pub const RETENTION_DAYS: i64 = 7;
/// One week of 3-minute samples.
pub const MAX_SAMPLES: usize = 3360;
pub const MIN_TREND_SAMPLES: usize = 3;

/// Fractional power loss vs. the clean-panel estimate, clamped to [0, 1].
/// `None` when there is nothing to compare against (night, dark cell).
pub fn soiling_loss(expected_w: f32, measured_w: f32) -> Option<f32> {
    if !(expected_w > 0.0) || !measured_w.is_finite() {
        return None;
    }
    Some(((expected_w - measured_w) / expected_w).clamp(0.0, 1.0))
}

/// Daylight loss samples of one node, oldest first.
#[derive(Debug, Clone, Default)]
pub struct LossHistory {
    samples: VecDeque<(DateTime<Utc>, f32)>,
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, at: DateTime<Utc>, loss: f32) {
        // Out-of-order frames (retries) would corrupt the regression axis.
        if let Some((last, _)) = self.samples.back() {
            if at < *last {
                tracing::debug!(%at, last = %last, "out-of-order loss sample dropped");
                return;
            }
        }
        self.samples.push_back((at, loss));

        let horizon = at - Duration::days(RETENTION_DAYS);
        while let Some((t, _)) = self.samples.front() {
            if *t < horizon || self.samples.len() > MAX_SAMPLES {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn latest(&self) -> Option<f32> {
        self.samples.back().map(|(_, l)| *l)
    }

    /// Loss change per day, `None` until enough spread-out samples exist.
    pub fn trend_per_day(&self, min_span_s: u64) -> Option<f32> {
        if self.samples.len() < MIN_TREND_SAMPLES {
            return None;
        }
        let (t0, _) = *self.samples.front()?;
        let (tn, _) = *self.samples.back()?;
        if ((tn - t0).num_seconds() as u64) < min_span_s.max(1) {
            return None;
        }

        let n = self.samples.len() as f64;
        let xs = self.samples.iter().map(|(t, _)| (*t - t0).num_seconds() as f64 / SECONDS_PER_DAY);
        let mean_x = xs.clone().sum::<f64>() / n;
        let mean_y = self.samples.iter().map(|(_, l)| *l as f64).sum::<f64>() / n;

        let mut sxy = 0.0;
        let mut sxx = 0.0;
        for (x, (_, y)) in xs.zip(self.samples.iter()) {
            let dx = x - mean_x;
            sxy += dx * (*y as f64 - mean_y);
            sxx += dx * dx;
        }
        if sxx <= 0.0 {
            return None;
        }
        Some((sxy / sxx) as f32)
    }

    /// Days until the loss reaches `threshold`; 0 once it is reached,
    /// `None` when the trend is flat, improving or unknown.
    pub fn days_until(&self, threshold: f32, min_span_s: u64) -> Option<f32> {
        let current = self.latest()?;
        if current >= threshold {
            return Some(0.0);
        }
        let slope = self.trend_per_day(min_span_s)?;
        if slope <= 0.0 {
            return None;
        }
        Some((threshold - current) / slope)
    }
}

pub fn pump_on(reading: &NodeReading, t: &Thresholds) -> bool {
    reading.pump_current_ma.is_some_and(|ma| ma >= t.pump_current_min_ma)
}

pub fn battery_low(reading: &NodeReading, t: &Thresholds) -> bool {
    reading.battery_mv.is_some_and(|mv| mv < t.battery_low_mv)
}

/// Reading-driven alert conditions currently true for a node.
pub fn active_conditions(
    reading: &NodeReading,
    loss: Option<f32>,
    days_until_cleaning: Option<f32>,
    t: &Thresholds,
) -> Vec<AlertKind> {
    let mut kinds = Vec::new();

    let soiled = loss.is_some_and(|l| l >= t.soiling_alert);
    if soiled {
        kinds.push(AlertKind::SoilingLoss);
    } else if days_until_cleaning.is_some_and(|d| d <= t.soiling_predict_days as f32) {
        kinds.push(AlertKind::CleaningDue);
    }

    if pump_on(reading, t) && reading.pump_flow_pps.unwrap_or(0) < t.pump_flow_min_pps {
        kinds.push(AlertKind::PumpNoFlow);
    }
    if battery_low(reading, t) {
        kinds.push(AlertKind::BatteryLow);
    }
    kinds
}
