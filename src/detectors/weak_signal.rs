//! Sustained weak signal.
//!
//! Policy: majority. With `n` readings in the trailing window and `b` of
//! them strictly below the threshold, a key alerts when
//!
//! - `n == 1` and that single reading is weak, or
//! - `n >= 2`, `b >= 2` and `b > n / 2`.
//!
//! A lone dip among otherwise healthy readings never alerts.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use serde_json::json;

use super::{mean, CheckContext, Detector, DetectorState, Evaluation};
use crate::alert::{AlertKind, NewAlert};
use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::observation::{lookback_start, NetworkKey};
use crate::signal::round1;

#[derive(Debug, Clone)]
pub struct WeakSignalDetector {
    /// dBm level; readings strictly below it are weak.
    threshold: f64,
    window: Duration,
}

impl WeakSignalDetector {
    pub fn new(threshold: f64, window: Duration) -> Self {
        WeakSignalDetector { threshold, window }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(config.weak_signal_threshold, config.weak_signal_window())
    }

    /// The persistence rule, separated out so it can be tested on its own.
    pub fn is_sustained(readings: usize, below: usize) -> bool {
        match readings {
            0 => false,
            1 => below == 1,
            n => below >= 2 && below * 2 > n,
        }
    }
}

impl Detector for WeakSignalDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::WeakSignal
    }

    fn evaluate(&self, ctx: &CheckContext<'_>, state: &mut DetectorState) -> Result<Evaluation> {
        let scan = ctx.store.window(lookback_start(ctx.now, self.window)?, ctx.now)?;

        let mut by_key: BTreeMap<NetworkKey, (Vec<f64>, Option<NaiveDateTime>)> = BTreeMap::new();
        for o in &scan.observations {
            let entry = by_key.entry(o.key()).or_default();
            entry.0.push(o.signal_dbm);
            entry.1 = entry.1.max(Some(o.timestamp));
        }

        let mut candidates = Vec::new();
        for (key, (signals, newest)) in by_key {
            if let Some(at) = newest {
                state.observe(&key, at);
            }
            let below = signals.iter().filter(|s| **s < self.threshold).count();
            if !Self::is_sustained(signals.len(), below) {
                continue;
            }
            let mean_signal = mean(&signals).unwrap_or(self.threshold);
            let message = format!(
                "Poor signal detected for {} in {}: {} of {} readings below {:.0} dBm",
                key.network_id,
                key.room,
                below,
                signals.len(),
                self.threshold
            );
            candidates.push(NewAlert::new(
                AlertKind::WeakSignal,
                key,
                message,
                json!({
                    "mean_signal": round1(mean_signal),
                    "readings": signals.len(),
                    "below_threshold": below,
                    "threshold": self.threshold,
                }),
            ));
        }

        Ok(Evaluation { candidates, skipped: scan.skipped })
    }
}
