//! # Module: detectors
//!
//! The three analyzers a check cycle runs against the observation store.
//! Each one reads a bounded time window, compares it against its threshold
//! and returns alert *candidates*; persisting them (and the dedup that goes
//! with it) is the ledger's job.
//!
//! ## Sub-modules
//! - [`degradation`]: hour-over-hour drop in mean signal
//! - [`weak_signal`]: sustained readings below an absolute level
//! - [`disappearance`]: known networks that stopped showing up

pub mod degradation;
pub mod disappearance;
pub mod weak_signal;

use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;

use crate::alert::{AlertKind, NewAlert};
use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::ledger::AlertLedger;
use crate::observation::{NetworkKey, ObservationStore};

pub use degradation::DegradationDetector;
pub use disappearance::DisappearanceDetector;
pub use weak_signal::WeakSignalDetector;

// ---------------------------------------------------------------------------
// Context + result
// ---------------------------------------------------------------------------

/// Everything a detector may read during one check cycle.
pub struct CheckContext<'a> {
    pub store: &'a dyn ObservationStore,
    /// Read-only here; detectors consult it for episode history.
    pub ledger: &'a AlertLedger,
    pub now: NaiveDateTime,
}

/// Output of one detector run.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub candidates: Vec<NewAlert>,
    /// Malformed rows skipped while reading the detector's window.
    pub skipped: usize,
}

/// A stateless-by-contract analyzer; anything it must remember between
/// cycles lives in the [`DetectorState`] it is handed.
pub trait Detector: Send + Sync {
    fn kind(&self) -> AlertKind;

    fn evaluate(&self, ctx: &CheckContext<'_>, state: &mut DetectorState) -> Result<Evaluation>;
}

/// The default detector set in the order a cycle runs them.
pub fn default_detectors(config: &AnalysisConfig) -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(DegradationDetector::from_config(config)),
        Box::new(WeakSignalDetector::from_config(config)),
        Box::new(DisappearanceDetector::from_config(config)),
    ]
}

// ---------------------------------------------------------------------------
// DetectorState
// ---------------------------------------------------------------------------

/// Per-`(room, network)` memory kept for the lifetime of the process.
///
/// Owned by the check-cycle runner. Only alerts the ledger actually
/// persisted are recorded as "alerted".
#[derive(Debug, Default)]
pub struct DetectorState {
    last_seen: HashMap<NetworkKey, NaiveDateTime>,
    last_alerted: HashMap<(AlertKind, NetworkKey), NaiveDateTime>,
    absent: HashSet<NetworkKey>,
    /// Keys whose alert history has been loaded from the ledger.
    hydrated: HashSet<(AlertKind, NetworkKey)>,
}

impl DetectorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting; keeps the newest timestamp.
    pub fn observe(&mut self, key: &NetworkKey, at: NaiveDateTime) {
        match self.last_seen.get_mut(key) {
            Some(seen) if *seen >= at => {}
            Some(seen) => *seen = at,
            None => {
                self.last_seen.insert(key.clone(), at);
            }
        }
    }

    pub fn last_seen(&self, key: &NetworkKey) -> Option<NaiveDateTime> {
        self.last_seen.get(key).copied()
    }

    /// Remember a persisted alert. A disappearance alert also opens an
    /// absence episode for the key.
    pub fn record_alert(&mut self, kind: AlertKind, key: &NetworkKey, at: NaiveDateTime) {
        self.last_alerted.insert((kind, key.clone()), at);
        self.hydrated.insert((kind, key.clone()));
        if kind == AlertKind::Disappearance {
            self.absent.insert(key.clone());
        }
    }

    pub fn last_alerted(&self, kind: AlertKind, key: &NetworkKey) -> Option<NaiveDateTime> {
        self.last_alerted.get(&(kind, key.clone())).copied()
    }

    /// Last alert time for `key`, loading it from the ledger the first time
    /// the key is asked about after process start.
    pub fn last_alerted_or_load(
        &mut self,
        kind: AlertKind,
        key: &NetworkKey,
        ledger: &AlertLedger,
    ) -> Result<Option<NaiveDateTime>> {
        let slot = (kind, key.clone());
        if !self.hydrated.contains(&slot) {
            if let Some(at) = ledger.latest_created_at(kind, key)? {
                self.last_alerted.insert(slot.clone(), at);
            }
            self.hydrated.insert(slot.clone());
        }
        Ok(self.last_alerted.get(&slot).copied())
    }

    pub fn is_absent(&self, key: &NetworkKey) -> bool {
        self.absent.contains(key)
    }

    pub fn mark_absent(&mut self, key: &NetworkKey) {
        self.absent.insert(key.clone());
    }

    /// Close the absence episode for `key` (the network was seen again).
    pub fn clear_absent(&mut self, key: &NetworkKey) {
        self.absent.remove(key);
    }

    pub fn absent_count(&self) -> usize {
        self.absent.len()
    }
}

/// Arithmetic mean; `None` for an empty slice.
pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
