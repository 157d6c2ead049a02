//! # Stage: Check Cycle
//!
//! ## Responsibility
//! One synchronous pass of every detector, followed by a single atomic
//! ledger write and retention pruning:
//!
//! 1. run the detectors in order; a store error aborts before any write
//! 2. `append_batch` every candidate in one transaction
//! 3. record the alerts that were actually persisted in [`DetectorState`]
//! 4. prune alerts older than the retention window
//!
//! ## Guarantees
//! - All-or-nothing: either every accepted alert of a cycle is visible, or none is
//! - Episode state only advances after the ledger commit succeeds
//! - Every failure is returned to the caller; nothing is swallowed

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;

use crate::alert::{Alert, AlertKind, NewAlert};
use crate::config::AnalysisConfig;
use crate::detectors::{default_detectors, CheckContext, Detector, DetectorState};
use crate::error::Result;
use crate::ledger::AlertLedger;
use crate::observation::{ts_format, ObservationStore};

/// Per-kind alert counts of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RaisedCounts {
    pub degradation: usize,
    pub weak_signal: usize,
    pub disappearance: usize,
}

impl RaisedCounts {
    fn bump(&mut self, kind: AlertKind) {
        match kind {
            AlertKind::Degradation => self.degradation += 1,
            AlertKind::WeakSignal => self.weak_signal += 1,
            AlertKind::Disappearance => self.disappearance += 1,
        }
    }

    pub fn get(&self, kind: AlertKind) -> usize {
        match kind {
            AlertKind::Degradation => self.degradation,
            AlertKind::WeakSignal => self.weak_signal,
            AlertKind::Disappearance => self.disappearance,
        }
    }

    pub fn total(&self) -> usize {
        self.degradation + self.weak_signal + self.disappearance
    }
}

/// Summary returned to whoever triggered the cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    #[serde(with = "ts_format")]
    pub ran_at: NaiveDateTime,
    pub raised: RaisedCounts,
    pub total: usize,
    /// Candidates dropped by the ledger's dedup window.
    pub suppressed: usize,
    /// Malformed observation rows skipped across all detector reads.
    pub skipped_rows: usize,
    /// Alerts removed by retention pruning.
    pub pruned: usize,
    pub alerts: Vec<Alert>,
}

/// Owns the detectors and their state; runs one cycle at a time.
pub struct CheckCycle {
    detectors: Vec<Box<dyn Detector>>,
    state: DetectorState,
    retention: Duration,
}

impl CheckCycle {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self::with_detectors(default_detectors(config), config.retention())
    }

    pub fn with_detectors(detectors: Vec<Box<dyn Detector>>, retention: Duration) -> Self {
        CheckCycle { detectors, state: DetectorState::new(), retention }
    }

    pub fn state(&self) -> &DetectorState {
        &self.state
    }

    pub fn run(
        &mut self,
        store: &dyn ObservationStore,
        ledger: &AlertLedger,
        now: NaiveDateTime,
    ) -> Result<CycleReport> {
        let ctx = CheckContext { store, ledger, now };

        // Alert timestamps enter the state only after the ledger commit below.
        let mut candidates: Vec<NewAlert> = Vec::new();
        let mut skipped_rows = 0;
        for detector in &self.detectors {
            let eval = detector.evaluate(&ctx, &mut self.state)?;
            tracing::debug!(
                target: "wifi_heatmap::cycle",
                detector = %detector.kind(),
                candidates = eval.candidates.len(),
                skipped = eval.skipped,
                "detector finished"
            );
            skipped_rows += eval.skipped;
            candidates.extend(eval.candidates);
        }

        let outcome = ledger.append_batch(candidates, now)?;

        let mut raised = RaisedCounts::default();
        for alert in &outcome.inserted {
            self.state.record_alert(alert.kind, &alert.key(), alert.created_at);
            raised.bump(alert.kind);
        }

        let pruned = ledger.prune(self.retention, now)?;

        let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
        for kind in AlertKind::ALL {
            by_kind.insert(kind.as_str(), raised.get(kind));
        }
        tracing::info!(
            target: "wifi_heatmap::cycle",
            raised = ?by_kind,
            suppressed = outcome.suppressed,
            skipped_rows,
            pruned,
            "check cycle complete"
        );

        Ok(CycleReport {
            ran_at: now,
            total: raised.total(),
            raised,
            suppressed: outcome.suppressed,
            skipped_rows,
            pruned,
            alerts: outcome.inserted,
        })
    }
}
