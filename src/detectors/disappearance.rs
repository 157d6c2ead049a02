//! Known networks that stopped appearing.
//!
//! The known set is every `(room, network)` seen within the lookback
//! (default 24 h). A key is absent once `now − last_seen` exceeds the
//! threshold. One alert is raised per absence episode: the episode stays
//! open while `last_seen <= last_alerted`, and a sighting newer than the
//! alert closes it so a later absence alerts again.

use chrono::Duration;
use serde_json::json;

use super::{CheckContext, Detector, DetectorState, Evaluation};
use crate::alert::{AlertKind, NewAlert};
use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::observation::{format_timestamp, lookback_start};

#[derive(Debug, Clone)]
pub struct DisappearanceDetector {
    after: Duration,
    lookback: Duration,
}

impl DisappearanceDetector {
    pub fn new(after: Duration, lookback: Duration) -> Self {
        DisappearanceDetector { after, lookback }
    }

    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self::new(config.disappearance_after(), config.disappearance_lookback())
    }
}

impl Detector for DisappearanceDetector {
    fn kind(&self) -> AlertKind {
        AlertKind::Disappearance
    }

    fn evaluate(&self, ctx: &CheckContext<'_>, state: &mut DetectorState) -> Result<Evaluation> {
        let sightings = ctx.store.last_seen(lookback_start(ctx.now, self.lookback)?)?;

        let mut candidates = Vec::new();
        for seen in sightings.networks {
            let key = seen.key;
            state.observe(&key, seen.last_seen);
            let last_seen = state.last_seen(&key).unwrap_or(seen.last_seen);

            if ctx.now - last_seen <= self.after {
                state.clear_absent(&key);
                continue;
            }

            match state.last_alerted_or_load(AlertKind::Disappearance, &key, ctx.ledger)? {
                Some(alerted_at) if last_seen <= alerted_at => {
                    state.mark_absent(&key);
                    continue;
                }
                _ => {}
            }

            let minutes_missing = (ctx.now - last_seen).num_minutes();
            let message = format!(
                "Network {} not seen in {} for {} minutes",
                key.network_id, key.room, minutes_missing
            );
            candidates.push(NewAlert::new(
                AlertKind::Disappearance,
                key,
                message,
                json!({
                    "last_seen": format_timestamp(&last_seen),
                    "minutes_missing": minutes_missing,
                }),
            ));
        }

        Ok(Evaluation { candidates, skipped: sightings.skipped })
    }
}
