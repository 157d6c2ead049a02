//! # Stage: Channel Congestion Analyzer
//!
//! ## Responsibility
//! Score 2.4 GHz channel usage and recommend one of the three
//! non-overlapping channels (1, 6, 11).
//!
//! Channels are 20 MHz wide on a 5 MHz grid, so a transmitter on channel `c`
//! interferes with everything in `c − 4 ..= c + 4`. The *effective
//! congestion* of an anchor is the network count summed over that band:
//!
//! ```text
//!   anchor  1 → channels 1..=5
//!   anchor  6 → channels 2..=10
//!   anchor 11 → channels 7..=14
//! ```
//!
//! The least congested anchor wins; ties go to the lower channel.
//!
//! ## Guarantees
//! - Total: never errors; empty or malformed input yields channel 1 and all-zero usage
//! - Deterministic: the same input always produces the same recommendation
//! - Out-of-band and non-numeric channels are skipped and counted

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::observation::Observation;

/// Valid 2.4 GHz channel numbers.
pub const BAND_CHANNELS: std::ops::RangeInclusive<u16> = 1..=14;

/// Channels whose 20 MHz masks do not overlap.
pub const NON_OVERLAPPING: [u16; 3] = [1, 6, 11];

/// Half-width of a channel's interference band, in channel steps.
pub const INTERFERENCE_SPAN: u16 = 4;

/// Networks counted per channel, always with an entry for all of 1..=14.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelUsage(BTreeMap<u16, u32>);

impl Default for ChannelUsage {
    fn default() -> Self {
        ChannelUsage(BAND_CHANNELS.map(|c| (c, 0)).collect())
    }
}

impl ChannelUsage {
    /// Build from explicit counts; entries outside 1..=14 are ignored.
    pub fn from_counts(counts: &[(u16, u32)]) -> Self {
        let mut usage = ChannelUsage::default();
        for &(channel, count) in counts {
            if let Some(slot) = usage.0.get_mut(&channel) {
                *slot += count;
            }
        }
        usage
    }

    pub fn get(&self, channel: u16) -> u32 {
        self.0.get(&channel).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|n| *n == 0)
    }

    pub fn as_map(&self) -> &BTreeMap<u16, u32> {
        &self.0
    }

    /// Sum of usage over every valid channel within ±4 of `anchor`.
    pub fn effective_congestion(&self, anchor: u16) -> u32 {
        interference_band(anchor).map(|c| self.get(c)).sum()
    }
}

/// Channels a transmitter on `anchor` interferes with, clipped to 1..=14.
pub fn interference_band(anchor: u16) -> std::ops::RangeInclusive<u16> {
    let lo = anchor.saturating_sub(INTERFERENCE_SPAN).max(*BAND_CHANNELS.start());
    let hi = anchor.saturating_add(INTERFERENCE_SPAN).min(*BAND_CHANNELS.end());
    lo..=hi
}

/// Pick the anchor with the lowest effective congestion (lowest channel on ties).
pub fn best_channel(usage: &ChannelUsage) -> u16 {
    NON_OVERLAPPING
        .iter()
        .copied()
        .min_by_key(|anchor| (usage.effective_congestion(*anchor), *anchor))
        .unwrap_or(NON_OVERLAPPING[0])
}

/// Channel recommendation returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub best_channel: u16,
    pub channel_usage: ChannelUsage,
    pub non_overlapping_channels: [u16; 3],
    /// Distinct networks seen anywhere in the band.
    pub total_networks_in_band: usize,
    /// Effective congestion per anchor channel.
    pub congestion: BTreeMap<u16, u32>,
    /// Entries dropped for a missing, non-numeric or out-of-band channel.
    pub skipped: usize,
}

impl Recommendation {
    pub fn from_usage(usage: ChannelUsage, total_networks_in_band: usize, skipped: usize) -> Self {
        let congestion = NON_OVERLAPPING.iter().map(|a| (*a, usage.effective_congestion(*a))).collect();
        Recommendation {
            best_channel: best_channel(&usage),
            channel_usage: usage,
            non_overlapping_channels: NON_OVERLAPPING,
            total_networks_in_band,
            congestion,
            skipped,
        }
    }
}

impl Default for Recommendation {
    fn default() -> Self {
        Self::from_usage(ChannelUsage::default(), 0, 0)
    }
}

/// Analyze `(network, channel)` pairs. A network counts once per channel
/// it was observed on, however many scans saw it.
pub fn recommend<'a, I>(samples: I) -> Recommendation
where
    I: IntoIterator<Item = (&'a str, Option<u16>)>,
{
    let mut per_channel: BTreeMap<u16, BTreeSet<&'a str>> = BTreeMap::new();
    let mut in_band: BTreeSet<&'a str> = BTreeSet::new();
    let mut skipped = 0usize;

    for (network, channel) in samples {
        match channel {
            Some(c) if BAND_CHANNELS.contains(&c) => {
                per_channel.entry(c).or_default().insert(network);
                in_band.insert(network);
            }
            _ => skipped += 1,
        }
    }

    let counts: Vec<(u16, u32)> =
        per_channel.iter().map(|(c, nets)| (*c, nets.len() as u32)).collect();
    if skipped > 0 {
        tracing::debug!(target: "wifi_heatmap::channel", skipped, "skipped non-2.4GHz or malformed channels");
    }
    Recommendation::from_usage(ChannelUsage::from_counts(&counts), in_band.len(), skipped)
}

/// Convenience wrapper over a scan window.
pub fn recommend_from_observations(observations: &[Observation]) -> Recommendation {
    recommend(observations.iter().map(|o| (o.network_id.as_str(), o.channel)))
}
