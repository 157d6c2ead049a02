//! Signal-unit conversion.
//!
//! The collector stores `signal` as the 0-100 link-quality percentage the OS
//! reports. Every threshold in this crate is expressed in dBm, so rows are
//! converted once, when they are read from the store:
//!
//! ```text
//! dbm = quality / 2 − 100        (quality > 0)
//! dbm = value                    (value ≤ 0, already dBm)
//! ```
//!
//! A quality of 100 maps to −50 dBm and a quality of 40 to −80 dBm, the
//! default weak-signal threshold.

/// Convert a 0-100 quality percentage to dBm.
pub fn quality_to_dbm(quality: f64) -> f64 {
    quality / 2.0 - 100.0
}

/// Convert dBm back to a 0-100 quality percentage, clamped to that range.
pub fn dbm_to_quality(dbm: f64) -> f64 {
    ((dbm + 100.0) * 2.0).clamp(0.0, 100.0)
}

/// Normalise a stored signal value to dBm.
///
/// Positive values are quality percentages; zero and negative values are
/// passed through as dBm.
pub fn normalize_signal(raw: f64) -> f64 {
    if raw > 0.0 {
        quality_to_dbm(raw)
    } else {
        raw
    }
}

/// Round to one decimal place for alert details and API payloads.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
