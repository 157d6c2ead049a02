//! Alert records raised by the detectors and persisted by the ledger.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::observation::{ts_format, NetworkKey};

// ---------------------------------------------------------------------------
// Kind + Severity
// ---------------------------------------------------------------------------

/// Which detector produced an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Degradation,
    WeakSignal,
    Disappearance,
}

impl AlertKind {
    pub const ALL: [AlertKind; 3] =
        [AlertKind::Degradation, AlertKind::WeakSignal, AlertKind::Disappearance];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Degradation => "degradation",
            AlertKind::WeakSignal => "weak_signal",
            AlertKind::Disappearance => "disappearance",
        }
    }

    /// Severity every alert of this kind is raised with.
    pub fn severity(&self) -> Severity {
        match self {
            AlertKind::Degradation => Severity::Warning,
            AlertKind::WeakSignal => Severity::Info,
            AlertKind::Disappearance => Severity::Warning,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "degradation" => Ok(AlertKind::Degradation),
            "weak_signal" => Ok(AlertKind::WeakSignal),
            "disappearance" => Ok(AlertKind::Disappearance),
            other => Err(format!("unknown alert kind: {other}")),
        }
    }
}

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

/// An alert candidate produced by a detector, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub kind: AlertKind,
    pub key: NetworkKey,
    pub message: String,
    pub details: serde_json::Value,
}

impl NewAlert {
    pub fn new(kind: AlertKind, key: NetworkKey, message: String, details: serde_json::Value) -> Self {
        NewAlert { kind, key, message, details }
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }
}

/// A persisted alert. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub room: String,
    pub network_id: String,
    pub message: String,
    #[serde(with = "ts_format")]
    pub created_at: NaiveDateTime,
    pub details: serde_json::Value,
}

impl Alert {
    pub fn key(&self) -> NetworkKey {
        NetworkKey::new(self.room.clone(), self.network_id.clone())
    }
}
