//! Device snapshots
//!
//! A [`Snapshot`] is one device's decoded measurements at one poll instant.
//! Values keep mapping-declaration order so the published envelope is
//! canonical.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::GatewayResult;

/// Outcome of the poll that produced a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// Every mapping decoded
    Ok,
    /// Some mappings fell outside the returned block and were skipped
    Partial,
    /// The poll failed; no values
    Error,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }
}

/// Named values in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Measurements(Vec<(String, f64)>);

impl Measurements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.0.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, f64)> for Measurements {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(n, v)| (n.into(), v)).collect())
    }
}

/// One device's measurements at one poll
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub device_name: String,
    /// Per-device, strictly increasing, starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Monotonic capture instant, used for staleness
    pub captured_at: Instant,
    pub values: Measurements,
    pub status: SnapshotStatus,
}

impl Snapshot {
    pub fn new(
        device_name: impl Into<String>,
        sequence: u64,
        values: Measurements,
        status: SnapshotStatus,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            sequence,
            timestamp: Utc::now(),
            captured_at: Instant::now(),
            values,
            status,
        }
    }

    /// Failed poll: no values, status `error`
    pub fn error(device_name: impl Into<String>, sequence: u64) -> Self {
        Self::new(device_name, sequence, Measurements::new(), SnapshotStatus::Error)
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.status == SnapshotStatus::Error
    }

    /// Envelope bytes for the transport sink
    pub fn to_json(&self) -> GatewayResult<Bytes> {
        crate::register_map::to_json(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurements_keep_order() {
        let values: Measurements = [("voltage", 230.1), ("current", 5.0), ("power", 1150.5)]
            .into_iter()
            .collect();
        let names: Vec<&str> = values.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["voltage", "current", "power"]);
        assert_eq!(values.get("current"), Some(5.0));
        assert_eq!(values.get("energy"), None);
    }

    #[test]
    fn test_error_snapshot_is_empty() {
        let snapshot = Snapshot::error("meter_1", 7);
        assert!(snapshot.is_error());
        assert!(snapshot.values.is_empty());
        assert_eq!(snapshot.sequence, 7);
        assert_eq!(snapshot.status.as_str(), "error");
    }
}
