//! Queue and cancellation types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of ready work: one step of one instance.
///
/// A step has at most one active queue entry at a time. `claimed_by` /
/// `claimed_at` track which worker currently holds the entry; a claim that
/// outlives the claim timeout is treated as orphaned and released.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub instance_id: i64,
    pub step_name: String,
    pub available_at: DateTime<Utc>,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Requested out-of-band termination mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelKind {
    /// Unwind completed steps through their compensations.
    Cancel,
    /// Stop immediately; no compensations run.
    Abort,
}

impl CancelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancel => "cancel",
            Self::Abort => "abort",
        }
    }
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancel" => Ok(Self::Cancel),
            "abort" => Ok(Self::Abort),
            other => Err(format!("invalid cancellation kind: '{other}'")),
        }
    }
}

/// A pending request to cancel or abort an instance, processed at-most-once
/// by the cancellation watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationRequest {
    pub id: i64,
    pub instance_id: i64,
    pub kind: CancelKind,
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub processed: bool,
}
