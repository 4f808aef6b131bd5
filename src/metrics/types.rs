use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Compact view of one finished clip job, kept for the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipSummary {
    pub channel: String,
    pub status: String,
    pub duration_secs: i64,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub sensor_faults: u64,
    pub simulated: bool,
    pub events_opened: u64,
    pub stability_closes: u64,
    pub forced_closes: u64,
    pub clips_uploaded: u64,
    pub clips_dropped: u64,
    pub clips_failed: u64,
    pub events_recorded: u64,
    /// Oldest first.
    pub recent_clips: VecDeque<ClipSummary>,
}
