//! Journal rows for finished clip jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capture::ClipOutcome;

/// One finished clip job as stored in `clip_outcomes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipOutcomeRecord {
    pub id: Option<i64>,
    pub job_id: String,
    pub channel: String,
    pub clip_start: DateTime<Utc>,
    pub clip_end: DateTime<Utc>,
    pub close_reason: String,
    pub peak_delta_value: f64,
    pub status: String,
    pub detail: Option<String>,
    pub clip_url: Option<String>,
    pub event_recorded: bool,
    pub finished_at: DateTime<Utc>,
}

impl From<&ClipOutcome> for ClipOutcomeRecord {
    fn from(outcome: &ClipOutcome) -> Self {
        Self {
            id: None,
            job_id: outcome.job_id.to_string(),
            channel: outcome.job.channel.as_str().to_string(),
            clip_start: outcome.job.clip_start,
            clip_end: outcome.job.clip_end,
            close_reason: outcome.job.reason.as_str().to_string(),
            peak_delta_value: outcome.job.peak_delta_value,
            status: outcome.status.as_str().to_string(),
            detail: outcome.detail.clone(),
            clip_url: outcome.clip_url.clone(),
            event_recorded: outcome.event_recorded,
            finished_at: outcome.finished_at,
        }
    }
}

/// Totals per status, for the shutdown summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipOutcomeCounts {
    pub uploaded: u64,
    pub dropped: u64,
    pub failed: u64,
    pub events_recorded: u64,
}
