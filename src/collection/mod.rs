//! Boundary to the collection service: upload locations, blob upload and
//! event ingestion.

mod client;

pub use client::HttpCollectionClient;

use anyhow::Result;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;

use crate::capture::ClipJob;

/// Short-lived, write-capable location for one blob plus its readable URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTarget {
    #[serde(rename = "sasUrl")]
    pub upload_url: String,
    #[serde(rename = "blobUrl")]
    pub public_url: String,
}

/// Body posted to the event-ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub user_id: String,
    pub event_time: String,
    pub duration_seconds: i64,
    pub weight_info: String,
    pub origin_video_url: String,
    pub event_type: String,
    pub bowl_where_cell: String,
}

impl EventRecord {
    pub fn for_clip(
        job: &ClipJob,
        user_id: &str,
        origin_video_url: &str,
        zone: FixedOffset,
        bowl_cell: &str,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            event_time: job.clip_start.with_timezone(&zone).to_rfc3339(),
            duration_seconds: job.duration_secs(),
            weight_info: weight_info(job.peak_delta_value),
            origin_video_url: origin_video_url.to_string(),
            event_type: job.channel.as_str().to_string(),
            bowl_where_cell: bowl_cell.to_string(),
        }
    }
}

/// Integer magnitude of the weight reading, or `N/A` when it is not a number.
pub fn weight_info(value: f64) -> String {
    if value.is_finite() {
        (value.trunc() as i64).abs().to_string()
    } else {
        "N/A".to_string()
    }
}

pub trait CollectionApi: Send + Sync + 'static {
    fn generate_upload_url(
        &self,
        file_name: &str,
    ) -> impl Future<Output = Result<UploadTarget>> + Send;

    fn upload_file(
        &self,
        target: &UploadTarget,
        path: &Path,
    ) -> impl Future<Output = Result<()>> + Send;

    fn report_event(&self, record: &EventRecord) -> impl Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ChannelId, CloseReason};
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn weight_info_truncates_and_drops_sign() {
        assert_eq!(weight_info(-12.9), "12");
        assert_eq!(weight_info(3.2), "3");
        assert_eq!(weight_info(f64::NAN), "N/A");
    }

    #[test]
    fn event_record_uses_local_zone_and_clip_window() {
        let start = Utc.with_ymd_and_hms(2025, 5, 4, 23, 59, 58).unwrap();
        let job = ClipJob {
            channel: ChannelId::Drink,
            clip_start: start,
            clip_end: start + Duration::milliseconds(9_600),
            peak_delta_value: -41.7,
            reason: CloseReason::Stable,
        };
        let zone = FixedOffset::east_opt(9 * 3600).unwrap();
        let record = EventRecord::for_clip(&job, "owner@example.com", "https://blob/x.mp4", zone, "5");

        assert_eq!(record.event_time, "2025-05-05T08:59:58+09:00");
        assert_eq!(record.duration_seconds, 9);
        assert_eq!(record.weight_info, "41");
        assert_eq!(record.event_type, "drink");
        assert_eq!(record.bowl_where_cell, "5");

        let body = serde_json::to_value(&record).unwrap();
        assert_eq!(body["origin_video_url"], "https://blob/x.mp4");
        assert_eq!(body["user_id"], "owner@example.com");
    }

    #[test]
    fn upload_target_reads_broker_field_names() {
        let target: UploadTarget =
            serde_json::from_str(r#"{"sasUrl":"https://up?sig=1","blobUrl":"https://blob/a.mp4"}"#)
                .unwrap();
        assert_eq!(target.upload_url, "https://up?sig=1");
        assert_eq!(target.public_url, "https://blob/a.mp4");
    }
}
