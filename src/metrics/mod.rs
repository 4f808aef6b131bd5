mod types;

pub use types::{ClipSummary, MetricsSnapshot};

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::capture::{ChannelEvent, ClipOutcome, ClipStatus, CloseReason};

const MAX_RECENT_CLIPS: usize = 20;

/// In-process counters for the capture node. Clones share the same state.
#[derive(Clone, Default)]
pub struct CaptureMetrics {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl CaptureMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_tick(&self, simulated: bool) {
        let mut state = self.inner.lock().await;
        state.ticks += 1;
        state.simulated = simulated;
    }

    pub async fn record_sensor_fault(&self) {
        self.inner.lock().await.sensor_faults += 1;
    }

    pub async fn record_channel_event(&self, event: &ChannelEvent) {
        let mut state = self.inner.lock().await;
        match event {
            ChannelEvent::Opened => state.events_opened += 1,
            ChannelEvent::Closed(job) => match job.reason {
                CloseReason::Stable => state.stability_closes += 1,
                CloseReason::Forced => state.forced_closes += 1,
            },
            ChannelEvent::Quiet | ChannelEvent::Extended => {}
        }
    }

    pub async fn record_outcome(&self, outcome: &ClipOutcome) {
        let mut state = self.inner.lock().await;
        match outcome.status {
            ClipStatus::Uploaded => state.clips_uploaded += 1,
            ClipStatus::Dropped => state.clips_dropped += 1,
            ClipStatus::Failed => state.clips_failed += 1,
        }
        if outcome.event_recorded {
            state.events_recorded += 1;
        }

        state.recent_clips.push_back(ClipSummary {
            channel: outcome.job.channel.as_str().to_string(),
            status: outcome.status.as_str().to_string(),
            duration_secs: outcome.job.duration_secs(),
            finished_at: outcome.finished_at,
        });
        if state.recent_clips.len() > MAX_RECENT_CLIPS {
            state.recent_clips.pop_front();
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{ChannelId, ClipJob};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn outcome(status: ClipStatus, recorded: bool) -> ClipOutcome {
        let now = Utc::now();
        ClipOutcome {
            job_id: Uuid::new_v4(),
            job: ClipJob {
                channel: ChannelId::Meal,
                clip_start: now - Duration::seconds(10),
                clip_end: now,
                peak_delta_value: 5.0,
                reason: CloseReason::Forced,
            },
            status,
            detail: None,
            clip_url: None,
            event_recorded: recorded,
            finished_at: now,
        }
    }

    #[tokio::test]
    async fn counts_events_and_outcomes() {
        let metrics = CaptureMetrics::new();
        metrics.record_tick(true).await;
        metrics.record_sensor_fault().await;
        metrics.record_channel_event(&ChannelEvent::Opened).await;
        metrics.record_channel_event(&ChannelEvent::Extended).await;
        metrics
            .record_channel_event(&ChannelEvent::Closed(outcome(ClipStatus::Uploaded, true).job))
            .await;
        metrics.record_outcome(&outcome(ClipStatus::Uploaded, true)).await;
        metrics.record_outcome(&outcome(ClipStatus::Dropped, false)).await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.ticks, 1);
        assert!(snapshot.simulated);
        assert_eq!(snapshot.sensor_faults, 1);
        assert_eq!(snapshot.events_opened, 1);
        assert_eq!(snapshot.forced_closes, 1);
        assert_eq!(snapshot.stability_closes, 0);
        assert_eq!(snapshot.clips_uploaded, 1);
        assert_eq!(snapshot.clips_dropped, 1);
        assert_eq!(snapshot.events_recorded, 1);
        assert_eq!(snapshot.recent_clips[0].duration_secs, 10);
    }

    #[tokio::test]
    async fn recent_clips_are_capped_oldest_first_out() {
        let metrics = CaptureMetrics::new();
        for _ in 0..5 {
            metrics.record_outcome(&outcome(ClipStatus::Failed, false)).await;
        }
        for _ in 0..MAX_RECENT_CLIPS {
            metrics.record_outcome(&outcome(ClipStatus::Uploaded, true)).await;
        }
        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.recent_clips.len(), MAX_RECENT_CLIPS);
        assert!(snapshot.recent_clips.iter().all(|c| c.status == "uploaded"));
        assert_eq!(snapshot.clips_failed, 5);
    }
}
