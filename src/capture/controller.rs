use anyhow::{bail, Context, Result};
use log::info;
use std::{path::Path, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;

use crate::collection::CollectionApi;
use crate::db::{ClipOutcomeRecord, Database};
use crate::metrics::CaptureMetrics;
use crate::settings::{FeederSettings, StreamSettings};

use super::encoder::{SegmentMerger, StreamEncoder};
use super::loop_worker::{capture_loop, LoopConfig};
use super::sensor::{factory_for, RetryPolicy, SensorSupervisor};
use super::worker::{ClipOutcome, ClipWorker, ClipWorkerConfig};

/// Owns every long-lived capture resource: the encoder process, the sensor
/// supervisor (through the poll loop), the clip worker and the outcome pump.
pub struct CaptureController {
    handle: Option<JoinHandle<SensorSupervisor>>,
    cancel_token: Option<CancellationToken>,
    encoder: Option<StreamEncoder>,
    worker: Option<ClipWorker>,
    metrics: CaptureMetrics,
}

impl CaptureController {
    pub fn new(metrics: CaptureMetrics) -> Self {
        Self {
            handle: None,
            cancel_token: None,
            encoder: None,
            worker: None,
            metrics,
        }
    }

    pub fn metrics(&self) -> CaptureMetrics {
        self.metrics.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Launch the camera encoder. Segments land in `segment_dir`.
    pub fn start_encoder(
        &mut self,
        stream: &StreamSettings,
        camera: &str,
        streaming_key: &str,
        segment_dir: &Path,
    ) -> Result<()> {
        if self.encoder.is_some() {
            bail!("encoder already running");
        }
        self.encoder = Some(StreamEncoder::start(stream, camera, streaming_key, segment_dir)?);
        Ok(())
    }

    /// Acquire the sensor, start the clip worker and spawn the poll loop.
    pub async fn start_capture<C, M>(
        &mut self,
        settings: &FeederSettings,
        api: Arc<C>,
        merger: Arc<M>,
        journal: Option<Database>,
    ) -> Result<()>
    where
        C: CollectionApi,
        M: SegmentMerger,
    {
        if self.handle.is_some() {
            bail!("capture already active");
        }

        let capture = &settings.capture;
        let supervisor = SensorSupervisor::init_with_retry(
            factory_for(&capture.sensor),
            RetryPolicy {
                attempts: capture.init_attempts,
                delay: Duration::from_millis(capture.init_retry_delay_ms),
            },
            capture.probe_interval(),
        )
        .await;

        let worker_config = ClipWorkerConfig::from_settings(capture, &settings.collection);
        let (worker, outcomes) = ClipWorker::spawn(worker_config, api, merger);
        tokio::spawn(record_outcomes(outcomes, self.metrics.clone(), journal));

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(capture_loop(
            supervisor,
            LoopConfig::from(capture),
            worker.submitter(),
            self.metrics.clone(),
            cancel_token.clone(),
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.worker = Some(worker);
        Ok(())
    }

    /// Stop polling, release the sensor and the encoder. In-flight clip jobs
    /// are left to finish on their own.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        let loop_result = match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(supervisor) => {
                    supervisor.shutdown().await;
                    Ok(())
                }
                Err(err) => Err(err).context("capture loop task failed to join"),
            },
            None => Ok(()),
        };

        if let Some(worker) = self.worker.take() {
            worker.detach();
        }

        if let Some(encoder) = self.encoder.take() {
            if let Err(err) = encoder.shutdown().await {
                log::warn!("encoder shutdown: {err:#}");
            }
        }

        let snapshot = self.metrics.snapshot().await;
        info!(
            "capture stopped: ticks={} faults={} opened={} stable={} forced={} uploaded={} dropped={} failed={}",
            snapshot.ticks,
            snapshot.sensor_faults,
            snapshot.events_opened,
            snapshot.stability_closes,
            snapshot.forced_closes,
            snapshot.clips_uploaded,
            snapshot.clips_dropped,
            snapshot.clips_failed,
        );

        loop_result
    }
}

/// Drain the worker's result channel into metrics and the journal.
async fn record_outcomes(
    mut outcomes: mpsc::UnboundedReceiver<ClipOutcome>,
    metrics: CaptureMetrics,
    journal: Option<Database>,
) {
    while let Some(outcome) = outcomes.recv().await {
        metrics.record_outcome(&outcome).await;
        if let Some(db) = &journal {
            if let Err(err) = db.insert_clip_outcome(&ClipOutcomeRecord::from(&outcome)).await {
                log::error!("failed to journal clip outcome {}: {err:#}", outcome.job_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::channel::{ChannelId, ClipJob, CloseReason};
    use crate::collection::{EventRecord, UploadTarget};
    use anyhow::anyhow;
    use chrono::Utc;

    struct OfflineCollection;

    impl CollectionApi for OfflineCollection {
        async fn generate_upload_url(&self, _file_name: &str) -> Result<UploadTarget> {
            Err(anyhow!("offline"))
        }

        async fn upload_file(&self, _target: &UploadTarget, _path: &Path) -> Result<()> {
            Err(anyhow!("offline"))
        }

        async fn report_event(&self, _record: &EventRecord) -> Result<()> {
            Err(anyhow!("offline"))
        }
    }

    struct NeverMerge;

    impl SegmentMerger for NeverMerge {
        async fn merge(&self, _dir: &Path, _list: &str, _out: &str) -> Result<()> {
            Err(anyhow!("not reached"))
        }
    }

    fn quick_settings(segment_dir: &Path) -> FeederSettings {
        let mut settings = FeederSettings::default();
        settings.capture.init_attempts = 1;
        settings.capture.init_retry_delay_ms = 1;
        settings.capture.poll_interval_ms = 10;
        settings.capture.post_event_buffer_secs = 0;
        settings.capture.segment_dir = segment_dir.to_path_buf();
        settings
    }

    #[tokio::test]
    async fn start_stop_in_simulation_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = CaptureController::new(CaptureMetrics::new());
        let settings = quick_settings(dir.path());

        controller
            .start_capture(&settings, Arc::new(OfflineCollection), Arc::new(NeverMerge), None)
            .await
            .unwrap();
        assert!(controller.is_running());
        assert!(controller
            .start_capture(&settings, Arc::new(OfflineCollection), Arc::new(NeverMerge), None)
            .await
            .is_err());

        tokio::time::sleep(Duration::from_millis(60)).await;
        controller.stop().await.unwrap();
        assert!(!controller.is_running());

        let snapshot = controller.metrics().snapshot().await;
        assert!(snapshot.simulated);
        assert!(snapshot.ticks >= 1);
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let mut controller = CaptureController::new(CaptureMetrics::new());
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn outcomes_reach_metrics_and_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Database::new(dir.path().join("clips.db")).unwrap();
        let metrics = CaptureMetrics::new();
        let settings = quick_settings(dir.path());

        let (worker, outcomes) = ClipWorker::spawn(
            ClipWorkerConfig::from_settings(&settings.capture, &settings.collection),
            Arc::new(OfflineCollection),
            Arc::new(NeverMerge),
        );
        let pump = tokio::spawn(record_outcomes(outcomes, metrics.clone(), Some(journal.clone())));

        let now = Utc::now() - chrono::Duration::hours(3);
        worker.submit(ClipJob {
            channel: ChannelId::Drink,
            clip_start: now,
            clip_end: now + chrono::Duration::seconds(4),
            peak_delta_value: 9.0,
            reason: CloseReason::Stable,
        });
        worker.finish().await;
        pump.await.unwrap();

        assert_eq!(metrics.snapshot().await.clips_dropped, 1);
        let rows = journal.recent_clip_outcomes(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "dropped");
        assert_eq!(rows[0].channel, "drink");
    }
}
