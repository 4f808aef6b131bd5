//! Off-loop clip pipeline: wait for the encoder to flush, pick the segments,
//! merge, upload, report. Jobs are submitted without blocking and every job
//! produces exactly one [`ClipOutcome`] on the result channel.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::Serialize;
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Semaphore},
    task::{JoinHandle, JoinSet},
    time::Duration,
};
use uuid::Uuid;

use super::channel::{ChannelId, ClipJob};
use super::encoder::{concat_list, SegmentMerger};
use super::segments::{local_utc_offset, recent_segment_names, resolve_clip_segments};
use crate::collection::{CollectionApi, EventRecord};
use crate::settings::{CaptureSettings, CollectionSettings};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

#[derive(Debug, Error)]
pub enum ClipError {
    #[error("no segments found for the {channel} clip window")]
    NoSegments { channel: ChannelId },
    #[error("segment merge failed: {0:#}")]
    Merge(anyhow::Error),
    #[error("upload location request failed: {0:#}")]
    UploadUrl(anyhow::Error),
    #[error("clip upload failed: {0:#}")]
    Upload(anyhow::Error),
    #[error("clip file I/O failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipStatus {
    Uploaded,
    Dropped,
    Failed,
}

impl ClipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClipStatus::Uploaded => "uploaded",
            ClipStatus::Dropped => "dropped",
            ClipStatus::Failed => "failed",
        }
    }
}

/// What happened to one clip job.
#[derive(Debug, Clone, Serialize)]
pub struct ClipOutcome {
    pub job_id: Uuid,
    pub job: ClipJob,
    pub status: ClipStatus,
    pub detail: Option<String>,
    pub clip_url: Option<String>,
    pub event_recorded: bool,
    pub finished_at: DateTime<Utc>,
}

impl ClipOutcome {
    fn from_result(job_id: Uuid, job: ClipJob, result: Result<Delivered, ClipError>) -> Self {
        let (status, detail, clip_url, event_recorded) = match result {
            Ok(delivered) => (
                ClipStatus::Uploaded,
                delivered.event_error,
                Some(delivered.clip_url),
                delivered.event_recorded,
            ),
            Err(err @ ClipError::NoSegments { .. }) => {
                (ClipStatus::Dropped, Some(err.to_string()), None, false)
            }
            Err(err) => (ClipStatus::Failed, Some(err.to_string()), None, false),
        };
        Self {
            job_id,
            job,
            status,
            detail,
            clip_url,
            event_recorded,
            finished_at: Utc::now(),
        }
    }
}

struct Delivered {
    clip_url: String,
    event_recorded: bool,
    event_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClipWorkerConfig {
    pub segment_dir: PathBuf,
    pub user_id: String,
    pub post_event_buffer: Duration,
    pub tolerance: chrono::Duration,
    /// Shift applied to the window when the first scan finds nothing.
    pub fallback_offset: chrono::Duration,
    /// Zone event times are reported in.
    pub event_zone: FixedOffset,
    pub bowl_cell: String,
    pub concurrency: usize,
}

impl ClipWorkerConfig {
    pub fn from_settings(capture: &CaptureSettings, collection: &CollectionSettings) -> Self {
        let event_zone = FixedOffset::east_opt(capture.event_utc_offset_minutes * 60)
            .unwrap_or_else(|| Utc.fix());
        Self {
            segment_dir: capture.segment_dir.clone(),
            user_id: collection.user_id.clone(),
            post_event_buffer: capture.post_event_buffer(),
            tolerance: chrono::Duration::seconds(capture.segment_tolerance_secs as i64),
            fallback_offset: local_utc_offset(),
            event_zone,
            bowl_cell: capture.bowl_cell.clone(),
            concurrency: capture.worker_concurrency.max(1),
        }
    }
}

struct Pipeline<C, M> {
    config: ClipWorkerConfig,
    api: Arc<C>,
    merger: Arc<M>,
}

/// Cloneable, non-blocking handle for queueing clip jobs.
#[derive(Clone)]
pub struct ClipSubmitter {
    tx: mpsc::UnboundedSender<ClipJob>,
}

impl ClipSubmitter {
    pub fn new(tx: mpsc::UnboundedSender<ClipJob>) -> Self {
        Self { tx }
    }

    /// Queue a job. Never waits; `false` only if the worker has shut down.
    pub fn submit(&self, job: ClipJob) -> bool {
        self.tx.send(job).is_ok()
    }
}

/// Bounded clip worker pool fed by a non-blocking submission queue.
pub struct ClipWorker {
    submitter: ClipSubmitter,
    dispatcher: JoinHandle<()>,
}

impl ClipWorker {
    /// Start the dispatcher. Outcomes arrive on the returned receiver.
    pub fn spawn<C, M>(
        config: ClipWorkerConfig,
        api: Arc<C>,
        merger: Arc<M>,
    ) -> (Self, mpsc::UnboundedReceiver<ClipOutcome>)
    where
        C: CollectionApi,
        M: SegmentMerger,
    {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(Pipeline {
            config,
            api,
            merger,
        });
        let dispatcher = tokio::spawn(dispatch(pipeline, submit_rx, outcome_tx));
        (
            Self {
                submitter: ClipSubmitter::new(submit_tx),
                dispatcher,
            },
            outcome_rx,
        )
    }

    pub fn submitter(&self) -> ClipSubmitter {
        self.submitter.clone()
    }

    pub fn submit(&self, job: ClipJob) -> bool {
        self.submitter.submit(job)
    }

    /// Stop accepting jobs and wait for the in-flight ones to finish.
    /// Jobs queued through other submitter clones keep the worker open.
    pub async fn finish(self) {
        drop(self.submitter);
        if let Err(err) = self.dispatcher.await {
            log_error!("[clip] dispatcher join failed: {err}");
        }
    }

    /// Stop accepting jobs; in-flight jobs keep running on their own.
    pub fn detach(self) {
        drop(self.submitter);
    }
}

async fn dispatch<C, M>(
    pipeline: Arc<Pipeline<C, M>>,
    mut submit_rx: mpsc::UnboundedReceiver<ClipJob>,
    outcome_tx: mpsc::UnboundedSender<ClipOutcome>,
) where
    C: CollectionApi,
    M: SegmentMerger,
{
    let permits = Arc::new(Semaphore::new(pipeline.config.concurrency));
    let mut in_flight = JoinSet::new();

    while let Some(job) = submit_rx.recv().await {
        let pipeline = Arc::clone(&pipeline);
        let permits = Arc::clone(&permits);
        let outcome_tx = outcome_tx.clone();

        in_flight.spawn(async move {
            tokio::time::sleep(pipeline.config.post_event_buffer).await;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            let job_id = Uuid::new_v4();
            log_info!(
                "[{}] [clip] {} close, window {} .. {}",
                job.channel,
                job.reason.as_str(),
                job.clip_start.format("%H:%M:%S"),
                job.clip_end.format("%H:%M:%S")
            );
            let result = pipeline.run(&job).await;
            match &result {
                Ok(delivered) => log_info!(
                    "[{}] [clip] uploaded {} (event recorded: {})",
                    job.channel,
                    delivered.clip_url,
                    delivered.event_recorded
                ),
                Err(err @ ClipError::NoSegments { .. }) => {
                    log_warn!("[{}] [clip] dropped: {err}", job.channel)
                }
                Err(err) => log_error!("[{}] [clip] failed: {err}", job.channel),
            }
            let _ = outcome_tx.send(ClipOutcome::from_result(job_id, job, result));
        });

        while let Some(joined) = in_flight.try_join_next() {
            if let Err(err) = joined {
                log_error!("[clip] job task panicked: {err}");
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            log_error!("[clip] job task panicked: {err}");
        }
    }
}

impl<C, M> Pipeline<C, M>
where
    C: CollectionApi,
    M: SegmentMerger,
{
    async fn run(&self, job: &ClipJob) -> Result<Delivered, ClipError> {
        let config = &self.config;
        let channel = job.channel;

        let segments = {
            let dir = config.segment_dir.clone();
            let job = job.clone();
            let (tolerance, offset) = (config.tolerance, config.fallback_offset);
            tokio::task::spawn_blocking(move || {
                resolve_clip_segments(&dir, &job, tolerance, offset)
            })
            .await
            .map_err(io::Error::other)?
            .map_err(|err| io::Error::other(format!("{err:#}")))?
        };

        if segments.is_empty() {
            log_warn!(
                "[{channel}] [clip] recent segments: {:?}",
                recent_segment_names(&config.segment_dir, 5)
            );
            return Err(ClipError::NoSegments { channel });
        }

        let names: Vec<String> = segments
            .iter()
            .filter_map(|s| s.path.file_name()?.to_str().map(str::to_owned))
            .collect();
        let list_name = format!("mylist_{channel}_{}.txt", Uuid::new_v4().simple());
        let output_name = format!("{}_{channel}_{}.mp4", config.user_id, Uuid::new_v4());
        let list_path = config.segment_dir.join(&list_name);
        let output_path = config.segment_dir.join(&output_name);

        tokio::fs::write(&list_path, concat_list(names.iter().map(String::as_str))).await?;

        if let Err(err) = self
            .merger
            .merge(&config.segment_dir, &list_name, &output_name)
            .await
        {
            remove_quietly(&list_path).await;
            return Err(ClipError::Merge(err));
        }

        // From here on a failure keeps the merged clip for manual recovery.
        let target = match self.api.generate_upload_url(&output_name).await {
            Ok(target) => target,
            Err(err) => {
                remove_quietly(&list_path).await;
                return Err(ClipError::UploadUrl(err));
            }
        };

        if let Err(err) = self.api.upload_file(&target, &output_path).await {
            remove_quietly(&list_path).await;
            return Err(ClipError::Upload(err));
        }

        let record = EventRecord::for_clip(
            job,
            &config.user_id,
            &target.public_url,
            config.event_zone,
            &config.bowl_cell,
        );
        let event_error = match self.api.report_event(&record).await {
            Ok(()) => None,
            Err(err) => {
                log_warn!("[{channel}] [clip] event report rejected: {err:#}");
                Some(format!("event report rejected: {err:#}"))
            }
        };

        remove_quietly(&list_path).await;
        remove_quietly(&output_path).await;

        Ok(Delivered {
            clip_url: target.public_url,
            event_recorded: event_error.is_none(),
            event_error,
        })
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => log_warn!("[clip] cleanup of {} failed: {err}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::channel::CloseReason;
    use crate::collection::UploadTarget;
    use anyhow::{anyhow, Result};
    use std::fs::{self, File};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::SystemTime;

    #[derive(Default)]
    struct FakeCollection {
        fail_url: AtomicBool,
        fail_upload: AtomicBool,
        reject_event: AtomicBool,
        uploaded: Mutex<Vec<PathBuf>>,
        events: Mutex<Vec<EventRecord>>,
    }

    impl CollectionApi for FakeCollection {
        async fn generate_upload_url(&self, file_name: &str) -> Result<UploadTarget> {
            if self.fail_url.load(Ordering::SeqCst) {
                return Err(anyhow!("broker down"));
            }
            Ok(UploadTarget {
                upload_url: format!("https://blob/{file_name}?sig=x"),
                public_url: format!("https://blob/{file_name}"),
            })
        }

        async fn upload_file(&self, _target: &UploadTarget, path: &Path) -> Result<()> {
            if self.fail_upload.load(Ordering::SeqCst) {
                return Err(anyhow!("connection reset"));
            }
            assert!(path.exists());
            self.uploaded.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        async fn report_event(&self, record: &EventRecord) -> Result<()> {
            if self.reject_event.load(Ordering::SeqCst) {
                return Err(anyhow!("422"));
            }
            self.events.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    /// Writes the list body into the output so tests can see what was merged.
    struct CopyMerger {
        fail: bool,
    }

    impl SegmentMerger for CopyMerger {
        async fn merge(&self, dir: &Path, list_name: &str, output_name: &str) -> Result<()> {
            if self.fail {
                return Err(anyhow!("exit status 1"));
            }
            let body = fs::read_to_string(dir.join(list_name))?;
            fs::write(dir.join(output_name), body)?;
            Ok(())
        }
    }

    fn config(dir: &Path) -> ClipWorkerConfig {
        ClipWorkerConfig {
            segment_dir: dir.to_path_buf(),
            user_id: "owner".into(),
            post_event_buffer: Duration::ZERO,
            tolerance: chrono::Duration::seconds(2),
            fallback_offset: chrono::Duration::zero(),
            event_zone: FixedOffset::east_opt(9 * 3600).unwrap(),
            bowl_cell: "5".into(),
            concurrency: 2,
        }
    }

    fn job_at(start: DateTime<Utc>) -> ClipJob {
        ClipJob {
            channel: ChannelId::Meal,
            clip_start: start,
            clip_end: start + chrono::Duration::seconds(6),
            peak_delta_value: -23.4,
            reason: CloseReason::Stable,
        }
    }

    fn segment(dir: &Path, name: &str, at: DateTime<Utc>) {
        let file = File::create(dir.join(name)).unwrap();
        file.set_modified(SystemTime::from(at)).unwrap();
    }

    fn leftovers(dir: &Path, prefix: &str) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.starts_with(prefix))
            .collect()
    }

    async fn run_one(
        dir: &Path,
        api: Arc<FakeCollection>,
        merger: CopyMerger,
        job: ClipJob,
    ) -> ClipOutcome {
        let (worker, mut outcomes) = ClipWorker::spawn(config(dir), api, Arc::new(merger));
        assert!(worker.submit(job));
        worker.finish().await;
        outcomes.recv().await.unwrap()
    }

    #[tokio::test]
    async fn uploads_reports_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc::now() - chrono::Duration::minutes(5);
        segment(dir.path(), "stream_1.ts", start + chrono::Duration::seconds(1));
        segment(dir.path(), "stream_2.ts", start + chrono::Duration::seconds(3));

        let api = Arc::new(FakeCollection::default());
        let outcome = run_one(dir.path(), Arc::clone(&api), CopyMerger { fail: false }, job_at(start)).await;

        assert_eq!(outcome.status, ClipStatus::Uploaded);
        assert!(outcome.event_recorded);
        let url = outcome.clip_url.unwrap();
        assert!(url.starts_with("https://blob/owner_meal_"));

        let events = api.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].duration_seconds, 6);
        assert_eq!(events[0].weight_info, "23");
        assert_eq!(events[0].event_type, "meal");
        assert_eq!(events[0].origin_video_url, url);

        assert!(leftovers(dir.path(), "mylist_").is_empty());
        assert!(leftovers(dir.path(), "owner_").is_empty());
    }

    #[tokio::test]
    async fn no_segments_is_a_silent_drop() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeCollection::default());
        let outcome = run_one(
            dir.path(),
            Arc::clone(&api),
            CopyMerger { fail: false },
            job_at(Utc::now() - chrono::Duration::hours(1)),
        )
        .await;

        assert_eq!(outcome.status, ClipStatus::Dropped);
        assert!(api.uploaded.lock().unwrap().is_empty());
        assert!(api.events.lock().unwrap().is_empty());
        assert!(leftovers(dir.path(), "mylist_").is_empty());
    }

    #[tokio::test]
    async fn merge_failure_removes_list_and_skips_upload() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc::now() - chrono::Duration::minutes(5);
        segment(dir.path(), "stream_1.ts", start);

        let api = Arc::new(FakeCollection::default());
        let outcome = run_one(dir.path(), Arc::clone(&api), CopyMerger { fail: true }, job_at(start)).await;

        assert_eq!(outcome.status, ClipStatus::Failed);
        assert!(outcome.detail.unwrap().contains("merge"));
        assert!(api.uploaded.lock().unwrap().is_empty());
        assert!(leftovers(dir.path(), "mylist_").is_empty());
    }

    #[tokio::test]
    async fn upload_failure_keeps_merged_clip() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc::now() - chrono::Duration::minutes(5);
        segment(dir.path(), "stream_1.ts", start + chrono::Duration::seconds(2));

        let api = Arc::new(FakeCollection::default());
        api.fail_upload.store(true, Ordering::SeqCst);
        let outcome = run_one(dir.path(), Arc::clone(&api), CopyMerger { fail: false }, job_at(start)).await;

        assert_eq!(outcome.status, ClipStatus::Failed);
        assert!(!outcome.event_recorded);
        assert!(api.events.lock().unwrap().is_empty());
        assert!(leftovers(dir.path(), "mylist_").is_empty());
        assert_eq!(leftovers(dir.path(), "owner_meal_").len(), 1);
    }

    #[tokio::test]
    async fn upload_url_failure_keeps_merged_clip() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc::now() - chrono::Duration::minutes(5);
        segment(dir.path(), "stream_1.ts", start + chrono::Duration::seconds(2));

        let api = Arc::new(FakeCollection::default());
        api.fail_url.store(true, Ordering::SeqCst);
        let outcome = run_one(dir.path(), Arc::clone(&api), CopyMerger { fail: false }, job_at(start)).await;

        assert_eq!(outcome.status, ClipStatus::Failed);
        assert!(outcome.detail.unwrap().contains("upload location"));
        assert_eq!(leftovers(dir.path(), "owner_meal_").len(), 1);
    }

    #[tokio::test]
    async fn rejected_event_does_not_fail_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let start = Utc::now() - chrono::Duration::minutes(5);
        segment(dir.path(), "stream_1.ts", start + chrono::Duration::seconds(2));

        let api = Arc::new(FakeCollection::default());
        api.reject_event.store(true, Ordering::SeqCst);
        let outcome = run_one(dir.path(), Arc::clone(&api), CopyMerger { fail: false }, job_at(start)).await;

        assert_eq!(outcome.status, ClipStatus::Uploaded);
        assert!(!outcome.event_recorded);
        assert_eq!(api.uploaded.lock().unwrap().len(), 1);
        assert!(leftovers(dir.path(), "owner_meal_").is_empty());
    }

    #[tokio::test]
    async fn every_submitted_job_yields_one_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(FakeCollection::default());
        let (worker, mut outcomes) =
            ClipWorker::spawn(config(dir.path()), api, Arc::new(CopyMerger { fail: false }));

        let base = Utc::now() - chrono::Duration::hours(2);
        for i in 0..5 {
            assert!(worker.submit(job_at(base + chrono::Duration::minutes(i))));
        }
        worker.finish().await;

        let mut seen = 0;
        while let Ok(outcome) = outcomes.try_recv() {
            assert_eq!(outcome.status, ClipStatus::Dropped);
            seen += 1;
        }
        assert_eq!(seen, 5);
    }
}
