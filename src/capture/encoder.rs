//! External ffmpeg processes: the long-lived RTSP -> RTMP + HLS encoder and
//! the one-shot lossless segment merge.

use anyhow::{bail, Context, Result};
use std::{
    fs,
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{
    process::{Child, Command},
    time::Duration,
};

use crate::settings::StreamSettings;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const PLAYLIST_NAME: &str = "playlist.m3u8";
const SEGMENT_PATTERN: &str = "stream_%Y-%m-%d_%H-%M-%S.ts";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Remove playlists and segments left behind by a previous run.
pub fn clear_stale_segments(dir: &Path) -> Result<usize> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create segment dir {}", dir.display()))?;

    let mut removed = 0;
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        let stale = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("m3u8") | Some("ts")
        );
        if stale && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Arguments for the tee encoder: one RTSP input, HLS segments plus an FLV live push.
pub fn encoder_args(
    settings: &StreamSettings,
    camera_url: &str,
    live_url: &str,
    segment_dir: &Path,
) -> Vec<String> {
    let playlist = segment_dir.join(PLAYLIST_NAME);
    let pattern = segment_dir.join(SEGMENT_PATTERN);
    let hls = format!(
        "[f=hls:hls_time={}:hls_list_size={}:hls_flags=delete_segments+program_date_time:strftime=1:hls_segment_filename={}]{}",
        settings.hls_segment_secs,
        settings.hls_list_size,
        pattern.display(),
        playlist.display(),
    );
    let tee = format!("{hls}|[f=flv]{live_url}");

    [
        "-loglevel", "info",
        "-rtsp_transport", "tcp",
        "-thread_queue_size", "64",
        "-i", camera_url,
        "-f", "lavfi", "-i", "anullsrc=channel_layout=stereo:sample_rate=44100",
        "-map", "0:v:0", "-map", "1:a:0",
        "-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency",
        "-pix_fmt", "yuv420p", "-g", "50", "-keyint_min", "50", "-sc_threshold", "0",
        "-vf", "fps=15",
        "-c:a", "aac", "-ar", "44100", "-b:a", "1k",
        "-f", "tee",
        "-flush_packets", "1",
        "-blocksize", "4096",
        "-flags", "+global_header",
        "-muxpreload", "0", "-muxdelay", "0",
        tee.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Handle to the running encoder process. Dropping it kills the process.
pub struct StreamEncoder {
    child: Child,
    segment_dir: PathBuf,
}

impl StreamEncoder {
    pub fn start(
        settings: &StreamSettings,
        camera: &str,
        streaming_key: &str,
        segment_dir: &Path,
    ) -> Result<Self> {
        let removed = clear_stale_segments(segment_dir)?;
        log_info!(
            "[encoder] cleared {removed} stale files from {}",
            segment_dir.display()
        );

        let camera_url = settings.camera_url(camera);
        let live_url = settings.live_url(streaming_key);
        let args = encoder_args(settings, &camera_url, &live_url, segment_dir);

        let child = Command::new(&settings.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", settings.ffmpeg_bin))?;

        log_info!("[encoder] started: {camera_url} -> {live_url} + HLS");
        Ok(Self {
            child,
            segment_dir: segment_dir.to_path_buf(),
        })
    }

    pub fn segment_dir(&self) -> &Path {
        &self.segment_dir
    }

    /// `false` once the process has exited on its own.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Kill the encoder and reap it.
    pub async fn shutdown(mut self) -> Result<()> {
        if !self.is_running() {
            log_warn!("[encoder] already exited");
            return Ok(());
        }
        self.child.start_kill().context("failed to signal encoder")?;
        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(status) => {
                let status = status.context("failed to reap encoder")?;
                log_info!("[encoder] stopped ({status})");
                Ok(())
            }
            Err(_) => bail!("encoder did not exit within {}s", SHUTDOWN_GRACE.as_secs()),
        }
    }
}

/// Concatenates segments listed in a concat-demuxer list file into one clip.
pub trait SegmentMerger: Send + Sync + 'static {
    fn merge(
        &self,
        dir: &Path,
        list_name: &str,
        output_name: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// `ffmpeg -f concat -safe 0 -i <list> -c copy <out>`, run inside the segment dir.
#[derive(Debug, Clone)]
pub struct FfmpegMerger {
    ffmpeg_bin: String,
}

impl FfmpegMerger {
    pub fn new(ffmpeg_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
        }
    }
}

impl SegmentMerger for FfmpegMerger {
    async fn merge(&self, dir: &Path, list_name: &str, output_name: &str) -> Result<()> {
        let output = Command::new(&self.ffmpeg_bin)
            .args(["-y", "-f", "concat", "-safe", "0", "-i", list_name, "-c", "copy", output_name])
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.ffmpeg_bin))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(3)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            bail!("ffmpeg exited with {}: {tail}", output.status);
        }
        Ok(())
    }
}

/// Body of a concat-demuxer list: one `file '<name>'` line per segment.
pub fn concat_list<'a, I>(names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .map(|name| format!("file '{}'\n", name.replace('\'', "'\\''")))
        .collect()
}
