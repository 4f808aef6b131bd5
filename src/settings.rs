use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
    time::Duration,
};

const API_KEY_ENV: &str = "FEEDWATCH_API_KEY";

/// Where the two bowl weights come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorSource {
    /// Static zero readings; the loop runs but never sees an event.
    Simulated,
    /// Line-oriented device or file, one `meal,drink` pair per line.
    Serial { path: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Absolute per-tick change (grams) that counts as activity.
    pub delta_g: f64,
    pub stability_threshold_secs: u64,
    pub max_event_secs: u64,
    pub pre_event_buffer_secs: u64,
    /// Delay before the worker scans for segments, so the encoder can flush.
    pub post_event_buffer_secs: u64,
    pub segment_tolerance_secs: u64,
    pub poll_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub probe_interval_secs: u64,
    pub init_attempts: u32,
    pub init_retry_delay_ms: u64,
    pub reinit_attempts: u32,
    pub reinit_retry_delay_ms: u64,
    pub worker_concurrency: usize,
    /// Offset of the zone event times are reported in.
    pub event_utc_offset_minutes: i32,
    pub bowl_cell: String,
    pub segment_dir: PathBuf,
    pub sensor: SensorSource,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            delta_g: 2.0,
            stability_threshold_secs: 2,
            max_event_secs: 60,
            pre_event_buffer_secs: 2,
            post_event_buffer_secs: 2,
            segment_tolerance_secs: 2,
            poll_interval_ms: 1_000,
            read_timeout_ms: 5_000,
            probe_interval_secs: 30,
            init_attempts: 5,
            init_retry_delay_ms: 5_000,
            reinit_attempts: 3,
            reinit_retry_delay_ms: 2_000,
            worker_concurrency: 2,
            event_utc_offset_minutes: 9 * 60,
            bowl_cell: "5".into(),
            segment_dir: PathBuf::from("static"),
            sensor: SensorSource::Simulated,
        }
    }
}

impl CaptureSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn post_event_buffer(&self) -> Duration {
        Duration::from_secs(self.post_event_buffer_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    pub ffmpeg_bin: String,
    /// Camera input; `{camera}` is replaced by the address given on the command line.
    pub rtsp_url: String,
    /// Live output base; the streaming key is appended.
    pub rtmp_base_url: String,
    pub hls_segment_secs: u32,
    pub hls_list_size: u32,
    pub warmup_secs: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".into(),
            rtsp_url: "rtsp://{camera}/stream1".into(),
            rtmp_base_url: "rtmp://localhost:1935/live/".into(),
            hls_segment_secs: 2,
            hls_list_size: 30,
            warmup_secs: 5,
        }
    }
}

impl StreamSettings {
    pub fn camera_url(&self, camera: &str) -> String {
        self.rtsp_url.replace("{camera}", camera)
    }

    pub fn live_url(&self, streaming_key: &str) -> String {
        format!("{}{}", self.rtmp_base_url, streaming_key)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionSettings {
    pub base_url: String,
    pub container: String,
    pub api_key: String,
    pub user_id: String,
    pub connect_timeout_secs: u64,
    pub upload_timeout_secs: u64,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".into(),
            container: "video".into(),
            api_key: String::new(),
            user_id: String::new(),
            connect_timeout_secs: 10,
            upload_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderSettings {
    pub target_per_class: usize,
    pub train_ratio: f64,
    pub seed: Option<u64>,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            target_per_class: 300,
            train_ratio: 0.7,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeederSettings {
    pub capture: CaptureSettings,
    pub stream: StreamSettings,
    pub collection: CollectionSettings,
    pub builder: BuilderSettings,
    pub journal_path: Option<PathBuf>,
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<FeederSettings>,
}

impl SettingsStore {
    /// Load settings from `path`. A missing or unreadable file yields defaults.
    pub fn new(path: PathBuf) -> Result<Self> {
        let mut data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!(
                    "Settings at {} could not be parsed ({err}); using defaults",
                    path.display()
                );
                FeederSettings::default()
            })
        } else {
            FeederSettings::default()
        };

        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                data.collection.api_key = key;
            }
        }

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> FeederSettings {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update<F>(&self, apply: F)
    where
        F: FnOnce(&mut FeederSettings),
    {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard);
    }

    pub fn save(&self) -> Result<()> {
        let data = self.snapshot();
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create settings directory {}", parent.display())
                })?;
            }
        }
        let serialized = serde_json::to_string_pretty(&data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
