use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::settings::CaptureSettings;

/// Physical bowl channel behind one load cell.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelId {
    Meal,
    Drink,
}

impl ChannelId {
    pub const ALL: [ChannelId; 2] = [ChannelId::Meal, ChannelId::Drink];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelId::Meal => "meal",
            ChannelId::Drink => "drink",
        }
    }

    pub fn index(self) -> usize {
        match self {
            ChannelId::Meal => 0,
            ChannelId::Drink => 1,
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One weight sample for one channel, produced every poll tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub channel: ChannelId,
    pub value: f64,
}

impl SensorReading {
    /// Split the paired `(meal, drink)` read into per-channel readings.
    pub fn pair(meal: f64, drink: f64) -> [SensorReading; 2] {
        [
            SensorReading {
                channel: ChannelId::Meal,
                value: meal,
            },
            SensorReading {
                channel: ChannelId::Drink,
                value: drink,
            },
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChannelPhase {
    Idle,
    Active {
        event_start: DateTime<Utc>,
        last_change: DateTime<Utc>,
    },
}

/// Per-channel detector state. Never dropped, only reset to idle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelState {
    pub phase: ChannelPhase,
    pub last_value: f64,
}

impl ChannelState {
    pub fn new(initial_value: f64) -> Self {
        Self {
            phase: ChannelPhase::Idle,
            last_value: initial_value,
        }
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.phase, ChannelPhase::Active { .. })
    }

    pub fn event_start(&self) -> Option<DateTime<Utc>> {
        match self.phase {
            ChannelPhase::Active { event_start, .. } => Some(event_start),
            ChannelPhase::Idle => None,
        }
    }

    pub fn last_change(&self) -> Option<DateTime<Utc>> {
        match self.phase {
            ChannelPhase::Active { last_change, .. } => Some(last_change),
            ChannelPhase::Idle => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloseReason {
    /// Readings stopped changing for the stability threshold.
    Stable,
    /// The event stayed open past the maximum duration.
    Forced,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Stable => "stable",
            CloseReason::Forced => "forced",
        }
    }
}

/// Capture-to-upload task emitted once per closed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipJob {
    pub channel: ChannelId,
    pub clip_start: DateTime<Utc>,
    pub clip_end: DateTime<Utc>,
    pub peak_delta_value: f64,
    pub reason: CloseReason,
}

impl ClipJob {
    pub fn duration_secs(&self) -> i64 {
        (self.clip_end - self.clip_start).num_seconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorConfig {
    pub delta_g: f64,
    pub stability_threshold: Duration,
    pub max_event: Duration,
    pub pre_buffer: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::from(&CaptureSettings::default())
    }
}

impl From<&CaptureSettings> for DetectorConfig {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            delta_g: settings.delta_g,
            stability_threshold: Duration::seconds(settings.stability_threshold_secs as i64),
            max_event: Duration::seconds(settings.max_event_secs as i64),
            pre_buffer: Duration::seconds(settings.pre_event_buffer_secs as i64),
        }
    }
}

/// What a single tick did to a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Quiet,
    Opened,
    Extended,
    Closed(ClipJob),
}

impl ChannelEvent {
    pub fn into_job(self) -> Option<ClipJob> {
        match self {
            ChannelEvent::Closed(job) => Some(job),
            _ => None,
        }
    }
}

/// Advance one channel by one reading.
///
/// Activity is measured tick to tick (`|value - last_value| >= delta_g`).
/// A stability close is checked before the max-duration close, and at most
/// one of them fires per tick.
pub fn step(
    state: ChannelState,
    reading: SensorReading,
    now: DateTime<Utc>,
    config: &DetectorConfig,
) -> (ChannelState, ChannelEvent) {
    let changed = (reading.value - state.last_value).abs() >= config.delta_g;
    let mut event = ChannelEvent::Quiet;

    let mut phase = match (state.phase, changed) {
        (ChannelPhase::Idle, true) => {
            event = ChannelEvent::Opened;
            ChannelPhase::Active {
                event_start: now,
                last_change: now,
            }
        }
        (ChannelPhase::Active { event_start, .. }, true) => {
            event = ChannelEvent::Extended;
            ChannelPhase::Active {
                event_start,
                last_change: now,
            }
        }
        (
            ChannelPhase::Active {
                event_start,
                last_change,
            },
            false,
        ) if now - last_change >= config.stability_threshold => {
            event = ChannelEvent::Closed(close_job(
                reading.channel,
                event_start,
                last_change,
                state.last_value,
                CloseReason::Stable,
                config,
            ));
            ChannelPhase::Idle
        }
        (phase, _) => phase,
    };

    if let ChannelPhase::Active {
        event_start,
        last_change,
    } = phase
    {
        if now - event_start >= config.max_event {
            event = ChannelEvent::Closed(close_job(
                reading.channel,
                event_start,
                last_change,
                state.last_value,
                CloseReason::Forced,
                config,
            ));
            phase = ChannelPhase::Idle;
        }
    }

    (
        ChannelState {
            phase,
            last_value: reading.value,
        },
        event,
    )
}

fn close_job(
    channel: ChannelId,
    event_start: DateTime<Utc>,
    clip_end: DateTime<Utc>,
    last_value: f64,
    reason: CloseReason,
    config: &DetectorConfig,
) -> ClipJob {
    ClipJob {
        channel,
        clip_start: event_start - config.pre_buffer,
        clip_end,
        peak_delta_value: last_value,
        reason,
    }
}
