use chrono::{DateTime, Utc};

use super::channel::{
    step, ChannelEvent, ChannelId, ChannelState, ClipJob, DetectorConfig, SensorReading,
};

/// Runs the per-channel state machine for every bowl. Channels never share state.
#[derive(Debug, Clone)]
pub struct EventDetector {
    config: DetectorConfig,
    channels: [ChannelState; 2],
}

impl EventDetector {
    /// Seed both channels from the first successful read.
    pub fn new(config: DetectorConfig, initial: (f64, f64)) -> Self {
        Self {
            config,
            channels: [ChannelState::new(initial.0), ChannelState::new(initial.1)],
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn state(&self, channel: ChannelId) -> &ChannelState {
        &self.channels[channel.index()]
    }

    /// Apply one tick's readings; returns the per-channel events in channel order.
    pub fn observe(
        &mut self,
        readings: &[SensorReading],
        now: DateTime<Utc>,
    ) -> Vec<(ChannelId, ChannelEvent)> {
        readings
            .iter()
            .map(|reading| {
                let slot = &mut self.channels[reading.channel.index()];
                let (next, event) = step(*slot, *reading, now, &self.config);
                *slot = next;
                (reading.channel, event)
            })
            .collect()
    }

    /// Convenience over [`observe`](Self::observe) for the paired load-cell read.
    pub fn observe_pair(&mut self, meal: f64, drink: f64, now: DateTime<Utc>) -> Vec<ClipJob> {
        self.observe(&SensorReading::pair(meal, drink), now)
            .into_iter()
            .filter_map(|(_, event)| event.into_job())
            .collect()
    }
}
