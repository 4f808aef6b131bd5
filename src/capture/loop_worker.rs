use chrono::Utc;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::metrics::CaptureMetrics;
use crate::settings::CaptureSettings;

use super::channel::{ChannelEvent, DetectorConfig, SensorReading};
use super::detector::EventDetector;
use super::sensor::{RetryPolicy, SensorSupervisor};
use super::worker::ClipSubmitter;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const FAULT_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct LoopConfig {
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    pub reinit: RetryPolicy,
    pub fault_cooldown: Duration,
    pub detector: DetectorConfig,
}

impl From<&CaptureSettings> for LoopConfig {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval(),
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            reinit: RetryPolicy {
                attempts: settings.reinit_attempts,
                delay: Duration::from_millis(settings.reinit_retry_delay_ms),
            },
            fault_cooldown: FAULT_COOLDOWN,
            detector: DetectorConfig::from(settings),
        }
    }
}

/// Poll both bowls until cancelled, handing closed events to the clip worker.
///
/// The supervisor is handed back so the caller can release the sensor.
pub async fn capture_loop(
    mut supervisor: SensorSupervisor,
    config: LoopConfig,
    clips: ClipSubmitter,
    metrics: CaptureMetrics,
    cancel_token: CancellationToken,
) -> SensorSupervisor {
    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut detector: Option<EventDetector> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // A stuck read, reinit or cooldown must not hold up shutdown.
                tokio::select! {
                    _ = poll_once(&mut supervisor, &mut detector, &config, &clips, &metrics) => {}
                    _ = cancel_token.cancelled() => {
                        log_info!("capture loop cancelled mid-poll");
                        break;
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("capture loop shutting down");
                break;
            }
        }
    }

    supervisor
}

async fn poll_once(
    supervisor: &mut SensorSupervisor,
    detector: &mut Option<EventDetector>,
    config: &LoopConfig,
    clips: &ClipSubmitter,
    metrics: &CaptureMetrics,
) {
    let (meal, drink) = match supervisor.read(config.read_timeout).await {
        Ok(pair) => pair,
        Err(err) => {
            // Channel state is left untouched until a read succeeds again.
            metrics.record_sensor_fault().await;
            log_warn!("[sensor] read failed: {err:#}; reinitializing");
            supervisor.reinitialize(config.reinit).await;
            tokio::time::sleep(config.fault_cooldown).await;
            return;
        }
    };

    let now = Utc::now();
    metrics.record_tick(supervisor.is_simulated()).await;

    if detector.is_none() {
        log_info!("[sensor] baseline meal={meal:.1} drink={drink:.1}");
        *detector = Some(EventDetector::new(config.detector, (meal, drink)));
        return;
    }
    let Some(detector) = detector.as_mut() else {
        return;
    };
    log_debug!("[sensor] meal={meal:.1} drink={drink:.1}");

    for (channel, event) in detector.observe(&SensorReading::pair(meal, drink), now) {
        metrics.record_channel_event(&event).await;
        match event {
            ChannelEvent::Opened => log_info!("[{channel}] event started"),
            ChannelEvent::Closed(job) => {
                log_info!(
                    "[{channel}] event ended ({}), {}s clip queued",
                    job.reason.as_str(),
                    job.duration_secs()
                );
                if !clips.submit(job) {
                    log_error!("[{channel}] clip worker is gone; job discarded");
                }
            }
            ChannelEvent::Quiet | ChannelEvent::Extended => {}
        }
    }

    supervisor.poll_recovery().await;
}
