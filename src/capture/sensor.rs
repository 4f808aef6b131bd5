//! Load-cell sources and the supervisor that keeps one of them alive.
//!
//! The supervisor never gives up: when the real sensor cannot be opened it
//! falls back to [`SimulatedSensor`] and probes for the real one in the
//! background while the poll loop keeps running.

use anyhow::{anyhow, bail, Context, Result};
use std::{
    collections::VecDeque,
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
    sync::{Arc, Mutex, TryLockError},
};
use tokio::{
    task::JoinHandle,
    time::{Duration, Instant},
};

use crate::settings::SensorSource;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Paired weight source: `latest()` returns `(meal, drink)` in grams.
pub trait WeightSensor: Send {
    fn start(&mut self) -> Result<()>;
    fn latest(&mut self) -> Result<(f64, f64)>;
    fn stop(&mut self);

    fn is_simulated(&self) -> bool {
        false
    }
}

pub type SensorFactory = Arc<dyn Fn() -> Result<Box<dyn WeightSensor>> + Send + Sync>;

/// Build the factory for the configured source.
pub fn factory_for(source: &SensorSource) -> SensorFactory {
    match source.clone() {
        SensorSource::Simulated => {
            Arc::new(|| Err(anyhow!("no hardware sensor configured")))
        }
        SensorSource::Serial { path } => Arc::new(move || {
            Ok(Box::new(SerialLineSensor::new(path.clone())) as Box<dyn WeightSensor>)
        }),
    }
}

/// Degraded-mode stand-in that always reads the same pair.
#[derive(Debug, Clone, Default)]
pub struct SimulatedSensor {
    value: (f64, f64),
}

impl SimulatedSensor {
    pub fn new(meal: f64, drink: f64) -> Self {
        Self {
            value: (meal, drink),
        }
    }
}

impl WeightSensor for SimulatedSensor {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn latest(&mut self) -> Result<(f64, f64)> {
        Ok(self.value)
    }

    fn stop(&mut self) {}

    fn is_simulated(&self) -> bool {
        true
    }
}

/// Reads `meal,drink` (or whitespace separated) lines from a device node or file,
/// e.g. the serial port of a microcontroller driving two HX711 amplifiers.
pub struct SerialLineSensor {
    path: PathBuf,
    reader: Option<BufReader<File>>,
}

impl SerialLineSensor {
    pub fn new(path: PathBuf) -> Self {
        Self { path, reader: None }
    }
}

impl WeightSensor for SerialLineSensor {
    fn start(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open sensor at {}", self.path.display()))?;
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn latest(&mut self) -> Result<(f64, f64)> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("sensor read before start()"))?;

        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .with_context(|| format!("failed to read from {}", self.path.display()))?;
            if read == 0 {
                bail!("sensor stream {} ended", self.path.display());
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        parse_pair(&line)
    }

    fn stop(&mut self) {
        self.reader = None;
    }
}

fn parse_pair(line: &str) -> Result<(f64, f64)> {
    let mut parts = line
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|p| !p.is_empty());
    let mut next = |name: &str| -> Result<f64> {
        parts
            .next()
            .ok_or_else(|| anyhow!("missing {name} value in {line:?}"))?
            .parse::<f64>()
            .with_context(|| format!("invalid {name} value in {line:?}"))
    };
    let meal = next("meal")?;
    let drink = next("drink")?;
    Ok((meal, drink))
}

/// Replays a fixed script of reads; once exhausted it repeats the last good pair.
#[derive(Debug, Default)]
pub struct ScriptedSensor {
    script: VecDeque<std::result::Result<(f64, f64), String>>,
    last: (f64, f64),
}

impl ScriptedSensor {
    pub fn new<I>(script: I) -> Self
    where
        I: IntoIterator<Item = std::result::Result<(f64, f64), String>>,
    {
        Self {
            script: script.into_iter().collect(),
            last: (0.0, 0.0),
        }
    }
}

impl WeightSensor for ScriptedSensor {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn latest(&mut self) -> Result<(f64, f64)> {
        match self.script.pop_front() {
            Some(Ok(pair)) => {
                self.last = pair;
                Ok(pair)
            }
            Some(Err(msg)) => Err(anyhow!(msg)),
            None => Ok(self.last),
        }
    }

    fn stop(&mut self) {}
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

/// Open, start and test-read one sensor from the factory.
fn open_sensor(factory: &SensorFactory) -> Result<Box<dyn WeightSensor>> {
    let mut sensor = factory()?;
    sensor.start()?;
    let first = sensor.latest().context("test read failed")?;
    log_info!("[sensor] test read ok: {:?}", first);
    Ok(sensor)
}

/// Owns the active sensor and its mode (real or simulated).
pub struct SensorSupervisor {
    factory: SensorFactory,
    sensor: Arc<Mutex<Box<dyn WeightSensor>>>,
    simulated: bool,
    probe_interval: Duration,
    last_probe: Instant,
    probe: Option<JoinHandle<Result<Box<dyn WeightSensor>>>>,
}

impl SensorSupervisor {
    /// Try the real sensor `policy.attempts` times, then fall back to simulation.
    pub async fn init_with_retry(
        factory: SensorFactory,
        policy: RetryPolicy,
        probe_interval: Duration,
    ) -> Self {
        let (sensor, simulated) = acquire(&factory, policy).await;
        if simulated {
            log_warn!("[mode] running in simulation mode");
        } else {
            log_info!("[mode] running with the real sensor");
        }
        Self {
            factory,
            sensor: Arc::new(Mutex::new(sensor)),
            simulated,
            probe_interval,
            last_probe: Instant::now(),
            probe: None,
        }
    }

    pub fn is_simulated(&self) -> bool {
        self.simulated
    }

    /// Read the paired weights off the poll task.
    pub async fn read(&self, timeout: Duration) -> Result<(f64, f64)> {
        let sensor = Arc::clone(&self.sensor);
        let read = tokio::task::spawn_blocking(move || {
            let mut guard = sensor
                .lock()
                .map_err(|_| anyhow!("sensor lock poisoned"))?;
            guard.latest()
        });

        match tokio::time::timeout(timeout, read).await {
            Ok(joined) => joined.context("sensor read worker join failed")?,
            Err(_) => bail!("sensor read timed out after {}ms", timeout.as_millis()),
        }
    }

    /// Release the current sensor and acquire a fresh one (possibly simulated).
    pub async fn reinitialize(&mut self, policy: RetryPolicy) {
        self.release_current().await;
        let (sensor, simulated) = acquire(&self.factory, policy).await;
        self.replace(sensor, simulated);
    }

    /// While simulated, start a background probe every `probe_interval` and
    /// switch to the real sensor once a probe succeeds. Never blocks.
    pub async fn poll_recovery(&mut self) -> bool {
        if !self.simulated {
            return false;
        }

        if let Some(handle) = self.probe.as_ref() {
            if !handle.is_finished() {
                return false;
            }
        }

        if let Some(handle) = self.probe.take() {
            match handle.await {
                Ok(Ok(sensor)) => {
                    log_info!("[sensor] recovery success: switching to real sensor");
                    self.release_current().await;
                    self.replace(sensor, false);
                    return true;
                }
                Ok(Err(err)) => log_warn!("[sensor] recovery failed: {err:#}"),
                Err(err) => log_warn!("[sensor] recovery probe panicked: {err}"),
            }
        }

        if self.last_probe.elapsed() >= self.probe_interval {
            self.last_probe = Instant::now();
            let factory = Arc::clone(&self.factory);
            self.probe = Some(tokio::task::spawn_blocking(move || open_sensor(&factory)));
        }
        false
    }

    /// Stop a real sensor; simulated ones have nothing to release.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.probe.take() {
            handle.abort();
        }
        if !self.simulated {
            self.release_current().await;
            log_info!("[sensor] stopped");
        }
    }

    fn replace(&mut self, sensor: Box<dyn WeightSensor>, simulated: bool) {
        self.sensor = Arc::new(Mutex::new(sensor));
        self.simulated = simulated;
        self.last_probe = Instant::now();
    }

    /// Stop the current sensor without waiting on a read that is still in
    /// flight. A sensor held by a hung read is abandoned; the blocked worker
    /// drops it when the read finally returns.
    async fn release_current(&self) {
        let sensor = Arc::clone(&self.sensor);
        let release = tokio::task::spawn_blocking(move || match sensor.try_lock() {
            Ok(mut guard) => {
                guard.stop();
                true
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                poisoned.into_inner().stop();
                true
            }
            Err(TryLockError::WouldBlock) => false,
        });

        match tokio::time::timeout(RELEASE_TIMEOUT, release).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => log_warn!("[sensor] busy with a stuck read; abandoning it"),
            Ok(Err(err)) => log_warn!("[sensor] release worker failed: {err}"),
            Err(_) => log_warn!(
                "[sensor] stop() did not return within {}ms; abandoning it",
                RELEASE_TIMEOUT.as_millis()
            ),
        }
    }
}

async fn acquire(factory: &SensorFactory, policy: RetryPolicy) -> (Box<dyn WeightSensor>, bool) {
    for attempt in 1..=policy.attempts {
        let factory = Arc::clone(factory);
        match tokio::task::spawn_blocking(move || open_sensor(&factory)).await {
            Ok(Ok(sensor)) => return (sensor, false),
            Ok(Err(err)) => {
                log_warn!("[sensor] init attempt {attempt}/{} failed: {err:#}", policy.attempts)
            }
            Err(err) => log_warn!("[sensor] init attempt {attempt} panicked: {err}"),
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }
    log_warn!("[sensor] all init attempts failed -> simulation mode");
    (Box::new(SimulatedSensor::default()), true)
}
