//! Background temperature sampling.
//!
//! The sampler owns the sensor and a ring of recent readings. After every
//! read it publishes an immutable [`TemperatureReading`]; the control tick
//! picks up whatever was published last without waiting on the sensor.

use kiln_shared::config::SensorConfig;
use kiln_shared::{Clock, Sensor, SensorError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Bounded ring of raw readings.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: VecDeque<f64>,
    capacity: usize,
    trim_percent: f64,
}

impl SampleBuffer {
    pub fn new(capacity: usize, trim_percent: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            trim_percent,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of the ring after chopping `trim_percent` of the sorted values
    /// from each end. With no trim this is the arithmetic mean.
    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        let chop = (sorted.len() as f64 * self.trim_percent / 100.0) as usize;
        if chop > 0 && sorted.len() > 2 * chop {
            sorted.sort_by(f64::total_cmp);
            sorted.truncate(sorted.len() - chop);
            sorted.drain(..chop);
        }
        Some(sorted.iter().sum::<f64>() / sorted.len() as f64)
    }
}

/// Published after every sampling cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemperatureReading {
    /// Corrected average of the ring, or the last one before a fault.
    pub value: Option<f64>,
    pub faulted: bool,
    /// When `value` was last refreshed by a good read.
    pub taken_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Failed fraction of the recent-read window, once the window is full.
    pub error_rate: f64,
}

/// Point-in-time view handed to the control tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerStatus {
    pub value: Option<f64>,
    pub faulted: bool,
    pub age: Option<Duration>,
    pub last_error: Option<String>,
}

impl SamplerStatus {
    /// Why this reading cannot be used for control, if it can't.
    pub fn unusable_reason(&self, stale_after: Duration) -> Option<String> {
        if self.faulted {
            return Some(
                self.last_error
                    .clone()
                    .unwrap_or_else(|| "sensor faulted".to_string()),
            );
        }
        match (self.value, self.age) {
            (None, _) | (_, None) => Some("no temperature reading yet".to_string()),
            (Some(v), _) if !v.is_finite() => Some("non-finite temperature".to_string()),
            (_, Some(age)) if age > stale_after => {
                Some(format!("temperature reading is {:.1}s old", age.as_secs_f64()))
            }
            _ => None,
        }
    }
}

/// Read side of the sampler. Cheap to clone.
#[derive(Clone)]
pub struct SamplerHandle {
    rx: watch::Receiver<Arc<TemperatureReading>>,
    clock: Arc<dyn Clock>,
}

impl SamplerHandle {
    pub fn current(&self) -> SamplerStatus {
        let reading = self.rx.borrow().clone();
        let now = self.clock.now_monotonic();
        SamplerStatus {
            value: reading.value,
            faulted: reading.faulted,
            age: reading.taken_at.map(|t| now.saturating_duration_since(t)),
            last_error: reading.last_error.clone(),
        }
    }
}

pub struct TemperatureSampler {
    sensor: Arc<dyn Sensor>,
    clock: Arc<dyn Clock>,
    config: SensorConfig,
    buffer: SampleBuffer,
    /// Outcome of the most recent reads, `true` for a failure.
    recent: VecDeque<bool>,
    reading: TemperatureReading,
    tx: watch::Sender<Arc<TemperatureReading>>,
}

impl TemperatureSampler {
    pub fn new(
        sensor: Arc<dyn Sensor>,
        clock: Arc<dyn Clock>,
        config: &SensorConfig,
    ) -> (Self, SamplerHandle) {
        let (tx, rx) = watch::channel(Arc::new(TemperatureReading::default()));
        let handle = SamplerHandle {
            rx,
            clock: clock.clone(),
        };
        let sampler = Self {
            sensor,
            clock,
            buffer: SampleBuffer::new(config.average_samples, config.trim_percent),
            recent: VecDeque::with_capacity(2 * config.average_samples.max(1)),
            config: config.clone(),
            reading: TemperatureReading::default(),
            tx,
        };
        (sampler, handle)
    }

    pub fn reading(&self) -> &TemperatureReading {
        &self.reading
    }

    /// One sampling cycle: read, update the ring, publish.
    pub async fn sample_once(&mut self) {
        let deadline = self.config.read_deadline();
        let result = match tokio::time::timeout(deadline, self.sensor.read()).await {
            Ok(result) => result,
            Err(_) => Err(SensorError::Timeout),
        };
        let result = result.and_then(|raw| {
            if raw.is_finite() {
                Ok(raw)
            } else {
                Err(SensorError::Other(format!("non-finite reading {}", raw)))
            }
        });

        let was_faulted = self.reading.faulted;
        let error_rate = self.record_outcome(result.is_err());
        let too_many_errors = self
            .config
            .max_error_rate
            .is_some_and(|limit| error_rate > limit);

        match result {
            Ok(raw) => {
                self.buffer.push(raw);
                let value = self.buffer.average().map(|avg| avg + self.config.offset_for(avg));
                let failures = self.reading.consecutive_failures;
                self.reading = TemperatureReading {
                    value,
                    faulted: too_many_errors,
                    taken_at: Some(self.clock.now_monotonic()),
                    consecutive_failures: 0,
                    last_error: too_many_errors.then(|| error_rate_message(error_rate)),
                    error_rate,
                };
                if was_faulted && !too_many_errors {
                    tracing::info!(
                        "Temperature sensor recovered ({} failed reads in a row before this)",
                        failures
                    );
                }
            }
            Err(e) => {
                self.reading.consecutive_failures += 1;
                self.reading.last_error = Some(e.to_string());
                self.reading.error_rate = error_rate;
                if self.reading.consecutive_failures == self.config.fault_threshold {
                    tracing::warn!(
                        "Temperature sensor faulted after {} consecutive failures: {}",
                        self.reading.consecutive_failures,
                        e
                    );
                    // Stale samples must not leak into the average after recovery.
                    self.buffer.clear();
                } else {
                    tracing::debug!("Temperature read failed: {}", e);
                }
                self.reading.faulted = too_many_errors
                    || self.reading.consecutive_failures >= self.config.fault_threshold;
            }
        }
        if too_many_errors && !was_faulted {
            tracing::warn!("Temperature sensor faulted: {}", error_rate_message(error_rate));
        }
        self.tx.send_replace(Arc::new(self.reading.clone()));
    }

    /// Push one read outcome into the window and return the failed fraction.
    /// Zero until the window has filled.
    fn record_outcome(&mut self, failed: bool) -> f64 {
        let window = 2 * self.config.average_samples.max(1);
        if self.recent.len() == window {
            self.recent.pop_front();
        }
        self.recent.push_back(failed);
        if self.recent.len() < window {
            return 0.0;
        }
        self.recent.iter().filter(|&&failed| failed).count() as f64 / window as f64
    }

    /// Sample at the configured period until every handle is dropped.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.sample_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            "Temperature sampler running every {:.0}ms over {} samples",
            self.config.sample_period * 1000.0,
            self.config.average_samples
        );
        while !self.tx.is_closed() {
            interval.tick().await;
            self.sample_once().await;
        }
        tracing::debug!("Temperature sampler stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

fn error_rate_message(rate: f64) -> String {
    format!("{:.0}% of recent reads failed", rate * 100.0)
}
