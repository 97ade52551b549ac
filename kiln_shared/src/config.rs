//! Kiln configuration shared by the host, the simulator and tests.

use crate::state::TempScale;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KilnConfig {
    #[serde(default)]
    pub temp_scale: TempScale,
    #[serde(default)]
    pub pid: PidConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PidConfig {
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_ki")]
    pub ki: f64,
    #[serde(default = "default_kd")]
    pub kd: f64,
    /// Degrees either side of the setpoint inside which PID applies.
    #[serde(default = "default_control_window")]
    pub control_window: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: default_kp(),
            ki: default_ki(),
            kd: default_kd(),
            control_window: default_control_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SensorConfig {
    /// Control tick period in seconds.
    #[serde(default = "default_time_wait")]
    pub time_wait: f64,
    /// Sampler period in seconds.
    #[serde(default = "default_sample_period")]
    pub sample_period: f64,
    #[serde(default = "default_average_samples")]
    pub average_samples: usize,
    /// Percent of the sorted ring dropped from each end before averaging.
    #[serde(default)]
    pub trim_percent: f64,
    /// Consecutive failed reads before the sampler reports a fault.
    #[serde(default = "default_fault_threshold")]
    pub fault_threshold: u32,
    /// Fraction of failed reads over the last `2 * average_samples` reads
    /// above which the sensor is faulted even between good reads.
    #[serde(default)]
    pub max_error_rate: Option<f64>,
    /// Seconds without a good reading before the value counts as stale.
    #[serde(default = "default_stale_after")]
    pub stale_after: f64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout: f64,
    #[serde(default)]
    pub thermocouple_offset: f64,
    /// `[raw, offset]` pairs sorted by raw temperature. Overrides the flat offset.
    #[serde(default)]
    pub thermocouple_correction: Vec<(f64, f64)>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            time_wait: default_time_wait(),
            sample_period: default_sample_period(),
            average_samples: default_average_samples(),
            trim_percent: 0.0,
            fault_threshold: default_fault_threshold(),
            max_error_rate: None,
            stale_after: default_stale_after(),
            read_timeout: default_read_timeout(),
            thermocouple_offset: 0.0,
            thermocouple_correction: Vec::new(),
        }
    }
}

impl SensorConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(self.time_wait)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sample_period)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout)
    }

    pub fn stale_limit(&self) -> Duration {
        Duration::from_secs_f64(self.stale_after)
    }

    /// Offset to add to a raw reading. Interpolates the correction table when
    /// one is configured, clamping to its end values.
    pub fn offset_for(&self, raw: f64) -> f64 {
        let table = &self.thermocouple_correction;
        let (Some(first), Some(last)) = (table.first(), table.last()) else {
            return self.thermocouple_offset;
        };
        if raw <= first.0 {
            return first.1;
        }
        if raw >= last.0 {
            return last.1;
        }
        let idx = table.partition_point(|&(t, _)| t < raw);
        let (t0, o0) = table[idx - 1];
        let (t1, o1) = table[idx];
        o0 + (o1 - o0) * (raw - t0) / (t1 - t0)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SafetyConfig {
    #[serde(default = "default_emergency_shutoff_temp")]
    pub emergency_shutoff_temp: f64,
    /// Deadline for a single heater command, in seconds.
    #[serde(default = "default_heater_timeout")]
    pub heater_timeout: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            emergency_shutoff_temp: default_emergency_shutoff_temp(),
            heater_timeout: default_heater_timeout(),
        }
    }
}

impl SafetyConfig {
    pub fn heater_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.heater_timeout)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub kiln_must_catch_up: bool,
    /// Lag in degrees that pauses the schedule. Falls back to the PID window.
    #[serde(default)]
    pub catch_up_margin: Option<f64>,
    /// Below this temperature an overshooting kiln jumps the schedule forward.
    /// Zero disables the policy.
    #[serde(default)]
    pub warmup_skip_threshold: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            kiln_must_catch_up: true,
            catch_up_margin: None,
            warmup_skip_threshold: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CooldownConfig {
    #[serde(default = "default_cooldown_stop_temp")]
    pub stop_temp: f64,
    #[serde(default = "default_cooldown_max_hours")]
    pub max_hours: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            stop_temp: default_cooldown_stop_temp(),
            max_hours: default_cooldown_max_hours(),
        }
    }
}

impl CooldownConfig {
    pub fn max_seconds(&self) -> f64 {
        self.max_hours * 3600.0
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CostConfig {
    #[serde(default = "default_kwh_rate")]
    pub kwh_rate: f64,
    /// Element power at full drive, in kilowatts.
    #[serde(default = "default_kw_elements")]
    pub kw_elements: f64,
    #[serde(default = "default_currency_type")]
    pub currency_type: String,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            kwh_rate: default_kwh_rate(),
            kw_elements: default_kw_elements(),
            currency_type: default_currency_type(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestartConfig {
    #[serde(default = "default_true")]
    pub automatic_restarts: bool,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Snapshots older than this are not resumed.
    #[serde(default = "default_window_minutes")]
    pub window_minutes: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            automatic_restarts: true,
            state_file: default_state_file(),
            window_minutes: default_window_minutes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatcherConfig {
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
    /// Queue depth per subscriber before ticks are dropped for it.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: default_backlog_capacity(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Two-body thermal model: heating element and chamber, each with a heat
/// capacity, coupled to each other and the chamber to the environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Environment temperature.
    #[serde(default = "default_t_env")]
    pub t_env: f64,
    /// Heat capacity of the element, J/K.
    #[serde(default = "default_c_heat")]
    pub c_heat: f64,
    /// Heat capacity of the chamber, J/K.
    #[serde(default = "default_c_oven")]
    pub c_oven: f64,
    /// Element power at full drive, W.
    #[serde(default = "default_p_heat")]
    pub p_heat: f64,
    /// Chamber-to-environment thermal resistance, K/W.
    #[serde(default = "default_r_o_nocool")]
    pub r_o_nocool: f64,
    /// Element-to-chamber thermal resistance, K/W.
    #[serde(default = "default_r_ho")]
    pub r_ho: f64,
    /// Peak-to-peak sensor noise in degrees.
    #[serde(default)]
    pub noise: f64,
    /// Physics step in seconds.
    #[serde(default = "default_sim_step")]
    pub step: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            t_env: default_t_env(),
            c_heat: default_c_heat(),
            c_oven: default_c_oven(),
            p_heat: default_p_heat(),
            r_o_nocool: default_r_o_nocool(),
            r_ho: default_r_ho(),
            noise: 0.0,
            step: default_sim_step(),
        }
    }
}

impl KilnConfig {
    pub fn catch_up_margin(&self) -> f64 {
        self.schedule.catch_up_margin.unwrap_or(self.pid.control_window)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        for (name, gain) in [("kp", self.pid.kp), ("ki", self.pid.ki), ("kd", self.pid.kd)] {
            if !gain.is_finite() || gain < 0.0 {
                return invalid(format!("pid.{} must be a finite, non-negative number", name));
            }
        }
        if !(self.pid.control_window > 0.0) {
            return invalid("pid.control_window must be > 0".to_string());
        }
        for (name, secs) in [
            ("sensor.time_wait", self.sensor.time_wait),
            ("sensor.sample_period", self.sensor.sample_period),
            ("sensor.read_timeout", self.sensor.read_timeout),
            ("sensor.stale_after", self.sensor.stale_after),
            ("safety.heater_timeout", self.safety.heater_timeout),
            ("simulation.step", self.simulation.step),
        ] {
            if !secs.is_finite() || secs <= 0.0 {
                return invalid(format!("{} must be > 0 seconds", name));
            }
        }
        if self.sensor.average_samples == 0 {
            return invalid("sensor.average_samples must be at least 1".to_string());
        }
        if !(0.0..50.0).contains(&self.sensor.trim_percent) {
            return invalid("sensor.trim_percent must be in [0, 50)".to_string());
        }
        if self.sensor.fault_threshold == 0 {
            return invalid("sensor.fault_threshold must be at least 1".to_string());
        }
        if let Some(rate) = self.sensor.max_error_rate {
            if !(rate > 0.0 && rate < 1.0) {
                return invalid("sensor.max_error_rate must be in (0, 1)".to_string());
            }
        }
        if self
            .sensor
            .thermocouple_correction
            .windows(2)
            .any(|w| w[1].0 <= w[0].0)
        {
            return invalid(
                "sensor.thermocouple_correction must be sorted by raw temperature".to_string(),
            );
        }
        if !self.safety.emergency_shutoff_temp.is_finite() {
            return invalid("safety.emergency_shutoff_temp must be finite".to_string());
        }
        if let Some(margin) = self.schedule.catch_up_margin {
            if !margin.is_finite() || margin < 0.0 {
                return invalid("schedule.catch_up_margin must be >= 0".to_string());
            }
        }
        if !(self.cooldown.max_hours > 0.0) {
            return invalid("cooldown.max_hours must be > 0".to_string());
        }
        if self.watcher.subscriber_buffer == 0 {
            return invalid("watcher.subscriber_buffer must be at least 1".to_string());
        }
        Ok(())
    }
}

fn default_true() -> bool { true }
fn default_kp() -> f64 { 0.1 }
fn default_ki() -> f64 { 0.0005 }
fn default_kd() -> f64 { 2.0 }
fn default_control_window() -> f64 { 10.0 }
fn default_time_wait() -> f64 { 1.0 }
fn default_sample_period() -> f64 { 0.1 }
fn default_average_samples() -> usize { 10 }
fn default_fault_threshold() -> u32 { 5 }
fn default_stale_after() -> f64 { 5.0 }
fn default_read_timeout() -> f64 { 0.5 }
fn default_emergency_shutoff_temp() -> f64 { 2264.0 }
fn default_heater_timeout() -> f64 { 0.5 }
fn default_cooldown_stop_temp() -> f64 { 200.0 }
fn default_cooldown_max_hours() -> f64 { 48.0 }
fn default_kwh_rate() -> f64 { 0.1319 }
fn default_kw_elements() -> f64 { 9.460 }
fn default_currency_type() -> String { "$".to_string() }
fn default_state_file() -> PathBuf { PathBuf::from("state.json") }
fn default_window_minutes() -> f64 { 15.0 }
fn default_backlog_capacity() -> usize { 500 }
fn default_subscriber_buffer() -> usize { 64 }
fn default_t_env() -> f64 { 65.0 }
fn default_c_heat() -> f64 { 500.0 }
fn default_c_oven() -> f64 { 5000.0 }
fn default_p_heat() -> f64 { 5450.0 }
fn default_r_o_nocool() -> f64 { 0.5 }
fn default_r_ho() -> f64 { 0.1 }
fn default_sim_step() -> f64 { 0.5 }

pub fn load_config(path: &str) -> Result<KilnConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: KilnConfig = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
