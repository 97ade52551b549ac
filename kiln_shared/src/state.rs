//! Control-loop state shared between the firing state machine, the restart
//! snapshot and the broadcast stream.

use crate::schedule::Schedule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    #[default]
    Idle,
    Running,
    Complete,
    Aborted,
    Error,
}

impl Outcome {
    pub fn is_running(self) -> bool {
        self == Outcome::Running
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Outcome::Complete | Outcome::Aborted | Outcome::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TempScale {
    #[default]
    #[serde(rename = "f", alias = "F")]
    Fahrenheit,
    #[serde(rename = "c", alias = "C")]
    Celsius,
}

impl TempScale {
    pub fn symbol(self) -> &'static str {
        match self {
            TempScale::Fahrenheit => "°F",
            TempScale::Celsius => "°C",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cooldown {
    pub active: bool,
    /// Seconds since the schedule ended.
    pub elapsed: f64,
    pub started_at: Option<DateTime<Utc>>,
}

/// A recoverable capability fault. The heater is held off while one is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Fault {
    Sensor(String),
    Heater(String),
}

/// Terms of the most recent PID evaluation, for observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PidStats {
    pub setpoint: f64,
    pub measured: f64,
    pub error: f64,
    pub p: f64,
    pub i: f64,
    pub d: f64,
    pub output: f64,
    pub in_window: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PidState {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integral: f64,
    pub previous_error: Option<f64>,
    /// Monotonic, so it never survives a restart.
    #[serde(skip)]
    pub last_sample_time: Option<Instant>,
    pub window_degrees: f64,
}

/// One firing run as seen by observers and the restart snapshot.
///
/// `outcome == Running` exactly when `schedule` and `started_wall_clock` are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    pub outcome: Outcome,
    pub run_id: Option<Uuid>,
    pub schedule: Option<Schedule>,
    /// Name of the current or most recent profile; survives the end of a run.
    pub profile: Option<String>,
    pub virtual_runtime: f64,
    pub total_time: f64,
    /// Wall seconds since the run started.
    pub elapsed: f64,
    pub started_wall_clock: Option<DateTime<Utc>>,
    pub target_temperature: f64,
    pub measured_temperature: f64,
    pub heater_drive: f64,
    pub accumulated_cost: f64,
    pub cooldown: Cooldown,
    pub fault: Option<Fault>,
    pub temp_scale: TempScale,
    pub pid: PidStats,
    /// Last snapshot write failure, if the most recent write failed.
    #[serde(default)]
    pub persistence_error: Option<String>,
}

impl ControlState {
    pub fn idle(temp_scale: TempScale) -> Self {
        Self {
            outcome: Outcome::Idle,
            run_id: None,
            schedule: None,
            profile: None,
            virtual_runtime: 0.0,
            total_time: 0.0,
            elapsed: 0.0,
            started_wall_clock: None,
            target_temperature: 0.0,
            measured_temperature: 0.0,
            heater_drive: 0.0,
            accumulated_cost: 0.0,
            cooldown: Cooldown::default(),
            fault: None,
            temp_scale,
            pid: PidStats::default(),
            persistence_error: None,
        }
    }

    pub fn running(
        schedule: Schedule,
        start_at: f64,
        now: DateTime<Utc>,
        temp_scale: TempScale,
    ) -> Self {
        Self {
            outcome: Outcome::Running,
            run_id: Some(Uuid::new_v4()),
            profile: Some(schedule.name().to_string()),
            total_time: schedule.duration(),
            target_temperature: schedule.interpolate(start_at),
            virtual_runtime: start_at,
            started_wall_clock: Some(now),
            schedule: Some(schedule),
            ..Self::idle(temp_scale)
        }
    }

    pub fn is_running(&self) -> bool {
        self.outcome.is_running()
    }

    pub fn faulted(&self) -> bool {
        self.fault.is_some()
    }

    /// Schedule seconds still to go, zero once the profile has ended.
    pub fn time_left(&self) -> f64 {
        (self.total_time - self.virtual_runtime).max(0.0)
    }
}

/// What is written to the restart store after every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub saved_at: DateTime<Utc>,
    pub state: ControlState,
    pub pid: PidState,
}

/// Message on the broadcast stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    /// Delivered once, first, to every new subscriber.
    Backlog {
        profile: Option<String>,
        log: Vec<Arc<ControlState>>,
    },
    State(Arc<ControlState>),
    Memo { text: String, at: DateTime<Utc> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_state_holds_invariant() {
        let schedule = Schedule::from_pairs("s", &[(0.0, 70.0), (60.0, 100.0)]).unwrap();
        let state = ControlState::running(schedule, 30.0, Utc::now(), TempScale::Celsius);
        assert!(state.is_running());
        assert!(state.schedule.is_some() && state.started_wall_clock.is_some());
        assert_eq!(state.target_temperature, 85.0);
        assert_eq!(state.time_left(), 30.0);

        let idle = ControlState::idle(TempScale::Celsius);
        assert!(!idle.is_running());
        assert!(idle.schedule.is_none() && idle.started_wall_clock.is_none());
    }

    #[test]
    fn snapshot_serializes_outcome_and_drops_instants() {
        let pid = PidState {
            kp: 1.0,
            last_sample_time: Some(Instant::now()),
            ..PidState::default()
        };
        let snapshot = PersistedSnapshot {
            saved_at: Utc::now(),
            state: ControlState::idle(TempScale::Fahrenheit),
            pid,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"]["outcome"], "IDLE");
        assert_eq!(json["state"]["temp_scale"], "f");
        assert!(json["pid"].get("last_sample_time").is_none());

        let back: PersistedSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back.pid.last_sample_time, None);
        assert_eq!(back.pid.kp, 1.0);
    }

    #[test]
    fn faults_serialize_with_kind() {
        let json = serde_json::to_value(Fault::Sensor("no connection".into())).unwrap();
        assert_eq!(json["kind"], "sensor");
        assert_eq!(json["detail"], "no connection");
    }
}
