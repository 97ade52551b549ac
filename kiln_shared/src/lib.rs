// kiln_shared: shared traits and types for the kiln host and simulator

pub mod clock;
pub mod config;
pub mod error;
pub mod schedule;
pub mod state;

pub use clock::{ManualClock, SystemClock};
pub use config::KilnConfig;
pub use error::{ActuatorError, ProfileError, SensorError, SinkError, StoreError};
pub use schedule::{Schedule, ScheduleError, SchedulePoint};
pub use state::{
    ControlState, Cooldown, Fault, Outcome, PersistedSnapshot, PidState, PidStats, TempScale,
    WatchEvent,
};

// --- Capability traits ---
//
// Everything the control core touches outside its own memory goes through one
// of these. Hardware-backed and simulated kilns are interchangeable.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Instant;

/// Source of raw thermocouple readings.
///
/// Implementations must report failure instead of blocking; the sampler
/// additionally bounds every call with a deadline.
#[async_trait]
pub trait Sensor: Send + Sync {
    async fn read(&self) -> Result<f64, SensorError>;
}

/// Heating element actuator. `drive` is a fraction in `[0, 1]`.
#[async_trait]
pub trait Heater: Send + Sync {
    async fn set_drive(&self, drive: f64) -> Result<(), ActuatorError>;
}

/// Durable slot for the restart snapshot.
pub trait PersistenceStore: Send + Sync {
    fn save(&self, snapshot: &PersistedSnapshot) -> Result<(), StoreError>;
    fn load(&self) -> Option<PersistedSnapshot>;
}

/// Looks up firing schedules by name.
pub trait ProfileSource: Send + Sync {
    fn lookup(&self, name: &str) -> Result<Schedule, ProfileError>;
}

/// In-memory profiles keyed by name.
impl ProfileSource for HashMap<String, Schedule> {
    fn lookup(&self, name: &str) -> Result<Schedule, ProfileError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(name.to_string()))
    }
}

/// Observer of the broadcast stream. Each sink is driven from its own task,
/// so a slow `push` only delays that sink.
#[async_trait]
pub trait StateSink: Send + 'static {
    async fn push(&mut self, event: WatchEvent) -> Result<(), SinkError>;
}

/// Time source. Monotonic time drives tick deltas; wall time stamps snapshots.
pub trait Clock: Send + Sync {
    fn now_monotonic(&self) -> Instant;
    fn now_wallclock(&self) -> chrono::DateTime<chrono::Utc>;
}
