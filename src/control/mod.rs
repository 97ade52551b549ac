// src/control/mod.rs - heater decision and schedule-clock policy
pub mod pid;
pub mod policy;

pub use pid::PidController;
pub use policy::{SchedulePolicy, ScheduleStep};
