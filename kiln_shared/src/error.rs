use crate::schedule::ScheduleError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("thermocouple not connected")]
    NoConnection,
    #[error("thermocouple shorted to ground")]
    ShortToGround,
    #[error("thermocouple shorted to VCC")]
    ShortToVcc,
    #[error("sensor read timed out")]
    Timeout,
    #[error("sensor error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActuatorError {
    #[error("heater command timed out")]
    Timeout,
    #[error("heater error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile '{0}' not found")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("profile parse error: {0}")]
    Parse(String),
    #[error(transparent)]
    Invalid(#[from] ScheduleError),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,
    #[error("sink write failed: {0}")]
    Write(String),
}
