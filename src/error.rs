use kiln_shared::{ProfileError, ScheduleError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KilnError {
    #[error("a firing is already running")]
    AlreadyRunning,
    #[error("no firing is running")]
    NotRunning,
    #[error("invalid schedule: {0}")]
    InvalidSchedule(#[from] ScheduleError),
    #[error("invalid start offset {0}s")]
    InvalidStartAt(f64),
    #[error("temperature sensor unavailable: {0}")]
    SensorUnavailable(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("kiln controller has shut down")]
    ControllerGone,
}

impl From<ProfileError> for KilnError {
    fn from(err: ProfileError) -> Self {
        match err {
            ProfileError::Invalid(e) => KilnError::InvalidSchedule(e),
            other => KilnError::Profile(other.to_string()),
        }
    }
}
