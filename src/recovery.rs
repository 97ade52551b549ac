//! Restart recovery: pick up a firing that was running when the process died.

use crate::error::KilnError;
use crate::oven::Oven;
use chrono::{DateTime, Utc};
use kiln_shared::config::RestartConfig;
use kiln_shared::{Outcome, PersistedSnapshot, ProfileSource, Schedule, TempScale};

/// Why recovery left the kiln idle.
#[derive(Debug, Clone, PartialEq)]
pub enum IdleReason {
    Disabled,
    NoSnapshot,
    NotRunning(Outcome),
    TooOld { minutes: f64 },
    /// The snapshot was recorded in a different temperature scale.
    ScaleChanged(TempScale),
    MissingSchedule(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    Resume {
        snapshot: Box<PersistedSnapshot>,
        schedule: Schedule,
    },
    Idle(IdleReason),
}

/// Decide what to do with the stored snapshot. Pure; touches nothing.
pub fn decide(
    config: &RestartConfig,
    temp_scale: TempScale,
    snapshot: Option<PersistedSnapshot>,
    now: DateTime<Utc>,
    profiles: Option<&dyn ProfileSource>,
) -> RecoveryDecision {
    if !config.automatic_restarts {
        return RecoveryDecision::Idle(IdleReason::Disabled);
    }
    let Some(snapshot) = snapshot else {
        return RecoveryDecision::Idle(IdleReason::NoSnapshot);
    };
    if !snapshot.state.outcome.is_running() {
        return RecoveryDecision::Idle(IdleReason::NotRunning(snapshot.state.outcome));
    }
    let minutes = (now - snapshot.saved_at).num_milliseconds().max(0) as f64 / 60_000.0;
    if config.window_minutes > 0.0 && minutes > config.window_minutes {
        return RecoveryDecision::Idle(IdleReason::TooOld { minutes });
    }
    if snapshot.state.temp_scale != temp_scale {
        return RecoveryDecision::Idle(IdleReason::ScaleChanged(snapshot.state.temp_scale));
    }

    let schedule = match (&snapshot.state.schedule, &snapshot.state.profile, profiles) {
        (Some(schedule), _, _) => schedule.clone(),
        (None, Some(name), Some(profiles)) => match profiles.lookup(name) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::warn!("Cannot recover profile '{}': {}", name, e);
                return RecoveryDecision::Idle(IdleReason::MissingSchedule(name.clone()));
            }
        },
        (None, name, _) => {
            let name = name.clone().unwrap_or_default();
            return RecoveryDecision::Idle(IdleReason::MissingSchedule(name));
        }
    };
    RecoveryDecision::Resume {
        snapshot: Box::new(snapshot),
        schedule,
    }
}

/// Load the oven's snapshot and resume it when allowed.
///
/// Returns `true` when a firing was resumed. The stored snapshot is never
/// deleted; an idle start simply overwrites it with the next run.
pub async fn recover(oven: &mut Oven) -> Result<bool, KilnError> {
    let snapshot = oven.store().load();
    let decision = decide(
        &oven.config().restart,
        oven.config().temp_scale,
        snapshot,
        oven.clock().now_wallclock(),
        oven.profiles(),
    );
    match decision {
        RecoveryDecision::Resume { snapshot, schedule } => {
            oven.resume(*snapshot, schedule).await?;
            Ok(true)
        }
        RecoveryDecision::Idle(reason) => {
            match &reason {
                IdleReason::Disabled | IdleReason::NoSnapshot | IdleReason::NotRunning(_) => {
                    tracing::info!("No firing to resume ({:?}), starting idle", reason)
                }
                _ => tracing::warn!("Not resuming stored firing: {:?}", reason),
            }
            Ok(false)
        }
    }
}
