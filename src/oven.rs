//! Firing state machine.
//!
//! An [`Oven`] owns one [`ControlState`] and is the only thing that mutates
//! it. In production it runs as a single task ([`Oven::spawn`]) that drains
//! a command queue ahead of each control tick; callers hold a [`KilnHandle`].
//! Tests drive the same methods directly with a manual clock.

use crate::control::{PidController, SchedulePolicy, ScheduleStep};
use crate::error::KilnError;
use crate::sampler::SamplerHandle;
use crate::watcher::Watcher;
use kiln_shared::{
    ActuatorError, Clock, ControlState, Fault, Heater, KilnConfig, Outcome, PersistedSnapshot,
    PersistenceStore, ProfileSource, Schedule,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Requests from a [`KilnHandle`] to the oven task.
#[derive(Debug)]
pub enum OvenCommand {
    Start {
        schedule: Schedule,
        start_at: f64,
        respond_to: oneshot::Sender<Result<(), KilnError>>,
    },
    /// Start a profile looked up through the oven's profile source.
    StartNamed {
        profile: String,
        start_at: f64,
        respond_to: oneshot::Sender<Result<(), KilnError>>,
    },
    Stop {
        respond_to: oneshot::Sender<Result<(), KilnError>>,
    },
    Memo {
        text: String,
    },
}

pub struct Oven {
    config: Arc<KilnConfig>,
    sampler: SamplerHandle,
    heater: Arc<dyn Heater>,
    store: Arc<dyn PersistenceStore>,
    clock: Arc<dyn Clock>,
    watcher: Watcher,
    profiles: Option<Arc<dyn ProfileSource>>,
    pid: PidController,
    policy: SchedulePolicy,
    state: ControlState,
    last_tick: Option<Instant>,
    cooldown_started: Option<Instant>,
    /// Previous tick held the schedule (catch-up or sensor fault).
    was_frozen: bool,
    published: watch::Sender<Arc<ControlState>>,
}

impl Oven {
    pub fn new(
        config: Arc<KilnConfig>,
        sampler: SamplerHandle,
        heater: Arc<dyn Heater>,
        store: Arc<dyn PersistenceStore>,
        clock: Arc<dyn Clock>,
        watcher: Watcher,
    ) -> Self {
        let state = ControlState::idle(config.temp_scale);
        let (published, _) = watch::channel(Arc::new(state.clone()));
        Self {
            pid: PidController::new(&config.pid),
            policy: SchedulePolicy::from_config(&config),
            config,
            sampler,
            heater,
            store,
            clock,
            watcher,
            profiles: None,
            state,
            last_tick: None,
            cooldown_started: None,
            was_frozen: false,
            published,
        }
    }

    pub fn with_profiles(mut self, profiles: Arc<dyn ProfileSource>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    pub(crate) fn config(&self) -> &KilnConfig {
        &self.config
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn store(&self) -> &dyn PersistenceStore {
        self.store.as_ref()
    }

    pub(crate) fn profiles(&self) -> Option<&dyn ProfileSource> {
        self.profiles.as_deref()
    }

    /// Begin a firing at `start_at` seconds into `schedule`.
    pub async fn start(&mut self, schedule: Schedule, start_at: f64) -> Result<(), KilnError> {
        if self.state.is_running() {
            return Err(KilnError::AlreadyRunning);
        }
        if !start_at.is_finite() || start_at < 0.0 {
            return Err(KilnError::InvalidStartAt(start_at));
        }
        let reading = self.sampler.current();
        if let Some(reason) = reading.unusable_reason(self.config.sensor.stale_limit()) {
            return Err(KilnError::SensorUnavailable(reason));
        }

        let now = self.clock.now_monotonic();
        let mut state = ControlState::running(
            schedule,
            start_at,
            self.clock.now_wallclock(),
            self.config.temp_scale,
        );
        state.measured_temperature = reading.value.unwrap_or_default();
        tracing::info!(
            "Starting firing '{}' at {:.0}s of {:.0}s (run {})",
            state.profile.as_deref().unwrap_or_default(),
            start_at,
            state.total_time,
            state.run_id.map(|id| id.to_string()).unwrap_or_default()
        );
        self.state = state;
        self.pid.reset();
        self.last_tick = Some(now);
        self.cooldown_started = None;
        self.was_frozen = false;
        self.watcher.start_run(self.state.profile.clone());
        self.persist();
        self.publish();
        Ok(())
    }

    pub async fn start_named(&mut self, profile: &str, start_at: f64) -> Result<(), KilnError> {
        let Some(profiles) = self.profiles.clone() else {
            return Err(KilnError::Profile(format!("no profile source to look up '{}'", profile)));
        };
        let schedule = profiles.lookup(profile)?;
        self.start(schedule, start_at).await
    }

    /// Abort the current firing, including a firing in cooldown.
    pub async fn stop(&mut self) -> Result<(), KilnError> {
        if !self.state.is_running() {
            return Err(KilnError::NotRunning);
        }
        self.heater_off().await;
        tracing::info!(
            "Firing '{}' aborted at {:.0}s, cost {}{:.2}",
            self.state.profile.as_deref().unwrap_or_default(),
            self.state.virtual_runtime,
            self.config.cost.currency_type,
            self.state.accumulated_cost
        );
        self.end_run(Outcome::Aborted);
        self.persist();
        self.publish();
        Ok(())
    }

    pub fn memo(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!("Memo: {}", text);
        self.watcher.memo(text, self.clock.now_wallclock());
    }

    /// Continue a persisted run from its own `virtual_runtime`.
    pub async fn resume(
        &mut self,
        snapshot: PersistedSnapshot,
        schedule: Schedule,
    ) -> Result<(), KilnError> {
        if self.state.is_running() {
            return Err(KilnError::AlreadyRunning);
        }
        let now = self.clock.now_monotonic();
        let mut state = snapshot.state;
        state.outcome = Outcome::Running;
        state.profile = Some(schedule.name().to_string());
        state.total_time = schedule.duration();
        state.schedule = Some(schedule);
        if state.started_wall_clock.is_none() {
            state.started_wall_clock = Some(self.clock.now_wallclock());
        }
        state.fault = None;
        state.persistence_error = None;
        state.heater_drive = 0.0;

        self.cooldown_started = if state.cooldown.active {
            let elapsed = Duration::try_from_secs_f64(state.cooldown.elapsed).unwrap_or_default();
            Some(now.checked_sub(elapsed).unwrap_or(now))
        } else {
            None
        };
        tracing::info!(
            "Resuming firing '{}' at {:.0}s of {:.0}s, cost so far {}{:.2}",
            state.profile.as_deref().unwrap_or_default(),
            state.virtual_runtime,
            state.total_time,
            self.config.cost.currency_type,
            state.accumulated_cost
        );
        self.state = state;
        self.pid = PidController::from_state(snapshot.pid);
        self.last_tick = Some(now);
        self.was_frozen = false;
        self.watcher.start_run(self.state.profile.clone());
        self.persist();
        self.publish();
        Ok(())
    }

    /// One control tick. Does nothing unless a firing is running.
    pub async fn tick(&mut self) {
        if !self.state.is_running() {
            return;
        }
        let now = self.clock.now_monotonic();
        let dt = self
            .last_tick
            .map(|prev| now.saturating_duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);
        self.last_tick = Some(now);
        self.state.elapsed = self
            .state
            .started_wall_clock
            .and_then(|started| (self.clock.now_wallclock() - started).to_std().ok())
            .map_or(0.0, |d| d.as_secs_f64());

        let reading = self.sampler.current();
        let unusable = reading.unusable_reason(self.config.sensor.stale_limit());
        let measured = match (unusable, reading.value) {
            (None, Some(value)) => value,
            (reason, _) => {
                let reason = reason.unwrap_or_else(|| "no temperature reading".to_string());
                self.sensor_fault(reason).await;
                // The cap still applies without a temperature.
                if self.state.cooldown.active
                    && self.cooldown_elapsed(now) >= self.config.cooldown.max_seconds()
                {
                    self.complete_cooldown(None);
                }
                self.finish_tick();
                return;
            }
        };
        if let Some(Fault::Sensor(_)) = self.state.fault {
            tracing::warn!("Temperature sensor fault cleared, resuming schedule");
            self.state.fault = None;
        }
        self.state.measured_temperature = measured;

        if measured >= self.config.safety.emergency_shutoff_temp {
            self.emergency_shutoff(measured).await;
            return;
        }

        if !self.state.cooldown.active {
            self.advance_schedule(measured, dt, now).await;
        }
        if self.state.cooldown.active {
            self.cooldown_tick(measured, now).await;
        }
        self.finish_tick();
    }

    async fn advance_schedule(&mut self, measured: f64, dt: f64, now: Instant) {
        let Some(schedule) = self.state.schedule.clone() else {
            return;
        };
        let runtime = self.state.virtual_runtime;
        let target = schedule.interpolate(runtime);

        match self.policy.next_step(&schedule, runtime, target, measured, dt) {
            ScheduleStep::Advance(dt) => {
                if self.was_frozen {
                    tracing::debug!("Schedule released at {:.1}s", runtime);
                    self.pid.reset();
                    self.was_frozen = false;
                }
                self.state.virtual_runtime = runtime + dt;
            }
            ScheduleStep::Freeze => {
                if !self.was_frozen {
                    tracing::info!(
                        "Kiln lagging schedule ({:.1} vs {:.1}), holding at {:.1}s",
                        measured,
                        target,
                        runtime
                    );
                }
                self.was_frozen = true;
            }
            ScheduleStep::Skip(to) => {
                tracing::info!(
                    "Warmup overshoot at {:.1}, skipping schedule from {:.1}s to {:.1}s",
                    measured,
                    runtime,
                    to
                );
                self.state.virtual_runtime = to;
                self.pid.reset();
                self.was_frozen = false;
            }
        }

        if self.state.virtual_runtime >= schedule.duration() {
            self.state.virtual_runtime = schedule.duration();
            self.state.cooldown.active = true;
            self.state.cooldown.elapsed = 0.0;
            self.state.cooldown.started_at = Some(self.clock.now_wallclock());
            self.cooldown_started = Some(now);
            tracing::info!(
                "Profile '{}' finished, cooling down until below {:.0}{}",
                schedule.name(),
                self.config.cooldown.stop_temp,
                self.config.temp_scale.symbol()
            );
            return;
        }

        let target = schedule.interpolate(self.state.virtual_runtime);
        self.state.target_temperature = target;
        let drive = self.pid.compute(target, measured, now);
        let applied = self.apply_drive(drive).await;
        self.state.accumulated_cost +=
            applied * self.config.cost.kw_elements * self.config.cost.kwh_rate * dt / 3600.0;
        tracing::debug!(
            "tick: runtime={:.1}s target={:.1} measured={:.1} drive={:.2}",
            self.state.virtual_runtime,
            target,
            measured,
            applied
        );
    }

    async fn cooldown_tick(&mut self, measured: f64, now: Instant) {
        self.state.target_temperature = 0.0;
        self.heater_off().await;
        let elapsed = self.cooldown_elapsed(now);
        if measured < self.config.cooldown.stop_temp {
            tracing::info!("Kiln cooled to {:.1}, firing complete", measured);
            self.complete_cooldown(Some(measured));
        } else if elapsed >= self.config.cooldown.max_seconds() {
            self.complete_cooldown(Some(measured));
        }
    }

    /// Refresh `cooldown.elapsed`, clamped to the cap, and return the raw value.
    fn cooldown_elapsed(&mut self, now: Instant) -> f64 {
        let elapsed = self
            .cooldown_started
            .map_or(0.0, |started| now.saturating_duration_since(started).as_secs_f64());
        self.state.cooldown.elapsed = elapsed.min(self.config.cooldown.max_seconds());
        elapsed
    }

    fn complete_cooldown(&mut self, measured: Option<f64>) {
        let cooled = measured.is_some_and(|m| m < self.config.cooldown.stop_temp);
        if !cooled {
            tracing::warn!(
                "Cooldown cap of {:.0}h reached at {}, firing complete",
                self.config.cooldown.max_hours,
                measured.map_or_else(|| "unknown temperature".to_string(), |m| format!("{:.1}", m))
            );
        }
        tracing::info!(
            "Firing '{}' cost {}{:.2}",
            self.state.profile.as_deref().unwrap_or_default(),
            self.config.cost.currency_type,
            self.state.accumulated_cost
        );
        self.end_run(Outcome::Complete);
    }

    async fn sensor_fault(&mut self, reason: String) {
        if !matches!(self.state.fault, Some(Fault::Sensor(_))) {
            tracing::warn!("Temperature unknown, heater off and schedule held: {}", reason);
        }
        self.state.fault = Some(Fault::Sensor(reason));
        self.was_frozen = true;
        self.heater_off().await;
    }

    async fn emergency_shutoff(&mut self, measured: f64) {
        tracing::error!(
            "Emergency shutoff: {:.1}{} reached the limit of {:.1}{}",
            measured,
            self.config.temp_scale.symbol(),
            self.config.safety.emergency_shutoff_temp,
            self.config.temp_scale.symbol()
        );
        self.heater_off().await;
        self.end_run(Outcome::Error);
        self.persist();
        self.publish();
    }

    /// Command the heater, returning the drive actually in effect.
    ///
    /// A failed command is a heater fault until a later command succeeds. A
    /// sensor fault already in place is kept.
    async fn apply_drive(&mut self, drive: f64) -> f64 {
        let deadline = self.config.safety.heater_deadline();
        let result = match tokio::time::timeout(deadline, self.heater.set_drive(drive)).await {
            Ok(result) => result,
            Err(_) => Err(ActuatorError::Timeout),
        };
        match result {
            Ok(()) => {
                if let Some(Fault::Heater(_)) = self.state.fault {
                    tracing::warn!("Heater fault cleared");
                    self.state.fault = None;
                }
                self.state.heater_drive = drive;
                drive
            }
            Err(e) => {
                match self.state.fault {
                    Some(Fault::Heater(_)) => {}
                    Some(Fault::Sensor(_)) => {
                        tracing::warn!("Heater command failed during sensor fault: {}", e);
                    }
                    None => {
                        tracing::warn!("Heater command failed, assuming off: {}", e);
                    }
                }
                if !matches!(self.state.fault, Some(Fault::Sensor(_))) {
                    self.state.fault = Some(Fault::Heater(e.to_string()));
                }
                self.state.heater_drive = 0.0;
                0.0
            }
        }
    }

    async fn heater_off(&mut self) {
        self.apply_drive(0.0).await;
    }

    fn end_run(&mut self, outcome: Outcome) {
        self.state.outcome = outcome;
        self.state.schedule = None;
        self.state.started_wall_clock = None;
        self.state.heater_drive = 0.0;
        self.state.cooldown.active = false;
        self.last_tick = None;
        self.cooldown_started = None;
        self.was_frozen = false;
        self.pid.reset();
    }

    fn finish_tick(&mut self) {
        self.state.pid = *self.pid.stats();
        self.persist();
        self.publish();
    }

    fn persist(&mut self) {
        let snapshot = PersistedSnapshot {
            saved_at: self.clock.now_wallclock(),
            state: self.state.clone(),
            pid: self.pid.state().clone(),
        };
        match self.store.save(&snapshot) {
            Ok(()) => {
                if self.state.persistence_error.take().is_some() {
                    tracing::info!("State snapshot writes recovered");
                }
            }
            Err(e) => {
                tracing::error!("Failed to persist state snapshot: {}", e);
                self.state.persistence_error = Some(e.to_string());
            }
        }
    }

    fn publish(&mut self) {
        let snapshot = Arc::new(self.state.clone());
        self.published.send_replace(snapshot.clone());
        self.watcher.publish(snapshot);
    }

    async fn handle(&mut self, command: OvenCommand) {
        match command {
            OvenCommand::Start {
                schedule,
                start_at,
                respond_to,
            } => {
                let result = self.start(schedule, start_at).await;
                let _ = respond_to.send(result);
            }
            OvenCommand::StartNamed {
                profile,
                start_at,
                respond_to,
            } => {
                let result = self.start_named(&profile, start_at).await;
                let _ = respond_to.send(result);
            }
            OvenCommand::Stop { respond_to } => {
                let result = self.stop().await;
                let _ = respond_to.send(result);
            }
            OvenCommand::Memo { text } => self.memo(text),
        }
    }

    /// Run until every handle is dropped. Commands are drained ahead of the
    /// next tick. The heater is switched off on the way out.
    pub async fn run(mut self, mut commands: mpsc::Receiver<OvenCommand>) {
        let mut interval = tokio::time::interval(self.config.sensor.tick_period());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = interval.tick() => self.tick().await,
            }
        }
        self.heater_off().await;
        tracing::info!("Kiln controller stopped");
    }

    pub fn spawn(self) -> (KilnHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = KilnHandle {
            commands: tx,
            state: self.published.subscribe(),
            watcher: self.watcher.clone(),
        };
        (handle, tokio::spawn(self.run(rx)))
    }
}

/// Caller side of a spawned [`Oven`]. Cheap to clone.
#[derive(Clone)]
pub struct KilnHandle {
    commands: mpsc::Sender<OvenCommand>,
    state: watch::Receiver<Arc<ControlState>>,
    watcher: Watcher,
}

impl KilnHandle {
    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), KilnError>>) -> OvenCommand,
    ) -> Result<(), KilnError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| KilnError::ControllerGone)?;
        rx.await.map_err(|_| KilnError::ControllerGone)?
    }

    pub async fn start(&self, schedule: Schedule, start_at: f64) -> Result<(), KilnError> {
        self.request(|respond_to| OvenCommand::Start {
            schedule,
            start_at,
            respond_to,
        })
        .await
    }

    pub async fn start_named(
        &self,
        profile: impl Into<String>,
        start_at: f64,
    ) -> Result<(), KilnError> {
        let profile = profile.into();
        self.request(|respond_to| OvenCommand::StartNamed {
            profile,
            start_at,
            respond_to,
        })
        .await
    }

    pub async fn stop(&self) -> Result<(), KilnError> {
        self.request(|respond_to| OvenCommand::Stop { respond_to }).await
    }

    pub async fn memo(&self, text: impl Into<String>) {
        if self.commands.send(OvenCommand::Memo { text: text.into() }).await.is_err() {
            tracing::debug!("Memo dropped, kiln controller is gone");
        }
    }

    /// Most recently published state.
    pub fn get_state(&self) -> Arc<ControlState> {
        self.state.borrow().clone()
    }

    /// Receiver that wakes on every published state.
    pub fn state_updates(&self) -> watch::Receiver<Arc<ControlState>> {
        self.state.clone()
    }

    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }
}
