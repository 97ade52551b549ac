use async_trait::async_trait;
use kiln_shared::config::SimulationConfig;
use kiln_shared::{ActuatorError, Heater, Sensor, SensorError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Lumped thermal model of an electric kiln.
///
/// The element absorbs the drive's share of `p_heat`, passes heat to the
/// chamber through `r_ho`, and the chamber loses heat to the environment
/// through `r_o_nocool`.
#[derive(Debug, Clone)]
pub struct KilnPhysics {
    pub t_env: f64,
    pub c_heat: f64,
    pub c_oven: f64,
    pub p_heat: f64,
    pub r_o_nocool: f64,
    pub r_ho: f64,
    /// Chamber temperature.
    pub t_oven: f64,
    /// Element temperature.
    pub t_element: f64,
    /// Element-to-chamber flux of the last step, W.
    pub p_ho: f64,
    /// Chamber-to-environment flux of the last step, W.
    pub p_env: f64,
}

impl KilnPhysics {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            t_env: config.t_env,
            c_heat: config.c_heat,
            c_oven: config.c_oven,
            p_heat: config.p_heat,
            r_o_nocool: config.r_o_nocool,
            r_ho: config.r_ho,
            t_oven: config.t_env,
            t_element: config.t_env,
            p_ho: 0.0,
            p_env: 0.0,
        }
    }

    pub fn step(&mut self, drive: f64, dt: f64) {
        let drive = drive.clamp(0.0, 1.0);
        self.t_element += self.p_heat * dt * drive / self.c_heat;

        self.p_ho = (self.t_element - self.t_oven) / self.r_ho;
        self.t_oven += self.p_ho * dt / self.c_oven;
        self.t_element -= self.p_ho * dt / self.c_heat;

        self.p_env = (self.t_oven - self.t_env) / self.r_o_nocool;
        self.t_oven -= self.p_env * dt / self.c_oven;
    }
}

#[derive(Debug)]
struct SimState {
    physics: KilnPhysics,
    drive: f64,
    noise: f64,
    failing_reads: u32,
}

/// Simulated kiln exposing the `Sensor` and `Heater` capabilities.
///
/// Clones share the same kiln.
#[derive(Debug, Clone)]
pub struct SimulatedKiln {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedKiln {
    pub fn new(config: &SimulationConfig) -> Self {
        tracing::info!(
            "Simulated kiln: {:.0}W element, environment at {:.1}",
            config.p_heat,
            config.t_env
        );
        Self {
            inner: Arc::new(Mutex::new(SimState {
                physics: KilnPhysics::new(config),
                drive: 0.0,
                noise: config.noise,
                failing_reads: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance the physics by `dt` seconds at the last commanded drive.
    pub fn advance(&self, dt: f64) {
        let mut sim = self.lock();
        let drive = sim.drive;
        sim.physics.step(drive, dt);
        tracing::trace!(
            "simulation: {:.0}W heater {:.0} -> {:.0}W oven {:.0} -> {:.0}W env",
            sim.physics.p_heat * drive,
            sim.physics.t_element,
            sim.physics.p_ho,
            sim.physics.t_oven,
            sim.physics.p_env
        );
    }

    /// Run the physics in real time on the current runtime.
    pub fn spawn(&self, step: Duration) -> JoinHandle<()> {
        let kiln = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(step);
            loop {
                interval.tick().await;
                kiln.advance(step.as_secs_f64());
            }
        })
    }

    pub fn temperature(&self) -> f64 {
        self.lock().physics.t_oven
    }

    pub fn drive(&self) -> f64 {
        self.lock().drive
    }

    /// Force the chamber (and element) to `t`.
    pub fn set_temperature(&self, t: f64) {
        let mut sim = self.lock();
        sim.physics.t_oven = t;
        sim.physics.t_element = t;
    }

    /// Make the next `count` reads fail as a disconnected thermocouple.
    pub fn inject_read_failures(&self, count: u32) {
        self.lock().failing_reads = count;
    }
}

#[async_trait]
impl Sensor for SimulatedKiln {
    async fn read(&self) -> Result<f64, SensorError> {
        let mut sim = self.lock();
        if sim.failing_reads > 0 {
            sim.failing_reads -= 1;
            return Err(SensorError::NoConnection);
        }
        let noise = sim.noise * (rand::random::<f64>() - 0.5);
        Ok(sim.physics.t_oven + noise)
    }
}

#[async_trait]
impl Heater for SimulatedKiln {
    async fn set_drive(&self, drive: f64) -> Result<(), ActuatorError> {
        if !drive.is_finite() {
            return Err(ActuatorError::Other(format!("invalid drive {}", drive)));
        }
        self.lock().drive = drive.clamp(0.0, 1.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_drive_heats_and_idle_cools() {
        let mut physics = KilnPhysics::new(&SimulationConfig::default());
        let start = physics.t_oven;
        for _ in 0..600 {
            physics.step(1.0, 1.0);
        }
        let hot = physics.t_oven;
        assert!(hot > start + 50.0, "kiln only reached {hot}");
        for _ in 0..600 {
            physics.step(0.0, 1.0);
        }
        assert!(physics.t_oven < hot);
        assert!(physics.t_oven >= physics.t_env);
    }

    #[test]
    fn settles_at_environment_without_drive() {
        let mut physics = KilnPhysics::new(&SimulationConfig::default());
        physics.step(0.0, 10.0);
        assert!((physics.t_oven - physics.t_env).abs() < 1e-9);
    }

    #[tokio::test]
    async fn injected_failures_then_recovery() {
        let kiln = SimulatedKiln::new(&SimulationConfig::default());
        kiln.inject_read_failures(2);
        assert_eq!(kiln.read().await, Err(SensorError::NoConnection));
        assert_eq!(kiln.read().await, Err(SensorError::NoConnection));
        assert_eq!(kiln.read().await, Ok(SimulationConfig::default().t_env));
    }

    #[tokio::test]
    async fn heater_clamps_and_rejects_nan() {
        let kiln = SimulatedKiln::new(&SimulationConfig::default());
        kiln.set_drive(1.7).await.unwrap();
        assert_eq!(kiln.drive(), 1.0);
        assert!(kiln.set_drive(f64::NAN).await.is_err());
        assert_eq!(kiln.drive(), 1.0);
        kiln.advance(5.0);
        assert!(kiln.temperature() > SimulationConfig::default().t_env);
    }
}
