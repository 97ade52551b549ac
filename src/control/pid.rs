// src/control/pid.rs
use kiln_shared::config::PidConfig;
use kiln_shared::{PidState, PidStats};
use std::time::Instant;

/// PID heater controller with a bang-bang band outside `window_degrees`.
#[derive(Debug, Clone)]
pub struct PidController {
    state: PidState,
    stats: PidStats,
}

impl PidController {
    pub fn new(config: &PidConfig) -> Self {
        Self::from_state(PidState {
            kp: config.kp,
            ki: config.ki,
            kd: config.kd,
            integral: 0.0,
            previous_error: None,
            last_sample_time: None,
            window_degrees: config.control_window,
        })
    }

    /// Rebuild from a persisted state. Timing starts over.
    pub fn from_state(mut state: PidState) -> Self {
        state.last_sample_time = None;
        Self {
            state,
            stats: PidStats::default(),
        }
    }

    pub fn state(&self) -> &PidState {
        &self.state
    }

    pub fn stats(&self) -> &PidStats {
        &self.stats
    }

    /// Bound on the integral so the I term alone cannot exceed full drive.
    fn integral_limit(&self) -> f64 {
        if self.state.ki > 0.0 {
            1.0 / self.state.ki
        } else {
            f64::INFINITY
        }
    }

    /// Heater drive in `[0, 1]` for the given setpoint and measurement.
    pub fn compute(&mut self, setpoint: f64, measured: f64, now: Instant) -> f64 {
        let error = setpoint - measured;
        let dt = self
            .state
            .last_sample_time
            .map(|prev| now.saturating_duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);

        let PidState { kp, ki, kd, .. } = self.state;
        let in_window = error.abs() <= self.state.window_degrees;
        let (derivative, output) = if !error.is_finite() {
            (0.0, 0.0)
        } else if !in_window {
            // Integral frozen out here.
            (0.0, if error > 0.0 { 1.0 } else { 0.0 })
        } else {
            if dt > 0.0 {
                let limit = self.integral_limit();
                self.state.integral = (self.state.integral + error * dt).clamp(-limit, limit);
            }
            let derivative = match self.state.previous_error {
                Some(prev) if dt > 0.0 => (error - prev) / dt,
                _ => 0.0,
            };
            let raw = kp * error + ki * self.state.integral + kd * derivative;
            (derivative, raw.clamp(0.0, 1.0))
        };

        self.state.previous_error = error.is_finite().then_some(error);
        self.state.last_sample_time = Some(now);
        self.stats = PidStats {
            setpoint,
            measured,
            error,
            p: kp * error,
            i: ki * self.state.integral,
            d: kd * derivative,
            output,
            in_window,
        };
        tracing::debug!(
            "pid: setpoint={:.2} measured={:.2} err={:.2} p={:.3} i={:.3} d={:.3} out={:.3}",
            setpoint,
            measured,
            error,
            self.stats.p,
            self.stats.i,
            self.stats.d,
            output
        );
        output
    }

    /// Zero the integral and forget the previous error.
    pub fn reset(&mut self) {
        self.state.integral = 0.0;
        self.state.previous_error = None;
        self.state.last_sample_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> PidConfig {
        PidConfig {
            kp: 0.1,
            ki: 0.01,
            kd: 1.0,
            control_window: 10.0,
        }
    }

    #[test]
    fn bang_bang_outside_window() {
        let mut pid = PidController::new(&config());
        let now = Instant::now();
        assert_eq!(pid.compute(200.0, 100.0, now), 1.0);
        assert_eq!(pid.compute(100.0, 200.0, now + Duration::from_secs(1)), 0.0);
        assert_eq!(pid.state().integral, 0.0);
        assert!(!pid.stats().in_window);
    }

    #[test]
    fn at_setpoint_drive_is_zero() {
        let mut pid = PidController::new(&config());
        assert_eq!(pid.compute(70.0, 70.0, Instant::now()), 0.0);
    }

    #[test]
    fn first_sample_has_no_integral_or_derivative() {
        let mut pid = PidController::new(&config());
        let out = pid.compute(105.0, 100.0, Instant::now());
        assert!((out - 0.5).abs() < 1e-9);
        assert_eq!(pid.state().integral, 0.0);
        assert_eq!(pid.state().previous_error, Some(5.0));
    }

    #[test]
    fn integrates_and_differentiates_over_dt() {
        let mut pid = PidController::new(&config());
        let t0 = Instant::now();
        pid.compute(105.0, 100.0, t0);
        let out = pid.compute(105.0, 102.0, t0 + Duration::from_secs(2));
        // error 3, integral 6, derivative -1
        assert!((pid.state().integral - 6.0).abs() < 1e-9);
        let expected: f64 = 0.1 * 3.0 + 0.01 * 6.0 + 1.0 * -1.0;
        assert_eq!(out, expected.clamp(0.0, 1.0));
        assert_eq!(out, 0.0);
    }

    #[test]
    fn integral_is_bounded() {
        let mut pid = PidController::new(&PidConfig { kp: 0.0, kd: 0.0, ..config() });
        let mut now = Instant::now();
        for _ in 0..1000 {
            pid.compute(110.0, 100.0, now);
            now += Duration::from_secs(60);
        }
        assert!(pid.state().integral <= 100.0 + 1e-9);
        assert_eq!(pid.compute(110.0, 100.0, now), 1.0);
    }

    #[test]
    fn output_stays_in_unit_range() {
        let mut pid = PidController::new(&config());
        let mut now = Instant::now();
        for step in 0..200 {
            let measured = 50.0 + (step as f64 * 1.7) % 100.0;
            let out = pid.compute(100.0, measured, now);
            assert!((0.0..=1.0).contains(&out));
            if (100.0 - measured).abs() > 10.0 {
                assert!(out == 0.0 || out == 1.0);
            }
            now += Duration::from_millis(700);
        }
    }

    #[test]
    fn nan_measurement_turns_heater_off() {
        let mut pid = PidController::new(&config());
        assert_eq!(pid.compute(100.0, f64::NAN, Instant::now()), 0.0);
        assert_eq!(pid.state().previous_error, None);
    }

    #[test]
    fn reset_clears_memory() {
        let mut pid = PidController::new(&config());
        let t0 = Instant::now();
        pid.compute(105.0, 100.0, t0);
        pid.compute(105.0, 100.0, t0 + Duration::from_secs(5));
        pid.reset();
        assert_eq!(pid.state().integral, 0.0);
        assert_eq!(pid.state().previous_error, None);
        assert_eq!(pid.state().kp, 0.1);
    }
}
