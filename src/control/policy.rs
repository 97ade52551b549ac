//! Schedule-clock policies: catch-up and warmup-skip.

use kiln_shared::{KilnConfig, Schedule};

/// How the virtual schedule clock moves on one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleStep {
    /// Advance by the wall-clock delta of the tick.
    Advance(f64),
    /// Kiln is lagging; hold the schedule where it is.
    Freeze,
    /// Kiln overshot during warmup; jump forward to this runtime.
    Skip(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulePolicy {
    pub catch_up: bool,
    pub catch_up_margin: f64,
    /// Zero or less disables warmup-skip.
    pub warmup_skip_threshold: f64,
}

impl SchedulePolicy {
    pub fn from_config(config: &KilnConfig) -> Self {
        Self {
            catch_up: config.schedule.kiln_must_catch_up,
            catch_up_margin: config.catch_up_margin(),
            warmup_skip_threshold: config.schedule.warmup_skip_threshold,
        }
    }

    fn in_warmup_overshoot(&self, target: f64, measured: f64) -> bool {
        self.warmup_skip_threshold > 0.0
            && measured < self.warmup_skip_threshold
            && target < self.warmup_skip_threshold
            && measured > target
    }

    /// Decide the schedule move for a tick.
    ///
    /// `target` is the schedule temperature at `runtime`, before this tick.
    /// Warmup-skip is checked first and only ever moves forward; when it finds
    /// nothing to jump to, the catch-up rule applies as usual.
    pub fn next_step(
        &self,
        schedule: &Schedule,
        runtime: f64,
        target: f64,
        measured: f64,
        dt: f64,
    ) -> ScheduleStep {
        if self.in_warmup_overshoot(target, measured) {
            if let Some(to) = schedule.find_time_for_temperature(measured, runtime) {
                if to > runtime {
                    return ScheduleStep::Skip(to);
                }
            }
        }
        if self.catch_up && target - measured > self.catch_up_margin {
            return ScheduleStep::Freeze;
        }
        ScheduleStep::Advance(dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Schedule {
        Schedule::from_pairs("ramp", &[(0.0, 70.0), (600.0, 200.0), (1200.0, 200.0)]).unwrap()
    }

    fn policy() -> SchedulePolicy {
        SchedulePolicy {
            catch_up: true,
            catch_up_margin: 50.0,
            warmup_skip_threshold: 150.0,
        }
    }

    #[test]
    fn advances_when_on_track() {
        let s = ramp();
        assert_eq!(policy().next_step(&s, 0.0, 70.0, 70.0, 1.0), ScheduleStep::Advance(1.0));
        assert_eq!(policy().next_step(&s, 100.0, 120.0, 70.0, 2.5), ScheduleStep::Advance(2.5));
    }

    #[test]
    fn freezes_when_lag_exceeds_margin() {
        let s = ramp();
        let target = s.interpolate(240.0);
        assert!(target - 70.0 > 50.0);
        assert_eq!(policy().next_step(&s, 240.0, target, 70.0, 1.0), ScheduleStep::Freeze);

        let relaxed = SchedulePolicy { catch_up: false, ..policy() };
        assert_eq!(relaxed.next_step(&s, 240.0, target, 70.0, 1.0), ScheduleStep::Advance(1.0));
    }

    #[test]
    fn skips_forward_on_low_overshoot() {
        let s = ramp();
        let runtime = 600.0 * 20.0 / 130.0;
        let target = s.interpolate(runtime);
        assert!((target - 90.0).abs() < 1e-9);
        match policy().next_step(&s, runtime, target, 140.0, 1.0) {
            ScheduleStep::Skip(to) => {
                assert!(to > runtime);
                assert!((s.interpolate(to) - 140.0).abs() < 1e-9);
            }
            other => panic!("expected skip, got {:?}", other),
        }
    }

    #[test]
    fn no_skip_at_or_above_threshold() {
        let s = ramp();
        // Measured above the threshold.
        assert_eq!(
            policy().next_step(&s, 0.0, 70.0, 160.0, 1.0),
            ScheduleStep::Advance(1.0)
        );
        // Disabled.
        let off = SchedulePolicy { warmup_skip_threshold: 0.0, ..policy() };
        assert_eq!(off.next_step(&s, 0.0, 70.0, 140.0, 1.0), ScheduleStep::Advance(1.0));
    }

    #[test]
    fn skip_never_moves_backward() {
        let s = Schedule::from_pairs("hold", &[(0.0, 100.0), (600.0, 100.0), (1200.0, 300.0)])
            .unwrap();
        // On the flat hold, 120 is only reached after 600s.
        let step = policy().next_step(&s, 300.0, 100.0, 120.0, 1.0);
        match step {
            ScheduleStep::Skip(to) => assert!((to - 660.0).abs() < 1e-9),
            other => panic!("expected skip, got {:?}", other),
        }
        for runtime in [0.0, 100.0, 599.0, 650.0] {
            let target = s.interpolate(runtime);
            if let ScheduleStep::Skip(to) = policy().next_step(&s, runtime, target, 130.0, 1.0) {
                assert!(to > runtime);
            }
        }
    }
}
