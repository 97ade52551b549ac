// End-to-end firings against the simulated kiln with a manual clock.
use kiln_rs::kiln_shared::config::SensorConfig;
use kiln_rs::kiln_shared::{
    KilnConfig, ManualClock, Outcome, PersistenceStore, Schedule, WatchEvent,
};
use kiln_rs::{JsonFileStore, Oven, TemperatureSampler, Watcher, recover};
use kiln_simulator::SimulatedKiln;
use std::path::Path;
use std::sync::Arc;

fn test_config() -> KilnConfig {
    let mut config = KilnConfig::default();
    config.sensor = SensorConfig {
        average_samples: 1,
        fault_threshold: 1,
        ..SensorConfig::default()
    };
    config.safety.emergency_shutoff_temp = 999.0;
    config.schedule.kiln_must_catch_up = true;
    config.schedule.catch_up_margin = Some(50.0);
    config
}

fn ramp() -> Schedule {
    Schedule::from_pairs("ramp", &[(0.0, 70.0), (600.0, 200.0), (1200.0, 200.0)]).unwrap()
}

struct Firing {
    oven: Oven,
    sampler: TemperatureSampler,
    kiln: SimulatedKiln,
    clock: Arc<ManualClock>,
}

impl Firing {
    fn new(config: KilnConfig, state_file: &Path, clock: Arc<ManualClock>) -> Self {
        let kiln = SimulatedKiln::new(&config.simulation);
        let (sampler, readings) =
            TemperatureSampler::new(Arc::new(kiln.clone()), clock.clone(), &config.sensor);
        let watcher = Watcher::new(&config.watcher);
        let oven = Oven::new(
            Arc::new(config),
            readings,
            Arc::new(kiln.clone()),
            Arc::new(JsonFileStore::new(state_file)),
            clock.clone(),
            watcher,
        );
        Self {
            oven,
            sampler,
            kiln,
            clock,
        }
    }

    async fn hold_at(&mut self, temperature: f64) {
        self.kiln.set_temperature(temperature);
        self.sampler.sample_once().await;
    }

    async fn step(&mut self, secs: f64) {
        self.clock.advance_secs(secs);
        self.sampler.sample_once().await;
        self.oven.tick().await;
    }
}

#[tokio::test]
async fn test_first_tick_at_setpoint() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let mut firing = Firing::new(test_config(), &state_file, Arc::new(ManualClock::new()));
    firing.hold_at(70.0).await;
    firing.oven.start(ramp(), 0.0).await.unwrap();
    firing.oven.tick().await;

    let state = firing.oven.state();
    assert_eq!(state.target_temperature, 70.0);
    assert!(state.pid.error.abs() < 1e-9);
    assert_eq!(state.heater_drive, 0.0);
}

#[tokio::test]
async fn test_stuck_kiln_waits_at_margin() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let mut firing = Firing::new(test_config(), &state_file, Arc::new(ManualClock::new()));
    firing.hold_at(70.0).await;
    firing.oven.start(ramp(), 0.0).await.unwrap();

    let mut max_runtime: f64 = 0.0;
    for _ in 0..1500 {
        firing.step(1.0).await;
        max_runtime = max_runtime.max(firing.oven.state().virtual_runtime);
    }
    let schedule = ramp();
    let frozen_at = firing.oven.state().virtual_runtime;
    assert_eq!(frozen_at, max_runtime);
    // The schedule only stops once the lag first exceeds the margin.
    assert!(schedule.interpolate(frozen_at) - 70.0 > 50.0);
    assert!(schedule.interpolate(frozen_at - 1.0) - 70.0 <= 50.0);
    assert_eq!(firing.oven.state().outcome, Outcome::Running);
}

#[tokio::test]
async fn test_low_overshoot_jumps_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.schedule.warmup_skip_threshold = 150.0;
    let state_file = dir.path().join("state.json");
    let mut firing = Firing::new(config, &state_file, Arc::new(ManualClock::new()));

    // Target is 90 here.
    let runtime = 600.0 * 20.0 / 130.0;
    firing.hold_at(140.0).await;
    firing.oven.start(ramp(), runtime).await.unwrap();
    firing.oven.tick().await;

    let expected = 600.0 * 70.0 / 130.0;
    assert!((firing.oven.state().virtual_runtime - expected).abs() < 1e-6);
}

#[tokio::test]
async fn test_overheat_is_an_error_on_the_same_tick() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let mut firing = Firing::new(test_config(), &state_file, Arc::new(ManualClock::new()));
    firing.hold_at(70.0).await;
    firing.oven.start(ramp(), 0.0).await.unwrap();
    let (_, mut rx) = firing.oven.watcher().subscribe_channel();

    firing.hold_at(1500.0).await;
    firing.oven.tick().await;

    let state = firing.oven.state();
    assert_eq!(state.outcome, Outcome::Error);
    assert_eq!(state.heater_drive, 0.0);
    assert_eq!(firing.kiln.drive(), 0.0);

    let stored = JsonFileStore::new(&state_file).load().unwrap();
    assert_eq!(stored.state.outcome, Outcome::Error);

    match rx.recv().await.unwrap() {
        WatchEvent::Backlog { log, .. } => assert_eq!(log.len(), 1),
        other => panic!("expected backlog, got {:?}", other),
    }
    match rx.recv().await.unwrap() {
        WatchEvent::State(state) => assert_eq!(state.outcome, Outcome::Error),
        other => panic!("expected state, got {:?}", other),
    }
}

#[tokio::test]
async fn test_restart_resumes_from_persisted_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let clock = Arc::new(ManualClock::new());
    let schedule = ramp();

    let mut first = Firing::new(test_config(), &state_file, clock.clone());
    first.hold_at(70.0).await;
    first.oven.start(schedule.clone(), 0.0).await.unwrap();
    for _ in 0..300 {
        let target = first.oven.state().target_temperature;
        first.kiln.set_temperature(target);
        first.step(1.0).await;
    }
    let runtime = first.oven.state().virtual_runtime;
    let cost = first.oven.state().accumulated_cost;
    let run_id = first.oven.state().run_id;
    assert_eq!(runtime, 300.0);
    drop(first);

    // Power is out for five minutes.
    clock.advance_secs(300.0);

    let mut second = Firing::new(test_config(), &state_file, clock.clone());
    second.hold_at(schedule.interpolate(runtime)).await;
    assert!(recover(&mut second.oven).await.unwrap());
    let state = second.oven.state();
    assert_eq!(state.outcome, Outcome::Running);
    assert_eq!(state.virtual_runtime, 300.0);
    assert!((state.accumulated_cost - cost).abs() < 1e-12);
    assert_eq!(state.run_id, run_id);

    second.step(1.0).await;
    let state = second.oven.state();
    assert_eq!(state.virtual_runtime, 301.0);
    // Wall time since the start includes the outage.
    assert!((state.elapsed - 601.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_restart_ignores_old_or_finished_runs() {
    let dir = tempfile::tempdir().unwrap();
    let state_file = dir.path().join("state.json");
    let clock = Arc::new(ManualClock::new());

    let mut first = Firing::new(test_config(), &state_file, clock.clone());
    first.hold_at(70.0).await;
    first.oven.start(ramp(), 0.0).await.unwrap();
    first.step(1.0).await;
    drop(first);

    clock.advance_secs(3600.0);
    let mut late = Firing::new(test_config(), &state_file, clock.clone());
    assert!(!recover(&mut late.oven).await.unwrap());
    assert_eq!(late.oven.state().outcome, Outcome::Idle);
    // Still there for inspection.
    assert!(state_file.exists());

    late.hold_at(70.0).await;
    late.oven.start(ramp(), 0.0).await.unwrap();
    late.oven.stop().await.unwrap();
    drop(late);

    let mut after_stop = Firing::new(test_config(), &state_file, clock);
    assert!(!recover(&mut after_stop.oven).await.unwrap());
}

#[tokio::test]
async fn test_simulated_firing_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.schedule.catch_up_margin = None;
    config.cooldown.stop_temp = 190.0;
    let state_file = dir.path().join("state.json");
    let mut firing = Firing::new(config, &state_file, Arc::new(ManualClock::new()));
    let schedule =
        Schedule::from_pairs("short", &[(0.0, 65.0), (600.0, 200.0), (900.0, 200.0)]).unwrap();

    firing.sampler.sample_once().await;
    firing.oven.start(schedule, 0.0).await.unwrap();

    let mut hottest: f64 = 0.0;
    let mut saw_cooldown = false;
    for _ in 0..20_000 {
        firing.kiln.advance(1.0);
        firing.step(1.0).await;
        let state = firing.oven.state();
        hottest = hottest.max(state.measured_temperature);
        saw_cooldown |= state.cooldown.active;
        if state.outcome != Outcome::Running {
            break;
        }
    }
    let state = firing.oven.state();
    assert_eq!(state.outcome, Outcome::Complete);
    assert!(saw_cooldown);
    assert!(hottest > 190.0 && hottest < 240.0, "peaked at {hottest}");
    assert!(state.accumulated_cost > 0.0);
}
