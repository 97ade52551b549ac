// src/main.rs - kiln host: simulated kiln, control loop, restart recovery
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use kiln_rs::kiln_shared::config::load_config;
use kiln_rs::kiln_shared::{
    KilnConfig, PersistenceStore, ProfileSource, SinkError, StateSink, SystemClock, WatchEvent,
};
use kiln_rs::{JsonFileStore, MemoryStore, Oven, ProfileDirectory, TemperatureSampler, Watcher};
use kiln_simulator::{CsvTraceSink, SimulatedKiln};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Kiln firing controller host
#[derive(Parser, Debug)]
#[command(name = "kiln-host", about = "Runs firing schedules against a simulated kiln.")]
struct Cli {
    /// Path to a TOML config file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of JSON firing profiles
    #[arg(short, long, default_value = "./profiles")]
    profiles: PathBuf,

    /// Keep the restart snapshot in memory instead of the state file
    #[arg(long)]
    no_persist: bool,

    /// Log per-tick control detail
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fire a profile, resuming an interrupted firing first if there is one
    Run {
        profile: String,
        /// Seconds into the profile to start at
        #[arg(long, default_value_t = 0.0)]
        start_at: f64,
        /// Write every broadcast state to this CSV file
        #[arg(long)]
        trace: Option<PathBuf>,
    },
    /// Resume an interrupted firing, if any, and follow it to the end
    Resume {
        #[arg(long)]
        trace: Option<PathBuf>,
    },
    /// List the profiles in the profile directory
    Profiles,
    /// Load and validate the configuration, then exit
    CheckConfig,
}

/// Logs each broadcast state.
struct LogSink {
    scale: &'static str,
}

#[async_trait]
impl StateSink for LogSink {
    async fn push(&mut self, event: WatchEvent) -> Result<(), SinkError> {
        match event {
            WatchEvent::Backlog { profile, log } => {
                tracing::debug!("Backlog for {:?}: {} states", profile, log.len());
            }
            WatchEvent::State(state) => {
                tracing::info!(
                    "{:?} {:.0}/{:.0}s target {:.1}{} measured {:.1}{} drive {:.0}% cost {:.2}{}",
                    state.outcome,
                    state.virtual_runtime,
                    state.total_time,
                    state.target_temperature,
                    self.scale,
                    state.measured_temperature,
                    self.scale,
                    state.heater_drive * 100.0,
                    state.accumulated_cost,
                    if state.cooldown.active { " (cooling)" } else { "" }
                );
            }
            WatchEvent::Memo { text, at } => tracing::info!("Memo at {}: {}", at, text),
        }
        Ok(())
    }
}

fn load(cli: &Cli) -> Result<KilnConfig, BoxError> {
    match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            Ok(load_config(&path.to_string_lossy())?)
        }
        None => {
            tracing::info!("No configuration file given, using defaults");
            Ok(KilnConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    let config = load(&cli)?;
    let profiles = Arc::new(ProfileDirectory::new(&cli.profiles));

    let (start, trace) = match &cli.command {
        Commands::CheckConfig => {
            tracing::info!(
                "Configuration OK: tick {:.1}s, emergency shutoff at {:.0}{}",
                config.sensor.time_wait,
                config.safety.emergency_shutoff_temp,
                config.temp_scale.symbol()
            );
            return Ok(());
        }
        Commands::Profiles => {
            for name in profiles.names()? {
                match profiles.lookup(&name) {
                    Ok(schedule) => println!(
                        "{}\t{} points\t{:.0}s",
                        name,
                        schedule.points().len(),
                        schedule.duration()
                    ),
                    Err(e) => println!("{}\tinvalid: {}", name, e),
                }
            }
            return Ok(());
        }
        Commands::Run {
            profile,
            start_at,
            trace,
        } => (Some((profile.clone(), *start_at)), trace.clone()),
        Commands::Resume { trace } => (None, trace.clone()),
    };

    tracing::info!("Starting kiln host");
    let config = Arc::new(config);
    let clock = Arc::new(SystemClock);
    let kiln = SimulatedKiln::new(&config.simulation);
    let physics = kiln.spawn(Duration::from_secs_f64(config.simulation.step));

    let (sampler, readings) =
        TemperatureSampler::new(Arc::new(kiln.clone()), clock.clone(), &config.sensor);
    let sampler = sampler.spawn();

    let store: Arc<dyn PersistenceStore> = if cli.no_persist {
        Arc::new(MemoryStore::new())
    } else {
        tracing::info!("Restart snapshots in {}", config.restart.state_file.display());
        Arc::new(JsonFileStore::new(&config.restart.state_file))
    };

    let watcher = Watcher::new(&config.watcher);
    watcher.subscribe(LogSink {
        scale: config.temp_scale.symbol(),
    });
    if let Some(path) = trace {
        watcher.subscribe(CsvTraceSink::create(path)?);
    }

    let mut oven = Oven::new(
        config.clone(),
        readings,
        Arc::new(kiln.clone()),
        store,
        clock,
        watcher,
    )
    .with_profiles(profiles);
    let resumed = kiln_rs::recover(&mut oven).await?;
    let (handle, controller) = oven.spawn();

    if let Some((profile, start_at)) = start {
        if resumed {
            tracing::warn!("An interrupted firing was resumed; not starting '{}'", profile);
        } else {
            // Let the sampler fill its ring before the start check.
            let fill = config.sensor.sample_interval() * config.sensor.average_samples as u32;
            tokio::time::sleep(fill).await;
            handle.start_named(profile, start_at).await?;
        }
    }

    if handle.get_state().is_running() {
        let mut updates = handle.state_updates();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::info!("Interrupted, stopping firing");
                    if let Err(e) = handle.stop().await {
                        tracing::warn!("Stop failed: {}", e);
                    }
                    break;
                }
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = updates.borrow_and_update().clone();
                    if state.outcome.is_terminal() {
                        tracing::info!("Firing finished: {:?}", state.outcome);
                        break;
                    }
                }
            }
        }
    } else {
        tracing::info!("Nothing to fire");
    }

    drop(handle);
    controller.await?;
    sampler.abort();
    physics.abort();
    Ok(())
}
