//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the VoltGuard daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod board;
mod sim;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use voltguard_common::{init_tracing, AppConfig, SupplyProfile};
use voltguard_monitor::{MonitorEvent, PowerMonitor};
use voltguard_persistence::NamespaceStore;
use voltguard_policy::{PolicyCollaborators, PolicyEventKind, PowerPolicy};

use crate::board::{ExitOnRestart, LoggingPlatform};
use crate::sim::{SimulatedAdc, SimulatedSupply, SimulatedTelemetry};

/// Exit status asking the service manager for a fresh process.
pub(crate) const RESTART_EXIT_CODE: i32 = 75;

const TELEMETRY_FRAME_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(author, version, about = "VoltGuard supply protection daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PROFILE", help = "Override the simulated supply profile (steady, brownout)")]
    profile: Option<SupplyProfile>,

    #[arg(long, value_name = "SEED", help = "Override the simulation random seed")]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the sampling and protection engines")]
    Run,
    #[command(about = "Validate the configuration and print the effective settings")]
    CheckConfig,
}

fn load_config(cli: &Cli) -> Result<(AppConfig, PathBuf)> {
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("bin/voltguardd/config/voltguard.toml"));
    candidates.push(PathBuf::from("/etc/voltguard/voltguard.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(profile) = cli.profile {
        config.simulation.profile = profile;
    }
    if let Some(seed) = cli.seed {
        config.simulation.random_seed = seed;
    }
    Ok((config, loaded.source))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (config, source) = load_config(&cli)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("voltguardd", &config.logging)?;
            info!(config_path = %source.display(), "configuration loaded");
            let code = run_daemon(config).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::CheckConfig => {
            let rendered =
                toml::to_string_pretty(&config).context("unable to render configuration")?;
            println!("# loaded from {}\n{}", source.display(), rendered);
        }
    }

    Ok(())
}

/// Run until ctrl-c or a restart request. Returns the process exit status.
async fn run_daemon(config: AppConfig) -> Result<i32> {
    let supply = SimulatedSupply::new(&config.simulation)?;
    info!(
        profile = ?config.simulation.profile,
        seed = config.simulation.random_seed,
        "simulated supply ready"
    );

    let monitor = PowerMonitor::new(
        &config.monitor,
        Box::new(SimulatedAdc::new(supply.clone(), &config.monitor)),
        Some(Box::new(SimulatedTelemetry::new(supply, TELEMETRY_FRAME_PERIOD))),
    )?;

    let store = NamespaceStore::open(config.persistence.directory.clone())
        .with_context(|| format!("unable to open state directory {}", config.persistence.directory.display()))?;
    let (process, mut restarts) = ExitOnRestart::new();
    let platform = Arc::new(LoggingPlatform::new());
    let policy = PowerPolicy::new(
        config.policy.clone(),
        config.runtime.clone(),
        PolicyCollaborators {
            voltage: Arc::new(monitor.clone()),
            platform: platform.clone(),
            process: Arc::new(process),
            store: Some(Arc::new(store)),
        },
    )?;

    spawn_event_logging(&monitor, &policy);

    monitor.start()?;
    // prime the cache so the first policy tick has a reading
    if let Err(err) = monitor.read_voltage_now() {
        warn!(error = %err, "initial voltage read failed");
    }
    if policy.should_auto_start() {
        policy.start()?;
    } else {
        warn!("policy auto start disabled; supply is monitored but not protected");
    }

    info!("daemon running; waiting for termination signal");
    let code = tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("ctrl-c received; shutting down");
            0
        }
        Some(reason) = restarts.recv() => {
            info!(reason = %reason, "restarting process");
            RESTART_EXIT_CODE
        }
    };

    policy.stop();
    monitor.stop();
    let stats = monitor.statistics();
    info!(
        samples = stats.sample_count,
        frames = stats.frame_count,
        checksum_errors = stats.checksum_error_count,
        timeouts = stats.timeout_error_count,
        violations = stats.threshold_violation_count,
        average_voltage = stats.average_voltage,
        fans_on = platform.fans_on(),
        final_state = policy.state_name(),
        "daemon stopped"
    );
    Ok(code)
}

fn spawn_event_logging(monitor: &PowerMonitor, policy: &PowerPolicy) {
    let mut monitor_events = monitor.subscribe();
    tokio::spawn(async move {
        loop {
            match monitor_events.recv().await {
                Ok(MonitorEvent::ThresholdBreach { sample, .. }) => {
                    warn!(voltage = sample.voltage, "supply outside alarm band");
                }
                Ok(event) => debug!(event = event.name(), "monitor event"),
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "monitor event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut policy_events = policy.subscribe();
    tokio::spawn(async move {
        loop {
            match policy_events.recv().await {
                Ok(event) => match event.kind {
                    PolicyEventKind::StateChanged { from, to } => {
                        info!(%from, %to, voltage = event.status.current_voltage, "protection state changed");
                    }
                    PolicyEventKind::DebugTick => {
                        debug!(status = ?event.status, "policy status");
                    }
                    kind => debug!(event = ?kind, "policy event"),
                },
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "policy event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
