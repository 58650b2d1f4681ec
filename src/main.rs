use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use voxkeeper::queue::{FileQueueStore, QueueStore};
use voxkeeper::structured_logger::StructuredLogger;
use voxkeeper::{paths, CoreConfig, OrchestratorBuilder};

const LOG_ENV: &str = "VOXKEEPER_LOG";

#[derive(Parser)]
#[command(name = "voxkeeper")]
#[command(about = "Keeps the local voice-assistant services alive and their outbound calls delivered")]
#[command(version)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Configuration file (defaults to ~/.voxkeeper/config.yaml, then the built-in config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise processes and guard dependencies until interrupted
    Run {
        /// Do not start processes marked `autostart`
        #[arg(long)]
        no_autostart: bool,

        /// Write the daemon log to ~/.voxkeeper/logs/voxkeeper.log instead of stderr
        #[arg(long)]
        log_file: bool,
    },
    /// Validate the configuration and print what it defines
    CheckConfig,
    /// Print requests that were given up on for a dependency
    DeadLetters {
        /// Dependency id, as named in the configuration
        dependency: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_file = matches!(cli.command, Command::Run { log_file: true, .. });
    init_tracing(log_file)?;

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Run { no_autostart, .. } => run(config, !no_autostart).await,
        Command::CheckConfig => {
            print_config(&config);
            Ok(())
        }
        Command::DeadLetters { dependency } => print_dead_letters(&config, &dependency).await,
    }
}

fn init_tracing(to_file: bool) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    if to_file {
        let path = paths::daemon_log_path()?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open daemon log: {}", path.display()))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

fn load_config(explicit: Option<&Path>) -> Result<CoreConfig> {
    match explicit {
        Some(path) => CoreConfig::load(path),
        None => CoreConfig::load_or_default(&paths::default_config_path()?),
    }
}

async fn run(config: CoreConfig, autostart: bool) -> Result<()> {
    let queue_dir = paths::queue_dir()?;
    let logs_dir = paths::logs_dir()?;
    let orchestrator = OrchestratorBuilder::from_config(&config, &queue_dir, Some(&logs_dir))?
        .build()
        .await
        .context("Failed to restore orchestrator state")?;

    let event_log = StructuredLogger::open(&paths::event_log_path()?)?;
    tracing::info!(run_id = event_log.run_id(), path = %event_log.path().display(), "event log opened");
    let events = orchestrator.events();
    let event_task = tokio::spawn(async move { event_log.follow(events).await });

    if autostart {
        for (id, result) in orchestrator.start_autostart().await {
            match result {
                Ok(status) => tracing::info!(process = %id, status = ?status, "started"),
                Err(e) => tracing::error!(process = %id, error = %e, "failed to start"),
            }
        }
    }
    orchestrator.spawn_monitor();

    let snapshot = orchestrator.get_snapshot();
    tracing::info!(
        processes = snapshot.processes.len(),
        dependencies = snapshot.dependencies.len(),
        "voxkeeper running"
    );

    wait_for_shutdown_signal().await?;
    tracing::info!("shutting down");
    orchestrator.shutdown().await;
    drop(orchestrator);

    // Background replays may still hold the event channel open briefly.
    if tokio::time::timeout(Duration::from_secs(1), event_task).await.is_err() {
        tracing::debug!("event log still busy at exit");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}

fn print_config(config: &CoreConfig) {
    let monitor = &config.monitor;
    println!(
        "monitor: every {:?}, at most {} restarts per {:?}, backoff {:?}..{:?}",
        monitor.interval,
        monitor.restart_limit,
        monitor.restart_window,
        monitor.backoff_base,
        monitor.backoff_max
    );
    for (id, process) in &config.processes {
        let command = std::iter::once(process.command.as_str())
            .chain(process.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let found = which::which(&process.command).is_ok();
        println!(
            "process {}: {}{}{}",
            id,
            command,
            if process.autostart { "" } else { " (manual)" },
            if found { "" } else { " [command not found on PATH]" }
        );
    }
    for (id, dependency) in &config.dependencies {
        println!(
            "dependency {}: {} (trips after {} failures, cooldown {:?}, queue {})",
            id,
            dependency.url,
            dependency.breaker.failure_threshold,
            dependency.breaker.reset_timeout,
            dependency.queue.max_size
        );
    }
}

async fn print_dead_letters(config: &CoreConfig, dependency: &str) -> Result<()> {
    if !config.dependencies.contains_key(dependency) {
        anyhow::bail!("Unknown dependency '{}'", dependency);
    }
    let store = FileQueueStore::open(&paths::queue_dir()?, dependency)?;
    let letters = store.dead_letters().await?;
    if letters.is_empty() {
        println!("no dead letters for {}", dependency);
        return Ok(());
    }
    for letter in letters {
        println!("{}", serde_json::to_string(&letter)?);
    }
    Ok(())
}
