mod config;
mod executor;
mod metrics;
mod worker;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use common::{RenderQueue, WorkerStatus};
use tokio::sync::watch;

use config::Config;
use executor::CommandExecutor;
use metrics::MetricsCollector;
use worker::{HostIdentity, LoopSettings, RenderWorker};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker config file (.yaml, .yml or .toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Root of the shared queue directory
    #[arg(short, long, env = common::DATABASE_ENV)]
    database: Option<PathBuf>,
    /// Display name to register under
    #[arg(short, long)]
    name: Option<String>,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "RQ_LOG")]
    log_level: Option<String>,
    /// Register or resume as Disabled instead of Idle
    #[arg(long)]
    disabled: bool,
    /// Disable the worker after its next task
    #[arg(long)]
    stop_after_task: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::discover(args.config.as_deref())?;
    if let Some(database) = args.database {
        config.worker.database = Some(database);
    }
    if let Some(name) = args.name {
        config.worker.name = Some(name);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.disabled {
        config.worker.start_enabled = false;
    }
    if args.stop_after_task {
        config.worker.stop_after_task = true;
    }

    let database = config.database();
    let rq = RenderQueue::open(&database)
        .with_context(|| format!("Failed to open render queue at {}", database.display()))?
        .with_policy(config.scheduler.selection);

    setup_logging(&config, &database)?;
    log::info!("Starting rq-worker on {}", database.display());

    let host = host_identity();
    let state_file = config.state_file(&database, &host.hostname);
    let registered = worker::resolve_worker(&rq, &config, &host, &state_file)?;
    log::info!(
        "Worker {} ({}) is {}, selection policy {:?}",
        registered.id,
        registered.name,
        registered.status,
        rq.policy()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, stopping after the current task is requeued");
            let _ = shutdown_tx.send(true);
        }
    });

    let metrics = Arc::new(MetricsCollector::new());
    let mut render_worker = RenderWorker::new(
        rq.clone(),
        registered.id.clone(),
        CommandExecutor::default(),
        Arc::clone(&metrics),
        LoopSettings::from_config(&config),
        shutdown_rx,
    );
    let result = render_worker.run().await;

    if let Some(path) = &config.metrics.file {
        if let Err(e) = metrics.write_to(path) {
            log::warn!("{:#}", e);
        }
    }
    if let Err(e) = &result {
        log::error!("Worker {} stopped: {:#}", registered.id, e);
        let _ = rq.set_worker_status(&registered.id, WorkerStatus::Disabled);
    }
    result
}

fn host_identity() -> HostIdentity {
    let hostname = nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.split('.').next().unwrap_or_default().to_string())
        .unwrap_or_else(|| "localhost".to_string());
    let username = nix::unistd::User::from_uid(nix::unistd::Uid::current())
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_default();
    HostIdentity { hostname, username }
}

fn setup_logging(config: &Config, database: &Path) -> anyhow::Result<()> {
    let logs_dir = database.join(common::LOGS_DIR);
    let log_file = config
        .logging
        .output
        .clone()
        .unwrap_or_else(|| logs_dir.join(common::QUEUE_LOG_FILE));
    let task_log_file = config
        .logging
        .task_output
        .clone()
        .unwrap_or_else(|| logs_dir.join(common::TASK_OUTPUT_LOG_FILE));
    let level: log::LevelFilter = config
        .logging
        .level
        .parse()
        .with_context(|| format!("Invalid log level: {}", config.logging.level))?;

    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level);

    // Queue log: everything except captured render output
    let main_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() != "task_output")
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_file).with_context(|| format!("Failed to open log file {:?}", log_file))?);

    // Task output log: render output only
    let task_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() == "task_output")
        .chain(fern::log_file(&task_log_file).with_context(|| format!("Failed to open log file {:?}", task_log_file))?);

    base_config.chain(main_log).chain(task_log).apply()?;
    Ok(())
}
