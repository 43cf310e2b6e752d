use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use vmusage_core::{
    host::{CommandRecordSource, SysinfoIdentity},
    init_observability,
    writer::create_log_dir,
    CompactionService, Config, FatalSignal, ScheduledTask, Scheduler, UsageService,
};

mod shutdown;

use shutdown::{shutdown_signal, ShutdownManager};

#[derive(Parser)]
#[command(name = "vmusaged")]
#[command(about = "Per-VM usage telemetry daemon", long_about = None)]
struct Args {
    /// Config file (defaults to $VMUSAGE_CONFIG, then /etc/vmusage/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    // Initialize observability FIRST
    init_observability(&config.log_level, config.metrics_port)
        .map_err(|e| anyhow!("initializing observability: {}", e))?;

    let dir = config.usage_log_directory.clone();
    info!(dir = %dir.display(), plan = ?config.tick_plan(), "vmusage daemon starting");

    create_log_dir(&dir).await.context("creating usage log directory")?;

    let (fatal, mut fatal_rx) = FatalSignal::channel();
    let mut signal = shutdown_signal();

    let identity =
        Arc::new(SysinfoIdentity::new(config.sysinfo_command.clone(), config.command_timeout()));
    let source = Arc::new(CommandRecordSource::new(
        config.collector_command.clone(),
        config.collector_args.clone(),
        config.command_timeout(),
    ));
    let usage = UsageService::new(dir.clone(), source, identity, fatal.clone());
    let compaction = CompactionService::new(dir, fatal);

    // Startup tasks should see the host identity.
    tokio::select! {
        _ = usage.ready() => {}
        Some(err) = fatal_rx.recv() => exit_fatal(err),
        _ = signal.recv() => {
            info!("vmusage daemon stopped before start");
            return Ok(());
        }
    }

    let mut compaction_task =
        ScheduledTask::new("compaction", Arc::new(compaction.clone())).at_startup().write_only();
    if let Some(seconds) = config.rotate_interval_seconds {
        compaction_task = compaction_task.every_seconds(seconds);
    }

    let mut scheduler = Scheduler::new(config.tick_plan());
    scheduler
        .register(ScheduledTask::new("usage", Arc::new(usage.clone())).at_startup())
        .register(compaction_task);

    let (stop_tx, stop_rx) = broadcast::channel(1);
    let scheduler = tokio::spawn(scheduler.run(stop_rx));
    info!("vmusage daemon ready");

    tokio::select! {
        _ = signal.recv() => {}
        Some(err) = fatal_rx.recv() => exit_fatal(err),
    }

    ShutdownManager::new(stop_tx, scheduler, usage, compaction).shutdown().await;

    // A cycle that was draining during shutdown may still have failed.
    if let Ok(err) = fatal_rx.try_recv() {
        exit_fatal(err);
    }

    info!("vmusage daemon shutting down");
    Ok(())
}

/// Exit non-zero so the service manager restarts us.
fn exit_fatal(err: vmusage_core::UsageError) -> ! {
    error!(error = %err, "unrecoverable error; exiting");
    std::process::exit(1);
}
