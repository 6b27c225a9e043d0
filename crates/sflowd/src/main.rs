//! sflowd - sFlow export daemon
//!
//! Entry point for the sflowd daemon. Loads the daemon configuration, starts
//! the dispatch core and the configuration server, applies the startup
//! objects and runs until SIGINT/SIGTERM.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sonic_sflowd::config::{SflowdConfig, StartupConfig, DEFAULT_CONFIG_PATH};
use sonic_sflowd::server::{self, ServerHandle};
use sonic_sflowd::{capture, hw};

/// sFlow sampling and export daemon
#[derive(Parser, Debug)]
#[command(name = "sflowd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// Initializes tracing. `RUST_LOG` wins over `log_level`.
fn init_logging(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().with_target(true).json())
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).compact())
            .init();
    }
}

/// Pushes the `[startup]` objects through the configuration surface. A
/// rejected object is logged and skipped.
async fn apply_startup(handle: &ServerHandle, startup: StartupConfig) {
    if let Some(global) = startup.global {
        if let Err(e) = handle.create_global(global).await {
            warn!(error = %e, "Startup SflowGlobal rejected");
        }
    }
    for obj in startup.collectors {
        let ip = obj.ip_addr.clone();
        if let Err(e) = handle.create_collector(obj).await {
            warn!(collector = %ip, error = %e, "Startup SflowCollector rejected");
        }
    }
    for obj in startup.interfaces {
        let intf_ref = obj.intf_ref.clone();
        if let Err(e) = handle.create_intf(obj).await {
            warn!(intf = %intf_ref, error = %e, "Startup SflowIntf rejected");
        }
    }
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("waiting for SIGINT")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    Ok(())
}

async fn run(config: SflowdConfig) -> anyhow::Result<()> {
    let hw = hw::create(config.daemon.hw_plugin);
    let capture =
        capture::create(config.daemon.capture_backend).context("creating capture backend")?;
    info!(hw = hw.name(), capture = capture.name(), "Collaborators selected");

    let (handle, join) = server::spawn(hw, capture, config.queues.clone()).await;
    apply_startup(&handle, config.startup).await;
    info!("sflowd running");

    wait_for_signal().await?;
    info!("Shutdown signal received");

    handle.shutdown().await.context("stopping server")?;
    join.await.context("joining server task")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match SflowdConfig::load_or_default(&args.config).and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sflowd: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level)
        .to_string();
    init_logging(&log_level, args.json_logs);

    info!(config = %args.config.display(), "--- Starting sflowd ---");

    match run(config).await {
        Ok(()) => {
            info!("sflowd exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("sflowd exiting with error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
