//! HERD - single-host process supervisor
//!
//! Runs the services configured under `pool.<namespace>` as a pool of worker
//! processes, restarting workers that die abnormally, optionally detached as
//! a daemon configured under `daemon.<namespace>`.
//!
//! ## Usage
//!
//! ```bash
//! # Start (the default command)
//! herd --config /etc/herd/herd.yaml
//!
//! # Manage a running daemon
//! herd stop
//! herd restart
//! herd status
//! herd pid
//!
//! # Another namespace, verbose logging
//! herd -v --namespace crawler start
//! ```

mod exec;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::Parser;
use herd_config::{PoolConfig, Settings};
use herd_core::{HerdError, init_logging};
use herd_daemon::{Daemon, command};
use herd_pool::Pool;
use herd_worker::Service;
use tracing::{error, info};

use crate::exec::ExecHandler;

/// HERD process supervisor
///
/// Keeps a set of worker processes alive and answers health report
/// requests about them.
#[derive(Parser, Debug)]
#[command(name = "herd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, default_value = "/etc/herd/herd.yaml")]
    config: PathBuf,

    /// Settings namespace for the `daemon.<NS>` and `pool.<NS>` sections
    #[arg(short, long, default_value = "herd")]
    namespace: String,

    /// Enable verbose logging (increases log level)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory for log files (defaults to ~/.herd/logs/)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// start (default), stop, restart, status or pid
    command: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_dir.clone(), cli.verbose > 0) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    let (settings, pool_config, daemon) = match load(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(error = %e, "cannot load settings");
            eprintln!("Error: {e}");
            if let Some(hint) = e.guidance() {
                eprintln!("Hint: {hint}");
            }
            return ExitCode::from(1);
        }
    };

    let code = command::dispatch(&daemon, cli.command.as_deref(), || {
        run_pool(&settings, &cli.namespace, &pool_config)
    });
    ExitCode::from(code)
}

fn load(cli: &Cli) -> Result<(Settings, PoolConfig, Daemon), HerdError> {
    let settings = Settings::from_file(&cli.config)?;
    let pool_config: PoolConfig = settings
        .section(&pool_namespace(&cli.namespace))?
        .unwrap_or_default();
    let daemon = Daemon::from_settings(&settings, &cli.namespace)?.with_timings(pool_config.timings.clone());
    Ok((settings, pool_config, daemon))
}

fn pool_namespace(namespace: &str) -> String {
    format!("pool.{namespace}")
}

/// The daemon workload: supervise every configured service until stopped.
fn run_pool(settings: &Settings, namespace: &str, config: &PoolConfig) -> anyhow::Result<()> {
    if config.services.is_empty() {
        bail!("no services configured under {}.services", pool_namespace(namespace));
    }

    let mut pool = Pool::from_config(config);
    for service in &config.services {
        pool.attach(
            Service::new(&service.name, ExecHandler::from_config(service)),
            service.instances,
        );
    }

    info!(
        source = ?settings.source(),
        services = config.services.len(),
        reporting = config.report.is_some(),
        "starting pool"
    );
    pool.serve().context("pool failed")?;
    info!("pool exited");
    Ok(())
}
