//! # parley
//!
//! Signaling relay binary. Loads settings, installs logging and metrics,
//! then serves until Ctrl-C or SIGTERM.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::logging::{LogFormat, init_subscriber};
use parley_server::config::ServerConfig;
use parley_server::server::ParleyServer;
use parley_settings::ParleySettings;
use tracing::{info, warn};

/// Parley WebRTC signaling relay.
#[derive(Parser, Debug)]
#[command(name = "parley", about = "WebRTC call-signaling relay", version)]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file. Defaults to `~/.parley/settings.json`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `parley_signaling=debug`.
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format: `compact` or `json`.
    #[arg(long, value_parser = parse_format)]
    log_format: Option<LogFormat>,
}

fn parse_format(value: &str) -> std::result::Result<LogFormat, String> {
    LogFormat::parse(value).ok_or_else(|| format!("unknown log format `{value}`"))
}

impl Cli {
    /// CLI flags win over the settings file and environment.
    fn apply(&self, settings: &mut ParleySettings) {
        if let Some(ref host) = self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(ref level) = self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

fn load(cli: &Cli) -> Result<ParleySettings> {
    let mut settings = match cli.config {
        Some(ref path) => parley_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => parley_settings::load_settings().context("Failed to load settings")?,
    };
    cli.apply(&mut settings);
    settings
        .validate()
        .context("Invalid command-line override")?;
    Ok(settings)
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = {
        let _bootstrap = parley_core::logging::bootstrap_guard();
        load(&cli)?
    };

    init_subscriber(&settings.logging.level, settings.logging.format);

    let metrics = parley_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let config = ServerConfig::from(&settings);
    let server = ParleyServer::new(config, metrics);
    let (addr, handle) = server.listen().await.context("Failed to start server")?;

    info!(
        addr = %addr,
        version = env!("CARGO_PKG_VERSION"),
        max_connections = server.config().max_connections,
        "parley ready"
    );

    shutdown_signal().await;
    info!("shutdown signal received");

    if !server.graceful_shutdown().await {
        warn!("some connections did not close before the shutdown timeout");
    }
    handle.await.context("Server task panicked")?;
    info!("parley stopped");
    Ok(())
}
