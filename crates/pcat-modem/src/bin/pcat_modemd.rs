//! pcat modem daemon.
//!
//! Powers the modem, watches for it on USB, runs its dial helper and keeps
//! the radio watchdog ticking until SIGINT.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pcat_common::config::ModemConfig;
use pcat_modem::{Backends, ModemManager};
use tracing_subscriber::EnvFilter;

/// Cellular modem lifecycle daemon.
#[derive(Parser, Debug)]
#[command(name = "pcat-modemd", about = "pcat cellular modem controller")]
struct Cli {
    /// TOML configuration file. A missing file means built-in defaults.
    #[arg(long, default_value = "/etc/pcat-manager.toml")]
    config: PathBuf,

    /// Seconds between status log lines (0 disables them).
    #[arg(long, default_value_t = 30)]
    status_interval: u64,
}

fn load_config(path: &Path) -> anyhow::Result<ModemConfig> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(ModemConfig::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    ModemConfig::from_toml_str(&text)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("invalid config {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    tracing::info!(config = %cli.config.display(), "pcat-modemd starting");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build event loop")?;

    let mut manager = ModemManager::new(config.clone());
    manager
        .start(Backends::system(&config), runtime.handle().clone())
        .context("failed to start modem manager")?;

    runtime.block_on(async {
        let mut status_tick = (cli.status_interval > 0)
            .then(|| tokio::time::interval(Duration::from_secs(cli.status_interval)));
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }
                _ = async {
                    match status_tick.as_mut() {
                        Some(tick) => { tick.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    match serde_json::to_string(&manager.status()) {
                        Ok(json) => tracing::info!(status = %json, "modem status"),
                        Err(e) => tracing::warn!(error = %e, "failed to serialize modem status"),
                    }
                }
            }
        }
    });

    manager.shutdown();
    settle(&runtime, SHUTDOWN_GRACE);
    tracing::info!("pcat-modemd stopped");
    Ok(())
}

/// Time given to the event loop after shutdown to kill and reap the helper.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Drive the event loop for `grace` so pending tasks can finish.
fn settle(runtime: &tokio::runtime::Runtime, grace: Duration) {
    runtime.block_on(async move { tokio::time::sleep(grace).await });
}
