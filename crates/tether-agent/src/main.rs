//! tether agent
//!
//! Dials a tether listener and runs the commands it sends.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_agent::tunnel::{Driver, TlsConnector};
use tether_core::config::{self, AgentConfig};

#[derive(Parser)]
#[command(name = "tether-agent")]
#[command(about = "tether agent - connects to a listener and executes its commands")]
#[command(version)]
struct Args {
    /// Listener to connect to (host:port)
    #[arg(env = config::ENV_TARGET)]
    target: Option<String>,

    /// Give up after this many failed attempts (0 = never)
    #[arg(short, long, env = config::ENV_MAX_RETRIES)]
    max_retries: Option<u32>,

    /// Shared secret, 64 hex characters
    #[arg(long, env = config::ENV_SECRET, hide_env_values = true)]
    secret: Option<String>,

    /// Expected SHA-256 fingerprint of the listener certificate
    #[arg(long, env = config::ENV_FINGERPRINT)]
    fingerprint: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(self, config: &mut AgentConfig) {
        if let Some(target) = self.target {
            config.target = target;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        if self.secret.is_some() {
            config.shared_secret = self.secret;
        }
        if self.fingerprint.is_some() {
            config.fingerprint = self.fingerprint;
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<AgentConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_dir().join("agent.toml");
    if default_path.exists() {
        config::load_config(&default_path)
            .with_context(|| format!("Failed to load config from {:?}", default_path))
    } else {
        Ok(AgentConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("tether agent starting...");

    let mut config = load_config(args.config.as_ref())?;
    config
        .apply_env_overrides(config::process_env)
        .context("Invalid environment override")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if config.fingerprint.is_none() {
        tracing::warn!("No listener fingerprint pinned; any certificate will be accepted");
    }

    let connector = TlsConnector::from_config(&config)?;
    let mut driver = Driver::new(connector, &config)?;

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
            _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
        }
    };

    tokio::select! {
        result = driver.run() => {
            result.context("Agent stopped")?;
        }
        _ = shutdown => {}
    }

    tracing::info!("Agent shutdown complete");
    Ok(())
}
