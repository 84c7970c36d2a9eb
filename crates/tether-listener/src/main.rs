//! tether listener
//!
//! Accepts TLS connections from agents and hands the operator a console to
//! drive them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tether_core::config::{self, ListenerConfig};
use tether_core::tls;
use tether_listener::console::Console;
use tether_listener::server::{ConnectionHandler, TlsServer};
use tether_listener::ListenerState;

#[derive(Parser)]
#[command(name = "tether-listener")]
#[command(about = "tether listener - accepts agents and drives them from a console")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long, env = config::ENV_PORT)]
    port: Option<u16>,

    /// Interface to bind (overrides config)
    #[arg(short, long, env = config::ENV_INTERFACE)]
    interface: Option<String>,

    /// Require agents to prove the shared secret
    #[arg(long, env = config::ENV_AUTH)]
    auth: bool,

    /// Shared secret, 64 hex characters
    #[arg(long, env = config::ENV_SECRET, hide_env_values = true)]
    secret: Option<String>,

    /// Certificate chain (PEM)
    #[arg(long, env = config::ENV_CERT)]
    cert: Option<PathBuf>,

    /// Private key (PEM)
    #[arg(long, env = config::ENV_KEY)]
    key: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Flags win over the config file and the environment
    fn apply(self, config: &mut ListenerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(interface) = self.interface {
            config.interface = interface;
        }
        if self.auth {
            config.auth_enabled = true;
        }
        if self.secret.is_some() {
            config.shared_secret = self.secret;
        }
        if self.cert.is_some() {
            config.cert_path = self.cert;
        }
        if self.key.is_some() {
            config.key_path = self.key;
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ListenerConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_dir().join("listener.toml");
    if default_path.exists() {
        config::load_config(&default_path)
            .with_context(|| format!("Failed to load config from {:?}", default_path))
    } else {
        tracing::info!("Using default configuration");
        Ok(ListenerConfig::default())
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

    tracing::info!("tether listener starting...");

    // Defaults, file, environment, flags; then validate once
    let mut config = load_config(args.config.as_ref())?;
    config
        .apply_env_overrides(config::process_env)
        .context("Invalid environment override")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let (cert_path, key_path) = match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => (cert.clone(), key.clone()),
        _ => anyhow::bail!("Certificate and key paths are required"),
    };
    let server_config = tls::server_config(&cert_path, &key_path)?;
    tracing::info!(
        "Certificate fingerprint (SHA-256): {}",
        tls::fingerprint_of_pem(&cert_path)?
    );
    if config.auth_enabled {
        tracing::info!("Shared-secret authentication enabled");
    } else {
        tracing::warn!("Shared-secret authentication disabled; any agent can connect");
    }

    let bind_addr = config.bind_address();
    let state = Arc::new(ListenerState::new(config));
    let handler = Arc::new(ConnectionHandler::from_config(
        Arc::clone(state.registry()),
        &state.config,
    )?);

    // Setup signal handlers
    let cancel = state.cancel.clone();
    tokio::spawn(async move {
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
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });

    let server = TlsServer::new(server_config, handler, state.cancel.clone());
    let console = Console::new(Arc::clone(&state));

    let result = tokio::select! {
        result = server.run(&bind_addr) => result,
        result = console.run() => result,
    };

    state.shutdown();
    tracing::info!("Listener shutdown complete");
    result
}
