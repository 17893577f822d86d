//! Shroud Client
//!
//! Listens for local proxy clients and carries their traffic to the relay
//! inside a session disguised as browser TLS:
//! - Reads configuration from a file, inline options or the shadowsocks
//!   plugin environment
//! - Bootstraps sessions over several concurrent connections
//! - Relays each local connection over its own stream

use anyhow::{bail, Context, Result};
use clap::Parser;
use shroud::{
    bootstrap::Bootstrapper,
    config::{decode_uid, ClientConfig, PluginEnv},
    handshake::DisguisedHandshake,
    obfuscation::{compose_client_hello, ClientHelloFields, Ja3Components},
    proxy::SessionManager,
    transport::TcpDialer,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Shroud Client - censorship-resistant transport
#[derive(Parser, Debug)]
#[command(name = "shroud-client")]
#[command(about = "Shroud Client - proxy traffic disguised as browser TLS")]
#[command(version)]
struct Args {
    /// Local address to listen on
    #[arg(short = 'i', long = "local-host")]
    local_host: Option<String>,

    /// Local port to listen on
    #[arg(short = 'l', long = "local-port")]
    local_port: Option<u16>,

    /// Relay host
    #[arg(short = 's', long = "remote-host")]
    remote_host: Option<String>,

    /// Relay port
    #[arg(short = 'p', long = "remote-port")]
    remote_port: Option<u16>,

    /// Configuration file path, or options separated with semicolons
    #[arg(short = 'c', long = "config", env = "SHROUD_CONFIG")]
    config: Option<String>,

    /// Admin UID (base64); connects in admin mode
    #[arg(short = 'a', long = "admin-uid")]
    admin_uid: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(&args.verbosity)
        .init();

    info!("Shroud Client v{}", shroud::VERSION);

    let config = load_config(&args)?;
    let admin_uid = args
        .admin_uid
        .as_deref()
        .map(decode_uid)
        .transpose()
        .context("Invalid admin UID")?;
    config
        .validate_with_admin(admin_uid.is_some())
        .context("Invalid configuration")?;

    if admin_uid.is_some() {
        info!("Admin mode: one connection, session 0");
    }

    log_fingerprint(&config.server_name)?;

    let params = config
        .handshake_params(admin_uid)
        .context("Invalid handshake settings")?;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let bootstrapper = Bootstrapper::new(
        TcpDialer::new(config.connect_timeout()),
        DisguisedHandshake::new(params),
        config.bootstrap_config(admin_uid.is_some()),
    )
    .with_cancel(cancel_rx);
    let manager = Arc::new(SessionManager::new(bootstrapper));

    let local_addr = config.local_addr();
    let listener = TcpListener::bind(&local_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", local_addr))?;
    info!(
        "Listening on {} for proxy clients, relay {} ({} connections, {})",
        local_addr,
        config.remote_addr(),
        config.num_conn,
        config.encryption_method
    );

    // Wait for shutdown signal
    tokio::select! {
        _ = manager.clone().serve(listener) => {
            warn!("Accept loop ended");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    let _ = cancel_tx.send(true);
    manager.shutdown().await;

    Ok(())
}

/// Merge config sources: file or inline options, then plugin environment,
/// then command-line flags
fn load_config(args: &Args) -> Result<ClientConfig> {
    let plugin = PluginEnv::from_env().context("Invalid plugin environment")?;

    let mut config = match (&args.config, &plugin) {
        (Some(arg), _) => ClientConfig::from_arg(arg).context("Failed to load configuration")?,
        (None, Some(env)) if !env.options.is_empty() => {
            ClientConfig::from_inline(&env.options).context("Invalid plugin options")?
        }
        _ => ClientConfig::default(),
    };

    if let Some(env) = &plugin {
        debug!("Running as a shadowsocks plugin");
        config.apply_plugin_env(env);
    }

    if let Some(host) = &args.local_host {
        config.local_host = host.clone();
    }
    if let Some(port) = args.local_port {
        config.local_port = port;
    }
    if let Some(host) = &args.remote_host {
        config.remote_host = host.clone();
    }
    if let Some(port) = args.remote_port {
        config.remote_port = port;
    }

    if config.remote_host.is_empty() {
        bail!("No relay configured; pass -s or set remote_host");
    }
    Ok(config)
}

fn log_fingerprint(server_name: &str) -> Result<()> {
    let hello = compose_client_hello(&ClientHelloFields {
        random: [0u8; 32],
        session_id: [0u8; 32],
        server_name: server_name.to_string(),
        secret: [0u8; 32],
    })
    .context("Invalid server name")?;
    let ja3 = Ja3Components::from_client_hello(&hello).context("Failed to read own hello")?;
    info!("Presenting Firefox 99 handshake (JA3 {})", ja3.ja3_hash());
    debug!("JA3 string: {}", ja3.ja3_string());
    Ok(())
}
