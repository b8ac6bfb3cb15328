#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # rtun
//!
//! Reverse tunnel for services behind NAT.
//!
//! A connector on the customer's network dials out to the bridge and keeps one
//! authenticated, multiplexed session open. The bridge sits behind the public
//! reverse proxy and relays `/t/{customer}/…` requests over that session to
//! the connector's local upstream.
//!
//! ## Subcommands
//!
//! - `rtun bridge`: tunnel listener + HTTP front
//! - `rtun connector`: dial the bridge and relay to the local upstream
//! - `rtun supervise --role <bridge|connector>`: restart the role on crash
//!
//! ## HTTP surface
//!
//! | Method | Path                          | Role      | Description                 |
//! |--------|-------------------------------|-----------|-----------------------------|
//! | GET    | `/health`                     | both      | 200 while ACTIVE, else 503  |
//! | GET    | `/metrics`                    | both      | Text exposition             |
//! | GET    | `/t/{customer}/_tunnel/status`| bridge    | Customer's tunnel status    |
//! | ANY    | `/t/{customer}/{rest}`        | bridge    | Proxied over the tunnel     |

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use rtun::config::{Config, Role};
use rtun::tunnel::{bridge, connector};
use rtun::{AppState, BridgeState};

/// Multiplexed reverse tunnel.
#[derive(Parser)]
#[command(name = "rtun", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cloud bridge.
    Bridge {
        /// Path to TOML or YAML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the on-prem connector.
    Connector {
        /// Path to TOML or YAML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run as supervisor: starts the role and restarts it on crash.
    Supervise {
        /// Path to TOML or YAML config file.
        #[arg(long)]
        config: Option<String>,
        /// Which role to supervise.
        #[arg(long, value_enum)]
        role: Role,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Bridge { config } => run_role(Role::Bridge, config.as_deref()).await,
        Commands::Connector { config } => run_role(Role::Connector, config.as_deref()).await,
        Commands::Supervise { config, role } => run_supervisor_mode(role, config.as_deref()).await,
    };

    if let Err(e) = result {
        error!("{e}");
        eprintln!("rtun: {e}");
        std::process::exit(1);
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn load_config(config_path: Option<&str>) -> Result<Config, BoxError> {
    let config = Config::load(config_path)?;

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    Ok(config)
}

async fn run_supervisor_mode(role: Role, config_path: Option<&str>) -> Result<(), BoxError> {
    let config = load_config(config_path)?;
    info!("rtun supervisor starting");
    rtun::supervisor::run_supervisor(role, config_path, &config.supervisor).await?;
    Ok(())
}

async fn run_role(role: Role, config_path: Option<&str>) -> Result<(), BoxError> {
    let config = load_config(config_path)?;
    config.validate(role)?;

    info!("rtun v{} starting as {}", env!("CARGO_PKG_VERSION"), role.as_str());
    info!("Mode: {}", config.mode);

    let state = AppState::new(Arc::new(config), role);
    match role {
        Role::Bridge => run_bridge(state).await,
        Role::Connector => run_connector(state).await,
    }
}

async fn run_bridge(state: AppState) -> Result<(), BoxError> {
    let bridge_state = BridgeState::from_app(&state)?;
    let cancel = CancellationToken::new();

    let tunnel_listener = TcpListener::bind(&state.config.bridge.tunnel_listen).await?;
    info!("Tunnel listener on {}", state.config.bridge.tunnel_listen);
    let http_listener = TcpListener::bind(&state.config.bridge.http_listen).await?;
    info!("HTTP front on {}", state.config.bridge.http_listen);

    let listener_task = tokio::spawn(bridge::run_tunnel_listener(
        tunnel_listener,
        bridge_state.clone(),
        cancel.clone(),
    ));
    state.accepting.store(true, Ordering::Relaxed);

    let app = bridge::front_router(state.clone(), bridge_state.clone());
    let shutdown = {
        let state = state.clone();
        async move {
            shutdown_signal().await;
            // /health reports draining from here on.
            state.accepting.store(false, Ordering::Relaxed);
        }
    };
    axum::serve(http_listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    // Cleanup
    info!("Shutting down...");
    cancel.cancel();
    let _ = listener_task.await;
    let grace = Duration::from_secs(state.config.bridge.drain_grace_secs);
    bridge_state.registry.drain_all(grace).await;
    info!("Goodbye");
    Ok(())
}

async fn run_connector(state: AppState) -> Result<(), BoxError> {
    let cancel = CancellationToken::new();

    let health_listener = TcpListener::bind(&state.config.connector.health_listen).await?;
    info!("Health endpoint on {}", state.config.connector.health_listen);
    let app = rtun::routes::router(state.clone()).layer(TraceLayer::new_for_http());

    let health_cancel = cancel.clone();
    let health_task = tokio::spawn(async move {
        axum::serve(health_listener, app)
            .with_graceful_shutdown(async move { health_cancel.cancelled().await })
            .await
    });

    let mut connector_task = tokio::spawn(connector::run(state.clone(), cancel.clone()));
    let result = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutting down...");
            cancel.cancel();
            (&mut connector_task).await
        }
        result = &mut connector_task => result,
    };

    cancel.cancel();
    health_task.await??;
    result??;
    info!("Goodbye");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
