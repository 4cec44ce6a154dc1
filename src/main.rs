use anyhow::Context;
use clap::Parser;
use portmux::bridge::BridgeServer;
use portmux::command::CommandExecutor;
use portmux::config::HostConfig;
use portmux::connection::ConnectionManager;
use portmux::session::SessionStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "portmux", about = "Serial and MQTT connection host for the UI bridge")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Loopback address for the bridge endpoint
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Session record location
    #[arg(long)]
    session_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(session_file) = args.session_file {
        config.session_path = session_file;
    }
    config.validate()?;

    info!(
        listen = %config.listen_addr,
        session = %config.session_path.display(),
        "portmux starting"
    );

    let manager = ConnectionManager::with_default_transports(&config);
    let sessions = Arc::new(SessionStore::new(config.session_path.clone()));
    let executor = CommandExecutor::new(manager.clone(), sessions);

    let shutdown = CancellationToken::new();
    let server = BridgeServer::bind(config.listen_addr, executor, shutdown.clone())
        .await
        .context("failed to start bridge")?;
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down...");

    shutdown.cancel();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "bridge stopped with error"),
        Err(e) => error!(error = %e, "bridge task panicked"),
    }
    manager.shutdown().await;

    info!("portmux stopped");
    Ok(())
}
