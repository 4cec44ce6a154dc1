//! Loopback TCP endpoint for the UI bridge

use super::client::serve_client;
use crate::command::CommandExecutor;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("refusing to listen on non-loopback address {0}")]
    NotLoopback(SocketAddr),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts bridge clients until cancelled
pub struct BridgeServer {
    listener: TcpListener,
    executor: CommandExecutor,
    cancel_token: CancellationToken,
}

impl BridgeServer {
    /// Bind the endpoint. Only loopback addresses are accepted.
    pub async fn bind(
        addr: SocketAddr,
        executor: CommandExecutor,
        cancel_token: CancellationToken,
    ) -> Result<Self, BridgeError> {
        if !addr.ip().is_loopback() {
            return Err(BridgeError::NotLoopback(addr));
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })?;

        Ok(Self {
            listener,
            executor,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until the cancellation token fires
    pub async fn run(self) -> Result<(), BridgeError> {
        info!(addr = %self.local_addr()?, "bridge listening");
        let mut next_client = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("bridge shutdown requested");
                    break;
                }
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        next_client += 1;
                        info!(client = next_client, peer = %peer, "bridge client connected");
                        if let Err(e) = stream.set_nodelay(true) {
                            error!(error = %e, "failed to set TCP_NODELAY");
                        }
                        tokio::spawn(serve_client(
                            stream,
                            peer,
                            next_client,
                            self.executor.clone(),
                            self.cancel_token.clone(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept bridge client");
                    }
                },
            }
        }

        Ok(())
    }
}
