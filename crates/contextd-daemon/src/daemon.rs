//! Daemon runtime: bind, accept, dispatch, shut down.
//!
//! [`serve`] owns the accept loop. Each accepted connection is numbered
//! from a single counter shared by both planes and handed to its connection
//! task; the broker task consumes everything they produce. SIGTERM or
//! SIGINT stops accepting, removes the socket files, and returns.

use contextd_core::config::BrokerConfig;
use contextd_core::registry::SessionId;
use contextd_core::store::StoreError;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::broker::Broker;
use crate::connection::{run_provider, run_subscriber};
use crate::protocol::error::ProtocolError;
use crate::protocol::socket_manager::{SocketManager, SocketManagerConfig, SocketType};

/// Failure to bring the daemon up or tear it down.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Socket setup or cleanup failed.
    #[error("socket setup failed: {0}")]
    Socket(#[from] ProtocolError),

    /// Rule installation failed at startup.
    #[error("rule installation failed: {0}")]
    Rules(#[from] StoreError),
}

/// Runs the broker until SIGTERM or SIGINT.
///
/// # Errors
///
/// Fails when the sockets cannot be bound, the signal handlers cannot be
/// registered, the configured rules cannot be installed, or the socket
/// files cannot be removed on the way out.
pub async fn serve(config: BrokerConfig) -> Result<(), DaemonError> {
    let manager = SocketManager::bind(
        SocketManagerConfig::new(
            config.daemon.provider_socket.clone(),
            config.daemon.subscriber_socket.clone(),
        )
        .with_max_connections(config.daemon.max_connections),
    )?;

    let (broker, handle) = Broker::new(&config)?;
    tokio::spawn(broker.run());

    let mut sigterm = signal(SignalKind::terminate()).map_err(ProtocolError::Io)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(ProtocolError::Io)?;

    let queue_capacity = config.daemon.session_queue_capacity;
    let mut next_conn: SessionId = 1;

    info!("contextd accepting connections");
    loop {
        tokio::select! {
            accepted = manager.accept() => {
                match accepted {
                    Ok((stream, permit, socket_type)) => {
                        let conn = next_conn;
                        next_conn += 1;
                        let handle = handle.clone();
                        match socket_type {
                            SocketType::Provider => {
                                tokio::spawn(run_provider(
                                    stream, permit, conn, handle, queue_capacity,
                                ));
                            },
                            SocketType::Subscriber => {
                                tokio::spawn(run_subscriber(
                                    stream, permit, conn, handle, queue_capacity,
                                ));
                            },
                        }
                    },
                    Err(err) => {
                        warn!(%err, "accept failed");
                    },
                }
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("SIGINT received; shutting down");
                break;
            }
        }
    }

    manager.cleanup()?;
    Ok(())
}
