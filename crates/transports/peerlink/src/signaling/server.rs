//! WebSocket relay server
//!
//! Binds a TCP listener and spawns one [`handle_connection`] task per
//! accepted socket. All connections share a single [`SignalRelay`](super::relay::SignalRelay).

use super::handler::{handle_connection, SharedState};
use crate::config::RelayConfig;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// WebSocket relay server
pub struct RelayServer {
    config: Arc<RelayConfig>,
    state: Arc<SharedState>,
}

impl RelayServer {
    /// Create a relay server; nothing is bound until [`start`](Self::start)
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let state = Arc::new(SharedState::new(Arc::clone(&config)));
        Ok(Self { config, state })
    }

    /// Get shared state (for external access)
    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Bind the listener and spawn the accept loop
    ///
    /// Binding errors are returned here; the returned handle reports the
    /// actual bound address, which matters when port 0 was requested.
    pub async fn start(self) -> Result<RelayServerHandle> {
        let listener = TcpListener::bind(self.config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!("Signal relay listening on ws://{}", local_addr);

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, state).await {
                                        error!("WebSocket connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept WebSocket connection: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Signal relay received shutdown signal");
                        break;
                    }
                }
            }
            info!("Signal relay accept loop exited");
        });

        Ok(RelayServerHandle {
            local_addr,
            state: self.state,
            shutdown_tx,
            task,
        })
    }
}

/// Handle for controlling a running relay
pub struct RelayServerHandle {
    local_addr: SocketAddr,
    state: Arc<SharedState>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl RelayServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL clients should connect to
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Number of currently admitted peers
    pub fn peer_count(&self) -> usize {
        self.state.relay.lock().len()
    }

    /// Stop accepting connections
    ///
    /// Connections already established keep running until their clients
    /// disconnect.
    pub async fn shutdown(self) {
        info!("Sending shutdown signal to signal relay");
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!("Signal relay accept loop panicked: {}", e);
        }
    }
}
