//! Relay test harness
//!
//! Boots a [`RelayServer`] on an ephemeral port and builds relay clients and
//! peer sessions against it. Sessions use the in-memory connections from
//! [`peerlink::mock`], so negotiation goes through the real relay while data
//! moves through process-local channels.

#![allow(dead_code)]

use peerlink::mock::{MockNetwork, MockPeerConnection};
use peerlink::peer::PeerConnection;
use peerlink::signaling::Notification;
use peerlink::{
    PeerSession, RelayConfig, RelayServer, RelayServerHandle, SessionConfig, SessionState,
    SignalingClient,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Errors surfaced by harness helpers
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("peerlink error: {0}")]
    Peerlink(#[from] peerlink::Error),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("unexpected: {0}")]
    Unexpected(String),
}

pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

/// Default bound for waits inside tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests (safe to call from every test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,peerlink=debug")
        .with_test_writer()
        .try_init();
}

/// A running relay plus the mock network its sessions share
pub struct RelayHarness {
    handle: Option<RelayServerHandle>,
    network: MockNetwork,
}

impl RelayHarness {
    /// Start a relay on 127.0.0.1 with an OS-assigned port
    pub async fn start() -> HarnessResult<Self> {
        let config = RelayConfig {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let handle = RelayServer::new(config)?.start().await?;
        Ok(Self {
            handle: Some(handle),
            network: MockNetwork::new(),
        })
    }

    fn handle(&self) -> &RelayServerHandle {
        self.handle
            .as_ref()
            .expect("relay handle present until shutdown")
    }

    pub fn url(&self) -> String {
        self.handle().url()
    }

    pub fn network(&self) -> &MockNetwork {
        &self.network
    }

    pub fn peer_count(&self) -> usize {
        self.handle().peer_count()
    }

    /// Session config pointed at this relay, with short test timeouts
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_secs(3),
            channel_open_timeout: Duration::from_secs(3),
            poll_interval: Duration::from_millis(20),
            backpressure_retry_delay: Duration::from_millis(20),
            ..SessionConfig::with_signal_server(self.url())
        }
    }

    /// Bare relay client
    pub async fn client(&self, peer_id: &str) -> HarnessResult<SignalingClient> {
        Ok(SignalingClient::connect(&self.url(), peer_id).await?)
    }

    /// Session over a mock connection
    pub async fn session(&self, peer_id: &str) -> HarnessResult<PeerSession> {
        self.session_with(self.session_config(), peer_id).await
    }

    pub async fn session_with(
        &self,
        config: SessionConfig,
        peer_id: &str,
    ) -> HarnessResult<PeerSession> {
        let (session, _) = self.session_with_connection(config, peer_id).await?;
        Ok(session)
    }

    /// Session plus a handle on its mock connection
    pub async fn session_with_connection(
        &self,
        config: SessionConfig,
        peer_id: &str,
    ) -> HarnessResult<(PeerSession, Arc<MockPeerConnection>)> {
        let signaling = SignalingClient::connect(&self.url(), peer_id).await?;
        let mock = self.network.create_connection();
        let connection: Arc<dyn PeerConnection> = mock.clone();
        let session = PeerSession::with_connection(config, signaling, connection)?;
        Ok((session, mock))
    }

    /// Wait until the relay has exactly `count` live peers
    pub async fn wait_for_peer_count(&self, count: usize) -> HarnessResult<()> {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.peer_count() != count {
            if tokio::time::Instant::now() >= deadline {
                return Err(HarnessError::Timeout(format!(
                    "{} live peers (have {})",
                    count,
                    self.peer_count()
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }

    pub async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await;
        }
    }
}

/// Receive notifications until one matches `predicate`
pub async fn expect_notification<F>(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    what: &str,
    mut predicate: F,
) -> HarnessResult<Notification>
where
    F: FnMut(&Notification) -> bool,
{
    let wait = async {
        while let Some(note) = rx.recv().await {
            if predicate(&note) {
                return Ok(note);
            }
        }
        Err(HarnessError::Unexpected(format!(
            "notification stream ended before {}",
            what
        )))
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .map_err(|_| HarnessError::Timeout(what.to_string()))?
}

/// Assert that no matching notification arrives within `window`
pub async fn expect_no_notification<F>(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    window: Duration,
    mut predicate: F,
) -> HarnessResult<()>
where
    F: FnMut(&Notification) -> bool,
{
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_) | Ok(None) => return Ok(()),
            Ok(Some(note)) if predicate(&note) => {
                return Err(HarnessError::Unexpected(format!(
                    "unexpected notification {:?}",
                    note
                )))
            }
            Ok(Some(_)) => continue,
        }
    }
}

/// Wait for a session to reach `state`
pub async fn wait_for_state(session: &PeerSession, state: SessionState) -> HarnessResult<()> {
    let mut rx = session.subscribe_state();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .map_err(|_| HarnessError::Timeout(format!("session state {}", state)))?
        .map_err(|_| HarnessError::Unexpected("session dropped".to_string()))?;
    Ok(())
}

/// Wait until a mock connection has applied at least `count` remote candidates
pub async fn wait_for_candidates(
    connection: &MockPeerConnection,
    count: usize,
) -> HarnessResult<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while connection.applied_candidates() < count {
        if tokio::time::Instant::now() >= deadline {
            return Err(HarnessError::Timeout(format!(
                "{} applied candidates (have {})",
                count,
                connection.applied_candidates()
            )));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Open a session pair: `offerer` connects to `answerer` by identity
pub async fn connected_pair(
    harness: &RelayHarness,
    offerer: &str,
    answerer: &str,
) -> HarnessResult<(PeerSession, PeerSession)> {
    let a = harness.session(offerer).await?;
    let b = harness.session(answerer).await?;
    a.connect(answerer).await?;
    a.wait_open(WAIT).await?;
    b.wait_open(WAIT).await?;
    Ok((a, b))
}
