//! Two peers exchange text and growing binary payloads over a real WebRTC
//! data channel, negotiated through an in-process relay.
//!
//! ```bash
//! cargo run -p peerlink --example datatransfer
//! RUST_LOG=peerlink=debug cargo run -p peerlink --example datatransfer
//! ```

use peerlink::{
    PeerSession, Payload, RelayConfig, RelayServer, SessionConfig, MAX_MESSAGE_SIZE,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,webrtc=warn")),
        )
        .init();

    let relay = RelayServer::new(RelayConfig {
        bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..Default::default()
    })?
    .start()
    .await?;

    // Host candidates are enough on loopback
    let config = SessionConfig {
        stun_servers: Vec::new(),
        ..SessionConfig::with_signal_server(relay.url())
    };

    let alice = PeerSession::connect_relay(config.clone(), "alice").await?;
    let bob = PeerSession::connect_relay(config, "bob").await?;
    let mut at_bob = bob
        .take_incoming()
        .ok_or_else(|| anyhow::anyhow!("incoming stream already taken"))?;

    let started = Instant::now();
    alice.connect("bob").await?;
    bob.wait_open(Duration::from_secs(10)).await?;
    info!("Connected in {:?}", started.elapsed());

    let receiver = tokio::spawn(async move {
        let mut received = 0usize;
        let mut bytes = 0usize;
        while let Some(payload) = at_bob.recv().await {
            received += 1;
            bytes += payload.byte_length();
            match &payload {
                Payload::Text(text) => info!("bob <- text {:?}", text),
                Payload::Binary(data) => info!("bob <- {} bytes", data.len()),
            }
            if received == 3 + 17 {
                break;
            }
        }
        (received, bytes)
    });

    for text in ["hello", "from", "alice"] {
        alice.send_async(text).await?;
    }

    // 1 B, 2 B, 4 B, ... up to the 64 KiB cap
    let mut size = 1;
    while size <= MAX_MESSAGE_SIZE {
        alice.send_async(vec![0xAB; size]).await?;
        size *= 2;
    }

    let (received, bytes) = tokio::time::timeout(Duration::from_secs(10), receiver).await??;
    info!(
        "Delivered {} payloads ({} bytes) in {:?}",
        received,
        bytes,
        started.elapsed()
    );

    let oversized = alice.send_async(vec![0u8; MAX_MESSAGE_SIZE + 1]).await;
    info!("Oversized send: {:?}", oversized.err());

    alice.debug_state().await;
    alice.close().await?;
    bob.close().await?;
    relay.shutdown().await;
    Ok(())
}
