//! Signal relay binary entry point
//!
//! Runs the rendezvous relay that peerlink sessions use to exchange
//! offers, answers and ICE candidates.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (0.0.0.0:3333)
//! cargo run -p peerlink-signal-server
//!
//! # Custom address, JSON logs
//! cargo run -p peerlink-signal-server -- --bind 127.0.0.1 --port 9000 --log-format json
//!
//! # Same via environment
//! SIGNAL_BIND=127.0.0.1 SIGNAL_PORT=9000 RUST_LOG=peerlink=debug cargo run -p peerlink-signal-server
//! ```

use clap::Parser;
use peerlink::{RelayConfig, RelayServer};
use std::net::{IpAddr, SocketAddr};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Peerlink signal relay
///
/// Admits peers under unique identities, pairs them through two-member
/// channels, and forwards signaling payloads between them.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind the WebSocket listener to
    #[arg(long, default_value = "0.0.0.0", env = "SIGNAL_BIND")]
    bind: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 3333, env = "SIGNAL_PORT")]
    port: u16,

    /// Largest accepted WebSocket frame in bytes
    #[arg(long, default_value_t = 1024 * 1024, env = "SIGNAL_MAX_FRAME_SIZE")]
    max_frame_size: usize,

    /// Log output format
    #[arg(long, default_value = "text", env = "SIGNAL_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            bind_address: SocketAddr::new(self.bind, self.port),
            max_frame_size: self.max_frame_size,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("signal-relay")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let config = args.relay_config();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind_address = %config.bind_address,
        max_frame_size = config.max_frame_size,
        "Peerlink signal relay starting"
    );

    let relay = RelayServer::new(config)?.start().await?;
    info!("Relay ready at {}", relay.url());

    tokio::signal::ctrl_c().await?;
    info!(peers = relay.peer_count(), "Ctrl+C received, shutting down");

    relay.shutdown().await;
    info!("Signal relay stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    // RUST_LOG wins over the default level
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
