use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bytes::Bytes;
use clap::Parser;
use crypto_hash::{hex_digest, Algorithm};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_udp_tftp::protocol::TFTP_DEFAULT_RETRIES;
use rust_udp_tftp::{ServerConfig, ShutdownManager, UdpServer};

/// Serves one file to every TFTP client that asks for it.
#[derive(Parser, Debug)]
#[command(name = "rust-udp-tftp", about = "Read-only TFTP server")]
struct Cli {
    /// Listen address.
    #[arg(short, long, default_value = "127.0.0.1:69")]
    address: String,

    /// File to serve to clients, whatever name they ask for.
    #[arg(short, long, default_value = "payload.jpeg")]
    payload: PathBuf,

    /// Transmissions per block before a transfer is abandoned.
    #[arg(long, default_value_t = TFTP_DEFAULT_RETRIES)]
    retries: u8,

    /// Seconds to wait for each acknowledgment.
    #[arg(long, default_value_t = 6)]
    timeout_secs: u64,

    /// STUN server (host:port) used to log the public address at startup.
    #[arg(long)]
    stun_server: Option<String>,
}

// Only discovers the external address; it does not keep a NAT mapping open.
async fn stun_request(socket: &UdpSocket, stun_server: &str) -> anyhow::Result<SocketAddr> {
    use stunclient::StunClient;

    let want_ipv4 = socket.local_addr()?.is_ipv4();
    let stun_addr = tokio::net::lookup_host(stun_server)
        .await
        .with_context(|| format!("resolving {stun_server}"))?
        .find(|addr| addr.is_ipv4() == want_ipv4)
        .ok_or_else(|| anyhow!("{stun_server} has no address of the listening family"))?;
    StunClient::new(stun_addr)
        .query_external_address_async(socket)
        .await
        .map_err(|e| anyhow!("request to STUN server failed: {e:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let payload = tokio::fs::read(&cli.payload)
        .await
        .with_context(|| format!("File '{}' could not be read", cli.payload.display()))?;
    let payload = Bytes::from(payload);
    info!(
        path = %cli.payload.display(),
        bytes = payload.len(),
        sha256 = %hex_digest(Algorithm::SHA256, &payload),
        "loaded payload"
    );

    let config = ServerConfig {
        address: cli.address,
        retries: cli.retries,
        timeout: Duration::from_secs(cli.timeout_secs),
    };

    let (shutdown_send, _) = broadcast::channel::<()>(16);
    let shutdown = ShutdownManager::new(shutdown_send);
    let mut ctrlc_shutdown = shutdown.clone();
    ctrlc::set_handler(move || ctrlc_shutdown.send()).context("installing Ctrl-C handler")?;

    let mut server = UdpServer::bind(&config, payload, shutdown)
        .await
        .with_context(|| format!("binding {}", config.address))?;

    if let Some(stun_server) = cli.stun_server.as_deref() {
        match stun_request(server.socket(), stun_server).await {
            Ok(public) => info!(private = %server.own_addr, public = %public, "discovered public address"),
            Err(e) => warn!(error = %e, "STUN lookup failed"),
        }
    }

    server.listen().await.context("listening for requests")?;
    Ok(())
}
