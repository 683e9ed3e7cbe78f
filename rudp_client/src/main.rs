//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p rudp_client -- [--addr 127.0.0.1:9500] [--message hi]

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use rudp_client::ClientConnection;
use rudp_core::{ConnectionEvent, NullStatistics, Reliability, TransportConfig};
use tracing::{info, warn};

struct Args {
    addr: SocketAddr,
    message: String,
}

fn parse_args() -> Args {
    let raw: Vec<String> = env::args().collect();
    let mut addr = "127.0.0.1:9500".to_string();
    let mut message = "hello".to_string();
    let mut i = 1;
    while i < raw.len() {
        match raw[i].as_str() {
            "--addr" if i + 1 < raw.len() => {
                addr = raw[i + 1].clone();
                i += 2;
            }
            "--message" if i + 1 < raw.len() => {
                message = raw[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Args {
        addr: addr.parse().unwrap_or_else(|_| "127.0.0.1:9500".parse().unwrap()),
        message,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args();
    let config = TransportConfig::default();
    config.validate().map_err(anyhow::Error::msg)?;

    info!(server = %args.addr, "connecting");
    let mut client =
        ClientConnection::connect(args.addr, b"hello from rudp_client".to_vec(), config, Arc::new(NullStatistics))
            .await
            .context("connect")?;

    client.wait_connected().await.context("handshake")?;
    info!("connected");

    client
        .handle
        .send(Reliability::Reliable, args.message.clone().into_bytes())
        .await
        .context("send")?;

    while let Some(event) = client.events.recv().await {
        match event {
            ConnectionEvent::DataReceived(payload) => {
                info!(bytes = payload.len(), text = %String::from_utf8_lossy(&payload), "received");
                break;
            }
            ConnectionEvent::Disconnected(reason) => {
                warn!(%reason, "disconnected");
                break;
            }
            other => {
                info!(?other, "event");
            }
        }
    }

    client.handle.disconnect(Vec::new()).await.ok();
    Ok(())
}
