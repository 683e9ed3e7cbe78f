//! Standalone listener binary.
//!
//! Usage:
//!   cargo run -p rudp_listener -- [--addr 127.0.0.1:9500]
//!
//! Accepts inbound peers, echoes back anything they send, and logs
//! connect/disconnect.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use rudp_core::{AcceptAll, ConnectionEvent, NullStatistics, Reliability, TransportConfig};
use rudp_listener::Listener;
use tracing::{info, warn};

fn parse_addr() -> SocketAddr {
    let args: Vec<String> = env::args().collect();
    let mut addr = "127.0.0.1:9500".to_string();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--addr" && i + 1 < args.len() {
            addr = args[i + 1].clone();
            i += 2;
        } else {
            i += 1;
        }
    }
    addr.parse().unwrap_or_else(|_| "127.0.0.1:9500".parse().unwrap())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let addr = parse_addr();
    let config = TransportConfig::default();
    config.validate().map_err(anyhow::Error::msg)?;

    let (listener, mut accepted, _listener_handle) = Listener::bind(
        addr,
        config,
        Arc::new(NullStatistics),
        Arc::new(AcceptAll),
    )
    .await
    .context("bind listener")?;

    info!(local = %listener.local_addr()?, "listening");
    tokio::spawn(listener.run());

    while let Some(accepted) = accepted.recv().await {
        let handle = accepted.handle;
        let mut events = accepted.events;
        let remote = handle.remote_addr();
        info!(%remote, "peer accepted");
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConnectionEvent::Connected => info!(%remote, "connected"),
                    ConnectionEvent::ConnectFailed => warn!(%remote, "handshake failed"),
                    ConnectionEvent::DataReceived(payload) => {
                        info!(%remote, bytes = payload.len(), "echoing payload");
                        if let Err(e) = handle.send(Reliability::Reliable, payload).await {
                            warn!(%remote, error = %e, "failed to echo payload");
                        }
                    }
                    ConnectionEvent::Disconnected(reason) => {
                        info!(%remote, %reason, "disconnected");
                        break;
                    }
                }
            }
        });
    }

    Ok(())
}
