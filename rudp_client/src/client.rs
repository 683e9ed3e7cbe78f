//! Single-peer client: a degenerate listener with exactly one connection.
//!
//! Binds an ephemeral local socket, dials the remote, and relays inbound
//! datagrams from that one peer into the connection's inbound pipeline —
//! the same pipeline a `rudp_listener::Listener` would feed from its own
//! demultiplex loop.

use bytes::Bytes;
use rudp_core::connection::{self, ConnectionEvent, ConnectionHandle, ConnectionParams};
use rudp_core::{BufferPool, Result, Statistics, TransportConfig, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::trace;

pub struct ClientConnection {
    pub handle: ConnectionHandle,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

impl ClientConnection {
    /// Dials `remote`, sending `hello_payload` as the handshake body.
    /// Resolves once bound and the connection task is running; use
    /// `wait_connected` to block until the handshake actually completes.
    pub async fn connect(
        remote: SocketAddr,
        hello_payload: Vec<u8>,
        config: TransportConfig,
        stats: Arc<dyn Statistics>,
    ) -> anyhow::Result<Self> {
        let bind_addr: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let pool = BufferPool::new(config.max_packet_size);
        let params = ConnectionParams {
            socket: socket.clone(),
            remote,
            config: config.clone(),
            stats,
            pool,
        };
        let (handle, events, inbound_tx) = connection::spawn_outbound(params, hello_payload, None);

        tokio::spawn(read_loop(socket, remote, inbound_tx, config.max_packet_size));

        Ok(Self { handle, events })
    }

    /// Waits for the handshake to resolve, returning once `Connected` is
    /// observed or an error describing why it failed.
    pub async fn wait_connected(&mut self) -> Result<()> {
        match self.events.recv().await {
            Some(ConnectionEvent::Connected) => Ok(()),
            Some(ConnectionEvent::ConnectFailed) => Err(TransportError::Timeout),
            Some(other) => {
                trace!(?other, "unexpected event before handshake completed");
                Err(TransportError::NotConnected)
            }
            None => Err(TransportError::NotConnected),
        }
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    inbound_tx: mpsc::Sender<Bytes>,
    max_packet_size: usize,
) {
    let mut buf = vec![0u8; max_packet_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) if from == remote => {
                if inbound_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    return;
                }
            }
            Ok((_, from)) => {
                trace!(unexpected_sender = %from, "dropped datagram from unexpected sender");
            }
            Err(e) => {
                trace!(error = %e, "client read loop stopping");
                return;
            }
        }
    }
}
