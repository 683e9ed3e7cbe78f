//! Listener / demultiplexer.
//!
//! Owns one UDP socket and the `remote -> connection` mapping. Every inbound
//! datagram is looked up by its source address; an unknown address spawns a
//! new connection (its first datagram is treated as a handshake Hello) and
//! reports it on the accept channel, exactly mirroring how `TcpListener`
//! surfaces new peers one at a time.

use bytes::Bytes;
use rudp_core::connection::{self, ConnectionEvent, ConnectionHandle, ConnectionParams, NewConnectionHandler};
use rudp_core::{BufferPool, Statistics, TransportConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// A freshly-accepted inbound connection: its control handle plus the
/// stream of lifecycle/data events the application drives.
pub struct Accepted {
    pub handle: ConnectionHandle,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

struct PeerEntry {
    inbound: mpsc::Sender<Bytes>,
    handle: ConnectionHandle,
}

pub struct Listener {
    socket: Arc<UdpSocket>,
    config: TransportConfig,
    stats: Arc<dyn Statistics>,
    pool: Arc<BufferPool>,
    handler: Arc<dyn NewConnectionHandler>,
    connections: HashMap<SocketAddr, PeerEntry>,
    removed_tx: mpsc::UnboundedSender<SocketAddr>,
    removed_rx: mpsc::UnboundedReceiver<SocketAddr>,
    accepted_tx: mpsc::Sender<Accepted>,
    stop_rx: mpsc::Receiver<()>,
}

/// A handle that can ask a running `Listener` to shut down gracefully.
#[derive(Clone)]
pub struct ListenerHandle {
    stop_tx: mpsc::Sender<()>,
}

impl ListenerHandle {
    /// Requests shutdown. The listener drains and disconnects every live
    /// connection with reason `"listener shutdown"` before its `run` future
    /// resolves.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(()).await;
    }
}

impl Listener {
    /// Binds `addr` and returns the listener, the channel new inbound
    /// connections are reported on, and a handle to request shutdown.
    pub async fn bind(
        addr: SocketAddr,
        config: TransportConfig,
        stats: Arc<dyn Statistics>,
        handler: Arc<dyn NewConnectionHandler>,
    ) -> anyhow::Result<(Self, mpsc::Receiver<Accepted>, ListenerHandle)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let pool = BufferPool::new(config.max_packet_size);
        let (removed_tx, removed_rx) = mpsc::unbounded_channel();
        let (accepted_tx, accepted_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Ok((
            Self {
                socket,
                config,
                stats,
                pool,
                handler,
                connections: HashMap::new(),
                removed_tx,
                removed_rx,
                accepted_tx,
                stop_rx,
            },
            accepted_rx,
            ListenerHandle { stop_tx },
        ))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Drives the demultiplex loop until the socket errors, the accept
    /// channel's receiver is dropped, or `ListenerHandle::stop` is called.
    /// Intended to be `tokio::spawn`ed.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.config.max_packet_size];
        loop {
            tokio::select! {
                biased;
                Some(()) = self.stop_rx.recv() => {
                    self.shutdown().await;
                    return Ok(());
                }
                Some(addr) = self.removed_rx.recv() => {
                    self.connections.remove(&addr);
                    trace!(remote = %addr, "connection removed from demultiplex table");
                }
                result = self.socket.recv_from(&mut buf) => {
                    let (n, from) = result?;
                    let datagram = Bytes::copy_from_slice(&buf[..n]);
                    if !self.dispatch(from, datagram).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Best-effort disconnects every live connection with reason
    /// `"listener shutdown"`, guaranteeing each one emits its `Disconnected`
    /// event rather than having its socket silently dropped.
    async fn shutdown(&mut self) {
        for (_, entry) in self.connections.drain() {
            let _ = entry.handle.disconnect(b"listener shutdown".to_vec()).await;
        }
    }

    /// Routes one inbound datagram to its connection, spawning a new one if
    /// `from` is unrecognized. Returns `false` if the accept channel closed
    /// and the listener should stop.
    async fn dispatch(&mut self, from: SocketAddr, datagram: Bytes) -> bool {
        if let Some(entry) = self.connections.get(&from) {
            if entry.inbound.try_send(datagram).is_err() {
                warn!(remote = %from, "connection inbound queue full or closed, dropping datagram");
            }
            return true;
        }

        let params = ConnectionParams {
            socket: self.socket.clone(),
            remote: from,
            config: self.config.clone(),
            stats: self.stats.clone(),
            pool: self.pool.clone(),
        };
        let (handle, events, inbound_tx) = connection::spawn_inbound(
            params,
            datagram,
            self.handler.clone(),
            Some(self.removed_tx.clone()),
        );
        self.connections.insert(
            from,
            PeerEntry {
                inbound: inbound_tx,
                handle: handle.clone(),
            },
        );

        if self.accepted_tx.send(Accepted { handle, events }).await.is_err() {
            return false;
        }
        true
    }
}
