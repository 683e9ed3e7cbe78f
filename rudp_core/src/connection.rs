//! Connection state machine and per-connection task.
//!
//! One `tokio::spawn`ed task owns a `Connection` for its whole life: it pulls
//! datagrams from an inbound channel, application commands from a second
//! channel, and retransmission/keep-alive deadlines from a single re-armed
//! timer, processing one event to completion before the next (see the
//! concurrency model this mirrors in `lib.rs`).

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::framing::{parse_datagram_header, MessageWriter, SendOption};
use crate::keepalive::KeepAlive;
use crate::pool::BufferPool;
use crate::reliable::{ReliableChannel, RetransmitOutcome};
use crate::stats::Statistics;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn, Instrument};

/// Lifecycle state of a connection, observable synchronously via
/// `ConnectionHandle::state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    NotConnected,
}

/// Whether an application send should be acknowledged and retransmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Unreliable,
    Reliable,
}

/// Events delivered to the application from a connection's task.
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected,
    ConnectFailed,
    DataReceived(Vec<u8>),
    Disconnected(String),
}

/// Commands posted onto a connection's task queue from the application side.
pub enum Command {
    Send {
        reliability: Reliability,
        payload: Vec<u8>,
        ack: Option<oneshot::Sender<()>>,
    },
    Disconnect {
        reason: Vec<u8>,
    },
}

/// A cheaply-cloneable, non-owning reference to a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
    remote: SocketAddr,
}

impl ConnectionHandle {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Sends application payload. Delivery order relative to other sends on
    /// this handle is preserved; completion of this call only means the
    /// command was accepted onto the connection's task queue.
    pub async fn send(&self, reliability: Reliability, payload: Vec<u8>) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.commands
            .send(Command::Send {
                reliability,
                payload,
                ack: None,
            })
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    /// Like `send` with `Reliability::Reliable`, but resolves the returned
    /// receiver exactly once the remote acknowledges the datagram.
    pub async fn send_reliable_tracked(&self, payload: Vec<u8>) -> Result<oneshot::Receiver<()>> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                reliability: Reliability::Reliable,
                payload,
                ack: Some(tx),
            })
            .await
            .map_err(|_| TransportError::NotConnected)?;
        Ok(rx)
    }

    pub async fn disconnect(&self, reason: Vec<u8>) -> Result<()> {
        self.commands
            .send(Command::Disconnect { reason })
            .await
            .map_err(|_| TransportError::NotConnected)
    }
}

/// Decides whether to accept an inbound handshake, given the remote address
/// and the payload carried by its Hello.
pub trait NewConnectionHandler: Send + Sync {
    fn accept(&self, remote: SocketAddr, hello_payload: &[u8]) -> bool;
}

impl<F> NewConnectionHandler for F
where
    F: Fn(SocketAddr, &[u8]) -> bool + Send + Sync,
{
    fn accept(&self, remote: SocketAddr, hello_payload: &[u8]) -> bool {
        self(remote, hello_payload)
    }
}

/// Always accepts; used by `rudp_client`, which never receives inbound
/// handshakes.
pub struct AcceptAll;
impl NewConnectionHandler for AcceptAll {
    fn accept(&self, _remote: SocketAddr, _hello_payload: &[u8]) -> bool {
        true
    }
}

enum Role {
    /// Actively dialing out: sends a Hello and waits for its ack.
    Client { hello_payload: Vec<u8> },
    /// Passively accepting: the first inbound datagram is treated as Hello.
    Server { handler: Arc<dyn NewConnectionHandler> },
}

/// Shared construction parameters for a spawned connection.
pub struct ConnectionParams {
    pub socket: Arc<UdpSocket>,
    pub remote: SocketAddr,
    pub config: TransportConfig,
    pub stats: Arc<dyn Statistics>,
    pub pool: Arc<BufferPool>,
}

/// Spawns a connection actively dialing `params.remote`.
///
/// Returns a handle, the event stream, and the sender the owning listener
/// (or client) feeds inbound datagrams for this peer into.
pub fn spawn_outbound(
    params: ConnectionParams,
    hello_payload: Vec<u8>,
    removed: Option<mpsc::UnboundedSender<SocketAddr>>,
) -> (
    ConnectionHandle,
    mpsc::Receiver<ConnectionEvent>,
    mpsc::Sender<Bytes>,
) {
    spawn(params, Role::Client { hello_payload }, None, removed)
}

/// Spawns a connection accepting an inbound peer, treating `first_datagram`
/// as its Hello.
pub fn spawn_inbound(
    params: ConnectionParams,
    first_datagram: Bytes,
    handler: Arc<dyn NewConnectionHandler>,
    removed: Option<mpsc::UnboundedSender<SocketAddr>>,
) -> (
    ConnectionHandle,
    mpsc::Receiver<ConnectionEvent>,
    mpsc::Sender<Bytes>,
) {
    spawn(params, Role::Server { handler }, Some(first_datagram), removed)
}

fn spawn(
    params: ConnectionParams,
    role: Role,
    first_datagram: Option<Bytes>,
    removed: Option<mpsc::UnboundedSender<SocketAddr>>,
) -> (
    ConnectionHandle,
    mpsc::Receiver<ConnectionEvent>,
    mpsc::Sender<Bytes>,
) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(64);
    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

    let remote = params.remote;
    let handle = ConnectionHandle {
        commands: command_tx,
        state: state_rx,
        remote,
    };

    let duplicate_window = params.config.duplicate_window;
    let conn = Connection {
        socket: params.socket,
        remote,
        config: params.config,
        stats: params.stats,
        pool: params.pool,
        reliable: ReliableChannel::new(duplicate_window),
        keepalive: KeepAlive::new(Instant::now().into()),
        state: ConnectionState::Connecting,
        state_tx,
        event_tx,
        command_rx,
        inbound_rx,
        hello_id: None,
        removed,
    };

    let span = tracing::info_span!("connection", %remote);
    tokio::spawn(conn.run(role, first_datagram).instrument(span));

    (handle, event_rx, inbound_tx)
}

struct Connection {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    config: TransportConfig,
    stats: Arc<dyn Statistics>,
    pool: Arc<BufferPool>,
    reliable: ReliableChannel,
    keepalive: KeepAlive,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    command_rx: mpsc::Receiver<Command>,
    inbound_rx: mpsc::Receiver<Bytes>,
    /// Reliable id of the outstanding Hello, while `Connecting` on the
    /// client side.
    hello_id: Option<u16>,
    removed: Option<mpsc::UnboundedSender<SocketAddr>>,
}

impl Connection {
    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    async fn emit(&self, event: ConnectionEvent) {
        let _ = self.event_tx.send(event).await;
    }

    fn build_datagram(&self, send_option: SendOption, reliable_id: Option<u16>, payload: &[u8]) -> Result<Vec<u8>> {
        let mut writer = MessageWriter::new(&self.pool, self.config.max_packet_size, send_option, reliable_id)?;
        writer.write_raw_bytes(payload)?;
        writer.finish()
    }

    async fn transmit(&self, bytes: &[u8]) {
        if let Err(e) = self.socket.send_to(bytes, self.remote).await {
            warn!(error = %e, "failed to send datagram");
        } else {
            self.stats.on_datagram_sent(self.remote, bytes.len());
        }
    }

    async fn send_ack(&self, id: u16) {
        match self.build_datagram(SendOption::Acknowledgement, Some(id), &[]) {
            Ok(bytes) => self.transmit(&bytes).await,
            Err(e) => warn!(error = %e, "failed to build acknowledgement"),
        }
    }

    async fn send_reliable(&mut self, send_option: SendOption, payload: &[u8], ack_callback: Option<crate::reliable::AckCallback>) -> Result<u16> {
        let id = self.reliable.next_id();
        let bytes = self.build_datagram(send_option, Some(id), payload)?;
        let now = Instant::now();
        self.reliable
            .track_send(id, bytes.clone(), now.into(), self.config.resend_timeout_initial, ack_callback);
        self.transmit(&bytes).await;
        self.keepalive.record_send(now.into());
        Ok(id)
    }

    fn next_wake(&self) -> Instant {
        let mut deadline = self.reliable.earliest_deadline();
        if self.state == ConnectionState::Connected {
            let interval = self.reliable.rtt.keep_alive_interval(
                self.config.keep_alive_interval_default,
                self.config.keep_alive_interval_min,
                self.config.keep_alive_interval_max,
            );
            let ka_deadline = self.keepalive.next_deadline(interval);
            deadline = Some(match deadline {
                Some(d) => d.min(ka_deadline),
                None => ka_deadline,
            });
        }
        deadline.map(Instant::from).unwrap_or_else(|| Instant::now() + self.config.keep_alive_interval_max)
    }

    async fn run(mut self, role: Role, first_datagram: Option<Bytes>) {
        match role {
            Role::Client { hello_payload } => {
                let id = match self
                    .send_reliable(SendOption::Hello, &hello_payload, None)
                    .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(error = %e, "failed to send hello");
                        self.finish(ConnectionState::NotConnected, ConnectionEvent::ConnectFailed)
                            .await;
                        return;
                    }
                };
                self.hello_id = Some(id);
                self.run_loop().await;
            }
            Role::Server { handler } => {
                if let Some(datagram) = first_datagram {
                    self.handle_hello_datagram(&datagram, &*handler).await;
                    if self.state == ConnectionState::Connected {
                        self.run_loop().await;
                    } else {
                        self.teardown().await;
                    }
                } else {
                    warn!("server-role connection spawned without a first datagram");
                    self.finish(ConnectionState::NotConnected, ConnectionEvent::ConnectFailed)
                        .await;
                }
            }
        }
    }

    async fn handle_hello_datagram(&mut self, datagram: &[u8], handler: &dyn NewConnectionHandler) {
        let header = match parse_datagram_header(datagram) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "malformed handshake datagram");
                self.set_state(ConnectionState::NotConnected);
                return;
            }
        };
        let payload = &datagram[header.body_offset..];
        if let Some(id) = header.reliable_id {
            self.reliable.is_duplicate(id);
            self.send_ack(id).await;
        }
        if handler.accept(self.remote, payload) {
            info!("accepted inbound connection");
            self.set_state(ConnectionState::Connected);
            self.keepalive.record_send(Instant::now().into());
            self.stats.on_connected(self.remote);
            self.emit(ConnectionEvent::Connected).await;
        } else {
            info!("rejected inbound connection");
            self.set_state(ConnectionState::NotConnected);
            self.emit(ConnectionEvent::ConnectFailed).await;
        }
    }

    async fn run_loop(&mut self) {
        loop {
            if self.state == ConnectionState::NotConnected {
                break;
            }
            let wake = self.next_wake();
            tokio::select! {
                biased;
                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(cmd).await;
                }
                Some(datagram) = self.inbound_rx.recv() => {
                    self.stats.on_datagram_received(self.remote, datagram.len());
                    self.handle_datagram(&datagram).await;
                }
                _ = sleep_until(wake) => {
                    self.handle_timer(Instant::now()).await;
                }
                else => break,
            }
        }
        self.teardown().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Send { reliability, payload, ack } => {
                if self.state != ConnectionState::Connected {
                    trace!("dropped send on a connection that is not connected");
                    return;
                }
                match reliability {
                    Reliability::Unreliable => {
                        match self.build_datagram(SendOption::Normal, None, &payload) {
                            Ok(bytes) => {
                                self.transmit(&bytes).await;
                                self.keepalive.record_send(Instant::now().into());
                            }
                            Err(e) => warn!(error = %e, "failed to build datagram"),
                        }
                    }
                    Reliability::Reliable => {
                        let callback: Option<crate::reliable::AckCallback> = ack.map(|tx| {
                            let cb: crate::reliable::AckCallback = Box::new(move || {
                                let _ = tx.send(());
                            });
                            cb
                        });
                        if let Err(e) = self.send_reliable(SendOption::Reliable, &payload, callback).await {
                            warn!(error = %e, "failed to send reliable datagram");
                        } else {
                            self.stats.on_reliable_sent(self.remote, self.reliable.outstanding_count() as u16);
                        }
                    }
                }
            }
            Command::Disconnect { reason } => {
                self.set_state(ConnectionState::Disconnecting);
                if let Ok(bytes) = self.build_datagram(SendOption::Disconnect, None, &reason) {
                    self.transmit(&bytes).await;
                }
                self.set_state(ConnectionState::NotConnected);
                self.emit(ConnectionEvent::Disconnected("local disconnect".to_string())).await;
            }
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8]) {
        let header = match parse_datagram_header(datagram) {
            Ok(h) => h,
            Err(e) => {
                trace!(error = %e, "dropped malformed datagram");
                return;
            }
        };
        let payload = &datagram[header.body_offset..];
        match header.send_option {
            SendOption::Normal => {
                self.emit(ConnectionEvent::DataReceived(payload.to_vec())).await;
            }
            SendOption::Reliable | SendOption::Hello | SendOption::Ping => {
                let id = header.reliable_id.expect("reliable send option carries an id");
                self.send_ack(id).await;
                if self.reliable.is_duplicate(id) {
                    self.stats.on_duplicate_dropped(self.remote, id);
                    return;
                }
                if header.send_option != SendOption::Ping {
                    self.emit(ConnectionEvent::DataReceived(payload.to_vec())).await;
                }
            }
            SendOption::Acknowledgement => {
                if payload.len() < 2 {
                    trace!("dropped malformed acknowledgement");
                    return;
                }
                let id = u16::from_be_bytes([payload[0], payload[1]]);
                let now = Instant::now();
                if self.reliable.on_ack(id, now.into()) {
                    self.stats.on_ack_received(self.remote, id);
                    if self.state == ConnectionState::Connecting && self.hello_id == Some(id) {
                        self.set_state(ConnectionState::Connected);
                        self.keepalive.record_send(now.into());
                        self.stats.on_connected(self.remote);
                        self.emit(ConnectionEvent::Connected).await;
                    }
                }
            }
            SendOption::Disconnect => {
                let reason = String::from_utf8_lossy(payload).into_owned();
                self.set_state(ConnectionState::NotConnected);
                self.emit(ConnectionEvent::Disconnected(reason)).await;
            }
            SendOption::Fragment => {
                trace!("fragment reassembly is not implemented; treating as Normal");
                self.emit(ConnectionEvent::DataReceived(payload.to_vec())).await;
            }
        }
    }

    async fn handle_timer(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected {
            let interval = self.reliable.rtt.keep_alive_interval(
                self.config.keep_alive_interval_default,
                self.config.keep_alive_interval_min,
                self.config.keep_alive_interval_max,
            );
            if self.keepalive.is_due(now.into(), interval) {
                if let Err(e) = self.send_reliable(SendOption::Ping, &[], None).await {
                    warn!(error = %e, "failed to send keep-alive ping");
                }
            }
        }

        let due = self.reliable.due_entries(now.into());
        for id in due {
            match self
                .reliable
                .retransmit(id, now.into(), self.config.resend_timeout_max, self.config.resend_retry_limit)
            {
                Some(RetransmitOutcome::Resend(bytes)) => {
                    debug!(message_id = id, "retransmitting");
                    self.transmit(&bytes).await;
                    self.stats.on_reliable_resent(self.remote, id, 0);
                }
                Some(RetransmitOutcome::RetryLimitExceeded) => {
                    warn!(message_id = id, "reliable retry limit exceeded");
                    let event = if self.state == ConnectionState::Connecting {
                        ConnectionEvent::ConnectFailed
                    } else {
                        ConnectionEvent::Disconnected("timeout".to_string())
                    };
                    self.set_state(ConnectionState::NotConnected);
                    self.emit(event).await;
                    return;
                }
                None => {}
            }
        }
    }

    async fn finish(&mut self, state: ConnectionState, event: ConnectionEvent) {
        self.set_state(state);
        self.emit(event).await;
        self.teardown().await;
    }

    async fn teardown(&mut self) {
        self.stats.on_disconnected(self.remote, "closed");
        if let Some(removed) = &self.removed {
            let _ = removed.send(self.remote);
        }
    }
}
