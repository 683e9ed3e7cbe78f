//! Core of a lightweight reliable-datagram transport layered over UDP.
//!
//! This crate implements the per-connection reliable sub-protocol (framing,
//! message-id assignment, acknowledgement tracking, retransmission,
//! duplicate detection), the connection state machine including handshake
//! and disconnect, and the keep-alive/RTT estimator. The listener
//! demultiplexer that maps inbound datagrams to connections lives in
//! `rudp_listener`; the single-peer client wrapper lives in `rudp_client`.

pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod keepalive;
pub mod pool;
pub mod reliable;
pub mod stats;

pub use config::TransportConfig;
pub use connection::{
    spawn_inbound, spawn_outbound, AcceptAll, Command, ConnectionEvent, ConnectionHandle,
    ConnectionParams, ConnectionState, NewConnectionHandler, Reliability,
};
pub use error::{Result, TransportError};
pub use framing::{MessageReader, MessageWriter, SendOption};
pub use pool::BufferPool;
pub use stats::{NullStatistics, Statistics};
