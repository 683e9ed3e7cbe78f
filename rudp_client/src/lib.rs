//! Single-peer client on top of the reliable-datagram transport core.

pub mod client;

pub use client::ClientConnection;
