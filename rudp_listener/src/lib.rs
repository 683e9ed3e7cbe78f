//! UDP listener/demultiplexer for the reliable-datagram transport.

pub mod listener;

pub use listener::{Accepted, Listener, ListenerHandle};
