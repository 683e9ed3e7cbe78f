//! Error kinds shared by the framing codec and the connection state machine.

use thiserror::Error;

/// Every failure mode this crate can surface.
///
/// The framing variants (`BufferOverflow`, `Underflow`, `Unbalanced`) are
/// programmer errors: they bubble straight to the caller and never affect
/// connection state. The remaining variants describe why a connection moved
/// to `NotConnected`; exactly one `Disconnected` event carries the reason
/// whenever that happens.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A write would exceed the framing buffer's fixed capacity.
    #[error("framing buffer overflow")]
    BufferOverflow,

    /// A read ran past the end of the available bytes.
    #[error("framing buffer underflow")]
    Underflow,

    /// `end_message` was called with no matching `start_message`.
    #[error("unbalanced start_message/end_message pair")]
    Unbalanced,

    /// `send` was attempted outside the `Connected` state.
    #[error("connection is not connected")]
    NotConnected,

    /// A socket-level I/O failure occurred.
    #[error("transport error: {0}")]
    Transport(String),

    /// The reliable retry limit was exceeded, or the keep-alive ping was
    /// never acknowledged.
    #[error("timed out")]
    Timeout,

    /// The remote end sent an explicit Disconnect.
    #[error("remote disconnected: {0:?}")]
    RemoteDisconnect(Vec<u8>),
}

impl TransportError {
    /// Human-readable disconnect reason, used to populate `Disconnected`
    /// events for the non-remote termination causes.
    pub fn reason_str(&self) -> String {
        match self {
            TransportError::Timeout => "timeout".to_string(),
            TransportError::Transport(msg) => format!("transport error: {msg}"),
            TransportError::RemoteDisconnect(bytes) => {
                String::from_utf8_lossy(bytes).into_owned()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
