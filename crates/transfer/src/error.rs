//! Error types for transfer sessions.

use zipline_connection::{ConnectionError, TransportError};
use zipline_signaling::SignalingError;

/// Errors produced while hosting or receiving a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent something the protocol does not allow at this point,
    /// including more bytes than the manifest declared.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The channel closed before the transfer finished.
    #[error("data channel closed mid-transfer")]
    ChannelClosed,

    /// The channel's event receiver was already taken.
    #[error("channel events unavailable")]
    EventsUnavailable,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}
