//! Error types for connection negotiation.

use zipline_signaling::SignalingError;

use crate::transport::TransportError;

/// Errors produced while negotiating a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The referenced identifier has no transfer record.
    #[error("invalid transfer: {0}")]
    InvalidTransfer(String),

    /// The transfer record exists but is already finalized.
    #[error("transfer already completed")]
    TransferAlreadyCompleted,

    /// No transport progress within the policy window. Local heuristic:
    /// the remote peer is not informed.
    #[error("connection timed out")]
    Timeout,

    /// The underlying connection reported `failed` or an unexpected
    /// `disconnected`.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// The transport's event receiver was already taken.
    #[error("transport events unavailable")]
    EventsUnavailable,
}
