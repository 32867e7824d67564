//! Transport seam: the operations the negotiator sequences and the channel
//! surface the transfer session runs on.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use zipline_protocol::{IceCandidate, SessionDescription};

/// Errors surfaced by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport failure: {0}")]
    Failure(String),

    #[error("data channel closed")]
    ChannelClosed,

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
}

/// Locally observed state of the peer connection. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Disconnected => "disconnected",
            ChannelState::Failed => "failed",
            ChannelState::Closed => "closed",
        };
        f.write_str(text)
    }
}

/// Asynchronous notifications from a peer transport.
#[derive(Clone)]
pub enum TransportEvent {
    /// A locally discovered network candidate, to be mirrored into the
    /// store for the remote peer.
    LocalCandidate(IceCandidate),
    /// Connection-level state transition.
    StateChanged(ChannelState),
    /// The data channel is open; negotiation is over, the transfer
    /// session takes over exclusively.
    ChannelOpen(Arc<dyn DataChannel>),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            TransportEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            TransportEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
        }
    }
}

/// Inbound traffic and flow-control signals on an open channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A text-framed message (manifest or control token).
    Text(String),
    /// A binary chunk payload.
    Binary(Bytes),
    /// Outstanding buffered bytes dropped below the low-water threshold.
    BufferedAmountLow,
    /// The channel closed (remote close or connection loss).
    Closed,
}

/// One peer-connection attempt. Owns exactly one underlying connection and
/// one data channel; never reused across transfers.
///
/// `create_offer` / `create_answer` produce *and install* the local
/// description, after which the transport starts emitting
/// [`TransportEvent::LocalCandidate`]s. Candidates may be added before the
/// remote description is applied; implementations queue them.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Requires the remote offer to have been applied first.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn apply_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn has_remote_description(&self) -> bool;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Takes the event receiver. Can only be called once.
    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Closes the connection and the channel. Idempotent.
    async fn close(&self);
}

/// The reliable, ordered byte-stream established once negotiation
/// succeeds.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<(), TransportError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError>;

    /// Outstanding bytes queued for sending but not yet handed to the
    /// network. Compared against the low-water threshold by the paced
    /// send loop.
    async fn buffered_amount(&self) -> usize;

    /// Takes the event receiver. Can only be called once.
    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn close(&self);
}

/// Produces a fresh answering transport per connection attempt: the
/// transfer owner answers each attempt on its own connection.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn answering_transport(&self) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_state_display_matches_wire_names() {
        assert_eq!(ChannelState::Connecting.to_string(), "connecting");
        assert_eq!(ChannelState::Connected.to_string(), "connected");
        assert_eq!(ChannelState::Disconnected.to_string(), "disconnected");
        assert_eq!(ChannelState::Failed.to_string(), "failed");
        assert_eq!(ChannelState::Closed.to_string(), "closed");
    }
}
