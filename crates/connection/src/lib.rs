//! Connection negotiation for zipline.
//!
//! Drives the two-sided session-description exchange through the signaling
//! store until the transport reports an open data channel. The transport
//! itself (WebRTC or the in-process stand-in) sits behind the
//! [`PeerTransport`] / [`DataChannel`] traits; this crate owns the
//! sequencing: when offers and answers are produced, that each is applied
//! exactly once, and how candidates flow while negotiation is in flight.

pub mod candidates;
pub mod error;
pub mod memory;
pub mod negotiator;
pub mod transport;

pub use candidates::CandidateExchange;
pub use error::ConnectionError;
pub use memory::{MemoryChannel, MemoryNetwork, MemoryTransport};
pub use negotiator::{JoinOptions, NegotiationState, OpenConnection, OwnerNegotiator, join};
pub use transport::{
    ChannelEvent, ChannelState, DataChannel, PeerTransport, TransportError, TransportEvent,
    TransportFactory,
};
