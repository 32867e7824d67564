//! Shared wire types and tunables for zipline peer-to-peer transfers.
//!
//! Exactly three message shapes cross the data channel: the one-time
//! [`TransferManifest`], the receiver's `download` and `end` control
//! tokens ([`ControlMessage`]), and raw binary chunk payloads. Everything
//! else in this crate is the opaque signaling blobs (session descriptions,
//! ICE candidates) that pass through the store untouched.

mod format;
mod messages;

pub use format::{format_bytes, format_progress};
pub use messages::{ControlMessage, IceCandidate, SessionDescription, TransferManifest};

use std::time::Duration;

/// Chunk size for file reads and binary sends: 8 KiB.
///
/// Small enough that one chunk never blows far past the buffering
/// threshold; correctness does not depend on both sides agreeing on it.
pub const CHUNK_SIZE: usize = 8192;

/// Low-water threshold for the channel's outstanding buffered bytes.
///
/// The sender defers the next chunk while the transport reports more than
/// this many bytes queued, and resumes on the buffered-amount-low signal.
pub const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 65536;

/// Default window for negotiation to show transport-level progress before
/// the attempt is abandoned.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Label of the single data channel carrying the transfer.
pub const DATA_CHANNEL_LABEL: &str = "channel";
