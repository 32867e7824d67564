//! Chunked file transfer over a negotiated data channel.
//!
//! The sending peer advertises a transfer, answers connection attempts and
//! streams the file in fixed-size binary chunks, pacing against the
//! channel's buffered amount. The receiving peer joins by transfer id,
//! requests the stream with `download`, accumulates chunks until the
//! manifest's byte count is reached and acknowledges with `end`.

pub mod chunker;
pub mod error;
pub mod progress;
pub mod receive;
pub mod receiver;
pub mod send;
pub mod sender;

pub use chunker::ChunkReader;
pub use error::TransferError;
pub use progress::{TransferEvent, TransferProgress};
pub use receive::join_transfer;
pub use receiver::{ReceiveSession, ReceivedFile};
pub use send::HostedTransfer;
pub use sender::SendSession;
