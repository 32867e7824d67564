//! Progress reporting for both sides of a transfer.

use zipline_connection::ChannelState;
use zipline_protocol::{TransferManifest, format_bytes, format_progress};

/// Session lifecycle notifications, delivered on a caller-supplied channel.
/// Sends never block; a dropped receiver silently disables reporting.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    StateChanged(ChannelState),
    ManifestReceived(TransferManifest),
    Progress(TransferProgress),
    Completed,
}

/// A point-in-time progress measurement, emitted after every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Bytes sent or received so far.
    pub transferred: u64,
    /// Declared total from the manifest.
    pub total: u64,
}

impl TransferProgress {
    pub fn new(transferred: u64, total: u64) -> Self {
        Self { transferred, total }
    }

    /// Whole-number percentage. A zero-byte transfer reads as 100%.
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            return 100;
        }
        self.transferred * 100 / self.total
    }

    pub fn is_complete(&self) -> bool {
        self.transferred >= self.total
    }

    /// Human-readable remaining bytes.
    pub fn remaining_display(&self) -> String {
        format_bytes(self.total.saturating_sub(self.transferred))
    }
}

impl std::fmt::Display for TransferProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_progress(self.transferred, self.total))
    }
}
