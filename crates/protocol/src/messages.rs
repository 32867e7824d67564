use serde::{Deserialize, Serialize};

/// File metadata sent once as the first text message over the open channel,
/// sender to receiver. No chunk data may precede it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferManifest {
    /// File name as offered to the receiving user.
    pub filename: String,
    /// Exact payload size in bytes. The transfer is complete when the
    /// receiver has accumulated precisely this many bytes.
    pub size: u64,
}

impl TransferManifest {
    /// Serializes the manifest to its wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a manifest from a text message.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Bare control tokens sent by the receiver.
///
/// `download` requests the chunk stream; `end` acknowledges full receipt
/// and triggers the sender-side teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Download,
    End,
}

impl ControlMessage {
    /// Wire form of the token.
    pub fn as_token(self) -> &'static str {
        match self {
            ControlMessage::Download => "download",
            ControlMessage::End => "end",
        }
    }

    /// Parses a text message as a control token. Returns `None` for any
    /// other text (e.g. a manifest).
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "download" => Some(ControlMessage::Download),
            "end" => Some(ControlMessage::End),
            _ => None,
        }
    }
}

/// Opaque session-description blob (offer or answer).
///
/// Produced and consumed by the transport; the signaling layer stores and
/// forwards it as a single atomic value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(pub serde_json::Value);

/// Opaque ICE candidate blob describing one discovered network path.
///
/// Write-once, append-only in the store; ordering among candidates is
/// irrelevant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub serde_json::Value);
