//! Typed views of the documents the two peers exchange through the store.

use serde::{Deserialize, Serialize};

use zipline_protocol::{IceCandidate, SessionDescription};

use crate::store::{Fields, SignalingError};

/// Root record of one transfer, owned by the sending peer.
///
/// Created once at transfer start; the only mutation this system performs
/// is flipping `completed` to `true` after the `end` control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRecord {
    pub filename: String,
    pub size: u64,
    #[serde(default)]
    pub completed: bool,
}

/// One connection attempt against a transfer.
///
/// The joining peer creates the record carrying the offer; the transfer
/// owner merges in the answer. Each blob is written atomically, never
/// field-by-field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

/// Append-only candidate item. The document's fields *are* the candidate
/// blob, matching the store layout of the original wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
    pub candidate: IceCandidate,
}

impl CandidateRecord {
    pub fn to_fields(&self) -> Result<Fields, SignalingError> {
        match &self.candidate.0 {
            serde_json::Value::Object(map) => Ok(map.clone()),
            other => Err(SignalingError::Backend(format!(
                "candidate blob must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn from_fields(fields: Fields) -> Self {
        Self {
            candidate: IceCandidate(serde_json::Value::Object(fields)),
        }
    }
}

/// Serializes a record into a document field map.
pub(crate) fn to_fields<T: Serialize>(record: &T) -> Result<Fields, SignalingError> {
    match serde_json::to_value(record)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(SignalingError::Backend(format!(
            "record did not serialize to an object: {other}"
        ))),
    }
}

/// Deserializes a record from a document field map.
pub(crate) fn from_fields<T: for<'de> Deserialize<'de>>(
    fields: Fields,
) -> Result<T, SignalingError> {
    Ok(serde_json::from_value(serde_json::Value::Object(fields))?)
}
