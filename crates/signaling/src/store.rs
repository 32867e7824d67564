//! The store contract consumed by the negotiation layer.
//!
//! Modeled on a document-oriented backend with realtime push: documents
//! hold flat field maps, collections nest under documents, and
//! subscriptions fire once immediately with current state and then on
//! every subsequent change.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Field map of a single document.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Errors surfaced by a signaling store.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed record at {path}: {reason}")]
    MalformedRecord { path: String, reason: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Store-assigned (or client-generated) document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Slash-joined path to a collection, e.g. `transfers` or
/// `transfers/<id>/connections`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionRef(String);

impl CollectionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// A document within this collection.
    pub fn doc(&self, id: &DocumentId) -> DocumentRef {
        DocumentRef(format!("{}/{}", self.0, id))
    }

    pub fn path(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CollectionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Slash-joined path to a document, e.g. `transfers/<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentRef(String);

impl DocumentRef {
    /// A sub-collection nested under this document.
    pub fn collection(&self, name: &str) -> CollectionRef {
        CollectionRef(format!("{}/{name}", self.0))
    }

    /// The final path segment.
    pub fn id(&self) -> DocumentId {
        let last = self.0.rsplit('/').next().unwrap_or(&self.0);
        DocumentId(last.to_string())
    }

    pub fn path(&self) -> &str {
        &self.0
    }

    /// Path of the collection containing this document.
    pub(crate) fn parent(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }
}

impl std::fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivery on a document subscription. `fields` is `None` while the
/// document does not exist yet.
#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub doc: DocumentRef,
    pub fields: Option<Fields>,
}

/// Per-item classification on a collection subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One delivery on a collection subscription.
///
/// On first attach every existing item is delivered as [`ChangeKind::Added`]
/// before any incremental change — consumers that must act once per item
/// need their own seen-set keyed by `id`.
#[derive(Debug, Clone)]
pub struct CollectionChange {
    pub kind: ChangeKind,
    pub id: DocumentId,
    pub fields: Fields,
}

/// A document store with realtime push, the only channel two peers share
/// before their direct connection exists.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Creates a document with a store-assigned identifier.
    async fn create(
        &self,
        collection: &CollectionRef,
        fields: Fields,
    ) -> Result<DocumentId, SignalingError>;

    /// Fetches a document, `None` if absent.
    async fn get(&self, doc: &DocumentRef) -> Result<Option<Fields>, SignalingError>;

    /// Partial update: listed fields are written, unlisted fields are left
    /// untouched. Creates the document if it does not exist.
    async fn merge(&self, doc: &DocumentRef, fields: Fields) -> Result<(), SignalingError>;

    /// Subscribes to a single document. The receiver fires once immediately
    /// with the current state, then on every subsequent change.
    async fn subscribe_document(
        &self,
        doc: &DocumentRef,
    ) -> Result<mpsc::UnboundedReceiver<DocumentSnapshot>, SignalingError>;

    /// Subscribes to a collection. Existing items arrive first as `Added`,
    /// then live changes follow.
    async fn subscribe_collection(
        &self,
        collection: &CollectionRef,
    ) -> Result<mpsc::UnboundedReceiver<CollectionChange>, SignalingError>;

    /// Creates a document within a named sub-path. Equivalent to
    /// [`create`](Self::create) on the sub-collection.
    async fn append(
        &self,
        collection: &CollectionRef,
        fields: Fields,
    ) -> Result<DocumentId, SignalingError> {
        self.create(collection, fields).await
    }
}
