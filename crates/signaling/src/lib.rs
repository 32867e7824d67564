//! Signaling layer for zipline.
//!
//! Two peers that cannot address each other negotiate through a shared
//! document store. This crate defines the store contract
//! ([`SignalingStore`]), the typed records that live in it, a convenience
//! client ([`SignalingClient`]) used by the negotiator, and a complete
//! in-process store ([`MemoryStore`]) with the same
//! deliver-all-then-incremental subscription semantics a hosted backend
//! provides.

pub mod client;
pub mod memory;
pub mod records;
pub mod store;

pub use client::{CandidateLane, SignalingClient};
pub use memory::MemoryStore;
pub use records::{CandidateRecord, ConnectionRecord, TransferRecord};
pub use store::{
    ChangeKind, CollectionChange, CollectionRef, DocumentId, DocumentRef, DocumentSnapshot,
    Fields, SignalingError, SignalingStore,
};
