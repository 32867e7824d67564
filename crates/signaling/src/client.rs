//! Typed client over the raw store, exposing exactly the operations the
//! negotiation and transfer layers need.
//!
//! Store layout (wire-compatible with the original deployment):
//!
//! ```text
//! transfers/<transferId>                      TransferRecord
//! transfers/<transferId>/connections/<id>     ConnectionRecord
//! .../connections/<id>/offerCandidates/<id>   candidate blob (joiner's)
//! .../connections/<id>/answerCandidates/<id>  candidate blob (owner's)
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use zipline_protocol::{IceCandidate, SessionDescription};

use crate::records::{self, CandidateRecord, ConnectionRecord, TransferRecord};
use crate::store::{
    CollectionChange, CollectionRef, DocumentId, DocumentRef, DocumentSnapshot, Fields,
    SignalingError, SignalingStore,
};

const TRANSFERS: &str = "transfers";
const CONNECTIONS: &str = "connections";

/// Which candidate sub-collection a record belongs to: the joiner (offer
/// side) writes `offerCandidates`, the transfer owner writes
/// `answerCandidates`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateLane {
    Offer,
    Answer,
}

impl CandidateLane {
    fn collection_name(self) -> &'static str {
        match self {
            CandidateLane::Offer => "offerCandidates",
            CandidateLane::Answer => "answerCandidates",
        }
    }
}

/// Typed signaling operations over any [`SignalingStore`].
#[derive(Clone)]
pub struct SignalingClient {
    store: Arc<dyn SignalingStore>,
}

impl SignalingClient {
    pub fn new(store: Arc<dyn SignalingStore>) -> Self {
        Self { store }
    }

    fn transfers(&self) -> CollectionRef {
        CollectionRef::new(TRANSFERS)
    }

    fn transfer_doc(&self, transfer: &DocumentId) -> DocumentRef {
        self.transfers().doc(transfer)
    }

    fn connection_doc(&self, transfer: &DocumentId, attempt: &DocumentId) -> DocumentRef {
        self.transfer_doc(transfer)
            .collection(CONNECTIONS)
            .doc(attempt)
    }

    fn candidates(
        &self,
        transfer: &DocumentId,
        attempt: &DocumentId,
        lane: CandidateLane,
    ) -> CollectionRef {
        self.connection_doc(transfer, attempt)
            .collection(lane.collection_name())
    }

    /// Publishes a new transfer record, returning its identifier — the one
    /// external parameter the receiving peer needs.
    pub async fn create_transfer(
        &self,
        filename: &str,
        size: u64,
    ) -> Result<DocumentId, SignalingError> {
        let record = TransferRecord {
            filename: filename.to_string(),
            size,
            completed: false,
        };
        let id = self
            .store
            .create(&self.transfers(), records::to_fields(&record)?)
            .await?;
        debug!(transfer = %id, filename, size, "transfer record created");
        Ok(id)
    }

    /// Fetches a transfer record, `None` if the identifier is unknown.
    pub async fn get_transfer(
        &self,
        transfer: &DocumentId,
    ) -> Result<Option<TransferRecord>, SignalingError> {
        match self.store.get(&self.transfer_doc(transfer)).await? {
            Some(fields) => Ok(Some(records::from_fields(fields)?)),
            None => Ok(None),
        }
    }

    /// Marks a transfer as completed. Monotonic: never flipped back.
    pub async fn mark_completed(&self, transfer: &DocumentId) -> Result<(), SignalingError> {
        let mut fields = Fields::new();
        fields.insert("completed".into(), serde_json::Value::Bool(true));
        self.store.merge(&self.transfer_doc(transfer), fields).await
    }

    /// Publishes the joiner's offer, creating the connection attempt
    /// document.
    pub async fn publish_offer(
        &self,
        transfer: &DocumentId,
        attempt: &DocumentId,
        offer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        let record = ConnectionRecord {
            offer: Some(offer.clone()),
            answer: None,
        };
        self.store
            .merge(
                &self.connection_doc(transfer, attempt),
                records::to_fields(&record)?,
            )
            .await
    }

    /// Merges the owner's answer into an existing connection attempt.
    pub async fn publish_answer(
        &self,
        transfer: &DocumentId,
        attempt: &DocumentId,
        answer: &SessionDescription,
    ) -> Result<(), SignalingError> {
        let record = ConnectionRecord {
            offer: None,
            answer: Some(answer.clone()),
        };
        self.store
            .merge(
                &self.connection_doc(transfer, attempt),
                records::to_fields(&record)?,
            )
            .await
    }

    /// Watches one connection attempt document (the joiner awaiting its
    /// answer).
    pub async fn watch_connection(
        &self,
        transfer: &DocumentId,
        attempt: &DocumentId,
    ) -> Result<mpsc::UnboundedReceiver<DocumentSnapshot>, SignalingError> {
        self.store
            .subscribe_document(&self.connection_doc(transfer, attempt))
            .await
    }

    /// Watches the connections collection (the owner awaiting attempts).
    pub async fn watch_connections(
        &self,
        transfer: &DocumentId,
    ) -> Result<mpsc::UnboundedReceiver<CollectionChange>, SignalingError> {
        self.store
            .subscribe_collection(&self.transfer_doc(transfer).collection(CONNECTIONS))
            .await
    }

    /// Appends one locally discovered candidate. Fire-and-forget: publish
    /// order across candidates is not significant.
    pub async fn append_candidate(
        &self,
        transfer: &DocumentId,
        attempt: &DocumentId,
        lane: CandidateLane,
        candidate: &IceCandidate,
    ) -> Result<DocumentId, SignalingError> {
        let record = CandidateRecord {
            candidate: candidate.clone(),
        };
        self.store
            .append(&self.candidates(transfer, attempt, lane), record.to_fields()?)
            .await
    }

    /// Watches a candidate lane for remotely discovered candidates.
    pub async fn watch_candidates(
        &self,
        transfer: &DocumentId,
        attempt: &DocumentId,
        lane: CandidateLane,
    ) -> Result<mpsc::UnboundedReceiver<CollectionChange>, SignalingError> {
        self.store
            .subscribe_collection(&self.candidates(transfer, attempt, lane))
            .await
    }

    /// Parses a connection snapshot into its typed record, if present.
    pub fn connection_record(
        snapshot: &DocumentSnapshot,
    ) -> Result<Option<ConnectionRecord>, SignalingError> {
        match &snapshot.fields {
            Some(fields) => Ok(Some(records::from_fields(fields.clone())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn client() -> SignalingClient {
        SignalingClient::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn transfer_lifecycle() {
        let client = client();
        let id = client.create_transfer("a.bin", 42).await.unwrap();

        let record = client.get_transfer(&id).await.unwrap().unwrap();
        assert_eq!(record.filename, "a.bin");
        assert_eq!(record.size, 42);
        assert!(!record.completed);

        client.mark_completed(&id).await.unwrap();
        let record = client.get_transfer(&id).await.unwrap().unwrap();
        assert!(record.completed);
        // Unlisted fields survived the merge.
        assert_eq!(record.filename, "a.bin");
    }

    #[tokio::test]
    async fn unknown_transfer_is_none() {
        let client = client();
        assert!(client
            .get_transfer(&DocumentId::from("missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn offer_then_answer_merge_into_one_attempt() {
        let client = client();
        let transfer = client.create_transfer("a.bin", 1).await.unwrap();
        let attempt = DocumentId::generate();

        let offer = SessionDescription(json!({"type": "offer", "sdp": "v=0 o"}));
        client
            .publish_offer(&transfer, &attempt, &offer)
            .await
            .unwrap();

        let mut watch = client.watch_connection(&transfer, &attempt).await.unwrap();
        let snap = watch.recv().await.unwrap();
        let record = SignalingClient::connection_record(&snap).unwrap().unwrap();
        assert_eq!(record.offer, Some(offer.clone()));
        assert!(record.answer.is_none());

        let answer = SessionDescription(json!({"type": "answer", "sdp": "v=0 a"}));
        client
            .publish_answer(&transfer, &attempt, &answer)
            .await
            .unwrap();
        let snap = watch.recv().await.unwrap();
        let record = SignalingClient::connection_record(&snap).unwrap().unwrap();
        assert_eq!(record.offer, Some(offer));
        assert_eq!(record.answer, Some(answer));
    }

    #[tokio::test]
    async fn owner_sees_new_attempts() {
        let client = client();
        let transfer = client.create_transfer("a.bin", 1).await.unwrap();
        let mut attempts = client.watch_connections(&transfer).await.unwrap();

        let attempt = DocumentId::generate();
        let offer = SessionDescription(json!({"type": "offer", "sdp": "v=0"}));
        client
            .publish_offer(&transfer, &attempt, &offer)
            .await
            .unwrap();

        let change = attempts.recv().await.unwrap();
        assert_eq!(change.id, attempt);
    }

    #[tokio::test]
    async fn candidate_lanes_are_separate() {
        let client = client();
        let transfer = client.create_transfer("a.bin", 1).await.unwrap();
        let attempt = DocumentId::generate();

        let mut offer_lane = client
            .watch_candidates(&transfer, &attempt, CandidateLane::Offer)
            .await
            .unwrap();
        let mut answer_lane = client
            .watch_candidates(&transfer, &attempt, CandidateLane::Answer)
            .await
            .unwrap();

        let candidate = IceCandidate(json!({"candidate": "host 127.0.0.1"}));
        client
            .append_candidate(&transfer, &attempt, CandidateLane::Offer, &candidate)
            .await
            .unwrap();

        let seen = offer_lane.recv().await.unwrap();
        assert_eq!(
            CandidateRecord::from_fields(seen.fields).candidate,
            candidate
        );
        assert!(answer_lane.try_recv().is_err());
    }
}
