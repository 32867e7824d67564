//! Candidate exchange: mirrors locally discovered candidates into the
//! store and applies remotely discovered ones to the transport, for the
//! lifetime of one connection attempt.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use zipline_protocol::IceCandidate;
use zipline_signaling::{CandidateLane, CandidateRecord, ChangeKind, DocumentId, SignalingClient};

use crate::error::ConnectionError;
use crate::transport::PeerTransport;

/// Bidirectional candidate pump for one attempt and side.
///
/// Outbound: candidates handed to [`publish_local`](Self::publish_local)
/// are appended to this side's lane, fire-and-forget. Inbound: each newly
/// added record on the opposite lane is applied to the transport exactly
/// once, deduped by document id — the subscription replays existing items
/// on attach, and two distinct records can carry identical content.
///
/// Both pumps stop when [`stop`](Self::stop) is called (the owning
/// negotiation reaching a terminal state); no candidates are processed
/// afterwards.
pub struct CandidateExchange {
    local_tx: mpsc::UnboundedSender<IceCandidate>,
    cancel: CancellationToken,
}

impl CandidateExchange {
    /// Starts both pumps. `outbound` names the lane this peer writes; the
    /// opposite lane is consumed.
    pub async fn start(
        client: SignalingClient,
        transfer: DocumentId,
        attempt: DocumentId,
        outbound: CandidateLane,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, ConnectionError> {
        let inbound = match outbound {
            CandidateLane::Offer => CandidateLane::Answer,
            CandidateLane::Answer => CandidateLane::Offer,
        };
        let mut remote_rx = client.watch_candidates(&transfer, &attempt, inbound).await?;

        let (local_tx, mut local_rx) = mpsc::unbounded_channel::<IceCandidate>();
        let cancel = CancellationToken::new();

        // Outbound pump: local discoveries into the store.
        {
            let client = client.clone();
            let transfer = transfer.clone();
            let attempt = attempt.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        candidate = local_rx.recv() => {
                            let Some(candidate) = candidate else { break };
                            trace!(attempt = %attempt, "publishing local candidate");
                            if let Err(e) = client
                                .append_candidate(&transfer, &attempt, outbound, &candidate)
                                .await
                            {
                                warn!(attempt = %attempt, error = %e, "failed to publish candidate");
                            }
                        }
                    }
                }
            });
        }

        // Inbound pump: remote discoveries into the transport. Candidates
        // may arrive before the remote description is set; the transport
        // queues them, so they are forwarded unconditionally.
        {
            let attempt = attempt.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut seen: HashSet<DocumentId> = HashSet::new();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        change = remote_rx.recv() => {
                            let Some(change) = change else { break };
                            if change.kind != ChangeKind::Added {
                                continue;
                            }
                            if !seen.insert(change.id.clone()) {
                                trace!(attempt = %attempt, candidate = %change.id, "duplicate candidate delivery ignored");
                                continue;
                            }
                            let record = CandidateRecord::from_fields(change.fields);
                            trace!(attempt = %attempt, candidate = %change.id, "applying remote candidate");
                            if let Err(e) = transport.add_remote_candidate(record.candidate).await {
                                warn!(attempt = %attempt, error = %e, "failed to apply remote candidate");
                            }
                        }
                    }
                }
                debug!(attempt = %attempt, "candidate exchange stopped");
            });
        }

        Ok(Self { local_tx, cancel })
    }

    /// Queues one locally discovered candidate for publication.
    pub fn publish_local(&self, candidate: IceCandidate) {
        let _ = self.local_tx.send(candidate);
    }

    /// Stops both pumps. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for CandidateExchange {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use zipline_signaling::MemoryStore;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate(json!({"candidate": format!("host path {n}")}))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn local_candidates_reach_the_store() {
        let client = SignalingClient::new(Arc::new(MemoryStore::new()));
        let transfer = DocumentId::from("t1");
        let attempt = DocumentId::from("c1");
        let network = MemoryNetwork::new();
        let transport = network.offering_transport();

        let exchange = CandidateExchange::start(
            client.clone(),
            transfer.clone(),
            attempt.clone(),
            CandidateLane::Offer,
            transport,
        )
        .await
        .unwrap();

        let mut lane = client
            .watch_candidates(&transfer, &attempt, CandidateLane::Offer)
            .await
            .unwrap();

        exchange.publish_local(candidate(1));
        let change = lane.recv().await.unwrap();
        assert_eq!(
            CandidateRecord::from_fields(change.fields).candidate,
            candidate(1)
        );
    }

    #[tokio::test]
    async fn remote_candidates_apply_exactly_once_per_record() {
        let client = SignalingClient::new(Arc::new(MemoryStore::new()));
        let transfer = DocumentId::from("t1");
        let attempt = DocumentId::from("c1");
        let network = MemoryNetwork::new();
        let transport = network.offering_transport();

        // Two records already present at subscribe time, with identical
        // content: dedupe is by identity, both must apply.
        client
            .append_candidate(&transfer, &attempt, CandidateLane::Answer, &candidate(7))
            .await
            .unwrap();
        client
            .append_candidate(&transfer, &attempt, CandidateLane::Answer, &candidate(7))
            .await
            .unwrap();

        let _exchange = CandidateExchange::start(
            client.clone(),
            transfer.clone(),
            attempt.clone(),
            CandidateLane::Offer,
            transport.clone(),
        )
        .await
        .unwrap();
        settle().await;
        assert_eq!(transport.applied_candidates().len(), 2);

        // A later addition applies too.
        client
            .append_candidate(&transfer, &attempt, CandidateLane::Answer, &candidate(8))
            .await
            .unwrap();
        settle().await;
        assert_eq!(transport.applied_candidates().len(), 3);
    }

    #[tokio::test]
    async fn stopped_exchange_processes_nothing() {
        let client = SignalingClient::new(Arc::new(MemoryStore::new()));
        let transfer = DocumentId::from("t1");
        let attempt = DocumentId::from("c1");
        let network = MemoryNetwork::new();
        let transport = network.offering_transport();

        let exchange = CandidateExchange::start(
            client.clone(),
            transfer.clone(),
            attempt.clone(),
            CandidateLane::Offer,
            transport.clone(),
        )
        .await
        .unwrap();
        exchange.stop();
        settle().await;

        client
            .append_candidate(&transfer, &attempt, CandidateLane::Answer, &candidate(1))
            .await
            .unwrap();
        settle().await;
        assert!(transport.applied_candidates().is_empty());
    }
}
