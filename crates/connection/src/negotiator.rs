//! Offer/answer sequencing for both roles.
//!
//! The joiner drives [`join`]: create the offer, publish it, wait for the
//! answer and the channel-open signal. The transfer owner runs an
//! [`OwnerNegotiator`]: answer every attempt that appears under the
//! transfer, on a fresh transport each, and hand back whichever connects
//! first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zipline_protocol::DEFAULT_NEGOTIATION_TIMEOUT;
use zipline_signaling::{
    CandidateLane, ChangeKind, CollectionChange, DocumentId, SignalingClient, SignalingError,
};

use crate::candidates::CandidateExchange;
use crate::error::ConnectionError;
use crate::transport::{
    ChannelState, DataChannel, PeerTransport, TransportError, TransportEvent, TransportFactory,
};

/// Where a negotiation currently stands. Diagnostic only; the control flow
/// lives in [`join`] and [`OwnerNegotiator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferCreated,
    AwaitingAnswer,
    AwaitingOffer,
    AnswerCreated,
    Negotiated,
    Connected,
    Failed,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferCreated => "offer-created",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::AwaitingOffer => "awaiting-offer",
            NegotiationState::AnswerCreated => "answer-created",
            NegotiationState::Negotiated => "negotiated",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// A successfully negotiated attempt: the transport kept alive for its
/// lifetime and the open channel the transfer session runs on.
pub struct OpenConnection {
    pub transport: Arc<dyn PeerTransport>,
    pub channel: Arc<dyn DataChannel>,
    pub attempt: DocumentId,
}

impl std::fmt::Debug for OpenConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenConnection")
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Knobs for [`join`].
#[derive(Debug, Clone)]
pub struct JoinOptions {
    /// How long to wait for the channel to open before giving up. The
    /// decision is local; the owner is not informed and keeps the attempt
    /// documents as-is.
    pub timeout: Duration,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_NEGOTIATION_TIMEOUT,
        }
    }
}

/// Joins an advertised transfer as the downloading peer.
///
/// Validates the transfer record, publishes an offer under a fresh attempt
/// id, exchanges candidates, applies the owner's answer when it lands and
/// resolves once the data channel opens. On timeout or transport failure
/// the transport is closed and the attempt abandoned.
pub async fn join(
    client: &SignalingClient,
    transport: Arc<dyn PeerTransport>,
    transfer: &DocumentId,
    options: JoinOptions,
) -> Result<OpenConnection, ConnectionError> {
    let record = client
        .get_transfer(transfer)
        .await?
        .ok_or_else(|| ConnectionError::InvalidTransfer(transfer.to_string()))?;
    if record.completed {
        return Err(ConnectionError::TransferAlreadyCompleted);
    }

    let attempt = DocumentId::generate();
    let mut state = NegotiationState::Idle;
    debug!(transfer = %transfer, attempt = %attempt, filename = %record.filename, "joining transfer");

    let mut events = transport
        .take_events()
        .await
        .ok_or(ConnectionError::EventsUnavailable)?;

    let exchange = CandidateExchange::start(
        client.clone(),
        transfer.clone(),
        attempt.clone(),
        CandidateLane::Offer,
        transport.clone(),
    )
    .await?;

    let result = drive_join(
        client,
        &transport,
        transfer,
        &attempt,
        &options,
        &mut events,
        &exchange,
        &mut state,
    )
    .await;

    exchange.stop();
    match &result {
        Ok(_) => {
            info!(transfer = %transfer, attempt = %attempt, "connection established");
        }
        Err(e) => {
            warn!(transfer = %transfer, attempt = %attempt, state = %state, error = %e, "join failed");
            transport.close().await;
        }
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn drive_join(
    client: &SignalingClient,
    transport: &Arc<dyn PeerTransport>,
    transfer: &DocumentId,
    attempt: &DocumentId,
    options: &JoinOptions,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    exchange: &CandidateExchange,
    state: &mut NegotiationState,
) -> Result<OpenConnection, ConnectionError> {
    let offer = transport.create_offer().await?;
    *state = NegotiationState::OfferCreated;
    client.publish_offer(transfer, attempt, &offer).await?;
    *state = NegotiationState::AwaitingAnswer;

    let mut watch = client.watch_connection(transfer, attempt).await?;
    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                return Err(ConnectionError::Timeout);
            }
            snapshot = watch.recv() => {
                let Some(snapshot) = snapshot else {
                    return Err(ConnectionError::Signaling(SignalingError::Backend(
                        "connection watch ended".into(),
                    )));
                };
                let Some(record) = SignalingClient::connection_record(&snapshot)? else {
                    continue;
                };
                // The snapshot replays on every write, including our own
                // offer; the answer is applied once.
                if let Some(answer) = record.answer {
                    if !transport.has_remote_description().await {
                        debug!(attempt = %attempt, "applying remote answer");
                        transport.apply_remote_description(answer).await?;
                        *state = NegotiationState::Negotiated;
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(ConnectionError::Transport(TransportError::Failure(
                        "transport event stream ended".into(),
                    )));
                };
                match event {
                    TransportEvent::LocalCandidate(candidate) => {
                        exchange.publish_local(candidate);
                    }
                    TransportEvent::StateChanged(ChannelState::Failed) => {
                        *state = NegotiationState::Failed;
                        return Err(ConnectionError::Transport(TransportError::Failure(
                            "connection failed".into(),
                        )));
                    }
                    TransportEvent::StateChanged(ChannelState::Disconnected) => {
                        *state = NegotiationState::Failed;
                        return Err(ConnectionError::Transport(TransportError::Failure(
                            "connection lost during negotiation".into(),
                        )));
                    }
                    TransportEvent::StateChanged(other) => {
                        debug!(attempt = %attempt, state = %other, "transport state");
                    }
                    TransportEvent::ChannelOpen(channel) => {
                        *state = NegotiationState::Connected;
                        return Ok(OpenConnection {
                            transport: transport.clone(),
                            channel,
                            attempt: attempt.clone(),
                        });
                    }
                }
            }
        }
    }
}

struct ActiveAttempt {
    attempt: DocumentId,
    transport: Arc<dyn PeerTransport>,
    cancel: CancellationToken,
}

/// Answers connection attempts for one advertised transfer.
///
/// Every attempt gets its own transport; concurrent attempts negotiate in
/// parallel and the first channel to open wins. Each attempt document is
/// answered at most once, surviving the replay the collection subscription
/// performs on attach.
pub struct OwnerNegotiator {
    client: SignalingClient,
    transfer: DocumentId,
    factory: Arc<dyn TransportFactory>,
    answered: HashSet<DocumentId>,
    active: Vec<ActiveAttempt>,
    open_tx: mpsc::Sender<OpenConnection>,
    open_rx: mpsc::Receiver<OpenConnection>,
}

impl OwnerNegotiator {
    pub fn new(
        client: SignalingClient,
        transfer: DocumentId,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (open_tx, open_rx) = mpsc::channel(4);
        Self {
            client,
            transfer,
            factory,
            answered: HashSet::new(),
            active: Vec::new(),
            open_tx,
            open_rx,
        }
    }

    /// Waits for a peer to connect. Answers every new attempt as it
    /// appears; resolves with the first attempt whose channel opens and
    /// closes the rest. No built-in deadline: callers that want one wrap
    /// this in `tokio::time::timeout`.
    pub async fn accept(mut self) -> Result<OpenConnection, ConnectionError> {
        let mut changes = self.client.watch_connections(&self.transfer).await?;
        debug!(transfer = %self.transfer, state = %NegotiationState::AwaitingOffer, "awaiting connection attempts");
        loop {
            tokio::select! {
                change = changes.recv() => {
                    let Some(change) = change else {
                        return Err(ConnectionError::Signaling(SignalingError::Backend(
                            "connections watch ended".into(),
                        )));
                    };
                    if let Err(e) = self.answer_attempt(&change).await {
                        warn!(transfer = %self.transfer, attempt = %change.id, error = %e, "failed to answer attempt");
                    }
                }
                opened = self.open_rx.recv() => {
                    // Sender half lives in self; never returns None here.
                    let Some(opened) = opened else { continue };
                    info!(transfer = %self.transfer, attempt = %opened.attempt, "attempt connected");
                    self.close_losers(&opened.attempt).await;
                    return Ok(opened);
                }
            }
        }
    }

    /// Answers one attempt if it is new and carries an offer. Returns
    /// whether an answer was published.
    pub async fn answer_attempt(
        &mut self,
        change: &CollectionChange,
    ) -> Result<bool, ConnectionError> {
        if change.kind != ChangeKind::Added {
            return Ok(false);
        }
        if self.answered.contains(&change.id) {
            return Ok(false);
        }
        let record: zipline_signaling::ConnectionRecord =
            match serde_json::from_value(serde_json::Value::Object(change.fields.clone())) {
                Ok(record) => record,
                Err(e) => {
                    warn!(attempt = %change.id, error = %e, "malformed connection record");
                    return Ok(false);
                }
            };
        let Some(offer) = record.offer else {
            debug!(attempt = %change.id, "attempt without offer, ignoring");
            return Ok(false);
        };
        self.answered.insert(change.id.clone());
        debug!(transfer = %self.transfer, attempt = %change.id, "answering attempt");

        let transport = self.factory.answering_transport().await?;
        let mut events = transport
            .take_events()
            .await
            .ok_or(ConnectionError::EventsUnavailable)?;
        let exchange = CandidateExchange::start(
            self.client.clone(),
            self.transfer.clone(),
            change.id.clone(),
            CandidateLane::Answer,
            transport.clone(),
        )
        .await?;

        transport.apply_remote_description(offer).await?;
        let answer = transport.create_answer().await?;
        self.client
            .publish_answer(&self.transfer, &change.id, &answer)
            .await?;
        debug!(transfer = %self.transfer, attempt = %change.id, state = %NegotiationState::AnswerCreated, "answer published");

        let cancel = CancellationToken::new();
        self.active.push(ActiveAttempt {
            attempt: change.id.clone(),
            transport: transport.clone(),
            cancel: cancel.clone(),
        });

        // Per-attempt pump: mirror candidates out, report the open channel
        // in. Ends on cancellation (a sibling won) or terminal state.
        let attempt = change.id.clone();
        let open_tx = self.open_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            TransportEvent::LocalCandidate(candidate) => {
                                exchange.publish_local(candidate);
                            }
                            TransportEvent::StateChanged(ChannelState::Failed)
                            | TransportEvent::StateChanged(ChannelState::Closed) => {
                                debug!(attempt = %attempt, "attempt ended without connecting");
                                break;
                            }
                            TransportEvent::StateChanged(state) => {
                                debug!(attempt = %attempt, state = %state, "attempt state");
                            }
                            TransportEvent::ChannelOpen(channel) => {
                                let _ = open_tx
                                    .send(OpenConnection {
                                        transport: transport.clone(),
                                        channel,
                                        attempt: attempt.clone(),
                                    })
                                    .await;
                                break;
                            }
                        }
                    }
                }
            }
            exchange.stop();
        });

        Ok(true)
    }

    async fn close_losers(&mut self, winner: &DocumentId) {
        for attempt in self.active.drain(..) {
            if &attempt.attempt == winner {
                continue;
            }
            debug!(attempt = %attempt.attempt, "closing losing attempt");
            attempt.cancel.cancel();
            attempt.transport.close().await;
        }
    }
}
