//! In-process transport used by tests: the full [`PeerTransport`] /
//! [`DataChannel`] surface without sockets.
//!
//! Descriptions are small JSON blobs carrying a pairing token. The
//! answering transport registers under the offer's token when the offer is
//! applied; the pair goes live the moment the offerer applies the matching
//! answer, emitting `ChannelOpen` on both sides just like a real
//! connection would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use zipline_protocol::{BUFFERED_AMOUNT_LOW_THRESHOLD, IceCandidate, SessionDescription};

use crate::transport::{
    ChannelEvent, ChannelState, DataChannel, PeerTransport, TransportError, TransportEvent,
    TransportFactory,
};

type Registry = Mutex<HashMap<String, Arc<MemoryTransport>>>;

/// Pairs offering and answering transports by token.
pub struct MemoryNetwork {
    answerers: Arc<Registry>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            answerers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A transport that will create the offer side of a pair.
    pub fn offering_transport(&self) -> Arc<MemoryTransport> {
        MemoryTransport::new(Role::Offering, self.answerers.clone())
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for MemoryNetwork {
    async fn answering_transport(&self) -> Result<Arc<dyn PeerTransport>, TransportError> {
        Ok(MemoryTransport::new(Role::Answering, self.answerers.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Offering,
    Answering,
}

struct TransportInner {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_applications: usize,
    applied_candidates: Vec<IceCandidate>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    closed: bool,
    token: Option<String>,
    channel: Option<Arc<MemoryChannel>>,
}

/// One side of an in-process pair.
pub struct MemoryTransport {
    role: Role,
    answerers: Arc<Registry>,
    this: Weak<MemoryTransport>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    inner: Mutex<TransportInner>,
}

impl MemoryTransport {
    fn new(role: Role, answerers: Arc<Registry>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|this| Self {
            role,
            answerers,
            this: this.clone(),
            events_tx,
            inner: Mutex::new(TransportInner {
                local_description: None,
                remote_description: None,
                remote_applications: 0,
                applied_candidates: Vec::new(),
                events_rx: Some(events_rx),
                closed: false,
                token: None,
                channel: None,
            }),
        })
    }

    /// Candidates applied so far, in arrival order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().unwrap().applied_candidates.clone()
    }

    /// How many times a remote description has been applied.
    pub fn remote_applications(&self) -> usize {
        self.inner.lock().unwrap().remote_applications
    }

    /// The channel this side got on open, if the pair is live.
    pub fn channel(&self) -> Option<Arc<MemoryChannel>> {
        self.inner.lock().unwrap().channel.clone()
    }

    fn token(&self) -> Option<String> {
        self.inner.lock().unwrap().token.clone()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    fn description(kind: &str, token: &str) -> SessionDescription {
        SessionDescription(json!({"type": kind, "sdp": format!("memory:{token}")}))
    }

    fn token_of(desc: &SessionDescription) -> Result<String, TransportError> {
        desc.0
            .get("sdp")
            .and_then(|v| v.as_str())
            .and_then(|s| s.strip_prefix("memory:"))
            .map(str::to_string)
            .ok_or_else(|| TransportError::InvalidDescription(desc.0.to_string()))
    }

    fn go_live(&self, peer: &Arc<MemoryTransport>) {
        let (near, far) = MemoryChannel::pair(BUFFERED_AMOUNT_LOW_THRESHOLD);
        self.inner.lock().unwrap().channel = Some(near.clone());
        peer.inner.lock().unwrap().channel = Some(far.clone());
        self.emit(TransportEvent::StateChanged(ChannelState::Connected));
        peer.emit(TransportEvent::StateChanged(ChannelState::Connected));
        self.emit(TransportEvent::ChannelOpen(near));
        peer.emit(TransportEvent::ChannelOpen(far));
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.role != Role::Offering {
            return Err(TransportError::Failure(
                "answering transport cannot offer".into(),
            ));
        }
        let token = uuid::Uuid::new_v4().to_string();
        let offer = Self::description("offer", &token);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.token = Some(token.clone());
            inner.local_description = Some(offer.clone());
        }
        self.emit(TransportEvent::LocalCandidate(IceCandidate(json!({
            "candidate": format!("memory host {token}")
        }))));
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.role != Role::Answering {
            return Err(TransportError::Failure(
                "offering transport cannot answer".into(),
            ));
        }
        let token = self
            .token()
            .ok_or_else(|| TransportError::InvalidDescription("no remote offer applied".into()))?;
        let answer = Self::description("answer", &token);
        self.inner.lock().unwrap().local_description = Some(answer.clone());
        self.emit(TransportEvent::LocalCandidate(IceCandidate(json!({
            "candidate": format!("memory srflx {token}")
        }))));
        Ok(answer)
    }

    async fn apply_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let token = Self::token_of(&desc)?;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.remote_description = Some(desc);
            inner.remote_applications += 1;
            if self.role == Role::Answering {
                inner.token = Some(token.clone());
            }
        }
        match self.role {
            Role::Answering => {
                if let Some(this) = self.this.upgrade() {
                    self.answerers.lock().unwrap().insert(token, this);
                }
                Ok(())
            }
            Role::Offering => {
                let peer = self.answerers.lock().unwrap().get(&token).cloned();
                let peer = peer.ok_or_else(|| {
                    TransportError::InvalidDescription(format!("no answerer for token {token}"))
                })?;
                // A peer that closed between answering and now must not
                // hand out a half-dead channel.
                if peer.inner.lock().unwrap().closed {
                    return Err(TransportError::ChannelClosed);
                }
                self.go_live(&peer);
                Ok(())
            }
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.inner.lock().unwrap().remote_description.is_some()
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(TransportError::ChannelClosed);
        }
        inner.applied_candidates.push(candidate);
        Ok(())
    }

    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner.lock().unwrap().events_rx.take()
    }

    async fn close(&self) {
        let (channel, token) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (inner.channel.take(), inner.token.take())
        };
        // A closed answerer must not be paired with a late answer.
        if self.role == Role::Answering {
            if let Some(token) = token {
                self.answerers.lock().unwrap().remove(&token);
            }
        }
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.emit(TransportEvent::StateChanged(ChannelState::Closed));
    }
}

struct ChannelInner {
    events_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    closed: bool,
    hold: bool,
    held: Vec<ChannelEvent>,
    buffered: usize,
}

/// One endpoint of an in-process reliable ordered channel.
///
/// By default sends deliver immediately and `buffered_amount` stays zero.
/// Tests exercising the paced send loop flip
/// [`hold_outgoing`](Self::hold_outgoing) on: sends then queue locally,
/// `buffered_amount` grows, and [`drain`](Self::drain) releases everything
/// and fires `BufferedAmountLow` if the queue crossed back under the
/// threshold.
pub struct MemoryChannel {
    threshold: usize,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    peer_tx: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
    inner: Mutex<ChannelInner>,
}

impl MemoryChannel {
    /// A linked pair sharing one low-water threshold.
    pub fn pair(threshold: usize) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let endpoint = |events_tx, peer_tx, events_rx| {
            Arc::new(Self {
                threshold,
                events_tx,
                peer_tx: Mutex::new(Some(peer_tx)),
                inner: Mutex::new(ChannelInner {
                    events_rx: Some(events_rx),
                    closed: false,
                    hold: false,
                    held: Vec::new(),
                    buffered: 0,
                }),
            })
        };
        let a = endpoint(a_tx.clone(), b_tx.clone(), a_rx);
        let b = endpoint(b_tx, a_tx, b_rx);
        (a, b)
    }

    /// Queue outgoing messages instead of delivering them.
    pub fn hold_outgoing(&self, hold: bool) {
        self.inner.lock().unwrap().hold = hold;
    }

    /// Delivers everything held and signals the low-water crossing.
    pub fn drain(&self) {
        let (held, crossed) = {
            let mut inner = self.inner.lock().unwrap();
            let was = inner.buffered;
            inner.buffered = 0;
            let held = std::mem::take(&mut inner.held);
            (held, was > self.threshold)
        };
        let peer = self.peer_tx.lock().unwrap().clone();
        if let Some(peer) = peer {
            for event in held {
                let _ = peer.send(event);
            }
        }
        if crossed {
            let _ = self.events_tx.send(ChannelEvent::BufferedAmountLow);
        }
    }

    fn deliver(&self, event: ChannelEvent, len: usize) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(TransportError::ChannelClosed);
        }
        if inner.hold {
            inner.buffered += len;
            inner.held.push(event);
            return Ok(());
        }
        drop(inner);
        let peer = self.peer_tx.lock().unwrap().clone();
        match peer {
            Some(peer) => peer.send(event).map_err(|_| TransportError::ChannelClosed),
            None => Err(TransportError::ChannelClosed),
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.deliver(ChannelEvent::Text(text.to_string()), text.len())
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        let len = data.len();
        self.deliver(ChannelEvent::Binary(data), len)
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.lock().unwrap().buffered
    }

    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.inner.lock().unwrap().events_rx.take()
    }

    async fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        if let Some(peer) = self.peer_tx.lock().unwrap().take() {
            let _ = peer.send(ChannelEvent::Closed);
        }
        let _ = self.events_tx.send(ChannelEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_channel(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Arc<dyn DataChannel> {
        loop {
            match rx.recv().await.expect("event stream ended") {
                TransportEvent::ChannelOpen(channel) => return channel,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn offer_answer_pair_goes_live() {
        let network = MemoryNetwork::new();
        let offerer = network.offering_transport();
        let answerer = network.answering_transport().await.unwrap();

        let mut offer_events = offerer.take_events().await.unwrap();
        let mut answer_events = answerer.take_events().await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        answerer.apply_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        offerer.apply_remote_description(answer).await.unwrap();

        let near = wait_for_channel(&mut offer_events).await;
        let far = wait_for_channel(&mut answer_events).await;

        let mut far_rx = far.take_events().await.unwrap();
        near.send_text("ping").await.unwrap();
        match far_rx.recv().await.unwrap() {
            ChannelEvent::Text(text) => assert_eq!(text, "ping"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn answer_without_offer_is_rejected() {
        let network = MemoryNetwork::new();
        let answerer = network.answering_transport().await.unwrap();
        assert!(answerer.create_answer().await.is_err());
    }

    #[tokio::test]
    async fn answer_for_unknown_token_is_rejected() {
        let network = MemoryNetwork::new();
        let offerer = network.offering_transport();
        offerer.create_offer().await.unwrap();
        let stray = MemoryTransport::description("answer", "nonexistent");
        assert!(offerer.apply_remote_description(stray).await.is_err());
    }

    #[tokio::test]
    async fn answer_from_a_closed_answerer_is_rejected() {
        let network = MemoryNetwork::new();
        let offerer = network.offering_transport();
        let answerer = network.answering_transport().await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        answerer.apply_remote_description(offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();

        // The answerer goes away before the offerer sees the answer. The
        // pair must not go live on a dead peer.
        answerer.close().await;
        let err = offerer.apply_remote_description(answer).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::InvalidDescription(_) | TransportError::ChannelClosed
        ));
        assert!(offerer.channel().is_none());
    }

    #[tokio::test]
    async fn events_can_only_be_taken_once() {
        let network = MemoryNetwork::new();
        let transport = network.offering_transport();
        assert!(transport.take_events().await.is_some());
        assert!(transport.take_events().await.is_none());
    }

    #[tokio::test]
    async fn held_sends_grow_buffered_amount_and_drain_signals() {
        let (a, b) = MemoryChannel::pair(10);
        let mut a_rx = a.take_events().await.unwrap();
        let mut b_rx = b.take_events().await.unwrap();

        a.hold_outgoing(true);
        a.send_binary(Bytes::from(vec![0u8; 32])).await.unwrap();
        assert_eq!(a.buffered_amount().await, 32);
        assert!(b_rx.try_recv().is_err());

        a.drain();
        assert_eq!(a.buffered_amount().await, 0);
        match b_rx.recv().await.unwrap() {
            ChannelEvent::Binary(data) => assert_eq!(data.len(), 32),
            other => panic!("unexpected: {other:?}"),
        }
        match a_rx.recv().await.unwrap() {
            ChannelEvent::BufferedAmountLow => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_reaches_the_peer() {
        let (a, b) = MemoryChannel::pair(10);
        let mut b_rx = b.take_events().await.unwrap();
        a.close().await;
        match b_rx.recv().await.unwrap() {
            ChannelEvent::Closed => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert!(a.send_text("late").await.is_err());
    }
}
