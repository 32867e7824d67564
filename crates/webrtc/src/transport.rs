//! Peer transport over a WebRTC connection.
//!
//! The joiner builds an offering transport, which creates the data channel
//! up front so it rides in the offer SDP. The transfer owner builds an
//! answering transport per attempt and receives the channel through the
//! `on_data_channel` callback. Candidates trickle: they surface as
//! [`TransportEvent::LocalCandidate`] the moment the ICE agent finds them,
//! independent of description exchange.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use zipline_connection::{
    ChannelEvent, ChannelState, DataChannel, PeerTransport, TransportError, TransportEvent,
    TransportFactory,
};
use zipline_protocol::{
    BUFFERED_AMOUNT_LOW_THRESHOLD, DATA_CHANNEL_LABEL, IceCandidate, SessionDescription,
};

/// ICE configuration shared by every transport this process creates.
#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    /// STUN/TURN server URLs.
    pub ice_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

fn failure(e: webrtc::Error) -> TransportError {
    TransportError::Failure(e.to_string())
}

async fn new_peer_connection(
    config: &WebRtcConfig,
) -> Result<Arc<RTCPeerConnection>, TransportError> {
    let mut media = MediaEngine::default();
    let registry =
        register_default_interceptors(Registry::new(), &mut media).map_err(failure)?;
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build();

    let pc = api
        .new_peer_connection(RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        })
        .await
        .map_err(failure)?;
    Ok(Arc::new(pc))
}

/// One WebRTC connection attempt.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl WebRtcTransport {
    /// Builds the joiner's transport: the data channel is created before
    /// the offer so its description is part of it.
    pub async fn offering(config: &WebRtcConfig) -> Result<Arc<Self>, TransportError> {
        let (this, _) = Self::build(config).await?;
        let dc = this
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(failure)?;
        attach_channel(this.events_tx.clone(), dc).await;
        Ok(this)
    }

    /// Builds the owner's transport: the channel arrives from the remote
    /// offer via `on_data_channel`.
    pub async fn answering(config: &WebRtcConfig) -> Result<Arc<Self>, TransportError> {
        let (this, events_tx) = Self::build(config).await?;
        this.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events_tx = events_tx.clone();
                Box::pin(async move {
                    if dc.label() != DATA_CHANNEL_LABEL {
                        warn!(label = dc.label(), "unexpected data channel label");
                    }
                    attach_channel(events_tx, dc).await;
                })
            }));
        Ok(this)
    }

    async fn build(
        config: &WebRtcConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedSender<TransportEvent>), TransportError> {
        let pc = new_peer_connection(config).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        {
            let events_tx = events_tx.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events_tx = events_tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => match serde_json::to_value(&init) {
                            Ok(blob) => {
                                let _ = events_tx
                                    .send(TransportEvent::LocalCandidate(IceCandidate(blob)));
                            }
                            Err(e) => warn!(error = %e, "failed to serialize candidate"),
                        },
                        Err(e) => warn!(error = %e, "failed to convert candidate"),
                    }
                })
            }));
        }

        {
            let events_tx = events_tx.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events_tx = events_tx.clone();
                Box::pin(async move {
                    let mapped = match state {
                        RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                            Some(ChannelState::Connecting)
                        }
                        RTCPeerConnectionState::Connected => Some(ChannelState::Connected),
                        RTCPeerConnectionState::Disconnected => Some(ChannelState::Disconnected),
                        RTCPeerConnectionState::Failed => Some(ChannelState::Failed),
                        RTCPeerConnectionState::Closed => Some(ChannelState::Closed),
                        _ => None,
                    };
                    if let Some(state) = mapped {
                        debug!(state = %state, "peer connection state");
                        let _ = events_tx.send(TransportEvent::StateChanged(state));
                    }
                })
            }));
        }

        let this = Arc::new(Self {
            pc,
            events_tx: events_tx.clone(),
            events_rx: Mutex::new(Some(events_rx)),
        });
        Ok((this, events_tx))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(failure)?;
        let blob = serde_json::to_value(&offer)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(failure)?;
        Ok(SessionDescription(blob))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(failure)?;
        let blob = serde_json::to_value(&answer)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(failure)?;
        Ok(SessionDescription(blob))
    }

    async fn apply_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        let desc: RTCSessionDescription = serde_json::from_value(desc.0)
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc.set_remote_description(desc).await.map_err(failure)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.0)
            .map_err(|e| TransportError::InvalidCandidate(e.to_string()))?;
        self.pc.add_ice_candidate(init).await.map_err(failure)
    }

    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!(error = %e, "peer connection close");
        }
    }
}

/// Registers channel callbacks and announces the channel on open.
async fn attach_channel(
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    dc: Arc<RTCDataChannel>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let channel = Arc::new(WebRtcChannel {
        dc: dc.clone(),
        events_rx: Mutex::new(Some(rx)),
    });

    dc.set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
        .await;
    {
        let tx = tx.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::BufferedAmountLow);
            })
        }))
        .await;
    }
    {
        let tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                let event = if msg.is_string {
                    ChannelEvent::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    ChannelEvent::Binary(msg.data)
                };
                let _ = tx.send(event);
            })
        }));
    }
    {
        let tx = tx.clone();
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(ChannelEvent::Closed);
            })
        }));
    }
    dc.on_open(Box::new(move || {
        let transport_tx = transport_tx.clone();
        let channel = channel.clone();
        Box::pin(async move {
            debug!("data channel open");
            let _ = transport_tx.send(TransportEvent::ChannelOpen(channel));
        })
    }));
}

/// The open channel behind [`DataChannel`].
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    async fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.dc
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(failure)
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), TransportError> {
        self.dc.send(&data).await.map(|_| ()).map_err(failure)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(error = %e, "data channel close");
        }
    }
}

/// Produces a fresh answering transport per connection attempt.
pub struct WebRtcFactory {
    config: WebRtcConfig,
}

impl WebRtcFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn answering_transport(&self) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = WebRtcTransport::answering(&self.config).await?;
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests exercise local SDP plumbing only; no network traffic and
    // no ICE connectivity is involved.

    #[tokio::test]
    async fn offering_transport_produces_an_offer() {
        let transport = WebRtcTransport::offering(&WebRtcConfig::default())
            .await
            .unwrap();
        let offer = transport.create_offer().await.unwrap();
        assert_eq!(offer.0.get("type").and_then(|v| v.as_str()), Some("offer"));
        assert!(offer.0.get("sdp").is_some());
        transport.close().await;
    }

    #[tokio::test]
    async fn answering_transport_answers_a_real_offer() {
        let config = WebRtcConfig::default();
        let offerer = WebRtcTransport::offering(&config).await.unwrap();
        let offer = offerer.create_offer().await.unwrap();

        let answerer = WebRtcTransport::answering(&config).await.unwrap();
        assert!(!answerer.has_remote_description().await);
        answerer.apply_remote_description(offer).await.unwrap();
        assert!(answerer.has_remote_description().await);

        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(
            answer.0.get("type").and_then(|v| v.as_str()),
            Some("answer")
        );

        offerer.close().await;
        answerer.close().await;
    }

    #[tokio::test]
    async fn answer_without_remote_offer_fails() {
        let transport = WebRtcTransport::answering(&WebRtcConfig::default())
            .await
            .unwrap();
        assert!(transport.create_answer().await.is_err());
        transport.close().await;
    }

    #[tokio::test]
    async fn malformed_blobs_are_rejected() {
        let transport = WebRtcTransport::offering(&WebRtcConfig::default())
            .await
            .unwrap();

        let err = transport
            .apply_remote_description(SessionDescription(serde_json::json!("not an sdp")))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidDescription(_)));

        let err = transport
            .add_remote_candidate(IceCandidate(serde_json::json!(42)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidCandidate(_)));

        transport.close().await;
    }

    #[tokio::test]
    async fn events_can_only_be_taken_once() {
        let transport = WebRtcTransport::offering(&WebRtcConfig::default())
            .await
            .unwrap();
        assert!(transport.take_events().await.is_some());
        assert!(transport.take_events().await.is_none());
        transport.close().await;
    }
}
