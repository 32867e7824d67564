//! Receiving side of an open channel: request, accumulate, acknowledge.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{info, warn};

use zipline_connection::{ChannelEvent, DataChannel};
use zipline_protocol::{ControlMessage, TransferManifest};

use crate::error::TransferError;
use crate::progress::{TransferEvent, TransferProgress};

/// The fully received payload.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub filename: String,
    pub bytes: Bytes,
}

/// Drives the receiving half of a transfer on an open data channel.
///
/// The first text message must be the manifest; `download` is sent exactly
/// once in response. Chunks accumulate until the byte count matches the
/// manifest, at which point the receiver acknowledges with `end` and
/// closes the channel. More bytes than declared is a protocol violation.
pub struct ReceiveSession {
    channel: Arc<dyn DataChannel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    events_tx: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl ReceiveSession {
    pub async fn new(channel: Arc<dyn DataChannel>) -> Result<Self, TransferError> {
        let events = channel
            .take_events()
            .await
            .ok_or(TransferError::EventsUnavailable)?;
        Ok(Self {
            channel,
            events,
            events_tx: None,
        })
    }

    /// Reports session events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        self.events_tx = Some(tx);
        self
    }

    /// Runs the transfer to completion, returning the payload.
    pub async fn run(mut self) -> Result<ReceivedFile, TransferError> {
        let mut manifest: Option<TransferManifest> = None;
        let mut received = BytesMut::new();

        loop {
            let Some(event) = self.events.recv().await else {
                return Err(TransferError::ChannelClosed);
            };
            match event {
                ChannelEvent::Text(text) => {
                    if manifest.is_some() {
                        warn!(text, "unexpected text after manifest ignored");
                        continue;
                    }
                    let parsed = TransferManifest::decode(&text).map_err(|e| {
                        TransferError::ProtocolViolation(format!("malformed manifest: {e}"))
                    })?;
                    info!(filename = %parsed.filename, size = parsed.size, "manifest received, requesting download");
                    self.emit(TransferEvent::ManifestReceived(parsed.clone()));
                    self.channel
                        .send_text(ControlMessage::Download.as_token())
                        .await?;
                    if parsed.size == 0 {
                        return self.finish(parsed, received).await;
                    }
                    manifest = Some(parsed);
                }
                ChannelEvent::Binary(chunk) => {
                    let Some(m) = manifest.as_ref() else {
                        warn!(len = chunk.len(), "chunk before manifest ignored");
                        continue;
                    };
                    received.extend_from_slice(&chunk);
                    let got = received.len() as u64;
                    if got > m.size {
                        return Err(TransferError::ProtocolViolation(format!(
                            "received {got} bytes, manifest declared {}",
                            m.size
                        )));
                    }
                    self.emit_progress(got, m.size);
                    if got == m.size {
                        let m = m.clone();
                        return self.finish(m, received).await;
                    }
                }
                ChannelEvent::BufferedAmountLow => {}
                ChannelEvent::Closed => return Err(TransferError::ChannelClosed),
            }
        }
    }

    /// Completion is receiver-initiated: acknowledge, then close.
    async fn finish(
        &self,
        manifest: TransferManifest,
        received: BytesMut,
    ) -> Result<ReceivedFile, TransferError> {
        self.channel
            .send_text(ControlMessage::End.as_token())
            .await?;
        self.channel.close().await;
        self.emit(TransferEvent::Completed);
        info!(filename = %manifest.filename, size = manifest.size, "transfer received");
        Ok(ReceivedFile {
            filename: manifest.filename,
            bytes: received.freeze(),
        })
    }

    fn emit_progress(&self, transferred: u64, total: u64) {
        self.emit(TransferEvent::Progress(TransferProgress::new(
            transferred,
            total,
        )));
    }

    fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(event);
        }
    }
}
