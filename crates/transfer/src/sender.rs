//! Sending side of an open channel: manifest, paced chunk stream, teardown.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use zipline_connection::{ChannelEvent, DataChannel};
use zipline_protocol::{BUFFERED_AMOUNT_LOW_THRESHOLD, ControlMessage, TransferManifest};

use crate::chunker::ChunkReader;
use crate::error::TransferError;
use crate::progress::{TransferEvent, TransferProgress};

/// Streams one file over an open data channel.
///
/// Sequence: manifest as the first text message, wait for the receiver's
/// `download`, then chunks paced against the channel's buffered amount,
/// then wait for `end` and close. The receiver owns completion; the sender
/// never closes before the acknowledgement arrives.
pub struct SendSession {
    channel: Arc<dyn DataChannel>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    low_water: usize,
    events_tx: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl SendSession {
    pub async fn new(channel: Arc<dyn DataChannel>) -> Result<Self, TransferError> {
        let events = channel
            .take_events()
            .await
            .ok_or(TransferError::EventsUnavailable)?;
        Ok(Self {
            channel,
            events,
            low_water: BUFFERED_AMOUNT_LOW_THRESHOLD,
            events_tx: None,
        })
    }

    /// Overrides the pacing threshold.
    pub fn with_low_water(mut self, bytes: usize) -> Self {
        self.low_water = bytes;
        self
    }

    /// Reports session events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        self.events_tx = Some(tx);
        self
    }

    /// Runs the transfer to completion.
    pub async fn run(
        mut self,
        manifest: &TransferManifest,
        reader: &mut ChunkReader,
    ) -> Result<(), TransferError> {
        self.channel.send_text(&manifest.encode()?).await?;
        debug!(filename = %manifest.filename, size = manifest.size, "manifest sent");

        self.await_token(ControlMessage::Download).await?;
        info!(filename = %manifest.filename, size = manifest.size, "download requested, streaming");

        let mut sent: u64 = 0;
        while let Some(chunk) = reader.next_chunk().await? {
            while self.channel.buffered_amount().await > self.low_water {
                self.await_buffer_room().await?;
            }
            sent += chunk.len() as u64;
            self.channel.send_binary(chunk).await?;
            self.emit_progress(sent, manifest.size);
        }
        debug!(sent, "all chunks queued, awaiting acknowledgement");

        self.await_token(ControlMessage::End).await?;
        self.channel.close().await;
        self.emit(TransferEvent::Completed);
        info!(filename = %manifest.filename, sent, "transfer acknowledged");
        Ok(())
    }

    /// Waits for a specific control token, tolerating a repeated
    /// `download` from the receiver.
    async fn await_token(&mut self, want: ControlMessage) -> Result<(), TransferError> {
        loop {
            let Some(event) = self.events.recv().await else {
                return Err(TransferError::ChannelClosed);
            };
            match event {
                ChannelEvent::Text(text) => match ControlMessage::parse(&text) {
                    Some(token) if token == want => return Ok(()),
                    Some(ControlMessage::Download) => {
                        warn!("repeated download request ignored");
                    }
                    Some(ControlMessage::End) => {
                        return Err(TransferError::ProtocolViolation(
                            "end received before download".into(),
                        ));
                    }
                    None => {
                        return Err(TransferError::ProtocolViolation(format!(
                            "unexpected text message: {text}"
                        )));
                    }
                },
                ChannelEvent::Binary(data) => {
                    return Err(TransferError::ProtocolViolation(format!(
                        "unexpected {} binary bytes from receiver",
                        data.len()
                    )));
                }
                ChannelEvent::BufferedAmountLow => {}
                ChannelEvent::Closed => return Err(TransferError::ChannelClosed),
            }
        }
    }

    /// Waits for the buffered-amount-low signal before the next chunk.
    async fn await_buffer_room(&mut self) -> Result<(), TransferError> {
        loop {
            let Some(event) = self.events.recv().await else {
                return Err(TransferError::ChannelClosed);
            };
            match event {
                ChannelEvent::BufferedAmountLow => return Ok(()),
                ChannelEvent::Text(text) => match ControlMessage::parse(&text) {
                    Some(ControlMessage::Download) => {
                        warn!("repeated download request ignored");
                    }
                    _ => {
                        return Err(TransferError::ProtocolViolation(format!(
                            "unexpected text message mid-stream: {text}"
                        )));
                    }
                },
                ChannelEvent::Binary(data) => {
                    return Err(TransferError::ProtocolViolation(format!(
                        "unexpected {} binary bytes from receiver",
                        data.len()
                    )));
                }
                ChannelEvent::Closed => return Err(TransferError::ChannelClosed),
            }
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;
    use zipline_connection::MemoryChannel;
    use zipline_protocol::CHUNK_SIZE;

    fn manifest(size: u64) -> TransferManifest {
        TransferManifest {
            filename: "payload.bin".into(),
            size,
        }
    }

    fn temp_file(dir: &TempDir, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join("payload.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    #[tokio::test]
    async fn streams_manifest_chunks_and_closes_on_end() {
        let dir = TempDir::new().unwrap();
        let data = vec![42u8; 17000];
        let path = temp_file(&dir, &data);

        let (tx, rx) = MemoryChannel::pair(BUFFERED_AMOUNT_LOW_THRESHOLD);
        let mut peer = rx.take_events().await.unwrap();

        let session = SendSession::new(tx).await.unwrap();
        let run = tokio::spawn(async move {
            let mut reader = ChunkReader::open(&path).await.unwrap();
            session.run(&manifest(17000), &mut reader).await
        });

        match peer.recv().await.unwrap() {
            ChannelEvent::Text(text) => {
                let m = TransferManifest::decode(&text).unwrap();
                assert_eq!(m.size, 17000);
            }
            other => panic!("expected manifest, got {other:?}"),
        }
        rx.send_text(ControlMessage::Download.as_token())
            .await
            .unwrap();

        let mut sizes = Vec::new();
        let mut total = 0usize;
        while total < 17000 {
            match peer.recv().await.unwrap() {
                ChannelEvent::Binary(chunk) => {
                    sizes.push(chunk.len());
                    total += chunk.len();
                }
                other => panic!("expected chunk, got {other:?}"),
            }
        }
        assert_eq!(sizes, vec![CHUNK_SIZE, CHUNK_SIZE, 17000 - 2 * CHUNK_SIZE]);

        rx.send_text(ControlMessage::End.as_token()).await.unwrap();
        run.await.unwrap().unwrap();
        match peer.recv().await.unwrap() {
            ChannelEvent::Closed => {}
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn paces_against_buffered_amount() {
        let dir = TempDir::new().unwrap();
        let data = vec![9u8; 10000];
        let path = temp_file(&dir, &data);

        let (tx, rx) = MemoryChannel::pair(10);
        let mut peer = rx.take_events().await.unwrap();

        tx.hold_outgoing(true);
        let sender_channel = tx.clone();
        let session = SendSession::new(sender_channel).await.unwrap().with_low_water(10);
        let run = tokio::spawn(async move {
            let mut reader = ChunkReader::open(&path).await.unwrap();
            session.run(&manifest(10000), &mut reader).await
        });

        // Manifest is held too; release it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.drain();
        match peer.recv().await.unwrap() {
            ChannelEvent::Text(_) => {}
            other => panic!("expected manifest, got {other:?}"),
        }
        rx.send_text(ControlMessage::Download.as_token())
            .await
            .unwrap();

        // First chunk queues and exceeds the threshold; the second must not
        // be sent until the buffer drains.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tx.buffered_amount().await, CHUNK_SIZE);

        tx.drain();
        match peer.recv().await.unwrap() {
            ChannelEvent::Binary(chunk) => assert_eq!(chunk.len(), CHUNK_SIZE),
            other => panic!("expected first chunk, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.drain();
        match peer.recv().await.unwrap() {
            ChannelEvent::Binary(chunk) => assert_eq!(chunk.len(), 10000 - CHUNK_SIZE),
            other => panic!("expected second chunk, got {other:?}"),
        }

        rx.send_text(ControlMessage::End.as_token()).await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn repeated_download_is_tolerated() {
        let dir = TempDir::new().unwrap();
        let data = vec![1u8; 100];
        let path = temp_file(&dir, &data);

        let (tx, rx) = MemoryChannel::pair(BUFFERED_AMOUNT_LOW_THRESHOLD);
        let mut peer = rx.take_events().await.unwrap();

        let session = SendSession::new(tx).await.unwrap();
        let run = tokio::spawn(async move {
            let mut reader = ChunkReader::open(&path).await.unwrap();
            session.run(&manifest(100), &mut reader).await
        });

        let _ = peer.recv().await.unwrap(); // manifest
        rx.send_text("download").await.unwrap();
        rx.send_text("download").await.unwrap();

        let mut total = 0usize;
        while total < 100 {
            if let ChannelEvent::Binary(chunk) = peer.recv().await.unwrap() {
                total += chunk.len();
            }
        }
        assert_eq!(total, 100);

        rx.send_text("end").await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn binary_from_receiver_is_a_violation() {
        let dir = TempDir::new().unwrap();
        let path = temp_file(&dir, &[5u8; 10]);

        let (tx, rx) = MemoryChannel::pair(BUFFERED_AMOUNT_LOW_THRESHOLD);
        let mut peer = rx.take_events().await.unwrap();

        let session = SendSession::new(tx).await.unwrap();
        let run = tokio::spawn(async move {
            let mut reader = ChunkReader::open(&path).await.unwrap();
            session.run(&manifest(10), &mut reader).await
        });

        let _ = peer.recv().await.unwrap(); // manifest
        rx.send_text("download").await.unwrap();
        let _ = peer.recv().await.unwrap(); // the single chunk
        rx.send_binary(Bytes::from_static(b"nope")).await.unwrap();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn close_before_download_fails() {
        let dir = TempDir::new().unwrap();
        let path = temp_file(&dir, &[5u8; 10]);

        let (tx, rx) = MemoryChannel::pair(BUFFERED_AMOUNT_LOW_THRESHOLD);
        let session = SendSession::new(tx).await.unwrap();
        let run = tokio::spawn(async move {
            let mut reader = ChunkReader::open(&path).await.unwrap();
            session.run(&manifest(10), &mut reader).await
        });

        rx.close().await;
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::ChannelClosed));
    }
}
