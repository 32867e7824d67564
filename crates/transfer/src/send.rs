//! Hosting a transfer: advertise the file, answer attempts, stream to the
//! first peer that connects, finalize the record.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use zipline_connection::{ChannelState, OwnerNegotiator, TransportFactory};
use zipline_protocol::TransferManifest;
use zipline_signaling::{DocumentId, SignalingClient};

use crate::chunker::ChunkReader;
use crate::error::TransferError;
use crate::progress::TransferEvent;
use crate::sender::SendSession;

/// One advertised file, addressable by its transfer id.
pub struct HostedTransfer {
    client: SignalingClient,
    transfer: DocumentId,
    manifest: TransferManifest,
    path: PathBuf,
    events_tx: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl HostedTransfer {
    /// Publishes the transfer record for `path`. The returned id is the
    /// single value the receiving peer needs.
    pub async fn create(
        client: SignalingClient,
        path: impl Into<PathBuf>,
    ) -> Result<Self, TransferError> {
        let path = path.into();
        let size = tokio::fs::metadata(&path).await?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let transfer = client.create_transfer(&filename, size).await?;
        info!(transfer = %transfer, filename, size, "transfer advertised");
        Ok(Self {
            client,
            transfer,
            manifest: TransferManifest { filename, size },
            path,
            events_tx: None,
        })
    }

    pub fn transfer_id(&self) -> &DocumentId {
        &self.transfer
    }

    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    /// Reports session events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<TransferEvent>) -> Self {
        self.events_tx = Some(tx);
        self
    }

    /// Serves one complete download: waits for a peer, streams the file,
    /// marks the record completed. Concurrent attempts race; the first
    /// open channel wins and the rest are closed.
    pub async fn serve(self, factory: Arc<dyn TransportFactory>) -> Result<(), TransferError> {
        let negotiator =
            OwnerNegotiator::new(self.client.clone(), self.transfer.clone(), factory);
        let connection = negotiator.accept().await?;
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(TransferEvent::StateChanged(ChannelState::Connected));
        }

        let mut reader = ChunkReader::open(&self.path).await?;
        let mut session = SendSession::new(connection.channel.clone()).await?;
        if let Some(tx) = self.events_tx.clone() {
            session = session.with_events(tx);
        }
        let result = session.run(&self.manifest, &mut reader).await;
        connection.transport.close().await;
        result?;

        self.client.mark_completed(&self.transfer).await?;
        info!(transfer = %self.transfer, "transfer record finalized");
        Ok(())
    }
}
