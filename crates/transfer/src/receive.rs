//! Joining an advertised transfer and downloading the payload.

use std::sync::Arc;

use tokio::sync::mpsc;

use zipline_connection::{ChannelState, JoinOptions, PeerTransport, join};
use zipline_signaling::{DocumentId, SignalingClient};

use crate::error::TransferError;
use crate::progress::TransferEvent;
use crate::receiver::{ReceiveSession, ReceivedFile};

/// Joins a transfer by id and downloads it to memory.
///
/// Negotiates a connection on `transport`, runs the receive protocol and
/// tears the transport down afterwards regardless of outcome. Session
/// events are reported on `events` when supplied.
pub async fn join_transfer(
    client: &SignalingClient,
    transport: Arc<dyn PeerTransport>,
    transfer: &DocumentId,
    options: JoinOptions,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
) -> Result<ReceivedFile, TransferError> {
    let connection = join(client, transport, transfer, options).await?;
    if let Some(tx) = &events {
        let _ = tx.send(TransferEvent::StateChanged(ChannelState::Connected));
    }
    let mut session = ReceiveSession::new(connection.channel.clone()).await?;
    if let Some(tx) = events {
        session = session.with_events(tx);
    }
    let result = session.run().await;
    connection.transport.close().await;
    result
}
