//! Connection tasks bridging sockets to the broker.
//!
//! Each accepted connection becomes two tasks: a read loop that parses
//! lines and forwards commands over the broker channel, and a writer that
//! drains the session's bounded outbound queue. Parse failures are answered
//! with an `error:` line directly from the read loop; only well-formed
//! commands reach the broker. An oversized line ends the connection.

use std::sync::Arc;

use bytes::Bytes;
use contextd_core::registry::SessionId;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::broker::{BrokerCommand, BrokerHandle};
use crate::protocol::command::{error_line, parse_provider_line, parse_subscriber_line};
use crate::protocol::error::{MAX_LINE_LENGTH, ProtocolError};
use crate::protocol::outbox::{frame, ChannelSink};

/// Drives one subscriber session until the peer goes away.
///
/// Holds the admission permit for the connection's lifetime.
pub async fn run_subscriber(
    stream: UnixStream,
    permit: OwnedSemaphorePermit,
    session: SessionId,
    broker: BrokerHandle,
    queue_capacity: usize,
) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(queue_capacity);
    let writer = tokio::spawn(write_lines(write_half, rx, session));

    broker
        .send(BrokerCommand::SessionOpened {
            session,
            sink: Arc::new(ChannelSink::new(tx.clone())),
        })
        .await;

    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(read) = lines.next().await {
        match read {
            Ok(line) => {
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() {
                    continue;
                }
                match parse_subscriber_line(line) {
                    Ok(command) => {
                        broker
                            .send(BrokerCommand::SessionRequest { session, command })
                            .await;
                    },
                    Err(err) if err.is_recoverable() => {
                        debug!(session, %err, "subscriber command rejected");
                        if tx.try_send(frame(&error_line(&err.to_string()))).is_err() {
                            debug!(session, "error reply dropped");
                        }
                    },
                    Err(err) => {
                        warn!(session, %err, "closing session");
                        break;
                    },
                }
            },
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(session, err = %ProtocolError::line_too_long(), "closing session");
                break;
            },
            Err(LinesCodecError::Io(err)) => {
                debug!(session, %err, "session read failed");
                break;
            },
        }
    }

    broker.send(BrokerCommand::SessionClosed { session }).await;
    drop(tx);
    let _ = writer.await;
    drop(permit);
}

/// Drives one provider connection until the peer goes away.
///
/// Disconnect, orderly or not, ends in `ProviderClosed`, which the broker
/// treats as an atomic `unset` of every key the provider owned.
pub async fn run_provider(
    stream: UnixStream,
    permit: OwnedSemaphorePermit,
    conn: SessionId,
    broker: BrokerHandle,
    queue_capacity: usize,
) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(queue_capacity);
    let writer = tokio::spawn(write_lines(write_half, rx, conn));

    broker
        .send(BrokerCommand::ProviderOpened {
            conn,
            sink: Arc::new(ChannelSink::new(tx.clone())),
        })
        .await;

    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(read) = lines.next().await {
        match read {
            Ok(line) => {
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() {
                    continue;
                }
                match parse_provider_line(line) {
                    Ok(command) => {
                        broker
                            .send(BrokerCommand::ProviderRequest { conn, command })
                            .await;
                    },
                    Err(err) if err.is_recoverable() => {
                        debug!(conn, %err, "provider command rejected");
                        if tx.try_send(frame(&error_line(&err.to_string()))).is_err() {
                            debug!(conn, "error reply dropped");
                        }
                    },
                    Err(err) => {
                        warn!(conn, %err, "closing provider");
                        break;
                    },
                }
            },
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(conn, err = %ProtocolError::line_too_long(), "closing provider");
                break;
            },
            Err(LinesCodecError::Io(err)) => {
                debug!(conn, %err, "provider read failed");
                break;
            },
        }
    }

    broker.send(BrokerCommand::ProviderClosed { conn }).await;
    drop(tx);
    let _ = writer.await;
    drop(permit);
}

/// Writer half: drains the outbound queue onto the socket.
///
/// Exits when the queue closes or a write fails; a failed write drops the
/// receiver, so later broker sends see the session as disconnected.
async fn write_lines(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, id: SessionId) {
    while let Some(payload) = rx.recv().await {
        if let Err(err) = write_half.write_all(&payload).await {
            debug!(id, %err, "write failed; dropping outbound queue");
            break;
        }
    }
}
