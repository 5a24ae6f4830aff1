//! Per-session outbound queues for pushes and replies.
//!
//! Every session has a bounded channel drained by its own writer task; the
//! broker hands completed lines to [`SessionOutbox`], which delivers them
//! without blocking. A slow subscriber fills its own queue and loses
//! notifications, never stalling recomputation or other sessions. Query
//! replies travel through the same queue as pushes, so per-session output
//! order matches broker processing order.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use contextd_core::registry::SessionId;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Result of a non-blocking line delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrySendResult {
    /// Line was queued for delivery.
    Sent,
    /// The session's outbound queue is full; line dropped.
    BufferFull,
    /// The session's writer is gone; line dropped.
    Disconnected,
}

/// Sender for completed protocol lines to one session.
///
/// Implementations must not block: the broker task calls this while holding
/// the store, so a stalled send would stall every session.
pub trait SessionSink: Send + Sync {
    /// Attempts to queue a newline-terminated frame without blocking.
    fn try_send_line(&self, frame: Bytes) -> TrySendResult;
}

/// Shared handle to a session's sink.
pub type SessionSender = Arc<dyn SessionSink>;

/// [`SessionSink`] over the bounded channel drained by a writer task.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    /// Wraps the sending half of a session's outbound channel.
    #[must_use]
    pub const fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

impl SessionSink for ChannelSink {
    fn try_send_line(&self, frame: Bytes) -> TrySendResult {
        match self.tx.try_send(frame) {
            Ok(()) => TrySendResult::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => TrySendResult::BufferFull,
            Err(mpsc::error::TrySendError::Closed(_)) => TrySendResult::Disconnected,
        }
    }
}

/// Appends the protocol newline and freezes the line for cheap fan-out
/// clones.
#[must_use]
pub fn frame(line: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(line.len() + 1);
    buf.put(line.as_bytes());
    buf.put_u8(b'\n');
    buf.freeze()
}

/// Broker-owned map from session to outbound sink.
///
/// Lives inside the broker task, so no lock: registration and delivery are
/// both serialized on the command loop.
#[derive(Default)]
pub struct SessionOutbox {
    sinks: HashMap<SessionId, SessionSender>,
}

impl SessionOutbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session's sink, replacing any previous one.
    pub fn register(&mut self, session: SessionId, sink: SessionSender) {
        self.sinks.insert(session, sink);
    }

    /// Drops a session's sink; later sends to it are ignored.
    pub fn unregister(&mut self, session: SessionId) {
        self.sinks.remove(&session);
    }

    /// Delivers one frame to one session, dropping it when the queue is
    /// full or the session is gone.
    pub fn send(&self, session: SessionId, frame: Bytes) -> TrySendResult {
        let Some(sink) = self.sinks.get(&session) else {
            debug!(session, "no sink registered; line dropped");
            return TrySendResult::Disconnected;
        };
        let result = sink.try_send_line(frame);
        match result {
            TrySendResult::Sent => {},
            TrySendResult::BufferFull => {
                warn!(session, "outbound queue full; notification dropped");
            },
            TrySendResult::Disconnected => {
                debug!(session, "writer gone; line dropped");
            },
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Mock sink recording delivered frames.
    #[derive(Default)]
    pub(crate) struct MockSessionSink {
        frames: Mutex<Vec<Bytes>>,
        failure_mode: AtomicU8,
    }

    impl MockSessionSink {
        const MODE_DISCONNECTED: u8 = 1;
        const MODE_BUFFER_FULL: u8 = 2;

        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_buffer_full() -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                failure_mode: AtomicU8::new(Self::MODE_BUFFER_FULL),
            }
        }

        pub(crate) fn with_disconnected() -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
                failure_mode: AtomicU8::new(Self::MODE_DISCONNECTED),
            }
        }

        /// Delivered frames decoded to text, trailing newlines stripped.
        pub(crate) fn received_lines(&self) -> Vec<String> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|frame| {
                    String::from_utf8(frame.to_vec())
                        .unwrap()
                        .trim_end_matches('\n')
                        .to_string()
                })
                .collect()
        }
    }

    impl SessionSink for MockSessionSink {
        fn try_send_line(&self, frame: Bytes) -> TrySendResult {
            match self.failure_mode.load(Ordering::Relaxed) {
                Self::MODE_DISCONNECTED => TrySendResult::Disconnected,
                Self::MODE_BUFFER_FULL => TrySendResult::BufferFull,
                _ => {
                    self.frames.lock().unwrap().push(frame);
                    TrySendResult::Sent
                },
            }
        }
    }

    #[test]
    fn frame_appends_newline() {
        assert_eq!(frame("value: Unknown").as_ref(), b"value: Unknown\n");
        assert_eq!(frame("").as_ref(), b"\n");
    }

    #[test]
    fn delivers_to_registered_sink() {
        let mut outbox = SessionOutbox::new();
        let sink = Arc::new(MockSessionSink::new());
        outbox.register(7, sink.clone());

        assert_eq!(outbox.send(7, frame("X = bool:true")), TrySendResult::Sent);
        assert_eq!(sink.received_lines(), vec!["X = bool:true"]);
    }

    #[test]
    fn fans_out_one_clone_per_session() {
        let mut outbox = SessionOutbox::new();
        let first = Arc::new(MockSessionSink::new());
        let second = Arc::new(MockSessionSink::new());
        outbox.register(1, first.clone());
        outbox.register(2, second.clone());

        let line = frame("Session.State = QString:\"normal\"");
        outbox.send(1, line.clone());
        outbox.send(2, line);

        assert_eq!(first.received_lines().len(), 1);
        assert_eq!(second.received_lines().len(), 1);
    }

    #[test]
    fn full_queue_drops_without_removing_registration() {
        let mut outbox = SessionOutbox::new();
        let sink = Arc::new(MockSessionSink::with_buffer_full());
        outbox.register(3, sink);

        assert_eq!(
            outbox.send(3, frame("X = bool:true")),
            TrySendResult::BufferFull
        );
        // still registered: a later send is attempted again
        assert_eq!(
            outbox.send(3, frame("X = bool:false")),
            TrySendResult::BufferFull
        );
    }

    #[test]
    fn unknown_session_reports_disconnected() {
        let outbox = SessionOutbox::new();
        assert_eq!(
            outbox.send(99, frame("X = Unknown")),
            TrySendResult::Disconnected
        );
    }

    #[test]
    fn unregister_stops_delivery() {
        let mut outbox = SessionOutbox::new();
        let sink = Arc::new(MockSessionSink::new());
        outbox.register(4, sink.clone());
        outbox.unregister(4);

        assert_eq!(
            outbox.send(4, frame("X = Unknown")),
            TrySendResult::Disconnected
        );
        assert!(sink.received_lines().is_empty());
    }

    #[test]
    fn disconnected_sink_reports_disconnected() {
        let mut outbox = SessionOutbox::new();
        outbox.register(5, Arc::new(MockSessionSink::with_disconnected()));
        assert_eq!(
            outbox.send(5, frame("X = Unknown")),
            TrySendResult::Disconnected
        );
    }

    #[test]
    fn channel_sink_maps_try_send_errors() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ChannelSink::new(tx);

        assert_eq!(sink.try_send_line(frame("first")), TrySendResult::Sent);
        assert_eq!(sink.try_send_line(frame("second")), TrySendResult::BufferFull);

        assert_eq!(rx.try_recv().unwrap().as_ref(), b"first\n");
        rx.close();
        // drain anything still buffered, then the channel reports closed
        while rx.try_recv().is_ok() {}
        assert_eq!(
            sink.try_send_line(frame("third")),
            TrySendResult::Disconnected
        );
    }
}
