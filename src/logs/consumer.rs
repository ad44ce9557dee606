//! Log consumers and the shared consumer list.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info};

use super::frame::{LogFrame, StreamKind};

/// Receives decoded frames from a session's log producer.
///
/// Delivery is synchronous: the producer waits for `accept` to return before
/// handing the frame to the next consumer, which keeps per-consumer ordering
/// identical to engine ordering.
pub trait LogConsumer: Send + Sync {
    /// Handle one frame.
    fn accept(&self, frame: &LogFrame);
}

impl<F> LogConsumer for F
where
    F: Fn(&LogFrame) + Send + Sync,
{
    fn accept(&self, frame: &LogFrame) {
        self(frame);
    }
}

/// Forwards frames into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelConsumer {
    tx: mpsc::UnboundedSender<LogFrame>,
}

impl ChannelConsumer {
    /// Create a consumer and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogConsumer for ChannelConsumer {
    fn accept(&self, frame: &LogFrame) {
        if self.tx.send(frame.clone()).is_err() {
            debug!("channel consumer receiver dropped; frame discarded");
        }
    }
}

/// Emits every frame as a `tracing` event tagged with the session it came from.
#[derive(Debug, Clone)]
pub struct TracingConsumer {
    session_id: String,
}

impl TracingConsumer {
    /// Consumer labelled with `session_id`.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }
}

impl LogConsumer for TracingConsumer {
    fn accept(&self, frame: &LogFrame) {
        let text = frame.text();
        let line = text.trim_end_matches(['\r', '\n']);
        match frame.kind {
            StreamKind::Stdout => info!(session_id = %self.session_id, stream = "stdout", "{line}"),
            StreamKind::Stderr => info!(session_id = %self.session_id, stream = "stderr", "{line}"),
        }
    }
}

/// Registration-ordered consumer list, appendable while a producer drains it.
#[derive(Clone, Default)]
pub struct ConsumerList {
    inner: Arc<Mutex<Vec<Arc<dyn LogConsumer>>>>,
}

impl ConsumerList {
    /// Empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a consumer; it receives frames decoded after this call.
    pub fn push(&self, consumer: Arc<dyn LogConsumer>) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(consumer);
    }

    /// Number of registered consumers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no consumer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `frame` to every consumer in registration order.
    ///
    /// The list is snapshotted first so consumers may register more consumers
    /// without deadlocking.
    pub fn deliver(&self, frame: &LogFrame) {
        let snapshot: Vec<Arc<dyn LogConsumer>> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for consumer in snapshot {
            consumer.accept(frame);
        }
    }
}

impl std::fmt::Debug for ConsumerList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerList")
            .field("len", &self.len())
            .finish()
    }
}
