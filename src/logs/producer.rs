//! Background log producer.
//!
//! One worker per session reads the engine's followed log stream, decodes
//! frames with [`FrameCodec`] and hands each frame to every registered
//! consumer in order. The worker is an explicit state machine:
//!
//! ```text
//! Connecting{since} ──ok──▶ Streaming ──connection closed──▶ Connecting{since = last frame}
//!        │                      │
//!        └──permanent error──▶ Stopped ◀──stop / cancel / session exited
//! ```
//!
//! Reconnects pass the time the last complete frame was decoded as `since`,
//! so already-delivered output is not replayed. A read that stops inside a
//! frame does not advance that time; the partial frame is dropped with the
//! connection and replayed in full by the next stream.

use std::io::ErrorKind;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::consumer::ConsumerList;
use super::frame::FrameCodec;
use crate::engine::{Engine, LogOptions, LogSince, LogStream, ResourceId};
use crate::retry::{retry_with_backoff, Backoff};
use crate::{AppError, Result};

/// Non-connection read errors tolerated in a row before reconnecting.
pub const MAX_CONSECUTIVE_READ_ERRORS: u32 = 3;

const READ_CHUNK: usize = 8 * 1024;

/// Handle to a running log producer.
///
/// Dropping the handle also stops the worker: the stop channel's sender goes
/// away and the worker treats that as a stop signal.
#[derive(Debug)]
pub struct LogProducer {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl LogProducer {
    /// Spawn the worker for `resource`.
    #[must_use]
    pub fn spawn(
        engine: Arc<dyn Engine>,
        resource: ResourceId,
        consumers: ConsumerList,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let span = info_span!("log_producer", resource = %resource);

        let worker = Worker {
            engine,
            resource,
            consumers,
            backoff,
            cancel,
            stop_rx,
            codec: FrameCodec::new(),
            buf: BytesMut::with_capacity(READ_CHUNK),
            last_read: None,
        };

        Self {
            stop_tx: Some(stop_tx),
            join_handle: Some(tokio::spawn(worker.run().instrument(span))),
        }
    }

    /// Whether the worker has exited on its own or been stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join_handle
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }

    /// Signal the worker to stop and wait for it to close its stream.
    ///
    /// Calling this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the worker task panicked.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            // The worker may already have exited; nothing to signal then.
            let _ = tx.send(());
        }

        if let Some(handle) = self.join_handle.take() {
            handle
                .await
                .map_err(|err| AppError::Io(format!("log producer task failed: {err}")))?;
        }

        Ok(())
    }
}

enum ProducerState {
    Connecting { since: Option<LogSince> },
    Streaming { stream: LogStream },
    Stopped,
}

struct Worker {
    engine: Arc<dyn Engine>,
    resource: ResourceId,
    consumers: ConsumerList,
    backoff: Backoff,
    cancel: CancellationToken,
    stop_rx: oneshot::Receiver<()>,
    codec: FrameCodec,
    buf: BytesMut,
    last_read: Option<LogSince>,
}

impl Worker {
    async fn run(mut self) {
        debug!("log producer started");
        let mut state = ProducerState::Connecting { since: None };

        loop {
            state = match state {
                ProducerState::Connecting { since } => self.connect(since).await,
                ProducerState::Streaming { stream } => self.stream(stream).await,
                ProducerState::Stopped => break,
            };
        }

        debug!("log producer stopped");
    }

    async fn connect(&mut self, since: Option<LogSince>) -> ProducerState {
        // Anything half-decoded belongs to the closed connection.
        self.buf.clear();
        self.codec = FrameCodec::new();

        let options = LogOptions {
            follow: true,
            since,
        };
        let engine = &self.engine;
        let resource = &self.resource;
        let request = retry_with_backoff("stream_logs", &self.backoff, &self.cancel, || {
            engine.stream_logs(resource, options)
        });

        tokio::select! {
            biased;

            _ = &mut self.stop_rx => ProducerState::Stopped,

            () = self.cancel.cancelled() => ProducerState::Stopped,

            result = request => match result {
                Ok(stream) => {
                    if let Some(since) = since {
                        info!(%since, "log stream reconnected");
                    }
                    ProducerState::Streaming { stream }
                }
                Err(AppError::Cancelled(_)) => ProducerState::Stopped,
                Err(err) => {
                    error!(%err, "cannot open log stream; log producer exiting");
                    ProducerState::Stopped
                }
            },
        }
    }

    async fn stream(&mut self, mut stream: LogStream) -> ProducerState {
        let mut consecutive_errors: u32 = 0;

        loop {
            let read = tokio::select! {
                biased;

                _ = &mut self.stop_rx => return ProducerState::Stopped,

                () = self.cancel.cancelled() => return ProducerState::Stopped,

                read = stream.read_buf(&mut self.buf) => read,
            };

            match read {
                Ok(0) => {
                    self.drain_eof();
                    return self.after_eof().await;
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    self.drain();
                    if self.at_frame_boundary() {
                        self.last_read = Some(LogSince::now());
                    }
                }
                Err(err) if is_connection_closed(&err) => {
                    info!(%err, "log stream closed by network; reconnecting");
                    return ProducerState::Connecting {
                        since: self.last_read,
                    };
                }
                Err(err) => {
                    consecutive_errors += 1;
                    warn!(%err, consecutive_errors, "log stream read failed");
                    if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        return ProducerState::Connecting {
                            since: self.last_read,
                        };
                    }
                }
            }
        }
    }

    /// Decide between reconnecting and exiting once the engine ends the stream.
    async fn after_eof(&mut self) -> ProducerState {
        match self.engine.inspect(&self.resource).await {
            Ok(state) if state.running => {
                debug!("log stream ended while session running; reconnecting");
                tokio::select! {
                    biased;
                    _ = &mut self.stop_rx => ProducerState::Stopped,
                    () = self.cancel.cancelled() => ProducerState::Stopped,
                    () = tokio::time::sleep(self.backoff.initial) => ProducerState::Connecting {
                        since: self.last_read,
                    },
                }
            }
            Ok(_) => {
                info!("session no longer running; log producer exiting");
                ProducerState::Stopped
            }
            Err(AppError::NotFound(msg)) => {
                info!(msg, "session removed; log producer exiting");
                ProducerState::Stopped
            }
            Err(err) => {
                warn!(%err, "inspect failed after log stream ended; reconnecting");
                ProducerState::Connecting {
                    since: self.last_read,
                }
            }
        }
    }

    fn at_frame_boundary(&self) -> bool {
        self.buf.is_empty() && !self.codec.is_skipping()
    }

    fn drain(&mut self) {
        loop {
            match self.codec.decode(&mut self.buf) {
                Ok(Some(frame)) => self.consumers.deliver(&frame),
                Ok(None) => break,
                Err(err) => warn!(%err, "skipping malformed log frame"),
            }
        }
    }

    fn drain_eof(&mut self) {
        loop {
            match self.codec.decode_eof(&mut self.buf) {
                Ok(Some(frame)) => self.consumers.deliver(&frame),
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "log stream ended mid-frame");
                    break;
                }
            }
        }
    }
}

/// Errors meaning the transport went away, as opposed to the session ending.
fn is_connection_closed(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}
