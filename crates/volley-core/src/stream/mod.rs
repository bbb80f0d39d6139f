//! Streaming RPC bridge
//!
//! A [`Stream`] is driven from the event loop thread (`on`, `write`, `end`,
//! `close`) while two background tasks own the network sides:
//!
//! - the writer sends queued messages in order and performs the half-close
//! - the reader starts after the first successful send and turns responses
//!   into `data`, `end` and `error` events
//!
//! Neither task touches listener state. Every event is handed to the
//! stream's [`CompletionQueue`] and runs on the loop thread in the order it
//! was produced.

mod reader;
mod writer;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::Client;
use crate::codec::Codec;
use crate::error::StreamError;
use crate::events::{EventRegistry, Listener, EVENT_DATA, EVENT_END, EVENT_ERROR};
use crate::metrics::{MetricTags, MetricsSink};
use crate::rpc::RpcError;
use crate::runtime::CompletionQueue;
use crate::schema::{DescriptorPool, MethodSchema};
use crate::transport::{CallContext, StreamTransport};

/// Unit handed to the writer
#[derive(Debug)]
pub(crate) enum QueuedMessage {
    /// JSON text of the script value; empty for `null`
    Payload(Bytes),
    /// Half-close once everything queued before it is sent
    CloseWrite,
}

/// Why a stream failed
#[derive(Debug)]
pub(crate) enum Failure {
    Rpc(RpcError),
    Other(String),
}

impl Failure {
    fn describe(&self) -> String {
        match self {
            Failure::Rpc(e) => e.to_string(),
            Failure::Other(message) => message.clone(),
        }
    }

    fn payload(&self, pool: &DescriptorPool) -> Value {
        match self {
            Failure::Rpc(e) => e.payload_with_pool(pool),
            Failure::Other(message) => json!({ "message": message }),
        }
    }
}

/// Everything a stream needs, resolved by the client before it starts
pub struct StreamSetup {
    pub method: Arc<MethodSchema>,
    pub transport: Arc<dyn StreamTransport>,
    pub codec: Arc<dyn Codec>,
    /// Types used to decode error details
    pub pool: Arc<DescriptorPool>,
    pub metrics: Arc<dyn MetricsSink>,
    pub tags: MetricTags,
    pub ctx: CallContext,
    pub queue: CompletionQueue,
}

/// State shared by the script-facing handle and both workers
pub(crate) struct StreamInner {
    pub(crate) id: Uuid,
    pub(crate) method: Arc<MethodSchema>,
    pub(crate) transport: Arc<dyn StreamTransport>,
    pub(crate) codec: Arc<dyn Codec>,
    pool: Arc<DescriptorPool>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) tags: MetricTags,
    pub(crate) ctx: CallContext,
    events: Arc<EventRegistry>,
    queue: CompletionQueue,
    started_at: Instant,

    /// Fired by shutdown; stops the writer and rejects blocked writes
    pub(crate) done: CancellationToken,
    /// Fired when the reader exits
    pub(crate) read_finished: CancellationToken,

    writing_closed: AtomicBool,
    pub(crate) explicitly_closed: Arc<AtomicBool>,
    reader_started: AtomicBool,
    shut_down: AtomicBool,
    end_recorded: AtomicBool,
    /// A terminal event reached listeners; only touched on the loop thread
    terminated: Arc<AtomicBool>,
}

/// Script handle to one streaming call. Clones share the same stream.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
    tx: mpsc::Sender<QueuedMessage>,
}

impl Stream {
    /// Open a stream on `method` through a connected client
    pub fn new(client: &Client, method: &str, options: Option<&Value>) -> Result<Self, StreamError> {
        client.stream(method, options)
    }

    /// Start the writer for a prepared call
    pub fn open(setup: StreamSetup) -> Self {
        let inner = Arc::new(StreamInner {
            id: Uuid::new_v4(),
            method: setup.method,
            transport: setup.transport,
            codec: setup.codec,
            pool: setup.pool,
            metrics: setup.metrics,
            tags: setup.tags,
            ctx: setup.ctx,
            events: Arc::new(EventRegistry::new()),
            queue: setup.queue,
            started_at: Instant::now(),
            done: CancellationToken::new(),
            read_finished: CancellationToken::new(),
            writing_closed: AtomicBool::new(false),
            explicitly_closed: Arc::new(AtomicBool::new(false)),
            reader_started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            end_recorded: AtomicBool::new(false),
            terminated: Arc::new(AtomicBool::new(false)),
        });

        // Capacity 1: a write returns once the writer has room for it
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(writer::write_loop(inner.clone(), rx));

        inner.metrics.record_stream_start(&inner.tags);
        tracing::debug!(
            stream_id = %inner.id,
            method = %inner.method.info.full_method,
            "Stream started"
        );
        Self { inner, tx }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Register a listener for `data`, `error` or `end`
    pub fn on(&self, event: &str, listener: impl Into<Listener>) {
        self.inner.events.on(event, listener.into());
    }

    /// Queue a message. Waits while the writer is busy with the previous one.
    pub async fn write(&self, value: &Value) -> Result<(), StreamError> {
        if self.inner.writing_closed.load(Ordering::Acquire) {
            return Err(StreamError::ClosedForWriting);
        }

        let payload = if value.is_null() {
            Bytes::new()
        } else {
            Bytes::from(serde_json::to_vec(value).map_err(StreamError::Marshal)?)
        };

        tokio::select! {
            biased;
            _ = self.inner.done.cancelled() => Err(StreamError::StreamClosed),
            sent = self.tx.send(QueuedMessage::Payload(payload)) => {
                sent.map_err(|_| StreamError::StreamClosed)
            }
        }
    }

    /// Half-close: no more writes, responses keep flowing until the peer ends
    pub async fn end(&self) {
        if self.inner.writing_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(stream_id = %self.inner.id, "Stream write side closing");
        tokio::select! {
            biased;
            _ = self.inner.done.cancelled() => {}
            _ = self.tx.send(QueuedMessage::CloseWrite) => {}
        }
    }

    /// Stop everything now. Listeners see `end`, not `error`.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.explicitly_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.writing_closed.store(true, Ordering::Release);
        tracing::debug!(stream_id = %inner.id, "Stream closed by script");

        inner.ctx.cancel();
        if !inner.reader_started.load(Ordering::Acquire) {
            inner.emit_end();
        }
        inner.shutdown();
    }

    pub fn is_writing_closed(&self) -> bool {
        self.inner.writing_closed.load(Ordering::Acquire)
    }
}

impl StreamInner {
    /// Start the reader at most once
    pub(crate) fn start_reader(self: &Arc<Self>) {
        if self.reader_started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(stream_id = %self.id, "Starting stream reader");
        tokio::spawn(reader::read_loop(self.clone()));
    }

    pub(crate) fn emit_data(&self, value: Value) {
        let events = self.events.clone();
        let closed = self.explicitly_closed.clone();
        let terminated = self.terminated.clone();
        self.queue.queue(move || {
            if closed.load(Ordering::Acquire) || terminated.load(Ordering::Acquire) {
                return;
            }
            events.emit(EVENT_DATA, &value);
        });
    }

    pub(crate) fn emit_end(&self) {
        self.record_end(None);
        self.emit_terminal(EVENT_END, Value::Null);
    }

    pub(crate) fn emit_error(&self, failure: Failure) {
        let message = failure.describe();
        self.record_end(Some(&message));
        self.emit_terminal(EVENT_ERROR, failure.payload(&self.pool));
    }

    fn emit_terminal(&self, event: &'static str, payload: Value) {
        let events = self.events.clone();
        let terminated = self.terminated.clone();
        self.queue.queue(move || {
            if terminated.swap(true, Ordering::AcqRel) {
                return;
            }
            events.emit(event, &payload);
        });
    }

    fn record_end(&self, error: Option<&str>) {
        if self.end_recorded.swap(true, Ordering::AcqRel) {
            return;
        }
        self.metrics
            .record_stream_end(&self.tags, self.started_at.elapsed(), error);
    }

    /// Stop the writer and release the completion queue once the reader is gone
    pub(crate) fn shutdown(self: &Arc<Self>) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.done.cancel();

        if self.reader_started.load(Ordering::Acquire) {
            let inner = self.clone();
            tokio::spawn(async move {
                inner.read_finished.cancelled().await;
                inner.queue.close();
                tracing::debug!(stream_id = %inner.id, "Stream released");
            });
        } else {
            // No reader to produce a terminal event; a no-op if one was emitted
            self.record_end(None);
            self.queue.close();
            tracing::debug!(stream_id = %self.id, "Stream released");
        }
    }
}
