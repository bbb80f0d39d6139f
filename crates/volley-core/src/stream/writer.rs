//! Write side of a stream

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Failure, QueuedMessage, StreamInner};
use crate::metrics::Direction;

pub(super) async fn write_loop(inner: Arc<StreamInner>, mut rx: mpsc::Receiver<QueuedMessage>) {
    loop {
        let message = tokio::select! {
            biased;
            _ = inner.done.cancelled() => return,
            message = rx.recv() => message,
        };

        match message {
            Some(QueuedMessage::Payload(payload)) => {
                if !send_payload(&inner, payload).await {
                    return;
                }
            }
            Some(QueuedMessage::CloseWrite) => {
                close_write(&inner, &mut rx).await;
                return;
            }
            // Every handle was dropped without closing
            None => {
                inner.shutdown();
                return;
            }
        }
    }
}

/// Flush what was queued before the close, then half-close and shut down
async fn close_write(inner: &Arc<StreamInner>, rx: &mut mpsc::Receiver<QueuedMessage>) {
    while let Ok(pending) = rx.try_recv() {
        match pending {
            QueuedMessage::Payload(payload) => {
                if !send_payload(inner, payload).await {
                    return;
                }
            }
            QueuedMessage::CloseWrite => continue,
        }
    }

    match inner.ctx.run(inner.transport.close_send()).await {
        Ok(()) => {
            // A call with no messages still has a response to read
            inner.start_reader();
        }
        Err(e) if inner.reader_started.load(Ordering::Acquire)
            || inner.explicitly_closed.load(Ordering::Acquire) =>
        {
            // The reader reports how the call finished
            tracing::warn!(stream_id = %inner.id, error = %e, "Failed to close stream write side");
        }
        Err(e) => {
            tracing::error!(
                stream_id = %inner.id,
                method = %inner.method.info.full_method,
                error = %e,
                "Failed to close stream write side"
            );
            inner.emit_error(Failure::Rpc(e));
        }
    }
    inner.shutdown();
}

/// Encode and send one message. Returns false once the stream has failed.
async fn send_payload(inner: &Arc<StreamInner>, payload: Bytes) -> bool {
    let value = if payload.is_empty() {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&payload) {
            Ok(value) => value,
            Err(e) => {
                fail(inner, Failure::Other(e.to_string()), "Failed to unmarshal message for sending");
                return false;
            }
        }
    };

    let encoded = match inner.codec.encode(&value, inner.method.input_schema()) {
        Ok(encoded) => encoded,
        Err(e) => {
            fail(inner, Failure::Other(e.to_string()), "Failed to encode message for sending");
            return false;
        }
    };
    let size = encoded.len();

    if let Err(e) = inner.ctx.run(inner.transport.send(encoded)).await {
        if inner.explicitly_closed.load(Ordering::Acquire) {
            tracing::debug!(stream_id = %inner.id, error = %e, "Send interrupted by close");
            return false;
        }
        fail(inner, Failure::Rpc(e), "Failed to write to stream");
        return false;
    }

    inner.start_reader();
    inner
        .metrics
        .record_stream_message(&inner.tags, Direction::Sent, size);
    true
}

fn fail(inner: &Arc<StreamInner>, failure: Failure, context: &str) {
    tracing::error!(
        stream_id = %inner.id,
        method = %inner.method.info.full_method,
        error = %failure.describe(),
        "{context}"
    );
    inner.emit_error(failure);
    // The reader would otherwise wait on a call that is already failed
    inner.ctx.cancel();
    inner.shutdown();
}
