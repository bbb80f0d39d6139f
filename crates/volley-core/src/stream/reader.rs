//! Read side of a stream

use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{Failure, StreamInner};
use crate::metrics::Direction;
use crate::rpc::{Code, RpcError};

/// How a failed receive ends the stream
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    End,
    Error,
}

fn classify(error: &RpcError, explicitly_closed: bool) -> Outcome {
    // Some peers report a finished stream as an error wrapping EOF
    if error.message().contains("EOF") {
        return Outcome::End;
    }
    let canceled =
        error.code() == Code::Canceled || error.message().contains("context canceled");
    if canceled && explicitly_closed {
        return Outcome::End;
    }
    Outcome::Error
}

pub(super) async fn read_loop(inner: Arc<StreamInner>) {
    let output = inner.method.output_schema();
    loop {
        match inner.ctx.run(inner.transport.receive()).await {
            Ok(Some(message)) => match inner.codec.decode(&message, output) {
                Ok(value) => {
                    inner
                        .metrics
                        .record_stream_message(&inner.tags, Direction::Received, message.len());
                    inner.emit_data(value);
                }
                Err(e) => {
                    tracing::error!(stream_id = %inner.id, error = %e, "Failed to decode stream message");
                    inner.emit_error(Failure::Other(e.to_string()));
                    break;
                }
            },
            Ok(None) => {
                tracing::debug!(stream_id = %inner.id, "Stream ended by peer");
                inner.emit_end();
                break;
            }
            Err(e) => {
                let explicitly_closed = inner.explicitly_closed.load(Ordering::Acquire);
                match classify(&e, explicitly_closed) {
                    Outcome::End => inner.emit_end(),
                    Outcome::Error => {
                        tracing::error!(
                            stream_id = %inner.id,
                            method = %inner.method.info.full_method,
                            error = %e,
                            "Failed to read from stream"
                        );
                        inner.emit_error(Failure::Rpc(e));
                    }
                }
                break;
            }
        }
    }
    inner.read_finished.cancel();
}
