//! Errors surfaced synchronously by the stream API
//!
//! Everything that happens after a stream is running is reported through its
//! `error` event instead.

use crate::client::ClientError;
use crate::params::ParamsError;
use crate::schema::SchemaError;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid stream client: {0}")]
    Client(#[from] ClientError),

    #[error("invalid stream method: {0}")]
    Method(#[from] SchemaError),

    #[error("invalid stream parameters: {0}")]
    Options(#[from] ParamsError),

    #[error("cannot write to a closed stream")]
    ClosedForWriting,

    #[error("stream is closed")]
    StreamClosed,

    #[error("failed to marshal message: {0}")]
    Marshal(#[source] serde_json::Error),
}

impl StreamError {
    /// Whether the error came from calling into a stream that no longer accepts input
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ClosedForWriting | Self::StreamClosed)
    }
}
