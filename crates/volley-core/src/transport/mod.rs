//! Stream transports
//!
//! A transport is one bidirectional RPC exchange: send framed messages, close
//! the request side, receive response messages until the peer finishes.

pub mod envelope;
mod http;

pub use http::{HttpConnection, HttpStreamTransport, UnaryReply};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::rpc::RpcError;

/// Bidirectional message channel bound to one RPC
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Send one encoded message. The first send establishes the call.
    async fn send(&self, message: Bytes) -> Result<(), RpcError>;

    /// Half-close: no more messages will be sent
    async fn close_send(&self) -> Result<(), RpcError>;

    /// Next response message; `None` once the peer ended the stream cleanly
    async fn receive(&self) -> Result<Option<Bytes>, RpcError>;
}

/// Cancellation and deadline shared by everything a call awaits
#[derive(Debug, Clone)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// Child of `parent`, expiring after `timeout` when one is given
    pub fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        Self {
            token: parent.child_token(),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Time left before the deadline, `None` without one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Await `fut` unless the call is cancelled or its deadline passes first
    pub async fn run<F, T>(&self, fut: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, RpcError>>,
    {
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(RpcError::canceled()),
            _ = expired => Err(RpcError::deadline_exceeded()),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Code;

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = CallContext::background();
        let value = ctx.run(async { Ok::<_, RpcError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let parent = CancellationToken::new();
        let ctx = CallContext::new(&parent, None);
        parent.cancel();
        let err = ctx
            .run(std::future::pending::<Result<(), RpcError>>())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Canceled);
    }

    #[tokio::test]
    async fn test_deadline() {
        let ctx = CallContext::new(&CancellationToken::new(), Some(Duration::from_millis(50)));
        let err = ctx
            .run(std::future::pending::<Result<(), RpcError>>())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }
}
