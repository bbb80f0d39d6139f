//! Volley core library
//!
//! Scriptable Connect/gRPC client: schema loading, schema-driven codecs,
//! HTTP transports, and the streaming bridge that delivers stream events to a
//! single-threaded event loop.

pub mod client;
pub mod codec;
pub mod error;
pub mod events;
pub mod metrics;
pub mod params;
pub mod rpc;
pub mod runtime;
pub mod schema;
pub mod stream;
pub mod transport;

pub use client::{Client, ClientError, UnaryResponse};
pub use error::StreamError;
pub use events::Listener;
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use params::{CallParams, ConnectParams};
pub use rpc::{Code, RpcError};
pub use runtime::{EventLoop, LoopHandle};
pub use schema::{MethodInfo, SchemaProvider, SchemaRegistry};
pub use stream::Stream;
