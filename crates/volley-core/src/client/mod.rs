//! Client connection management
//!
//! A [`Client`] owns the connect options and, depending on the connection
//! strategy, a pooled HTTP client shared by its calls and streams.

mod unary;

pub use unary::UnaryResponse;

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::codec::CodecError;
use crate::error::StreamError;
use crate::metrics::{MetricTags, MetricsSink};
use crate::params::{CallParams, ConnectParams, ConnectionStrategy, HttpVersion, ParamsError, TlsParams};
use crate::runtime::LoopHandle;
use crate::schema::{SchemaError, SchemaProvider};
use crate::stream::{Stream, StreamSetup};
use crate::transport::{CallContext, HttpConnection};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no connection, you must call connect first")]
    NotConnected,

    #[error("invalid connect() parameters: {0}")]
    ConnectParams(#[source] ParamsError),

    #[error("invalid call parameters: {0}")]
    CallParams(#[source] ParamsError),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid TLS configuration: {0}")]
    Tls(String),

    #[error("failed to create HTTP client: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("failed to encode request: {0}")]
    Encode(#[source] CodecError),

    #[error("failed to decode response: {0}")]
    Decode(#[source] CodecError),
}

/// Where and how to connect, fixed by `connect`
struct Target {
    base_url: String,
    params: ConnectParams,
}

#[derive(Default)]
struct ClientState {
    target: Option<Target>,
    /// Pooled connection for per-vu and per-iteration strategies
    pooled: Option<HttpConnection>,
    pooled_iteration: u64,
    /// HTTP connections built since the client was created
    connections_built: u64,
}

/// Connect/gRPC client bound to one event loop
pub struct Client {
    handle: LoopHandle,
    schemas: Arc<dyn SchemaProvider>,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(
        handle: LoopHandle,
        schemas: Arc<dyn SchemaProvider>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            handle,
            schemas,
            metrics,
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Connect using script-style options
    pub fn connect(&self, addr: &str, options: Option<&Value>) -> Result<bool, ClientError> {
        let params = ConnectParams::from_value(options).map_err(ClientError::ConnectParams)?;
        self.connect_with(addr, params)
    }

    /// Bind the client to `addr`: a `http(s)://` URL or a bare `host:port`,
    /// whose scheme then follows `plaintext`
    pub fn connect_with(&self, addr: &str, params: ConnectParams) -> Result<bool, ClientError> {
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            url::Url::parse(addr)?;
            addr.trim_end_matches('/').to_string()
        } else {
            let scheme = if params.plaintext { "http" } else { "https" };
            let base = format!("{scheme}://{addr}");
            url::Url::parse(&base)?;
            base
        };

        let pooled = match params.connection_strategy {
            ConnectionStrategy::PerCall => None,
            _ => Some(HttpConnection::new(
                build_http_client(&params)?,
                &base_url,
                &params,
            )),
        };

        tracing::info!(
            base_url = %base_url,
            protocol = %params.protocol,
            strategy = params.connection_strategy.as_str(),
            "Client connection configured"
        );
        let mut state = self.state.lock();
        if pooled.is_some() {
            state.connections_built += 1;
        }
        state.target = Some(Target { base_url, params });
        state.pooled = pooled;
        state.pooled_iteration = self.handle.iteration();
        Ok(true)
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().target.is_some()
    }

    /// The connection a new call should use, per the connection strategy
    pub(crate) fn connection(&self) -> Result<HttpConnection, ClientError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let target = state.target.as_ref().ok_or(ClientError::NotConnected)?;

        match target.params.connection_strategy {
            ConnectionStrategy::PerCall => {
                let connection = HttpConnection::new(
                    build_http_client(&target.params)?,
                    &target.base_url,
                    &target.params,
                );
                state.connections_built += 1;
                Ok(connection)
            }
            ConnectionStrategy::PerIteration => {
                let iteration = self.handle.iteration();
                if state.pooled.is_none() || state.pooled_iteration != iteration {
                    let connection = HttpConnection::new(
                        build_http_client(&target.params)?,
                        &target.base_url,
                        &target.params,
                    );
                    state.pooled = Some(connection);
                    state.pooled_iteration = iteration;
                    state.connections_built += 1;
                    tracing::debug!(
                        iteration,
                        connections = state.connections_built,
                        "New connection for iteration"
                    );
                }
                state.pooled.clone().ok_or(ClientError::NotConnected)
            }
            ConnectionStrategy::PerVu => state.pooled.clone().ok_or(ClientError::NotConnected),
        }
    }

    /// Open a stream on `method`
    pub fn stream(&self, method: &str, options: Option<&Value>) -> Result<Stream, StreamError> {
        let connection = self.connection()?;
        let schema = self.schemas.resolve(method)?;
        let call = CallParams::from_value(options)?;

        let ctx = CallContext::new(self.handle.context(), call.timeout);
        let transport = connection.open_stream(&schema.info, &call.metadata, ctx.clone());
        let tags = MetricTags::for_call(
            &schema.info,
            connection.protocol(),
            connection.content_type(),
            &call.tags,
        );

        Ok(Stream::open(StreamSetup {
            method: schema,
            transport: Arc::new(transport),
            codec: connection.content_type().codec(),
            pool: self.schemas.pool(),
            metrics: self.metrics.clone(),
            tags,
            ctx,
            queue: self.handle.completion_queue(),
        }))
    }

    /// Drop the pooled connection. `connect` must be called again.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.pooled = None;
        state.target = None;
    }
}

/// Build the HTTP client for `params`
pub fn build_http_client(params: &ConnectParams) -> Result<reqwest::Client, ClientError> {
    let mut builder = reqwest::Client::builder();

    builder = match params.http_version {
        HttpVersion::Http1 => builder.http1_only(),
        // Without TLS there is no ALPN, so HTTP/2 must be assumed up front
        HttpVersion::Http2 if params.plaintext => builder.http2_prior_knowledge(),
        HttpVersion::Http2 | HttpVersion::Auto => builder,
    };

    if !params.plaintext {
        builder = apply_tls(builder, &params.tls)?;
    }
    if let Some(timeout) = params.timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

fn apply_tls(
    mut builder: reqwest::ClientBuilder,
    tls: &TlsParams,
) -> Result<reqwest::ClientBuilder, ClientError> {
    builder = builder.danger_accept_invalid_certs(tls.insecure_skip_verify);

    for (index, pem) in tls.cacerts.iter().enumerate() {
        let certificate = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|e| {
            ClientError::Tls(format!("failed to append ca certificate [{index}] from PEM: {e}"))
        })?;
        builder = builder.add_root_certificate(certificate);
    }

    if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
        if tls.password.as_deref().is_some_and(|p| !p.is_empty()) {
            return Err(ClientError::Tls(
                "encrypted private keys are not supported".to_string(),
            ));
        }
        let identity = reqwest::Identity::from_pem(format!("{cert}\n{key}").as_bytes())
            .map_err(|e| ClientError::Tls(format!("failed to load certificate from PEM: {e}")))?;
        builder = builder.identity(identity);
    }
    Ok(builder)
}
