//! HTTP transport over reqwest
//!
//! Streams issue their request lazily on the first send, with a body fed from
//! a channel so messages go out while responses come in (HTTP/2 full duplex).

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_TYPE, USER_AGENT};
use reqwest::{RequestBuilder, StatusCode};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use super::envelope::{self, EnvelopeBuffer};
use super::{CallContext, StreamTransport};
use crate::params::{ConnectParams, ContentType, Protocol};
use crate::rpc::{Code, RpcError};
use crate::schema::MethodInfo;

const CLIENT_USER_AGENT: &str = concat!("volley/", env!("CARGO_PKG_VERSION"));
const CONNECT_PROTOCOL_VERSION: &str = "connect-protocol-version";
const CONNECT_TIMEOUT: &str = "connect-timeout-ms";
const GRPC_TIMEOUT: &str = "grpc-timeout";
const TRAILER_PREFIX: &str = "trailer-";

/// A pooled HTTP client bound to a base address and protocol settings
#[derive(Debug, Clone)]
pub struct HttpConnection {
    client: reqwest::Client,
    base_url: String,
    protocol: Protocol,
    content_type: ContentType,
    max_send_size: usize,
    max_receive_size: usize,
    headers: HashMap<String, String>,
}

/// Result of a unary call
#[derive(Debug, Clone)]
pub struct UnaryReply {
    pub message: Bytes,
    pub headers: HashMap<String, String>,
    pub trailers: HashMap<String, String>,
}

impl HttpConnection {
    pub fn new(client: reqwest::Client, base_url: &str, params: &ConnectParams) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            protocol: params.protocol,
            content_type: params.content_type,
            max_send_size: params.max_send_size,
            max_receive_size: params.max_receive_size,
            headers: params.headers.clone(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    fn request(
        &self,
        method: &MethodInfo,
        streaming: bool,
        metadata: &HashMap<String, String>,
        ctx: &CallContext,
    ) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, method.full_method);
        let mut request = self
            .client
            .post(url)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header(
                CONTENT_TYPE,
                self.protocol.content_type(self.content_type, streaming),
            );

        let remaining = ctx.remaining();
        match self.protocol {
            Protocol::Connect => {
                request = request.header(CONNECT_PROTOCOL_VERSION, "1");
                if let Some(remaining) = remaining {
                    request = request.header(CONNECT_TIMEOUT, remaining.as_millis().max(1).to_string());
                }
            }
            Protocol::Grpc | Protocol::GrpcWeb => {
                if self.protocol == Protocol::Grpc {
                    request = request.header("te", "trailers");
                } else {
                    request = request.header("x-grpc-web", "1");
                }
                if let Some(remaining) = remaining {
                    request = request.header(GRPC_TIMEOUT, grpc_timeout(remaining.as_millis()));
                }
            }
        }

        for (key, value) in self.headers.iter().chain(metadata.iter()) {
            request = request.header(key.as_str(), value.as_str());
        }
        request
    }

    /// Prepare a streaming call. Nothing is sent until the first message.
    pub fn open_stream(
        &self,
        method: &MethodInfo,
        metadata: &HashMap<String, String>,
        ctx: CallContext,
    ) -> HttpStreamTransport {
        let request = self.request(method, true, metadata, &ctx);
        HttpStreamTransport {
            protocol: self.protocol,
            max_send_size: self.max_send_size,
            max_receive_size: self.max_receive_size,
            ctx,
            body: Mutex::new(BodyState::Pending(request)),
            read: Mutex::new(ReadState::NotStarted),
            headers: parking_lot::Mutex::new(HashMap::new()),
            trailers: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// One request, one response
    pub async fn unary(
        &self,
        method: &MethodInfo,
        message: Bytes,
        metadata: &HashMap<String, String>,
        ctx: CallContext,
    ) -> Result<UnaryReply, RpcError> {
        if self.protocol != Protocol::Connect {
            return self.unary_over_stream(method, message, metadata, ctx).await;
        }

        check_send_size(message.len(), self.max_send_size)?;
        let request = self.request(method, false, metadata, &ctx).body(message);
        let response = ctx
            .run(async { request.send().await.map_err(from_reqwest) })
            .await?;
        let status = response.status();
        let (headers, trailers) = split_connect_headers(response.headers());
        let body = ctx
            .run(async { response.bytes().await.map_err(from_reqwest) })
            .await?;
        if !status.is_success() {
            return Err(error_from_body(status, &body));
        }
        check_receive_size(body.len(), self.max_receive_size)?;
        Ok(UnaryReply {
            message: body,
            headers,
            trailers,
        })
    }

    /// gRPC and gRPC-Web frame unary calls like single-message streams
    async fn unary_over_stream(
        &self,
        method: &MethodInfo,
        message: Bytes,
        metadata: &HashMap<String, String>,
        ctx: CallContext,
    ) -> Result<UnaryReply, RpcError> {
        let stream = self.open_stream(method, metadata, ctx);
        stream.send(message).await?;
        stream.close_send().await?;
        let message = stream
            .receive()
            .await?
            .ok_or_else(|| RpcError::new(Code::Unimplemented, "unary response has no message"))?;
        if stream.receive().await?.is_some() {
            return Err(RpcError::new(
                Code::Unimplemented,
                "unary response has multiple messages",
            ));
        }
        Ok(UnaryReply {
            message,
            headers: stream.headers(),
            trailers: stream.trailers(),
        })
    }
}

enum BodyState {
    /// Request not yet issued
    Pending(RequestBuilder),
    Open(mpsc::Sender<Result<Bytes, std::io::Error>>),
    Closed,
}

enum ReadState {
    NotStarted,
    AwaitingResponse(oneshot::Receiver<Result<reqwest::Response, RpcError>>),
    Streaming {
        body: BoxStream<'static, reqwest::Result<Bytes>>,
        buffer: EnvelopeBuffer,
    },
    Finished,
}

/// One streaming call over HTTP
pub struct HttpStreamTransport {
    protocol: Protocol,
    max_send_size: usize,
    max_receive_size: usize,
    ctx: CallContext,
    body: Mutex<BodyState>,
    read: Mutex<ReadState>,
    headers: parking_lot::Mutex<HashMap<String, String>>,
    trailers: parking_lot::Mutex<HashMap<String, String>>,
}

impl HttpStreamTransport {
    /// Response headers, once received
    pub fn headers(&self) -> HashMap<String, String> {
        self.headers.lock().clone()
    }

    /// Trailers, once the stream finished
    pub fn trailers(&self) -> HashMap<String, String> {
        self.trailers.lock().clone()
    }

    /// Issue the request; its body stays open until `close_send`
    async fn start(&self, request: RequestBuilder) -> mpsc::Sender<Result<Bytes, std::io::Error>> {
        let (body_tx, body_rx) = mpsc::channel(1);
        let (response_tx, response_rx) = oneshot::channel();
        let request = request.body(reqwest::Body::wrap_stream(ReceiverStream::new(body_rx)));
        let token = self.ctx.token().clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                result = request.send() => result.map_err(from_reqwest),
                _ = token.cancelled() => Err(RpcError::canceled()),
            };
            let _ = response_tx.send(result);
        });

        *self.read.lock().await = ReadState::AwaitingResponse(response_rx);
        body_tx
    }

    /// Validate response headers and switch to reading the body
    async fn accept_response(&self, response: reqwest::Response) -> Result<ReadState, RpcError> {
        let status = response.status();
        let headers = header_map(response.headers());

        if !status.is_success() {
            let body = self
                .ctx
                .run(async { response.bytes().await.map_err(from_reqwest) })
                .await
                .unwrap_or_default();
            return Err(error_from_body(status, &body));
        }

        if self.protocol != Protocol::Connect {
            // Trailers-only response
            if headers.contains_key("grpc-status") {
                let error = envelope::status_from_trailers(&headers);
                *self.headers.lock() = headers.clone();
                *self.trailers.lock() = headers;
                return match error {
                    Some(error) => Err(error),
                    None => Ok(ReadState::Finished),
                };
            }
        }

        *self.headers.lock() = headers;
        Ok(ReadState::Streaming {
            body: response.bytes_stream().boxed(),
            buffer: EnvelopeBuffer::new(self.max_receive_size),
        })
    }

    /// What a complete envelope means for the stream
    fn handle_envelope(&self, envelope: envelope::Envelope) -> Result<Frame, RpcError> {
        if envelope.is_compressed() {
            return Err(RpcError::new(
                Code::Internal,
                "received a compressed message but compression was not negotiated",
            ));
        }
        match self.protocol {
            Protocol::Connect if envelope.is_end_stream() => {
                let end = envelope::parse_end_stream(&envelope.payload)?;
                let trailers = end
                    .metadata
                    .into_iter()
                    .map(|(k, v)| (k, v.join(", ")))
                    .collect();
                *self.trailers.lock() = trailers;
                match end.error {
                    Some(error) => Err(error),
                    None => Ok(Frame::End),
                }
            }
            Protocol::GrpcWeb if envelope.is_trailer() => {
                let trailers = envelope::parse_trailers(&envelope.payload);
                let error = envelope::status_from_trailers(&trailers);
                *self.trailers.lock() = trailers;
                match error {
                    Some(error) => Err(error),
                    None => Ok(Frame::End),
                }
            }
            _ => Ok(Frame::Message(envelope.payload)),
        }
    }
}

enum Frame {
    Message(Bytes),
    End,
}

/// The request body went away before the call finished
fn body_closed() -> RpcError {
    RpcError::new(Code::Unavailable, "request body closed by the server")
}

#[async_trait]
impl StreamTransport for HttpStreamTransport {
    async fn send(&self, message: Bytes) -> Result<(), RpcError> {
        check_send_size(message.len(), self.max_send_size)?;
        let mut body = self.body.lock().await;
        if let BodyState::Pending(_) = &*body {
            if let BodyState::Pending(request) = std::mem::replace(&mut *body, BodyState::Closed) {
                *body = BodyState::Open(self.start(request).await);
            }
        }
        let BodyState::Open(tx) = &*body else {
            return Err(RpcError::new(
                Code::FailedPrecondition,
                "cannot send after the request was closed",
            ));
        };
        let frame = envelope::encode(0, &message);
        self.ctx
            .run(async {
                tx.send(Ok(frame))
                    .await
                    .map_err(|_| body_closed())
            })
            .await
    }

    async fn close_send(&self) -> Result<(), RpcError> {
        let mut body = self.body.lock().await;
        match std::mem::replace(&mut *body, BodyState::Closed) {
            // Establish the call even when nothing was sent
            BodyState::Pending(request) => drop(self.start(request).await),
            BodyState::Open(tx) => drop(tx),
            BodyState::Closed => {}
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Bytes>, RpcError> {
        let mut read = self.read.lock().await;
        loop {
            match &mut *read {
                ReadState::NotStarted => {
                    return Err(RpcError::new(
                        Code::FailedPrecondition,
                        "stream has not been started",
                    ))
                }
                ReadState::Finished => return Ok(None),
                ReadState::AwaitingResponse(rx) => {
                    let response = self
                        .ctx
                        .run(async {
                            rx.await.map_err(|_| {
                                RpcError::new(Code::Unavailable, "request ended without a response")
                            })?
                        })
                        .await;
                    let next = match response {
                        Ok(response) => self.accept_response(response).await,
                        Err(error) => Err(error),
                    };
                    match next {
                        Ok(state) => *read = state,
                        Err(error) => {
                            *read = ReadState::Finished;
                            return Err(error);
                        }
                    }
                }
                ReadState::Streaming { body, buffer } => {
                    let envelope = match buffer.try_next() {
                        Ok(envelope) => envelope,
                        Err(error) => {
                            *read = ReadState::Finished;
                            return Err(error);
                        }
                    };
                    if let Some(envelope) = envelope {
                        match self.handle_envelope(envelope) {
                            Ok(Frame::Message(message)) => return Ok(Some(message)),
                            Ok(Frame::End) => {
                                *read = ReadState::Finished;
                                return Ok(None);
                            }
                            Err(error) => {
                                *read = ReadState::Finished;
                                return Err(error);
                            }
                        }
                    }

                    let chunk = self.ctx.run(async { Ok(body.next().await) }).await;
                    match chunk {
                        Ok(Some(Ok(chunk))) => buffer.push(&chunk),
                        Ok(Some(Err(error))) => {
                            *read = ReadState::Finished;
                            return Err(from_reqwest(error));
                        }
                        Ok(None) => {
                            let truncated = !buffer.is_empty();
                            *read = ReadState::Finished;
                            if truncated {
                                return Err(RpcError::new(
                                    Code::Internal,
                                    "stream ended inside a message",
                                ));
                            }
                            return match self.protocol {
                                Protocol::Connect => Err(RpcError::new(
                                    Code::Internal,
                                    "stream ended without an end-of-stream message",
                                )),
                                // HTTP trailers are not surfaced by the client; a clean
                                // body end is taken as success
                                Protocol::Grpc | Protocol::GrpcWeb => Ok(None),
                            };
                        }
                        Err(error) => {
                            *read = ReadState::Finished;
                            return Err(error);
                        }
                    }
                }
            }
        }
    }
}

fn check_send_size(len: usize, max: usize) -> Result<(), RpcError> {
    if max > 0 && len > max {
        return Err(RpcError::new(
            Code::ResourceExhausted,
            format!("message size {len} exceeds sendMaxBytes {max}"),
        ));
    }
    Ok(())
}

fn check_receive_size(len: usize, max: usize) -> Result<(), RpcError> {
    if max > 0 && len > max {
        return Err(RpcError::new(
            Code::ResourceExhausted,
            format!("message size {len} exceeds readMaxBytes {max}"),
        ));
    }
    Ok(())
}

/// gRPC timeouts carry at most eight digits
fn grpc_timeout(millis: u128) -> String {
    if millis < 100_000_000 {
        format!("{}m", millis.max(1))
    } else if millis / 1000 < 100_000_000 {
        format!("{}S", millis / 1000)
    } else {
        format!("{}M", (millis / 60_000).min(99_999_999))
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

/// Connect unary responses carry trailers as `trailer-` prefixed headers
fn split_connect_headers(
    headers: &HeaderMap,
) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut plain = HashMap::new();
    let mut trailers = HashMap::new();
    for (name, value) in header_map(headers) {
        match name.strip_prefix(TRAILER_PREFIX) {
            Some(trailer) => trailers.insert(trailer.to_string(), value),
            None => plain.insert(name, value),
        };
    }
    (plain, trailers)
}

fn error_from_body(status: StatusCode, body: &[u8]) -> RpcError {
    RpcError::from_connect_json(body)
        .filter(|error| !error.message().is_empty() || error.code() != Code::Unknown)
        .unwrap_or_else(|| {
            RpcError::new(
                Code::from_http_status(status.as_u16()),
                format!("HTTP status {status}"),
            )
        })
}

fn from_reqwest(error: reqwest::Error) -> RpcError {
    let code = if error.is_timeout() {
        Code::DeadlineExceeded
    } else if error.is_connect() || error.is_request() {
        Code::Unavailable
    } else {
        Code::Unknown
    };
    RpcError::new(code, error.to_string())
}
