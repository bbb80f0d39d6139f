//! End-to-end calls against an in-process Connect server over h2c

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use volley_core::transport::envelope::{encode, EnvelopeBuffer, FLAG_END_STREAM};
use volley_core::{Client, EventLoop, InMemoryMetrics, Listener, SchemaRegistry};

const DESCRIPTORS: &str = include_str!("../testdata/ping.json");

async fn ping(body: Bytes) -> Response {
    let request: Value = serde_json::from_slice(&body).unwrap_or_default();
    let reply = json!({
        "number": request["number"].as_i64().unwrap_or_default() * 2,
        "text": request["text"],
    });
    ([(header::CONTENT_TYPE, "application/json")], reply.to_string()).into_response()
}

async fn fail() -> Response {
    let error = json!({"code": "invalid_argument", "message": "number must be positive"});
    (
        StatusCode::BAD_REQUEST,
        [(header::CONTENT_TYPE, "application/json")],
        error.to_string(),
    )
        .into_response()
}

/// Running total of every request number, one reply per request
async fn cum_sum(body: Body) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    tokio::spawn(async move {
        let mut data = body.into_data_stream();
        let mut buffer = EnvelopeBuffer::new(0);
        let mut sum = 0;
        while let Some(Ok(chunk)) = data.next().await {
            buffer.push(&chunk);
            while let Ok(Some(envelope)) = buffer.try_next() {
                let request: Value = serde_json::from_slice(&envelope.payload).unwrap_or_default();
                sum += request["number"].as_i64().unwrap_or_default();
                let reply = json!({"sum": sum}).to_string();
                if tx.send(Ok(encode(0, reply.as_bytes()))).await.is_err() {
                    return;
                }
            }
        }
        let _ = tx.send(Ok(encode(FLAG_END_STREAM, b"{}"))).await;
    });

    (
        [(header::CONTENT_TYPE, "application/connect+json")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

async fn start_server() -> SocketAddr {
    let app = Router::new()
        .route("/test.v1.PingService/Ping", post(ping))
        .route("/test.v1.PingService/Fail", post(fail))
        .route("/test.v1.PingService/CumSum", post(cum_sum));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn connected_client(event_loop: &EventLoop, addr: SocketAddr, metrics: Arc<InMemoryMetrics>) -> Client {
    let registry = Arc::new(SchemaRegistry::new());
    registry.load_descriptor_json(DESCRIPTORS).unwrap();
    let client = Client::new(event_loop.handle(), registry, metrics);
    client
        .connect(
            &addr.to_string(),
            Some(&json!({"plaintext": true, "httpVersion": "2", "timeout": "5s"})),
        )
        .unwrap();
    client
}

#[tokio::test]
async fn test_unary_ping() {
    let addr = start_server().await;
    let event_loop = EventLoop::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let client = connected_client(&event_loop, addr, metrics.clone());

    let response = client
        .invoke("test.v1.PingService/Ping", &json!({"number": 21, "text": "hi"}), None)
        .await
        .unwrap();
    assert!(response.is_ok());
    assert_eq!(response.message, json!({"number": 42, "text": "hi"}));
    let stats = metrics.stats("/test.v1.PingService/Ping");
    assert_eq!(stats.unary_requests, 1);
    assert_eq!(stats.unary_statuses.get("ok"), Some(&1));
}

#[tokio::test]
async fn test_unary_error_is_returned_in_response() {
    let addr = start_server().await;
    let event_loop = EventLoop::new();
    let client = connected_client(&event_loop, addr, Arc::new(InMemoryMetrics::new()));

    let response = client
        .invoke("/test.v1.PingService/Fail", &json!({"code": 3}), None)
        .await
        .unwrap();
    assert_eq!(response.status, 400);
    assert_eq!(response.message["code"], "invalid_argument");
    assert_eq!(
        response.message["message"],
        "invalid_argument: number must be positive"
    );
}

#[tokio::test]
async fn test_bidi_cum_sum_over_http() {
    let addr = start_server().await;
    let mut event_loop = EventLoop::new();
    let metrics = Arc::new(InMemoryMetrics::new());
    let client = connected_client(&event_loop, addr, metrics.clone());

    let log: Arc<Mutex<Vec<(&'static str, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let stream = client.stream("/test.v1.PingService/CumSum", None).unwrap();
    for event in ["data", "error", "end"] {
        let log = log.clone();
        stream.on(
            event,
            Listener::new(move |payload| {
                log.lock().push((event, payload.clone()));
                Ok(())
            }),
        );
    }

    let script = async {
        for number in [5, 10, 3] {
            stream.write(&json!({"number": number})).await.unwrap();
        }
        stream.end().await;
    };
    tokio::time::timeout(Duration::from_secs(10), event_loop.run_iteration(script))
        .await
        .expect("stream did not finish");

    let log = log.lock();
    let names: Vec<_> = log.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, ["data", "data", "data", "end"]);
    let sums: Vec<_> = log.iter().take(3).map(|(_, payload)| payload["sum"].clone()).collect();
    assert_eq!(sums, [json!(5), json!(15), json!(18)]);

    let stats = metrics.stats("/test.v1.PingService/CumSum");
    assert_eq!(stats.messages_sent, 3);
    assert_eq!(stats.messages_received, 3);
    assert_eq!(stats.streams_ended, 1);
}
