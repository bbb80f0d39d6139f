use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::*;
use crate::codec::{fixtures, JsonCodec, ProtoCodec};
use crate::events::Listener;
use crate::metrics::InMemoryMetrics;
use crate::rpc::Code;
use crate::runtime::EventLoop;
use crate::schema::MethodInfo;

enum Request {
    Message(Bytes),
    HalfClose,
}

type Responses = mpsc::UnboundedSender<Result<Bytes, RpcError>>;

/// In-process stand-in for a streaming server
struct FakeTransport {
    requests: mpsc::UnboundedSender<Request>,
    responses: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Bytes, RpcError>>>,
    send_error: Option<RpcError>,
    close_error: Option<RpcError>,
    received: Mutex<Vec<Bytes>>,
    half_closes: AtomicUsize,
}

#[async_trait]
impl StreamTransport for FakeTransport {
    async fn send(&self, message: Bytes) -> Result<(), RpcError> {
        if let Some(error) = &self.send_error {
            return Err(error.clone());
        }
        self.received.lock().push(message.clone());
        let _ = self.requests.send(Request::Message(message));
        Ok(())
    }

    async fn close_send(&self) -> Result<(), RpcError> {
        self.half_closes.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.close_error {
            return Err(error.clone());
        }
        let _ = self.requests.send(Request::HalfClose);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Bytes>, RpcError> {
        match self.responses.lock().await.recv().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(error)) => Err(error),
            None => Ok(None),
        }
    }
}

fn serve<F, Fut>(server: F) -> Arc<FakeTransport>
where
    F: FnOnce(mpsc::UnboundedReceiver<Request>, Responses) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    tokio::spawn(server(request_rx, response_tx));
    Arc::new(FakeTransport {
        requests: request_tx,
        responses: tokio::sync::Mutex::new(response_rx),
        send_error: None,
        close_error: None,
        received: Mutex::new(Vec::new()),
        half_closes: AtomicUsize::new(0),
    })
}

/// A transport with no server behind it
fn broken(send_error: Option<RpcError>, close_error: Option<RpcError>) -> Arc<FakeTransport> {
    let (request_tx, _) = mpsc::unbounded_channel();
    let (_, response_rx) = mpsc::unbounded_channel();
    Arc::new(FakeTransport {
        requests: request_tx,
        responses: tokio::sync::Mutex::new(response_rx),
        send_error,
        close_error,
        received: Mutex::new(Vec::new()),
        half_closes: AtomicUsize::new(0),
    })
}

/// Waits for the half-close, then fails the call with `error`
fn fails_after_half_close(error: RpcError) -> Arc<FakeTransport> {
    serve(|mut requests, responses| async move {
        while let Some(request) = requests.recv().await {
            if let Request::HalfClose = request {
                let _ = responses.send(Err(error));
                break;
            }
        }
        std::future::pending::<()>().await;
    })
}

fn json_reply(value: Value) -> Result<Bytes, RpcError> {
    Ok(Bytes::from(serde_json::to_vec(&value).unwrap()))
}

fn number_of(message: &Bytes) -> i64 {
    serde_json::from_slice::<Value>(message).unwrap()["number"]
        .as_i64()
        .unwrap_or(0)
}

/// Replies with the running total of every `number` it receives
fn cum_sum() -> Arc<FakeTransport> {
    serve(|mut requests, responses| async move {
        let mut sum = 0;
        while let Some(Request::Message(message)) = requests.recv().await {
            sum += number_of(&message);
            let _ = responses.send(json_reply(json!({ "sum": sum })));
        }
    })
}

/// Counts up to the first `number` it receives
fn count_up() -> Arc<FakeTransport> {
    serve(|mut requests, responses| async move {
        if let Some(Request::Message(message)) = requests.recv().await {
            for i in 1..=number_of(&message) {
                let _ = responses.send(json_reply(json!({ "number": i })));
            }
        }
        while let Some(Request::Message(_)) = requests.recv().await {}
    })
}

/// Answers every message and never finishes on its own
fn never_ends() -> Arc<FakeTransport> {
    serve(|mut requests, responses| async move {
        while let Some(request) = requests.recv().await {
            if let Request::Message(message) = request {
                let _ = responses.send(json_reply(json!({ "sum": number_of(&message) })));
            }
        }
        std::future::pending::<()>().await;
    })
}

type Log = Arc<Mutex<Vec<(&'static str, Value)>>>;

struct Harness {
    event_loop: EventLoop,
    stream: Stream,
    log: Log,
    metrics: Arc<InMemoryMetrics>,
}

impl Harness {
    fn events(&self, name: &str) -> Vec<Value> {
        self.log
            .lock()
            .iter()
            .filter(|(event, _)| *event == name)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn names(&self) -> Vec<&'static str> {
        self.log.lock().iter().map(|(event, _)| *event).collect()
    }

    /// Run completions until `count` events arrived
    async fn wait_for_events(&mut self, count: usize) {
        for _ in 0..400 {
            self.event_loop.tick();
            if self.log.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {count} events, got {:?}", self.names());
    }

    async fn finish(&mut self) {
        tokio::time::timeout(Duration::from_secs(5), self.event_loop.run_until_idle())
            .await
            .expect("stream never released its completion queue");
    }
}

fn open(
    transport: Arc<FakeTransport>,
    procedure: &str,
    codec: Arc<dyn Codec>,
    timeout: Option<Duration>,
) -> Harness {
    let pool = Arc::new(fixtures::pool());
    let (input, output) = match procedure {
        "CountUp" => ("test.CountUpRequest", "test.CountUpResponse"),
        _ => ("test.CumSumRequest", "test.CumSumResponse"),
    };
    let info = MethodInfo {
        package: "test".into(),
        service: "PingService".into(),
        full_method: format!("/test.PingService/{procedure}"),
        is_client_stream: true,
        is_server_stream: true,
    };
    let method = Arc::new(MethodSchema {
        info: info.clone(),
        input: pool.message(input).unwrap().clone(),
        output: pool.message(output).unwrap().clone(),
        pool: pool.clone(),
    });

    let event_loop = EventLoop::new();
    let handle = event_loop.handle();
    let metrics = Arc::new(InMemoryMetrics::new());
    let stream = Stream::open(StreamSetup {
        method,
        transport,
        codec,
        pool,
        metrics: metrics.clone(),
        tags: MetricTags {
            method: info.full_method.clone(),
            ..Default::default()
        },
        ctx: CallContext::new(handle.context(), timeout),
        queue: handle.completion_queue(),
    });

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    for event in [EVENT_DATA, EVENT_ERROR, EVENT_END] {
        let log = log.clone();
        stream.on(
            event,
            Listener::new(move |payload| {
                log.lock().push((event, payload.clone()));
                Ok(())
            }),
        );
    }

    Harness {
        event_loop,
        stream,
        log,
        metrics,
    }
}

#[tokio::test]
async fn test_cum_sum_delivers_running_totals_then_end() {
    let transport = cum_sum();
    let mut h = open(transport.clone(), "CumSum", Arc::new(JsonCodec), None);

    for number in [5, 10, 3] {
        h.stream.write(&json!({ "number": number })).await.unwrap();
    }
    h.stream.end().await;
    h.finish().await;

    assert_eq!(
        h.events(EVENT_DATA),
        vec![json!({"sum": 5}), json!({"sum": 15}), json!({"sum": 18})]
    );
    assert_eq!(h.names().last(), Some(&EVENT_END));
    assert_eq!(h.events(EVENT_END).len(), 1);
    assert!(h.events(EVENT_ERROR).is_empty());

    let stats = h.metrics.stats("/test.PingService/CumSum");
    assert_eq!(stats.streams_started, 1);
    assert_eq!(stats.streams_ended, 1);
    assert_eq!(stats.streams_failed, 0);
    assert_eq!(stats.messages_sent, 3);
    assert_eq!(stats.messages_received, 3);
}

#[tokio::test]
async fn test_count_up_fans_out() {
    let mut h = open(count_up(), "CountUp", Arc::new(JsonCodec), None);

    h.stream.write(&json!({ "number": 5 })).await.unwrap();
    h.stream.end().await;
    h.finish().await;

    let numbers: Vec<i64> = h
        .events(EVENT_DATA)
        .iter()
        .map(|v| v["number"].as_i64().unwrap())
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    assert_eq!(h.names().last(), Some(&EVENT_END));
}

#[tokio::test]
async fn test_write_after_end_fails_without_sending() {
    let transport = cum_sum();
    let mut h = open(transport.clone(), "CumSum", Arc::new(JsonCodec), None);

    h.stream.write(&json!({ "number": 1 })).await.unwrap();
    h.stream.end().await;
    h.stream.end().await;

    let err = h.stream.write(&json!({ "number": 2 })).await.unwrap_err();
    assert!(matches!(err, StreamError::ClosedForWriting));
    assert_eq!(err.to_string(), "cannot write to a closed stream");
    h.finish().await;

    assert_eq!(transport.received.lock().len(), 1);
    assert_eq!(transport.half_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.events(EVENT_END).len(), 1);
}

#[tokio::test]
async fn test_close_mid_stream_ends_without_error() {
    let mut h = open(never_ends(), "CumSum", Arc::new(JsonCodec), None);

    h.stream.write(&json!({ "number": 7 })).await.unwrap();
    h.wait_for_events(1).await;

    h.stream.close();
    h.stream.close();
    let delivered_before_close = h.events(EVENT_DATA).len();
    h.finish().await;

    assert_eq!(h.events(EVENT_DATA).len(), delivered_before_close);
    assert_eq!(h.events(EVENT_END), vec![Value::Null]);
    assert!(h.events(EVENT_ERROR).is_empty());

    let err = h.stream.write(&json!({ "number": 1 })).await.unwrap_err();
    assert!(matches!(err, StreamError::ClosedForWriting));
}

#[tokio::test]
async fn test_close_before_first_write_still_ends() {
    let transport = cum_sum();
    let mut h = open(transport.clone(), "CumSum", Arc::new(JsonCodec), None);

    h.stream.close();
    h.finish().await;

    assert_eq!(h.names(), vec![EVENT_END]);
    assert!(transport.received.lock().is_empty());
    assert_eq!(h.metrics.stats("/test.PingService/CumSum").streams_ended, 1);
}

#[tokio::test]
async fn test_failing_listeners_do_not_block_delivery() {
    let transport = cum_sum();
    let calls_seen = Arc::new(AtomicUsize::new(0));
    let mut h = open(transport, "CumSum", Arc::new(JsonCodec), None);

    // Registered after the recorder, so they run second and third
    h.stream
        .on(EVENT_DATA, Listener::new(|_| anyhow::bail!("listener failed")));
    h.stream.on(EVENT_DATA, Listener::new(|_| panic!("listener panicked")));
    let calls = calls_seen.clone();
    h.stream.on(
        EVENT_DATA,
        Listener::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    h.stream.on(EVENT_END, json!("not callable"));

    h.stream.write(&json!({ "number": 1 })).await.unwrap();
    h.stream.write(&json!({ "number": 2 })).await.unwrap();
    h.stream.end().await;
    h.finish().await;

    assert_eq!(h.events(EVENT_DATA).len(), 2);
    assert_eq!(calls_seen.load(Ordering::SeqCst), 2);
    assert_eq!(h.events(EVENT_END).len(), 1);
}

#[tokio::test]
async fn test_null_write_sends_empty_message() {
    let transport = serve(|mut requests, _responses| async move {
        while let Some(Request::Message(_)) = requests.recv().await {}
    });
    let mut h = open(transport.clone(), "CumSum", Arc::new(ProtoCodec), None);

    h.stream.write(&Value::Null).await.unwrap();
    h.stream.end().await;
    h.finish().await;

    let received = transport.received.lock();
    assert_eq!(received.len(), 1);
    assert!(received[0].is_empty());
    assert_eq!(h.names(), vec![EVENT_END]);
}

#[tokio::test]
async fn test_unencodable_message_fails_stream() {
    let transport = cum_sum();
    let mut h = open(transport.clone(), "CumSum", Arc::new(JsonCodec), None);

    h.stream.write(&json!({ "nope": 1 })).await.unwrap();
    h.finish().await;

    let errors = h.events(EVENT_ERROR);
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["message"].as_str().unwrap().contains("nope"));
    assert!(h.events(EVENT_END).is_empty());
    assert!(transport.received.lock().is_empty());

    let err = h.stream.write(&json!({ "number": 1 })).await.unwrap_err();
    assert!(matches!(err, StreamError::StreamClosed));
    assert_eq!(h.metrics.stats("/test.PingService/CumSum").streams_failed, 1);
}

#[tokio::test]
async fn test_send_failure_is_reported_as_rpc_error() {
    let transport = broken(
        Some(RpcError::new(Code::Unavailable, "connection refused")),
        None,
    );
    let mut h = open(transport, "CumSum", Arc::new(JsonCodec), None);

    h.stream.write(&json!({ "number": 1 })).await.unwrap();
    h.finish().await;

    let errors = h.events(EVENT_ERROR);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "unavailable");
    assert_eq!(errors[0]["message"], "unavailable: connection refused");
    assert_eq!(errors[0]["details"], json!([]));
}

#[tokio::test]
async fn test_server_error_after_data() {
    let transport = serve(|mut requests, responses| async move {
        if let Some(Request::Message(message)) = requests.recv().await {
            let _ = responses.send(json_reply(json!({ "sum": number_of(&message) })));
            let _ = responses.send(Err(RpcError::new(Code::ResourceExhausted, "too many")));
        }
        while let Some(Request::Message(_)) = requests.recv().await {}
    });
    let mut h = open(transport, "CumSum", Arc::new(JsonCodec), None);

    h.stream.write(&json!({ "number": 4 })).await.unwrap();
    h.wait_for_events(2).await;
    h.stream.end().await;
    h.finish().await;

    assert_eq!(h.names(), vec![EVENT_DATA, EVENT_ERROR]);
    assert_eq!(h.events(EVENT_ERROR)[0]["code"], "resource_exhausted");
}

#[tokio::test]
async fn test_eof_error_counts_as_end() {
    let transport = serve(|mut requests, responses| async move {
        if let Some(Request::Message(_)) = requests.recv().await {
            let _ = responses.send(Err(RpcError::new(Code::Unknown, "unexpected EOF")));
        }
        while let Some(Request::Message(_)) = requests.recv().await {}
    });
    let mut h = open(transport, "CumSum", Arc::new(JsonCodec), None);

    h.stream.write(&json!({ "number": 1 })).await.unwrap();
    h.stream.end().await;
    h.finish().await;

    assert_eq!(h.names(), vec![EVENT_END]);
}

#[tokio::test]
async fn test_deadline_is_an_error() {
    let transport = serve(|mut requests, _responses| async move {
        while requests.recv().await.is_some() {}
        std::future::pending::<()>().await;
    });
    let mut h = open(
        transport,
        "CumSum",
        Arc::new(JsonCodec),
        Some(Duration::from_millis(50)),
    );

    h.stream.write(&json!({ "number": 1 })).await.unwrap();
    h.wait_for_events(1).await;
    h.stream.close();
    h.finish().await;

    assert_eq!(h.names(), vec![EVENT_ERROR]);
    assert_eq!(h.events(EVENT_ERROR)[0]["code"], "deadline_exceeded");
}

#[tokio::test]
async fn test_cancel_after_end_is_an_error() {
    let transport = fails_after_half_close(RpcError::new(Code::Canceled, "canceled by peer"));
    let mut h = open(transport, "CumSum", Arc::new(JsonCodec), None);

    h.stream.write(&json!({ "number": 1 })).await.unwrap();
    h.stream.end().await;
    h.finish().await;

    assert_eq!(h.names(), vec![EVENT_ERROR]);
    assert_eq!(h.events(EVENT_ERROR)[0]["code"], "canceled");
}

#[tokio::test]
async fn test_error_after_end_counts_as_failed() {
    let transport = fails_after_half_close(RpcError::new(Code::Internal, "boom"));
    let mut h = open(transport, "CumSum", Arc::new(JsonCodec), None);

    h.stream.write(&json!({ "number": 1 })).await.unwrap();
    h.stream.end().await;
    h.finish().await;

    assert_eq!(h.names(), vec![EVENT_ERROR]);
    let stats = h.metrics.stats("/test.PingService/CumSum");
    assert_eq!(stats.streams_ended, 1);
    assert_eq!(stats.streams_failed, 1);
}

#[tokio::test]
async fn test_half_close_failure_without_writes_is_an_error() {
    let transport = broken(None, Some(RpcError::new(Code::Unavailable, "connection reset")));
    let mut h = open(transport.clone(), "CumSum", Arc::new(JsonCodec), None);

    h.stream.end().await;
    h.finish().await;

    assert_eq!(transport.half_closes.load(Ordering::SeqCst), 1);
    assert_eq!(h.names(), vec![EVENT_ERROR]);
    assert_eq!(h.events(EVENT_ERROR)[0]["code"], "unavailable");
    assert_eq!(h.metrics.stats("/test.PingService/CumSum").streams_failed, 1);
}
