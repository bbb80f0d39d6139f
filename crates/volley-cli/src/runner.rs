//! Runs a scenario's steps on an event loop

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info, warn};
use volley_core::metrics::MethodStats;
use volley_core::{Client, EventLoop, InMemoryMetrics, Listener, SchemaRegistry};

use crate::scenario::{load_schema, Scenario, Step};

/// Event totals across every stream in the run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EventCounts {
    pub data: u64,
    pub errors: u64,
    pub ends: u64,
    pub unary_failures: u64,
}

pub struct RunReport {
    pub iterations: u64,
    pub events: EventCounts,
    pub metrics: BTreeMap<String, MethodStats>,
}

pub struct Runner {
    scenario: Scenario,
    event_loop: EventLoop,
    client: Client,
    metrics: Arc<InMemoryMetrics>,
    counts: Arc<Mutex<EventCounts>>,
}

impl Runner {
    /// Load the schema and connect
    pub fn new(scenario: Scenario) -> Result<Self> {
        let registry = Arc::new(SchemaRegistry::new());
        load_schema(&registry, &scenario.schema)?;

        let event_loop = EventLoop::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let client = Client::new(event_loop.handle(), registry, metrics.clone());
        client
            .connect(&scenario.address, scenario.connect.as_ref())
            .with_context(|| format!("Failed to connect to {}", scenario.address))?;

        Ok(Self {
            scenario,
            event_loop,
            client,
            metrics,
            counts: Arc::new(Mutex::new(EventCounts::default())),
        })
    }

    pub async fn run(mut self, iterations: u64) -> Result<RunReport> {
        for iteration in 1..=iterations {
            info!(iteration, steps = self.scenario.steps.len(), "Running iteration");
            let script = run_steps(&self.client, &self.scenario.steps, &self.counts);
            self.event_loop.run_iteration(script).await?;
        }
        self.client.close();

        Ok(RunReport {
            iterations,
            events: self.counts.lock().clone(),
            metrics: self.metrics.summary(),
        })
    }
}

async fn run_steps(client: &Client, steps: &[Step], counts: &Arc<Mutex<EventCounts>>) -> Result<()> {
    for step in steps {
        match step {
            Step::Unary {
                method,
                request,
                options,
            } => {
                let response = client
                    .invoke(method, request, options.as_ref())
                    .await
                    .with_context(|| format!("Unary call to {method} failed"))?;
                if response.is_ok() {
                    info!(method = %method, message = %response.message, "Unary response");
                } else {
                    counts.lock().unary_failures += 1;
                    warn!(
                        method = %method,
                        status = response.status,
                        error = %response.message,
                        "Unary call returned an error"
                    );
                }
            }
            Step::Stream {
                method,
                messages,
                options,
                close,
            } => {
                let stream = client
                    .stream(method, options.as_ref())
                    .with_context(|| format!("Failed to open stream {}", step.method()))?;
                watch(&stream, method, counts);

                for message in messages {
                    if let Err(e) = stream.write(message).await {
                        // The error listener already has the cause
                        warn!(stream_id = %stream.id(), error = %e, "Stopped writing");
                        break;
                    }
                }
                if *close {
                    stream.close();
                } else {
                    stream.end().await;
                }
            }
        }
    }
    Ok(())
}

/// Log every event and count it
fn watch(stream: &volley_core::Stream, method: &str, counts: &Arc<Mutex<EventCounts>>) {
    let id = stream.id();

    let (data_counts, data_method) = (counts.clone(), method.to_string());
    stream.on(
        "data",
        Listener::new(move |message: &Value| {
            data_counts.lock().data += 1;
            info!(stream_id = %id, method = %data_method, message = %message, "Stream data");
            Ok(())
        }),
    );

    let (error_counts, error_method) = (counts.clone(), method.to_string());
    stream.on(
        "error",
        Listener::new(move |payload: &Value| {
            error_counts.lock().errors += 1;
            error!(stream_id = %id, method = %error_method, error = %payload, "Stream error");
            Ok(())
        }),
    );

    let (end_counts, end_method) = (counts.clone(), method.to_string());
    stream.on(
        "end",
        Listener::new(move |_: &Value| {
            end_counts.lock().ends += 1;
            info!(stream_id = %id, method = %end_method, "Stream ended");
            Ok(())
        }),
    );
}

/// Human-readable summary for stdout
pub fn render(report: &RunReport) -> Result<String> {
    let summary = serde_json::json!({
        "iterations": report.iterations,
        "events": {
            "data": report.events.data,
            "error": report.events.errors,
            "end": report.events.ends,
            "unaryFailures": report.events.unary_failures,
        },
        "methods": report.metrics,
    });
    Ok(serde_json::to_string_pretty(&summary)?)
}
