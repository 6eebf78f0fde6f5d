//! Common test utilities and helpers for integration tests.
//!
//! This module provides a collector configuration bound to loopback ports,
//! an in-process HTTP destination that records what it receives, and
//! builders for sample telemetry.

#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::Router;
use shared::config::{
    CollectorConfig, ExporterConfig, ListenerConfig, MemoryExporterConfig, OtlpHttpExporterConfig,
    RetryConfig,
};
use shared::models::{LogRecord, Resource, Severity, Span, SpanId, TraceId};
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};

pub const TRACE_ID: &str = "0af7651916cd43dd8448eb211c80319c";
pub const SPAN_ID: &str = "b7ad6b7169203331";

/// A collector configuration with every listener on an ephemeral loopback port.
///
/// No pipelines are configured.
pub fn base_config() -> CollectorConfig {
    let mut config = CollectorConfig::default();
    config.receivers.http = ListenerConfig::enabled("127.0.0.1:0");
    config.receivers.grpc = ListenerConfig::enabled("127.0.0.1:0");
    config.service.address = "127.0.0.1:0".to_string();
    config.service.telemetry_interval_ms = 60_000;
    config.service.shutdown_grace_ms = 2_000;
    config
}

/// Retry settings with short backoffs.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_backoff_ms: 10,
        max_backoff_ms: 40,
        multiplier: 2.0,
        max_attempts: 5,
        queue_size: 16,
        attempt_timeout_ms: 1_000,
    }
}

pub fn add_memory_exporter(config: &mut CollectorConfig, name: &str) {
    config.exporters.insert(
        name.to_string(),
        ExporterConfig::Memory(MemoryExporterConfig::default()),
    );
}

pub fn add_otlp_exporter(config: &mut CollectorConfig, name: &str, sink: &Sink, retry: RetryConfig) {
    config.exporters.insert(
        name.to_string(),
        ExporterConfig::OtlpHttp(OtlpHttpExporterConfig {
            endpoint: sink.url(),
            headers: BTreeMap::new(),
            compression: shared::config::Compression::None,
            retry,
        }),
    );
}

/// One request seen by a [`Sink`].
#[derive(Debug, Clone)]
pub struct Captured {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Default)]
struct SinkState {
    requests: Mutex<Vec<Captured>>,
    script: Mutex<VecDeque<StatusCode>>,
    hang: bool,
}

/// An in-process HTTP destination.
///
/// Answers with the scripted statuses in order, then 200. A hanging sink
/// records the request and never answers.
#[derive(Clone)]
pub struct Sink {
    addr: SocketAddr,
    state: Arc<SinkState>,
}

impl Sink {
    pub async fn start(script: Vec<StatusCode>) -> Self {
        Self::spawn(SinkState {
            script: Mutex::new(script.into()),
            ..SinkState::default()
        })
        .await
    }

    pub async fn ok() -> Self {
        Self::start(Vec::new()).await
    }

    pub async fn hanging() -> Self {
        Self::spawn(SinkState {
            hang: true,
            ..SinkState::default()
        })
        .await
    }

    async fn spawn(state: SinkState) -> Self {
        let state = Arc::new(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(capture).with_state(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<Captured> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn capture(State(state): State<Arc<SinkState>>, uri: Uri, headers: HeaderMap, body: Bytes) -> StatusCode {
    state.requests.lock().unwrap().push(Captured {
        path: uri.path().to_string(),
        headers,
        body,
    });
    if state.hang {
        std::future::pending::<()>().await;
    }
    state.script.lock().unwrap().pop_front().unwrap_or(StatusCode::OK)
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

/// POSTs an OTLP protobuf body to the HTTP receiver.
pub async fn post_otlp(addr: SocketAddr, path: &str, body: Vec<u8>) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}{path}"))
        .header("content-type", "application/x-protobuf")
        .body(body)
        .send()
        .await
        .unwrap()
}

pub async fn get(addr: SocketAddr, path: &str) -> reqwest::Response {
    reqwest::get(format!("http://{addr}{path}")).await.unwrap()
}

pub fn trace_id() -> TraceId {
    TraceId::from_hex(TRACE_ID).unwrap()
}

pub fn span_id() -> SpanId {
    SpanId::from_hex(SPAN_ID).unwrap()
}

/// `count` spans of one trace.
pub fn spans(count: u8, service: &str) -> Vec<Span> {
    let resource = Resource::for_service(service).shared();
    (1..=count)
        .map(|i| {
            Span::new(
                trace_id(),
                SpanId::from_bytes([i; 8]).unwrap(),
                format!("operation-{i}"),
                Arc::clone(&resource),
            )
        })
        .collect()
}

/// `count` info records.
pub fn logs(count: usize, service: &str) -> Vec<LogRecord> {
    let resource = Resource::for_service(service).shared();
    (0..count)
        .map(|i| LogRecord::new(Severity::Info, format!("message {i}"), Arc::clone(&resource)))
        .collect()
}
