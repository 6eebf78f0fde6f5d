//! Receivers.
//!
//! Both transports decode into [`Decoded`] requests and hand them to the
//! signal's [`Ingress`], which runs the processor chain and enqueues the
//! survivors for batching. A request either leaves the ingress admitted as a
//! whole (minus individually rejected records) or is refused with an
//! [`IngestError`].

pub mod grpc;
pub mod http;

use crate::admission::AdmissionError;
use crate::batcher::Admitted;
use crate::error::IngestError;
use crate::processor::{Processor, ProcessorChain, StageContext, StageError};
use crate::telemetry::{Counter, Counters};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::models::{LogRecord, MetricPoint, Record, SignalType, Span};
use shared::otlp::proto::collector::{
    logs::v1::{ExportLogsPartialSuccess, ExportLogsServiceRequest, ExportLogsServiceResponse},
    metrics::v1::{
        ExportMetricsPartialSuccess, ExportMetricsServiceRequest, ExportMetricsServiceResponse,
    },
    trace::v1::{ExportTracePartialSuccess, ExportTraceServiceRequest, ExportTraceServiceResponse},
};
use shared::otlp::{decode_logs, decode_metrics, decode_traces, Decoded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};

/// Outcome of an admitted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    /// Records that entered the pipeline.
    pub accepted: usize,
    /// Records rejected individually.
    pub rejected: usize,
    /// Summary of the rejections.
    pub error_message: Option<String>,
}

struct Inner<T: Record> {
    tx: mpsc::Sender<Admitted<T>>,
    chain: ProcessorChain<T>,
    validator: Option<Box<dyn Processor<T>>>,
    counters: Arc<Counters>,
    enqueue_timeout: Duration,
    closed: AtomicBool,
}

/// Entry point of one signal pipeline, shared by every receiver.
pub struct Ingress<T: Record> {
    inner: Arc<Inner<T>>,
}

impl<T: Record> Clone for Ingress<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Record> Ingress<T> {
    /// Creates an ingress feeding `tx`.
    ///
    /// `validator` runs before the processor chain and drops individual
    /// records, e.g. counters that went backwards.
    #[must_use]
    pub fn new(
        tx: mpsc::Sender<Admitted<T>>,
        chain: ProcessorChain<T>,
        validator: Option<Box<dyn Processor<T>>>,
        counters: Arc<Counters>,
        enqueue_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tx,
                chain,
                validator,
                counters,
                enqueue_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Whether new requests are refused.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Refuses every later request with `ShuttingDown`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Counts a request the transport refused before decoding it.
    ///
    /// Its record count is unknown, so it counts as one rejected record.
    pub fn reject_undecodable(&self) {
        self.inner.counters.signal(T::SIGNAL).add(Counter::Rejected, 1);
    }

    /// Runs a decoded request through the pipeline.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` once closed, `Backpressure` above the soft
    /// memory limit and `ResourceExhausted` above the hard limit or when the
    /// ingress queue stays full for the enqueue timeout. A refused request
    /// admits nothing.
    pub async fn submit(&self, decoded: Decoded<T>) -> Result<Accepted, IngestError> {
        let counters = self.inner.counters.signal(T::SIGNAL);
        let decode_rejected = decoded.rejected_count();
        let total = decoded.records.len() + decode_rejected;
        if self.is_closed() {
            counters.add(Counter::Rejected, total);
            return Err(IngestError::ShuttingDown);
        }
        let decode_message = decoded.rejected.first().map(ToString::to_string);

        let mut ctx = StageContext::new();
        let records = match self.process(decoded.records, &mut ctx) {
            Ok(records) => records,
            Err(e) => {
                counters.add(Counter::Rejected, total);
                return Err(refusal(e));
            }
        };

        let accepted = records.len();
        if !records.is_empty() {
            let admitted = Admitted {
                records,
                permit: ctx.take_permit(),
            };
            if let Err(e) = self.inner.tx.send_timeout(admitted, self.inner.enqueue_timeout).await {
                counters.add(Counter::Rejected, total);
                return Err(match e {
                    SendTimeoutError::Timeout(_) => {
                        tracing::warn!(
                            signal = %T::SIGNAL,
                            records = accepted,
                            "Ingress queue full"
                        );
                        IngestError::ResourceExhausted("ingress queue full".to_string())
                    }
                    SendTimeoutError::Closed(_) => IngestError::ShuttingDown,
                });
            }
        }

        let rejected = decode_rejected + ctx.rejected();
        counters.add(Counter::Received, accepted);
        counters.add(Counter::Rejected, rejected);
        let error_message = decode_message
            .or_else(|| ctx.first_rejection().map(str::to_string))
            .filter(|_| rejected > 0)
            .map(|first| format!("{rejected} records rejected; first error: {first}"));

        tracing::debug!(signal = %T::SIGNAL, accepted, rejected, "Admitted request");
        Ok(Accepted {
            accepted,
            rejected,
            error_message,
        })
    }

    fn process(&self, records: Vec<T>, ctx: &mut StageContext) -> Result<Vec<T>, StageError> {
        let records = match &self.inner.validator {
            Some(validator) => validator.process(records, ctx)?,
            None => records,
        };
        self.inner.chain.run(records, ctx)
    }
}

fn refusal(error: StageError) -> IngestError {
    match error {
        StageError::Admission(AdmissionError::SoftLimit { .. }) => IngestError::Backpressure,
        StageError::Admission(e @ AdmissionError::HardLimit { .. }) => {
            IngestError::ResourceExhausted(e.to_string())
        }
    }
}

/// The ingress of every configured pipeline.
#[derive(Clone, Default)]
pub struct Ingresses {
    /// Traces pipeline.
    pub traces: Option<Ingress<Span>>,
    /// Metrics pipeline.
    pub metrics: Option<Ingress<MetricPoint>>,
    /// Logs pipeline.
    pub logs: Option<Ingress<LogRecord>>,
}

impl Ingresses {
    /// Counts an undecodable request against the pipeline of `signal`.
    pub fn reject_undecodable(&self, signal: SignalType) {
        match signal {
            SignalType::Traces => {
                if let Some(i) = &self.traces {
                    i.reject_undecodable();
                }
            }
            SignalType::Metrics => {
                if let Some(i) = &self.metrics {
                    i.reject_undecodable();
                }
            }
            SignalType::Logs => {
                if let Some(i) = &self.logs {
                    i.reject_undecodable();
                }
            }
        }
    }

    /// Refuses new requests on every pipeline.
    pub fn close(&self) {
        if let Some(i) = &self.traces {
            i.close();
        }
        if let Some(i) = &self.metrics {
            i.close();
        }
        if let Some(i) = &self.logs {
            i.close();
        }
    }
}

/// An OTLP export request type, shared by the HTTP and gRPC receivers.
pub trait OtlpExport: prost::Message + Default + DeserializeOwned + Send + 'static {
    /// Record type the request carries.
    type Record: Record;
    /// Matching response type.
    type Response: prost::Message + Serialize + Default + Send + 'static;

    /// Decodes the request into records.
    fn decode_records(&self) -> Decoded<Self::Record>;

    /// Builds the response, with a partial success when records were rejected.
    fn response(accepted: &Accepted) -> Self::Response;
}

fn rejected_i64(accepted: &Accepted) -> i64 {
    i64::try_from(accepted.rejected).unwrap_or(i64::MAX)
}

impl OtlpExport for ExportTraceServiceRequest {
    type Record = Span;
    type Response = ExportTraceServiceResponse;

    fn decode_records(&self) -> Decoded<Span> {
        decode_traces(self)
    }

    fn response(accepted: &Accepted) -> Self::Response {
        ExportTraceServiceResponse {
            partial_success: (accepted.rejected > 0).then(|| ExportTracePartialSuccess {
                rejected_spans: rejected_i64(accepted),
                error_message: accepted.error_message.clone().unwrap_or_default(),
            }),
        }
    }
}

impl OtlpExport for ExportMetricsServiceRequest {
    type Record = MetricPoint;
    type Response = ExportMetricsServiceResponse;

    fn decode_records(&self) -> Decoded<MetricPoint> {
        decode_metrics(self)
    }

    fn response(accepted: &Accepted) -> Self::Response {
        ExportMetricsServiceResponse {
            partial_success: (accepted.rejected > 0).then(|| ExportMetricsPartialSuccess {
                rejected_data_points: rejected_i64(accepted),
                error_message: accepted.error_message.clone().unwrap_or_default(),
            }),
        }
    }
}

impl OtlpExport for ExportLogsServiceRequest {
    type Record = LogRecord;
    type Response = ExportLogsServiceResponse;

    fn decode_records(&self) -> Decoded<LogRecord> {
        decode_logs(self)
    }

    fn response(accepted: &Accepted) -> Self::Response {
        ExportLogsServiceResponse {
            partial_success: (accepted.rejected > 0).then(|| ExportLogsPartialSuccess {
                rejected_log_records: rejected_i64(accepted),
                error_message: accepted.error_message.clone().unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::MemoryBudget;
    use crate::processor::{MemoryLimiter, SeriesCheck};
    use shared::config::MemoryLimits;
    use shared::models::{Resource, Severity, SignalType};
    use shared::otlp::DecodeError;

    fn logs(n: usize) -> Vec<LogRecord> {
        let resource = Resource::for_service("api").shared();
        (0..n)
            .map(|i| LogRecord::new(Severity::Info, format!("line {i}"), Arc::clone(&resource)))
            .collect()
    }

    fn decoded<T>(records: Vec<T>) -> Decoded<T> {
        Decoded {
            records,
            rejected: Vec::new(),
        }
    }

    fn ingress(
        budget: &Arc<MemoryBudget>,
        capacity: usize,
    ) -> (Ingress<LogRecord>, mpsc::Receiver<Admitted<LogRecord>>, Arc<Counters>) {
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Counters::new_shared();
        let stages: Vec<Box<dyn Processor<LogRecord>>> =
            vec![Box::new(MemoryLimiter::implicit(Arc::clone(budget)))];
        let ingress = Ingress::new(
            tx,
            ProcessorChain::new(stages),
            None,
            Arc::clone(&counters),
            Duration::from_millis(20),
        );
        (ingress, rx, counters)
    }

    fn count(counters: &Counters, counter: Counter) -> u64 {
        counters.signal(SignalType::Logs).get(counter)
    }

    #[tokio::test]
    async fn test_admitted_request_reaches_channel_with_permit() {
        let budget = MemoryBudget::new_shared(MemoryLimits::new(1 << 20, 2 << 20));
        let (ingress, mut rx, counters) = ingress(&budget, 4);

        let accepted = ingress.submit(decoded(logs(3))).await.unwrap();
        assert_eq!(accepted.accepted, 3);
        assert_eq!(accepted.rejected, 0);
        assert!(accepted.error_message.is_none());

        let admitted = rx.recv().await.unwrap();
        assert_eq!(admitted.records.len(), 3);
        assert!(admitted.permit.bytes() > 0);
        assert_eq!(budget.used(), admitted.permit.bytes());
        assert_eq!(count(&counters, Counter::Received), 3);

        drop(admitted);
        assert_eq!(budget.used(), 0);
    }

    #[tokio::test]
    async fn test_decode_rejections_are_partial_success() {
        let budget = MemoryBudget::new_shared(MemoryLimits::new(1 << 20, 2 << 20));
        let (ingress, _rx, counters) = ingress(&budget, 4);

        let request = Decoded {
            records: logs(2),
            rejected: vec![DecodeError::MissingValue("latency".into())],
        };
        let accepted = ingress.submit(request).await.unwrap();

        assert_eq!(accepted.accepted, 2);
        assert_eq!(accepted.rejected, 1);
        assert!(accepted.error_message.unwrap().contains("latency"));
        assert_eq!(count(&counters, Counter::Received), 2);
        assert_eq!(count(&counters, Counter::Rejected), 1);
    }

    #[tokio::test]
    async fn test_soft_limit_refuses_whole_request() {
        let budget = MemoryBudget::new_shared(MemoryLimits::new(100, 1 << 20));
        let _held = budget.admit(100).unwrap();
        let (ingress, mut rx, counters) = ingress(&budget, 4);

        let err = ingress.submit(decoded(logs(2))).await.unwrap_err();
        assert_eq!(err, IngestError::Backpressure);
        assert_eq!(count(&counters, Counter::Rejected), 2);
        assert!(rx.try_recv().is_err());
        assert_eq!(budget.used(), 100);
    }

    #[tokio::test]
    async fn test_hard_limit_is_resource_exhausted() {
        let budget = MemoryBudget::new_shared(MemoryLimits::new(1000, 1001));
        let (ingress, _rx, _counters) = ingress(&budget, 4);

        // One large request crosses the hard limit and latches refusal.
        let _first = ingress.submit(decoded(logs(50))).await.unwrap();
        assert!(budget.is_refusing());

        let err = ingress.submit(decoded(logs(1))).await.unwrap_err();
        assert!(matches!(err, IngestError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_full_queue_times_out_and_releases_memory() {
        let budget = MemoryBudget::new_shared(MemoryLimits::new(1 << 20, 2 << 20));
        let (ingress, _rx, counters) = ingress(&budget, 1);

        ingress.submit(decoded(logs(1))).await.unwrap();
        let used = budget.used();
        let err = ingress.submit(decoded(logs(1))).await.unwrap_err();

        assert!(matches!(err, IngestError::ResourceExhausted(_)));
        assert_eq!(budget.used(), used);
        assert_eq!(count(&counters, Counter::Rejected), 1);
    }

    #[tokio::test]
    async fn test_closed_ingress_refuses() {
        let budget = MemoryBudget::new_shared(MemoryLimits::new(1 << 20, 2 << 20));
        let (ingress, _rx, counters) = ingress(&budget, 4);
        let ingresses = Ingresses {
            logs: Some(ingress.clone()),
            ..Ingresses::default()
        };

        ingresses.close();
        assert!(ingress.is_closed());
        assert_eq!(ingress.submit(decoded(logs(1))).await.unwrap_err(), IngestError::ShuttingDown);
        assert_eq!(count(&counters, Counter::Received), 0);
        assert_eq!(count(&counters, Counter::Rejected), 1);
    }

    #[tokio::test]
    async fn test_refused_request_is_not_received() {
        let budget = MemoryBudget::new_shared(MemoryLimits::new(100, 1 << 20));
        let (ingress, _rx, counters) = ingress(&budget, 4);

        ingress.submit(decoded(logs(2))).await.unwrap();
        let _held = budget.admit(100);
        ingress.submit(decoded(logs(2))).await.unwrap_err();

        assert_eq!(count(&counters, Counter::Received), 2);
        assert_eq!(count(&counters, Counter::Rejected), 2);
    }

    #[test]
    fn test_undecodable_request_counts_as_rejected() {
        let budget = MemoryBudget::new_shared(MemoryLimits::new(1 << 20, 2 << 20));
        let (ingress, _rx, counters) = ingress(&budget, 4);
        let ingresses = Ingresses {
            logs: Some(ingress),
            ..Ingresses::default()
        };

        ingresses.reject_undecodable(SignalType::Logs);
        ingresses.reject_undecodable(SignalType::Traces);
        assert_eq!(count(&counters, Counter::Rejected), 1);
        assert_eq!(count(&counters, Counter::Received), 0);
    }

    #[tokio::test]
    async fn test_validator_drops_backwards_counter() {
        let (tx, mut rx) = mpsc::channel(4);
        let budget = MemoryBudget::new_shared(MemoryLimits::new(1 << 20, 2 << 20));
        let stages: Vec<Box<dyn Processor<MetricPoint>>> =
            vec![Box::new(MemoryLimiter::implicit(budget))];
        let ingress = Ingress::new(
            tx,
            ProcessorChain::new(stages),
            Some(Box::new(SeriesCheck::new(100))),
            Counters::new_shared(),
            Duration::from_millis(20),
        );
        let resource = Resource::for_service("api").shared();
        let point = |v| MetricPoint::counter("requests_total", v, Arc::clone(&resource));

        ingress.submit(decoded(vec![point(10.0)])).await.unwrap();
        let accepted = ingress.submit(decoded(vec![point(4.0), point(12.0)])).await.unwrap();

        assert_eq!(accepted.accepted, 1);
        assert_eq!(accepted.rejected, 1);
        rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.records[0].value.as_number(), Some(12.0));
    }

    #[test]
    fn test_partial_success_response() {
        let accepted = Accepted {
            accepted: 4,
            rejected: 2,
            error_message: Some("2 records rejected".into()),
        };
        let response = ExportTraceServiceRequest::response(&accepted);
        let partial = response.partial_success.unwrap();
        assert_eq!(partial.rejected_spans, 2);
        assert_eq!(partial.error_message, "2 records rejected");

        let clean = Accepted {
            rejected: 0,
            error_message: None,
            ..accepted
        };
        assert!(ExportLogsServiceRequest::response(&clean).partial_success.is_none());
    }
}
