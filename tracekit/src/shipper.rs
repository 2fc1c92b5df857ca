//! Delivery of finished spans to a collector.
//!
//! [`Span::finish`](crate::Span::finish) hands spans to a [`SpanSink`]. The
//! production sink is the [`BatchShipper`], which queues spans without
//! blocking the instrumented code and ships them in batches over gRPC.
//! Delivery is at-most-once: overflow and failed uploads drop spans, with
//! counters and warnings as the only trace.

use crate::error::Error;
use crate::span::RawSpan;
use async_trait::async_trait;
use prometheus::IntCounter;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tonic::transport::Endpoint;
use tracekit_proto::timestamp;
use tracekit_proto::v1 as pb;
use tracekit_proto::v1::storer_client::StorerClient;
use tracing::warn;

/// Receives finished spans.
pub trait SpanSink: Send + Sync + fmt::Debug {
    /// Takes ownership of a finished span. Must not block; implementations
    /// that cannot keep up drop spans instead.
    fn submit(&self, span: RawSpan);
}

/// A sink that keeps every submitted span in memory, for tests and demos.
#[derive(Clone, Debug, Default)]
pub struct InMemorySink {
    spans: Arc<Mutex<Vec<RawSpan>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        InMemorySink::default()
    }

    /// A copy of everything submitted so far.
    pub fn spans(&self) -> Vec<RawSpan> {
        match self.spans.lock() {
            Ok(spans) => spans.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SpanSink for InMemorySink {
    fn submit(&self, span: RawSpan) {
        let mut spans = match self.spans.lock() {
            Ok(spans) => spans,
            Err(poisoned) => poisoned.into_inner(),
        };
        spans.push(span);
    }
}

/// Configuration for the [`BatchShipper`].
#[derive(Clone, Debug)]
pub struct ShipperConfig {
    /// How many spans to batch up before shipping them. The intake channel
    /// holds twice this many spans on top of the pending batch; spans
    /// arriving beyond that are dropped.
    pub queue_size: usize,
    /// How often to ship a non-empty batch that hasn't filled up.
    pub flush_interval: Duration,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        ShipperConfig {
            queue_size: 1024,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Uploads one batch of wire spans. Implemented by the gRPC client; tests
/// substitute their own.
#[async_trait]
pub trait SpanUploader: Send + 'static {
    async fn upload(&mut self, spans: Vec<pb::Span>) -> Result<(), tonic::Status>;
}

struct GrpcUploader {
    client: StorerClient<tonic::transport::Channel>,
}

#[async_trait]
impl SpanUploader for GrpcUploader {
    async fn upload(&mut self, spans: Vec<pb::Span>) -> Result<(), tonic::Status> {
        self.client.store(pb::StoreRequest { spans }).await?;
        Ok(())
    }
}

/// A [`SpanSink`] that batches spans and ships them to a collector.
///
/// `submit` is the fast path: a non-blocking enqueue onto a bounded intake
/// channel, counted in `stored_spans_total` on success and
/// `dropped_spans_total` when the channel is full. A single worker task
/// drains the channel into a pending batch and flushes it when it reaches
/// `queue_size` spans or `flush_interval` has passed. A failed upload is
/// logged and the batch is discarded; there are no retries.
#[derive(Debug)]
pub struct BatchShipper {
    tx: mpsc::Sender<RawSpan>,
    stored: IntCounter,
    dropped: IntCounter,
}

impl BatchShipper {
    /// Connects to a collector and spawns the shipper worker on the current
    /// Tokio runtime. The connection itself is established lazily.
    pub fn connect(endpoint: impl Into<String>, config: ShipperConfig) -> Result<Self, Error> {
        let channel = Endpoint::from_shared(endpoint.into())?.connect_lazy();
        Ok(Self::new(
            GrpcUploader {
                client: StorerClient::new(channel),
            },
            config,
        ))
    }

    /// Builds a shipper around an arbitrary uploader. Must be called within
    /// a Tokio runtime.
    pub fn new(uploader: impl SpanUploader, config: ShipperConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size * 2);
        let worker = Worker {
            rx,
            pending: Vec::with_capacity(config.queue_size),
            queue_size: config.queue_size,
            flush_interval: config.flush_interval,
            uploader,
        };
        tokio::spawn(worker.run());
        BatchShipper {
            tx,
            stored: register_counter("stored_spans_total", "Number of spans accepted for shipping."),
            dropped: register_counter("dropped_spans_total", "Number of spans dropped on intake overflow."),
        }
    }

    /// Spans accepted onto the intake channel so far.
    pub fn stored(&self) -> u64 {
        self.stored.get()
    }

    /// Spans dropped because the intake channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }
}

impl SpanSink for BatchShipper {
    fn submit(&self, span: RawSpan) {
        match self.tx.try_send(span) {
            Ok(()) => self.stored.inc(),
            Err(_) => self.dropped.inc(),
        }
    }
}

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("statically valid counter spec");
    if let Err(err) = prometheus::default_registry().register(Box::new(counter.clone())) {
        warn!("couldn't register prometheus counter: {err}");
    }
    counter
}

struct Worker<U> {
    rx: mpsc::Receiver<RawSpan>,
    pending: Vec<RawSpan>,
    queue_size: usize,
    flush_interval: Duration,
    uploader: U,
}

impl<U: SpanUploader> Worker<U> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(span) => {
                        self.pending.push(span);
                        if self.pending.len() == self.queue_size {
                            self.flush().await;
                        }
                    }
                    // All shipper handles are gone; drain and stop.
                    None => {
                        self.flush().await;
                        return;
                    }
                },
                _ = ticker.tick() => self.flush().await,
            }
        }
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let spans = self.pending.drain(..).map(to_wire).collect();
        if let Err(err) = self.uploader.upload(spans).await {
            warn!("couldn't flush spans: {err}");
        }
    }
}

/// Converts a raw span to its wire form. Tags are stringified; each log
/// entry rides as an extra tag whose timestamp marks it as a log.
pub(crate) fn to_wire(span: RawSpan) -> pb::Span {
    let mut tags = Vec::with_capacity(span.tags.len() + span.logs.len());
    for (key, value) in span.tags {
        tags.push(pb::Tag {
            key,
            value: value.to_string(),
            time: None,
        });
    }
    for log in span.logs {
        tags.push(pb::Tag {
            key: log.event,
            value: log.payload.map(|p| p.to_string()).unwrap_or_default(),
            time: Some(timestamp::from_system_time(log.timestamp)),
        });
    }
    pb::Span {
        span_id: span.context.span_id(),
        parent_id: span.context.parent_id(),
        trace_id: span.context.trace_id(),
        flags: span.context.flags(),
        service_name: span.service_name,
        operation_name: span.operation_name,
        start_time: Some(timestamp::from_system_time(span.start_time)),
        finish_time: Some(timestamp::from_system_time(span.finish_time)),
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SpanContext;
    use crate::span::LogRecord;
    use crate::value::TagValue;
    use std::collections::HashMap;
    use std::time::UNIX_EPOCH;

    fn raw_span(span_id: u64) -> RawSpan {
        RawSpan {
            context: SpanContext::new(span_id, span_id, 0, 1, HashMap::new()),
            service_name: "svc".to_owned(),
            operation_name: "op".to_owned(),
            start_time: UNIX_EPOCH + Duration::from_secs(1),
            finish_time: UNIX_EPOCH + Duration::from_secs(2),
            tags: HashMap::new(),
            logs: Vec::new(),
        }
    }

    /// An uploader whose first upload never completes.
    #[derive(Debug)]
    struct StalledUploader;

    #[async_trait]
    impl SpanUploader for StalledUploader {
        async fn upload(&mut self, _spans: Vec<pb::Span>) -> Result<(), tonic::Status> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[derive(Clone, Debug, Default)]
    struct CollectingUploader {
        batches: Arc<Mutex<Vec<Vec<pb::Span>>>>,
    }

    #[async_trait]
    impl SpanUploader for CollectingUploader {
        async fn upload(&mut self, spans: Vec<pb::Span>) -> Result<(), tonic::Status> {
            self.batches.lock().unwrap().push(spans);
            Ok(())
        }
    }

    #[tokio::test]
    async fn intake_overflow_drops_spans() {
        let queue_size = 8;
        let shipper = BatchShipper::new(
            StalledUploader,
            ShipperConfig {
                queue_size,
                flush_interval: Duration::from_secs(3600),
            },
        );

        // On a current-thread runtime the worker never runs between
        // submissions, so exactly the intake capacity is accepted.
        for id in 0..3 * queue_size {
            shipper.submit(raw_span(id as u64 + 1));
        }

        assert_eq!(
            shipper.stored() + shipper.dropped(),
            3 * queue_size as u64
        );
        assert_eq!(shipper.stored(), 2 * queue_size as u64);
        assert_eq!(shipper.dropped(), queue_size as u64);
    }

    #[tokio::test]
    async fn full_batches_flush_without_a_tick() {
        let uploader = CollectingUploader::default();
        let batches = uploader.batches.clone();
        let shipper = BatchShipper::new(
            uploader,
            ShipperConfig {
                queue_size: 2,
                flush_interval: Duration::from_secs(3600),
            },
        );

        shipper.submit(raw_span(1));
        shipper.submit(raw_span(2));
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if !batches.lock().unwrap().is_empty() {
                break;
            }
        }

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn wire_conversion_flattens_logs_into_timestamped_tags() {
        let mut span = raw_span(9);
        span.tags.insert("url".to_owned(), TagValue::from("/hello"));
        span.logs.push(LogRecord {
            event: "retry".to_owned(),
            payload: Some(TagValue::I64(2)),
            timestamp: UNIX_EPOCH + Duration::from_secs(1),
        });
        span.logs.push(LogRecord {
            event: "gave up".to_owned(),
            payload: None,
            timestamp: UNIX_EPOCH + Duration::from_secs(2),
        });

        let wire = to_wire(span);
        assert_eq!(wire.span_id, 9);
        assert_eq!(wire.tags.len(), 3);
        let url = wire.tags.iter().find(|t| t.key == "url").unwrap();
        assert_eq!(url.value, "/hello");
        assert!(url.time.is_none());
        let retry = wire.tags.iter().find(|t| t.key == "retry").unwrap();
        assert_eq!(retry.value, "2");
        assert!(retry.time.is_some());
        let gave_up = wire.tags.iter().find(|t| t.key == "gave up").unwrap();
        assert_eq!(gave_up.value, "");
    }

    #[test]
    fn unsampled_finish_leaves_counters_untouched() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let shipper = Arc::new(BatchShipper::new(StalledUploader, ShipperConfig::default()));
        let tracer = crate::Tracer::builder("svc", shipper.clone())
            .with_sampler(crate::ConstSampler::new(false))
            .build();
        tracer.span("x").start().finish();
        assert_eq!(shipper.stored(), 0);
        assert_eq!(shipper.dropped(), 0);
    }
}
