//! A Dapper-style distributed tracing client.
//!
//! Instrumented code creates [`Span`]s through a [`Tracer`], annotates them
//! with tags and logs, and propagates the active [`SpanContext`] across
//! process boundaries through text-map or binary carriers. Finished spans
//! are handed to a [`SpanSink`]; the [`BatchShipper`] sink batches them and
//! forwards them to a collector over gRPC.
//!
//! The instrumentation surface is defensive: none of the span or tracer
//! operations panic, and operations on unsampled spans are cheap no-ops.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use tracekit::{InMemorySink, Tracer};
//!
//! let sink = Arc::new(InMemorySink::new());
//! let tracer = Tracer::builder("api", sink.clone()).build();
//!
//! let span = tracer.span("GET /hello").start();
//! span.set_tag("url", "/hello");
//! span.finish();
//!
//! assert_eq!(sink.spans().len(), 1);
//! ```

mod context;
mod error;
mod ids;
pub mod propagation;
mod sampler;
mod shipper;
mod span;
pub mod time;
mod tracer;
mod value;

pub use context::{SpanContext, FLAG_SAMPLED};
pub use error::Error;
pub use ids::{IdGenerator, RandomIdGenerator};
pub use sampler::{ConstSampler, ProbabilisticSampler, RateSampler, Sampler};
pub use shipper::{BatchShipper, InMemorySink, ShipperConfig, SpanSink, SpanUploader};
pub use span::{LogRecord, RawRelation, RawSpan, RawTrace, RelationKind, Span};
pub use tracer::{SpanBuilder, Tracer, TracerBuilder, SAMPLING_PRIORITY};
pub use value::TagValue;
