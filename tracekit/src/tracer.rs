use crate::context::{SpanContext, FLAG_SAMPLED};
use crate::error::Error;
use crate::ids::{IdGenerator, RandomIdGenerator};
use crate::propagation::{ExtractCarrier, InjectCarrier, PropagationRegistry};
use crate::sampler::{ConstSampler, Sampler};
use crate::shipper::SpanSink;
use crate::span::Span;
use crate::value::TagValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// Start tag that forces the sampled flag on a root span when its numeric
/// value is at least 1, regardless of what the sampler decides.
pub const SAMPLING_PRIORITY: &str = "sampling.priority";

struct TracerInner {
    service_name: String,
    sampler: Box<dyn Sampler>,
    id_generator: Box<dyn IdGenerator>,
    registry: PropagationRegistry,
    sink: Arc<dyn SpanSink>,
}

/// Creates spans for one service and carries their contexts across process
/// boundaries.
///
/// Cloning a tracer is cheap; clones share the sink, sampler and
/// propagation registry.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("service_name", &self.inner.service_name)
            .finish_non_exhaustive()
    }
}

impl Tracer {
    pub fn builder(service_name: impl Into<String>, sink: Arc<dyn SpanSink>) -> TracerBuilder {
        TracerBuilder {
            service_name: service_name.into(),
            sink,
            sampler: Box::new(ConstSampler::new(true)),
            id_generator: Box::new(RandomIdGenerator::default()),
            registry: PropagationRegistry::default(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Starts building a span. Call [`SpanBuilder::start`] to create it.
    pub fn span(&self, operation_name: impl Into<String>) -> SpanBuilder<'_> {
        SpanBuilder {
            tracer: self,
            operation_name: operation_name.into(),
            parent: None,
            start_time: None,
            tags: Vec::new(),
        }
    }

    /// Injects `context` into `carrier` using the named format.
    pub fn inject(
        &self,
        context: &SpanContext,
        format: &str,
        carrier: &mut InjectCarrier<'_>,
    ) -> Result<(), Error> {
        self.inner.registry.inject(context, format, carrier)
    }

    /// Extracts a span context from `carrier` using the named format.
    pub fn extract(
        &self,
        format: &str,
        carrier: &mut ExtractCarrier<'_>,
    ) -> Result<SpanContext, Error> {
        self.inner.registry.extract(format, carrier)
    }
}

/// Configures a [`Tracer`].
pub struct TracerBuilder {
    service_name: String,
    sink: Arc<dyn SpanSink>,
    sampler: Box<dyn Sampler>,
    id_generator: Box<dyn IdGenerator>,
    registry: PropagationRegistry,
}

impl TracerBuilder {
    pub fn with_sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Box::new(sampler);
        self
    }

    pub fn with_id_generator(mut self, id_generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Box::new(id_generator);
        self
    }

    /// Replaces the propagation registry. Register custom formats on the
    /// registry before building; the registry is immutable afterwards.
    pub fn with_registry(mut self, registry: PropagationRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> Tracer {
        Tracer {
            inner: Arc::new(TracerInner {
                service_name: self.service_name,
                sampler: self.sampler,
                id_generator: self.id_generator,
                registry: self.registry,
                sink: self.sink,
            }),
        }
    }
}

/// Options for a span being started.
pub struct SpanBuilder<'a> {
    tracer: &'a Tracer,
    operation_name: String,
    parent: Option<SpanContext>,
    start_time: Option<SystemTime>,
    tags: Vec<(String, TagValue)>,
}

impl SpanBuilder<'_> {
    /// Links the new span as a child of `parent`.
    ///
    /// Only the first parent reference is honored; further calls are
    /// silently ignored.
    pub fn child_of(mut self, parent: &SpanContext) -> Self {
        if self.parent.is_none() {
            self.parent = Some(parent.clone());
        }
        self
    }

    pub fn started_at(mut self, start_time: SystemTime) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn start(self) -> Span {
        let inner = &self.tracer.inner;
        let span_id = inner.id_generator.generate();
        let (trace_id, parent_id, flags) = match &self.parent {
            Some(parent) => (parent.trace_id(), parent.span_id(), parent.flags()),
            None => {
                let mut flags = 0;
                if inner.sampler.sample(span_id) {
                    flags |= FLAG_SAMPLED;
                }
                if self.priority_forces_sampling() {
                    flags |= FLAG_SAMPLED;
                }
                (span_id, 0, flags)
            }
        };
        let context = SpanContext::new(trace_id, span_id, parent_id, flags, HashMap::new());
        let tags = if context.is_sampled() {
            self.tags.into_iter().collect()
        } else {
            HashMap::new()
        };
        Span::new(
            context,
            inner.service_name.clone(),
            self.operation_name,
            self.start_time.unwrap_or_else(SystemTime::now),
            tags,
            inner.sink.clone(),
        )
    }

    fn priority_forces_sampling(&self) -> bool {
        self.tags.iter().any(|(key, value)| {
            key == SAMPLING_PRIORITY && value.as_f64().map_or(false, |n| n >= 1.0)
        })
    }
}
