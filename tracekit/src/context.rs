use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bit 0 of [`SpanContext::flags`]: the span is sampled.
pub const FLAG_SAMPLED: u64 = 1;

/// The parts of a span that cross process boundaries.
///
/// A span context is immutable once created; the sampled flag in
/// particular never changes after the root sampling decision.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanContext {
    trace_id: u64,
    span_id: u64,
    parent_id: u64,
    flags: u64,
    #[serde(default)]
    baggage: HashMap<String, String>,
}

impl SpanContext {
    pub fn new(
        trace_id: u64,
        span_id: u64,
        parent_id: u64,
        flags: u64,
        baggage: HashMap<String, String>,
    ) -> Self {
        SpanContext {
            trace_id,
            span_id,
            parent_id,
            flags,
            baggage,
        }
    }

    /// The id shared by every span in this trace. Non-zero for any valid
    /// context.
    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn span_id(&self) -> u64 {
        self.span_id
    }

    /// The id of the parent span; 0 marks a root.
    pub fn parent_id(&self) -> u64 {
        self.parent_id
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn is_sampled(&self) -> bool {
        self.flags & FLAG_SAMPLED != 0
    }

    /// Free-form key/value pairs that ride along across service hops.
    pub fn baggage(&self) -> &HashMap<String, String> {
        &self.baggage
    }

    pub fn baggage_item(&self, key: &str) -> Option<&str> {
        self.baggage.get(key).map(String::as_str)
    }

    /// Returns a copy of this context with the baggage item set.
    pub fn with_baggage_item(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.baggage.insert(key.into(), value.into());
        self
    }
}
