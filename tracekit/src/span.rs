use crate::context::SpanContext;
use crate::shipper::SpanSink;
use crate::value::TagValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// A timestamped event on a span.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub event: String,
    #[serde(default)]
    pub payload: Option<TagValue>,
    #[serde(with = "crate::time::unix_nanos")]
    pub timestamp: SystemTime,
}

/// All the data associated with a finished span. This is the form spans are
/// shipped and stored in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSpan {
    #[serde(flatten)]
    pub context: SpanContext,
    pub service_name: String,
    pub operation_name: String,
    #[serde(with = "crate::time::unix_nanos")]
    pub start_time: SystemTime,
    #[serde(with = "crate::time::unix_nanos")]
    pub finish_time: SystemTime,
    #[serde(default)]
    pub tags: HashMap<String, TagValue>,
    #[serde(default)]
    pub logs: Vec<LogRecord>,
}

/// The kind of an edge between two spans.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationKind {
    Parent,
}

impl RelationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RelationKind::Parent => "parent",
        }
    }
}

/// An edge between two spans of the same trace.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRelation {
    pub parent_id: u64,
    pub child_id: u64,
    pub kind: RelationKind,
}

/// All the data associated with a trace.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawTrace {
    pub trace_id: u64,
    pub spans: Vec<RawSpan>,
    pub relations: Vec<RawRelation>,
}

#[derive(Debug)]
struct SpanState {
    service_name: String,
    operation_name: String,
    start_time: SystemTime,
    tags: HashMap<String, TagValue>,
    logs: Vec<LogRecord>,
}

/// One unit of timed work within a trace.
///
/// A span is mutated by the execution that owns it until [`Span::finish`],
/// which hands the collected [`RawSpan`] to the sink exactly once. The
/// mutable state sits behind a read-write lock, so accidental concurrent
/// use cannot corrupt it. Unsampled spans carry no state at all and every
/// mutator returns immediately.
#[derive(Debug)]
pub struct Span {
    context: SpanContext,
    sink: Arc<dyn SpanSink>,
    state: RwLock<Option<SpanState>>,
}

impl Span {
    pub(crate) fn new(
        context: SpanContext,
        service_name: String,
        operation_name: String,
        start_time: SystemTime,
        tags: HashMap<String, TagValue>,
        sink: Arc<dyn SpanSink>,
    ) -> Self {
        let state = context.is_sampled().then(|| SpanState {
            service_name,
            operation_name,
            start_time,
            tags,
            logs: Vec::new(),
        });
        Span {
            context,
            sink,
            state: RwLock::new(state),
        }
    }

    /// A copy of this span's propagation context.
    pub fn context(&self) -> SpanContext {
        self.context.clone()
    }

    /// Whether this span was sampled. The decision is made at creation and
    /// never changes.
    pub fn sampled(&self) -> bool {
        self.context.is_sampled()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SpanState) -> R) -> Option<R> {
        let mut guard = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_mut().map(f)
    }

    pub fn set_operation_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.with_state(|state| state.operation_name = name);
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<TagValue>) {
        let (key, value) = (key.into(), value.into());
        self.with_state(|state| {
            state.tags.insert(key, value);
        });
    }

    /// Records an event at the current time.
    pub fn log(&self, event: impl Into<String>) {
        self.log_record(LogRecord {
            event: event.into(),
            payload: None,
            timestamp: SystemTime::now(),
        });
    }

    /// Records an event with a payload at the current time.
    pub fn log_with_payload(&self, event: impl Into<String>, payload: impl Into<TagValue>) {
        self.log_record(LogRecord {
            event: event.into(),
            payload: Some(payload.into()),
            timestamp: SystemTime::now(),
        });
    }

    pub fn log_record(&self, record: LogRecord) {
        self.with_state(|state| state.logs.push(record));
    }

    pub fn log_bulk(&self, records: impl IntoIterator<Item = LogRecord>) {
        self.with_state(|state| state.logs.extend(records));
    }

    /// Finishes the span now and hands it to the sink.
    pub fn finish(&self) {
        self.finish_at(SystemTime::now());
    }

    /// Finishes the span with an explicit finish time. A finish time before
    /// the start time is stored as given. Calls after the first are no-ops.
    pub fn finish_at(&self, finish_time: SystemTime) {
        let state = {
            let mut guard = match self.state.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        let Some(state) = state else { return };
        self.sink.submit(RawSpan {
            context: self.context.clone(),
            service_name: state.service_name,
            operation_name: state.operation_name,
            start_time: state.start_time,
            finish_time,
            tags: state.tags,
            logs: state.logs,
        });
    }
}
