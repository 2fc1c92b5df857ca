//! The storage contract and the engines implementing it.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracekit::{RawSpan, RawTrace};

/// Errors from storage engines.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested span or trace does not exist.
    #[error("not found")]
    NotFound,

    /// The engine does not implement this optional operation.
    #[error("{0} is not supported by this storage engine")]
    Unsupported(&'static str),

    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Pool(#[from] deadpool_postgres::PoolError),
}

/// A single tag or log entry condition in a [`Query`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryTag {
    pub key: String,
    pub value: String,
    /// When false, only the key's presence is required.
    pub check_value: bool,
}

/// The conditions of a trace search. All conditions are combined with AND;
/// unset optionals mean the lack of a constraint.
#[derive(Clone, Debug, Default)]
pub struct Query {
    /// Only match traces whose root started at or after this time.
    pub start_time: Option<SystemTime>,
    /// Only match traces whose root finished at or before this time.
    /// Defaults to now.
    pub finish_time: Option<SystemTime>,
    /// Only match traces whose root has this operation name. Empty matches
    /// any.
    pub operation_name: String,
    /// Only match traces that lasted at least this long, inclusive.
    pub min_duration: Duration,
    /// Only match traces that lasted at most this long, inclusive.
    pub max_duration: Option<Duration>,
    /// Every one of these tags must occur somewhere in the trace.
    pub and_tags: Vec<QueryTag>,
    /// At least one of these tags must occur somewhere in the trace.
    pub or_tags: Vec<QueryTag>,
    /// How many traces to return.
    pub num: Option<usize>,
}

/// An aggregated count of calls from one service to another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub parent: String,
    pub child: String,
    pub count: u64,
}

/// Storing and querying spans.
///
/// Engines are shared across concurrently running transports; every method
/// takes `&self`. Dropping a returned future cancels the operation and
/// rolls back whatever transaction it held open.
#[async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Persists one finished span. Storing a span id twice merges the two:
    /// time range, service and operation are replaced, tags and logs
    /// accumulate.
    async fn store(&self, span: RawSpan) -> Result<(), StorageError>;

    /// The trace with the given id, spans ordered by start time.
    async fn trace_by_id(&self, id: u64) -> Result<RawTrace, StorageError>;

    async fn span_by_id(&self, id: u64) -> Result<RawSpan, StorageError>;

    /// All traces matching `query`, ordered by root start time ascending.
    async fn query_traces(&self, query: &Query) -> Result<Vec<RawTrace>, StorageError>;

    /// Distinct service names, ascending.
    async fn services(&self) -> Result<Vec<String>, StorageError>;

    /// Distinct operation names of one service, ascending.
    async fn operations(&self, service: &str) -> Result<Vec<String>, StorageError>;

    /// Aggregated caller/callee counts between services.
    async fn dependencies(&self) -> Result<Vec<Dependency>, StorageError>;

    /// Deletes all traces whose root span started before `before`.
    /// Optional; the default implementation reports it as unsupported.
    async fn purge(&self, before: SystemTime) -> Result<(), StorageError> {
        let _ = before;
        Err(StorageError::Unsupported("purge"))
    }
}
