use thiserror::Error;

/// Errors surfaced to instrumentation callers.
///
/// These cover context propagation and shipper construction. Span and
/// tracer operations themselves never fail; invalid input is logged and
/// dropped instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The carrier handed to inject or extract is not of the kind the
    /// propagation format expects.
    #[error("invalid carrier")]
    InvalidCarrier,

    /// No injecter or extracter is registered for the requested format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The carrier does not contain a span context.
    #[error("span context not found")]
    SpanContextNotFound,

    /// An I/O error from a binary carrier, other than truncation.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Establishing the shipper's gRPC channel failed.
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}
