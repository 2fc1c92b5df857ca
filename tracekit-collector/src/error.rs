use crate::config::ConfigError;
use crate::storage::StorageError;
use thiserror::Error;

/// Collector-level errors. Everything here is fatal at startup or fatal
/// for a transport; per-request failures surface through the transports'
/// own status codes instead.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("unsupported storage engine: {0}")]
    UnknownStorage(String),

    #[error("unsupported storage transport: {0}")]
    UnknownStorageTransport(String),

    #[error("unsupported query transport: {0}")]
    UnknownQueryTransport(String),

    #[error("invalid listen address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error(transparent)]
    Http(#[from] hyper::Error),

    #[error(transparent)]
    Grpc(#[from] tonic::transport::Error),

    #[error("transport task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
