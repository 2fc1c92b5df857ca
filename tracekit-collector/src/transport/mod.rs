//! Transports: how spans arrive and how queries are answered.

pub mod grpc;
pub mod http;
pub mod zipkin;

use crate::error::Error;
use async_trait::async_trait;

/// Accepts spans via some protocol and hands them to the storage engine.
#[async_trait]
pub trait StorageTransport: Send {
    /// Serves until a fatal error. There is no graceful-shutdown contract;
    /// the process exits with the transport.
    async fn serve(self: Box<Self>) -> Result<(), Error>;
}

/// Accepts queries via some protocol and answers them from storage.
#[async_trait]
pub trait QueryTransport: Send {
    async fn serve(self: Box<Self>) -> Result<(), Error>;
}

pub(crate) fn listen_addr(
    conf: &toml::Table,
    key: &'static str,
) -> Result<std::net::SocketAddr, Error> {
    let listen = conf
        .get("listen")
        .and_then(toml::Value::as_str)
        .ok_or_else(|| crate::config::ConfigError::MissingKey(key.to_owned()))?;
    Ok(listen.parse()?)
}
