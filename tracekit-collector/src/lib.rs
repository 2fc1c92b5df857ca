//! The tracekit collector.
//!
//! A collector accepts finished spans from shippers over a storage
//! transport (gRPC), persists them through a pluggable [`Storage`] engine,
//! and answers queries over one or more query transports (the native HTTP
//! API and a Zipkin v1 compatible one).
//!
//! Engines and transports are looked up by name in a [`Registry`] built at
//! startup; the `tracekitd` binary wires a [`Server`] from a TOML
//! configuration file.
//!
//! [`Storage`]: storage::Storage

pub mod config;
mod error;
pub mod server;
pub mod storage;
pub mod transport;

pub use config::{Config, ConfigError};
pub use error::Error;
pub use server::{Registry, Server};
