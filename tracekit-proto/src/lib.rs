//! Wire types for the tracekit span ingestion protocol.
//!
//! The message and service definitions live in `proto/tracekit/v1`; the
//! generated `prost`/`tonic` code is checked in under `src/proto/` and
//! re-exported here as [`v1`].

mod proto;

pub use proto::v1;

pub mod timestamp;
