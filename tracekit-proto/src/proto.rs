/// Generated files using [`tonic`](https://docs.rs/crate/tonic) and [`prost`](https://docs.rs/crate/prost)
#[path = "proto/tracekit.v1.rs"]
pub mod v1;
