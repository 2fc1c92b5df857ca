//! The gRPC storage transport.
//!
//! Decodes each span of a `Store` batch and forwards it to the storage
//! engine. The first failure aborts the remainder of the batch and is
//! returned to the peer; spans stored before it stay stored, since every
//! store is its own transaction.

use super::{listen_addr, StorageTransport};
use crate::error::Error;
use crate::storage::Storage;
use async_trait::async_trait;
use prost_types::TimestampError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracekit::{LogRecord, RawSpan, SpanContext, TagValue};
use tracekit_proto::timestamp;
use tracekit_proto::v1 as pb;
use tracekit_proto::v1::storer_server::{Storer, StorerServer};

pub fn setup(
    storage: Arc<dyn Storage>,
    conf: toml::Table,
) -> Result<Box<dyn StorageTransport>, Error> {
    let listen = listen_addr(&conf, "storage_transport.grpc.listen")?;
    Ok(Box::new(GrpcTransport { listen, storage }))
}

pub struct GrpcTransport {
    listen: SocketAddr,
    storage: Arc<dyn Storage>,
}

#[async_trait]
impl StorageTransport for GrpcTransport {
    async fn serve(self: Box<Self>) -> Result<(), Error> {
        tonic::transport::Server::builder()
            .add_service(StorerServer::new(StorerService {
                storage: self.storage,
            }))
            .serve(self.listen)
            .await?;
        Ok(())
    }
}

struct StorerService {
    storage: Arc<dyn Storage>,
}

#[tonic::async_trait]
impl Storer for StorerService {
    async fn store(
        &self,
        request: Request<pb::StoreRequest>,
    ) -> Result<Response<pb::StoreResponse>, Status> {
        for span in request.into_inner().spans {
            let span = decode_span(span)
                .map_err(|err| Status::invalid_argument(format!("invalid timestamp: {err}")))?;
            self.storage
                .store(span)
                .await
                .map_err(|err| Status::internal(err.to_string()))?;
        }
        Ok(Response::new(pb::StoreResponse {}))
    }
}

/// Rebuilds a raw span from its wire form. Tags with a timestamp become
/// log entries; everything arrives as strings, which is what storage keeps
/// anyway.
pub(crate) fn decode_span(span: pb::Span) -> Result<RawSpan, TimestampError> {
    let start_time = timestamp::to_system_time(span.start_time.as_ref())?;
    let finish_time = timestamp::to_system_time(span.finish_time.as_ref())?;

    let mut tags = HashMap::new();
    let mut logs = Vec::new();
    for tag in span.tags {
        match tag.time {
            Some(time) => logs.push(LogRecord {
                event: tag.key,
                payload: Some(TagValue::String(tag.value)),
                timestamp: timestamp::to_system_time(Some(&time))?,
            }),
            None => {
                tags.insert(tag.key, TagValue::String(tag.value));
            }
        }
    }

    Ok(RawSpan {
        context: SpanContext::new(
            span.trace_id,
            span.span_id,
            span.parent_id,
            span.flags,
            HashMap::new(),
        ),
        service_name: span.service_name,
        operation_name: span.operation_name,
        start_time,
        finish_time,
        tags,
        logs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn timestamped_tags_become_logs() {
        let wire = pb::Span {
            span_id: 2,
            parent_id: 1,
            trace_id: 1,
            flags: 1,
            service_name: "svc".to_owned(),
            operation_name: "op".to_owned(),
            start_time: Some(timestamp::from_system_time(
                UNIX_EPOCH + Duration::from_secs(5),
            )),
            finish_time: Some(timestamp::from_system_time(
                UNIX_EPOCH + Duration::from_secs(6),
            )),
            tags: vec![
                pb::Tag {
                    key: "url".to_owned(),
                    value: "/hello".to_owned(),
                    time: None,
                },
                pb::Tag {
                    key: "retry".to_owned(),
                    value: "2".to_owned(),
                    time: Some(timestamp::from_system_time(
                        UNIX_EPOCH + Duration::from_secs(5),
                    )),
                },
            ],
        };

        let span = decode_span(wire).unwrap();
        assert_eq!(span.context.span_id(), 2);
        assert_eq!(span.context.parent_id(), 1);
        assert_eq!(span.start_time, UNIX_EPOCH + Duration::from_secs(5));
        assert_eq!(span.tags.get("url"), Some(&TagValue::from("/hello")));
        assert_eq!(span.logs.len(), 1);
        assert_eq!(span.logs[0].event, "retry");
    }

    #[test]
    fn missing_timestamps_decode_as_the_epoch() {
        let wire = pb::Span {
            span_id: 1,
            trace_id: 1,
            ..Default::default()
        };
        let span = decode_span(wire).unwrap();
        assert_eq!(span.start_time, UNIX_EPOCH);
        assert_eq!(span.finish_time, UNIX_EPOCH);
    }
}
