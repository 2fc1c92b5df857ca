//! A Zipkin-v1-compatible query transport, for pointing Zipkin's UI at a
//! tracekit collector.
//!
//! Spans render with core annotations derived from the `span.kind` tag:
//! `server` spans get sr/ss, `client` spans cs/cr, kind-less spans none at
//! all. Every tag becomes a binary annotation, sorted by key. Timestamps
//! and durations are microseconds, ids 16-char lowercase hex; roots omit
//! `parentId`.

use super::http::{json_response, storage_error_response, text_response};
use super::{listen_addr, QueryTransport};
use crate::error::Error;
use crate::storage::{Query, Storage};
use async_trait::async_trait;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode, Uri};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracekit::time::to_unix_micros;
use tracekit::RawTrace;
use url::form_urlencoded;

pub fn setup(
    storage: Arc<dyn Storage>,
    conf: toml::Table,
) -> Result<Box<dyn QueryTransport>, Error> {
    let listen = listen_addr(&conf, "query.zipkin.listen")?;
    Ok(Box::new(ZipkinTransport { listen, storage }))
}

pub struct ZipkinTransport {
    listen: SocketAddr,
    storage: Arc<dyn Storage>,
}

#[async_trait]
impl QueryTransport for ZipkinTransport {
    async fn serve(self: Box<Self>) -> Result<(), Error> {
        let storage = self.storage;
        let make = make_service_fn(move |_conn| {
            let storage = storage.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| handle(storage.clone(), req)))
            }
        });
        hyper::Server::bind(&self.listen).serve(make).await?;
        Ok(())
    }
}

async fn handle(
    storage: Arc<dyn Storage>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path();
    let response = match (req.method(), path) {
        (&Method::GET, "/api/v1/services") => services(&storage).await,
        (&Method::GET, "/api/v1/spans") => spans(&storage, req.uri()).await,
        (&Method::GET, "/api/v1/traces") => traces(&storage, req.uri()).await,
        (&Method::GET, "/api/v1/dependencies") => dependencies(&storage).await,
        (&Method::GET, _) if path.starts_with("/api/v1/trace/") => {
            trace(&storage, &path["/api/v1/trace/".len()..]).await
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
struct ZipkinEndpoint {
    ipv4: String,
    port: u16,
    #[serde(rename = "serviceName")]
    service_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct ZipkinAnnotation {
    endpoint: ZipkinEndpoint,
    timestamp: u64,
    value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct ZipkinBinaryAnnotation {
    endpoint: ZipkinEndpoint,
    key: String,
    value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct ZipkinSpan {
    annotations: Vec<ZipkinAnnotation>,
    binary_annotations: Vec<ZipkinBinaryAnnotation>,
    debug: bool,
    duration: u64,
    id: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
    timestamp: u64,
    trace_id: String,
}

fn endpoint(service_name: &str) -> ZipkinEndpoint {
    ZipkinEndpoint {
        service_name: service_name.to_owned(),
        ..ZipkinEndpoint::default()
    }
}

fn annotation(service_name: &str, at: SystemTime, value: &str) -> ZipkinAnnotation {
    ZipkinAnnotation {
        endpoint: endpoint(service_name),
        timestamp: to_unix_micros(at),
        value: value.to_owned(),
    }
}

fn hex_id(id: u64) -> String {
    format!("{id:016x}")
}

fn trace_to_zipkin(trace: &RawTrace) -> Vec<ZipkinSpan> {
    let parents: HashMap<u64, u64> = trace
        .relations
        .iter()
        .map(|relation| (relation.child_id, relation.parent_id))
        .collect();

    trace
        .spans
        .iter()
        .map(|span| {
            let service = span.service_name.as_str();
            let annotations = match span.tags.get("span.kind").and_then(|kind| kind.as_str()) {
                Some("server") => vec![
                    annotation(service, span.start_time, "sr"),
                    annotation(service, span.finish_time, "ss"),
                ],
                Some("client") => vec![
                    annotation(service, span.start_time, "cs"),
                    annotation(service, span.finish_time, "cr"),
                ],
                _ => Vec::new(),
            };

            let mut binary_annotations: Vec<ZipkinBinaryAnnotation> = span
                .tags
                .iter()
                .map(|(key, value)| ZipkinBinaryAnnotation {
                    endpoint: endpoint(service),
                    key: key.clone(),
                    value: value.to_string(),
                })
                .collect();
            binary_annotations.sort_by(|a, b| a.key.cmp(&b.key));

            let span_id = span.context.span_id();
            let parent = parents.get(&span_id).copied().unwrap_or(0);
            let timestamp = to_unix_micros(span.start_time);

            ZipkinSpan {
                annotations,
                binary_annotations,
                debug: false,
                duration: to_unix_micros(span.finish_time).saturating_sub(timestamp),
                id: hex_id(span_id),
                name: span.operation_name.clone(),
                parent_id: (parent != 0).then(|| hex_id(parent)),
                timestamp,
                trace_id: hex_id(trace.trace_id),
            }
        })
        .collect()
}

async fn services(storage: &Arc<dyn Storage>) -> Response<Body> {
    match storage.services().await {
        Ok(services) => json_response(&services),
        Err(err) => storage_error_response(err),
    }
}

async fn spans(storage: &Arc<dyn Storage>, uri: &Uri) -> Response<Body> {
    let service = param(uri, "serviceName").unwrap_or_default();
    match storage.operations(&service).await {
        Ok(operations) => json_response(&operations),
        Err(err) => storage_error_response(err),
    }
}

async fn traces(storage: &Arc<dyn Storage>, uri: &Uri) -> Response<Body> {
    let limit = match numeric_param(uri, "limit") {
        Some(0) | None => 10,
        Some(limit) => limit as usize,
    };
    let min_duration = Duration::from_micros(numeric_param(uri, "minDuration").unwrap_or(0));
    let max_duration = numeric_param(uri, "maxDuration").map(Duration::from_micros);
    let end_ts = match numeric_param(uri, "endTs") {
        Some(0) | None => SystemTime::now(),
        Some(millis) => UNIX_EPOCH + Duration::from_millis(millis),
    };
    let lookback = Duration::from_millis(numeric_param(uri, "lookback").unwrap_or(0));

    let query = Query {
        start_time: Some(end_ts.checked_sub(lookback).unwrap_or(UNIX_EPOCH)),
        finish_time: Some(end_ts),
        min_duration,
        max_duration: max_duration.filter(|d| !d.is_zero()),
        ..Query::default()
    };
    match storage.query_traces(&query).await {
        Ok(traces) => {
            let mut out: Vec<Vec<ZipkinSpan>> = traces.iter().map(trace_to_zipkin).collect();
            if out.len() > limit {
                out = out.split_off(out.len() - limit);
            }
            json_response(&out)
        }
        Err(err) => storage_error_response(err),
    }
}

async fn trace(storage: &Arc<dyn Storage>, raw_id: &str) -> Response<Body> {
    let id = match u64::from_str_radix(raw_id, 16) {
        Ok(id) => id,
        Err(err) => {
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("invalid id: {err}"),
            )
        }
    };
    match storage.trace_by_id(id).await {
        Ok(trace) => json_response(&trace_to_zipkin(&trace)),
        Err(err) => storage_error_response(err),
    }
}

async fn dependencies(storage: &Arc<dyn Storage>) -> Response<Body> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct ZipkinDependency {
        call_count: u64,
        child: String,
        parent: String,
    }

    match storage.dependencies().await {
        Ok(dependencies) => {
            let out: Vec<ZipkinDependency> = dependencies
                .into_iter()
                .map(|dependency| ZipkinDependency {
                    call_count: dependency.count,
                    child: dependency.child,
                    parent: dependency.parent,
                })
                .collect();
            json_response(&out)
        }
        Err(err) => storage_error_response(err),
    }
}

fn param(uri: &Uri, name: &str) -> Option<String> {
    form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn numeric_param(uri: &Uri, name: &str) -> Option<u64> {
    param(uri, name).and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracekit::{RawRelation, RawSpan, RelationKind, SpanContext, TagValue};

    fn raw_span(trace_id: u64, span_id: u64, kind: Option<&str>) -> RawSpan {
        let mut tags = HashMap::new();
        if let Some(kind) = kind {
            tags.insert("span.kind".to_owned(), TagValue::from(kind));
        }
        tags.insert("url".to_owned(), TagValue::from("/hello"));
        tags.insert("attempt".to_owned(), TagValue::from("1"));
        RawSpan {
            context: SpanContext::new(trace_id, span_id, 0, 1, HashMap::new()),
            service_name: "svc".to_owned(),
            operation_name: "op".to_owned(),
            start_time: UNIX_EPOCH + Duration::from_micros(1_000),
            finish_time: UNIX_EPOCH + Duration::from_micros(3_500),
            tags,
            logs: Vec::new(),
        }
    }

    #[test]
    fn server_spans_get_sr_ss_annotations() {
        let trace = RawTrace {
            trace_id: 1,
            spans: vec![raw_span(1, 1, Some("server"))],
            relations: Vec::new(),
        };
        let zipkin = trace_to_zipkin(&trace);
        assert_eq!(zipkin.len(), 1);
        let span = &zipkin[0];
        assert_eq!(span.timestamp, 1_000);
        assert_eq!(span.duration, 2_500);
        assert_eq!(span.id, "0000000000000001");
        assert_eq!(span.parent_id, None);
        let values: Vec<&str> = span
            .annotations
            .iter()
            .map(|a| a.value.as_str())
            .collect();
        assert_eq!(values, vec!["sr", "ss"]);
        assert_eq!(span.annotations[0].timestamp, 1_000);
        assert_eq!(span.annotations[1].timestamp, 3_500);
    }

    #[test]
    fn kind_less_spans_emit_no_core_annotations() {
        let trace = RawTrace {
            trace_id: 1,
            spans: vec![raw_span(1, 1, None)],
            relations: Vec::new(),
        };
        assert!(trace_to_zipkin(&trace)[0].annotations.is_empty());
    }

    #[test]
    fn binary_annotations_are_sorted_by_key() {
        let trace = RawTrace {
            trace_id: 1,
            spans: vec![raw_span(1, 1, Some("client"))],
            relations: Vec::new(),
        };
        let keys: Vec<String> = trace_to_zipkin(&trace)[0]
            .binary_annotations
            .iter()
            .map(|b| b.key.clone())
            .collect();
        assert_eq!(keys, vec!["attempt", "span.kind", "url"]);
    }

    #[test]
    fn children_carry_their_parent_id() {
        let trace = RawTrace {
            trace_id: 1,
            spans: vec![raw_span(1, 1, None), raw_span(1, 2, None)],
            relations: vec![RawRelation {
                parent_id: 1,
                child_id: 2,
                kind: RelationKind::Parent,
            }],
        };
        let zipkin = trace_to_zipkin(&trace);
        assert_eq!(zipkin[0].parent_id, None);
        assert_eq!(zipkin[1].parent_id, Some("0000000000000001".to_owned()));
    }

    #[test]
    fn spans_serialize_in_the_v1_shape() {
        let trace = RawTrace {
            trace_id: 255,
            spans: vec![raw_span(255, 255, Some("client"))],
            relations: Vec::new(),
        };
        let json = serde_json::to_value(trace_to_zipkin(&trace)).unwrap();
        let span = &json[0];
        assert_eq!(span["traceId"], "00000000000000ff");
        assert!(span["binaryAnnotations"].is_array());
        assert!(span.get("parentId").is_none());
        assert_eq!(
            span["annotations"][0]["endpoint"]["serviceName"],
            "svc"
        );
    }
}
