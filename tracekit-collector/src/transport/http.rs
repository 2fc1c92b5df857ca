//! The native HTTP query transport.
//!
//! Three endpoints, all JSON: `/trace/?id=<hex>`, `/span/?id=<hex>` and
//! `/trace/query/?…` for predicate searches. Times and durations in query
//! strings are Unix nanoseconds; `and_tag`/`or_tag` repeat, either as
//! `key=value` (value is checked) or a bare `key` (presence only).

use super::{listen_addr, QueryTransport};
use crate::error::Error;
use crate::storage::{Query, QueryTag, Storage, StorageError};
use async_trait::async_trait;
use hyper::header::{self, HeaderValue};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode, Uri};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracekit::time::from_unix_nanos;
use url::form_urlencoded;

pub fn setup(
    storage: Arc<dyn Storage>,
    conf: toml::Table,
) -> Result<Box<dyn QueryTransport>, Error> {
    let listen = listen_addr(&conf, "query.http.listen")?;
    Ok(Box::new(HttpTransport { listen, storage }))
}

pub struct HttpTransport {
    listen: SocketAddr,
    storage: Arc<dyn Storage>,
}

#[async_trait]
impl QueryTransport for HttpTransport {
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
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/trace/") => trace_by_id(&storage, req.uri()).await,
        (&Method::GET, "/span/") => span_by_id(&storage, req.uri()).await,
        (&Method::GET, "/trace/query/") => query_traces(&storage, req.uri()).await,
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn trace_by_id(storage: &Arc<dyn Storage>, uri: &Uri) -> Response<Body> {
    let id = match parse_hex_id(uri) {
        Ok(id) => id,
        Err(err) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    };
    match storage.trace_by_id(id).await {
        Ok(trace) => json_response(&trace),
        Err(err) => storage_error_response(err),
    }
}

async fn span_by_id(storage: &Arc<dyn Storage>, uri: &Uri) -> Response<Body> {
    let id = match parse_hex_id(uri) {
        Ok(id) => id,
        Err(err) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    };
    match storage.span_by_id(id).await {
        Ok(span) => json_response(&span),
        Err(err) => storage_error_response(err),
    }
}

async fn query_traces(storage: &Arc<dyn Storage>, uri: &Uri) -> Response<Body> {
    let query = match parse_query(uri) {
        Ok(query) => query,
        Err(err) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    };
    match storage.query_traces(&query).await {
        Ok(traces) => json_response(&traces),
        Err(err) => storage_error_response(err),
    }
}

fn parse_hex_id(uri: &Uri) -> Result<u64, String> {
    let raw = query_params(uri)
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value)
        .ok_or_else(|| "missing id parameter".to_owned())?;
    u64::from_str_radix(&raw, 16).map_err(|err| format!("invalid id: {err}"))
}

fn parse_query(uri: &Uri) -> Result<Query, String> {
    let mut query = Query::default();
    for (key, value) in query_params(uri) {
        match key.as_ref() {
            "start" => query.start_time = Some(from_unix_nanos(parse_u64(&key, &value)?)),
            "finish" => query.finish_time = Some(from_unix_nanos(parse_u64(&key, &value)?)),
            "operation" => query.operation_name = value.into_owned(),
            "min_duration" => {
                query.min_duration = Duration::from_nanos(parse_u64(&key, &value)?)
            }
            "max_duration" => {
                query.max_duration = Some(Duration::from_nanos(parse_u64(&key, &value)?))
            }
            "num" => {
                query.num = Some(
                    value
                        .parse()
                        .map_err(|err| format!("invalid num: {err}"))?,
                )
            }
            "and_tag" => query.and_tags.push(parse_query_tag(&value)),
            "or_tag" => query.or_tags.push(parse_query_tag(&value)),
            _ => {}
        }
    }
    Ok(query)
}

fn parse_u64(key: &str, value: &str) -> Result<u64, String> {
    value
        .parse()
        .map_err(|err| format!("invalid {key}: {err}"))
}

fn parse_query_tag(raw: &str) -> QueryTag {
    match raw.split_once('=') {
        Some((key, value)) => QueryTag {
            key: key.to_owned(),
            value: value.to_owned(),
            check_value: true,
        },
        None => QueryTag {
            key: raw.to_owned(),
            value: String::new(),
            check_value: false,
        },
    }
}

fn query_params(uri: &Uri) -> impl Iterator<Item = (std::borrow::Cow<'_, str>, std::borrow::Cow<'_, str>)> {
    form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
}

pub(crate) fn json_response<T: Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(err) => text_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

pub(crate) fn text_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response
}

pub(crate) fn storage_error_response(err: StorageError) -> Response<Body> {
    let status = match err {
        StorageError::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    text_response(status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn uri(query: &str) -> Uri {
        format!("http://collector/trace/query/?{query}")
            .parse()
            .unwrap()
    }

    #[test]
    fn parses_hex_ids() {
        let uri: Uri = "http://collector/trace/?id=00000000000000ff".parse().unwrap();
        assert_eq!(parse_hex_id(&uri).unwrap(), 255);

        let uri: Uri = "http://collector/trace/?id=xyz".parse().unwrap();
        assert!(parse_hex_id(&uri).is_err());
    }

    #[test]
    fn parses_full_queries() {
        let query = parse_query(&uri(
            "start=1000000000&finish=2000000000&operation=GET+%2F&min_duration=5&max_duration=10&num=3&and_tag=url%3D%2Fhello&and_tag=error&or_tag=retry",
        ))
        .unwrap();

        assert_eq!(
            query.start_time,
            Some(UNIX_EPOCH + Duration::from_secs(1))
        );
        assert_eq!(
            query.finish_time,
            Some(UNIX_EPOCH + Duration::from_secs(2))
        );
        assert_eq!(query.operation_name, "GET /");
        assert_eq!(query.min_duration, Duration::from_nanos(5));
        assert_eq!(query.max_duration, Some(Duration::from_nanos(10)));
        assert_eq!(query.num, Some(3));
        assert_eq!(
            query.and_tags,
            vec![
                QueryTag {
                    key: "url".to_owned(),
                    value: "/hello".to_owned(),
                    check_value: true,
                },
                QueryTag {
                    key: "error".to_owned(),
                    value: String::new(),
                    check_value: false,
                },
            ]
        );
        assert_eq!(query.or_tags.len(), 1);
        assert!(!query.or_tags[0].check_value);
    }

    #[test]
    fn empty_queries_mean_no_constraints() {
        let query = parse_query(&uri("")).unwrap();
        assert!(query.start_time.is_none());
        assert!(query.finish_time.is_none());
        assert!(query.num.is_none());
        assert!(query.and_tags.is_empty());
    }

    #[test]
    fn bad_numbers_are_reported() {
        assert!(parse_query(&uri("start=soon")).is_err());
        assert!(parse_query(&uri("num=-1")).is_err());
    }
}
