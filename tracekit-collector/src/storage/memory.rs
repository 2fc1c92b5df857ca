//! In-memory storage.
//!
//! Behaves like the relational engine: upserts by span id, append-only
//! tag/log rows, placeholder parents, root-only queries. Keeps everything
//! in process memory. Useful for demos and for exercising the rest of the
//! collector without a database.

use super::{Dependency, Query, Storage, StorageError};
use crate::error::Error;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracekit::{
    LogRecord, RawRelation, RawSpan, RawTrace, RelationKind, SpanContext, TagValue,
};

/// Builds a `memory` engine; it takes no options.
pub fn setup(
    _conf: toml::Table,
) -> futures_util::future::BoxFuture<'static, Result<Arc<dyn Storage>, Error>> {
    Box::pin(async { Ok(Arc::new(MemoryStorage::new()) as Arc<dyn Storage>) })
}

/// One row of the conceptual tags table.
#[derive(Clone, Debug)]
struct TagRow {
    key: String,
    value: String,
    time: Option<SystemTime>,
}

#[derive(Clone, Debug)]
struct SpanRecord {
    trace_id: u64,
    start_time: SystemTime,
    finish_time: SystemTime,
    service_name: String,
    operation_name: String,
    rows: Vec<TagRow>,
}

#[derive(Debug, Default)]
struct Inner {
    spans: HashMap<u64, SpanRecord>,
    relations: Vec<RawRelation>,
}

/// A storage engine that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn to_raw_span(id: u64, record: &SpanRecord) -> RawSpan {
    let mut tags = HashMap::new();
    let mut logs = Vec::new();
    for row in &record.rows {
        match row.time {
            Some(timestamp) => logs.push(LogRecord {
                event: row.key.clone(),
                payload: Some(TagValue::String(row.value.clone())),
                timestamp,
            }),
            None => {
                tags.insert(row.key.clone(), TagValue::String(row.value.clone()));
            }
        }
    }
    RawSpan {
        context: SpanContext::new(record.trace_id, id, 0, 0, HashMap::new()),
        service_name: record.service_name.clone(),
        operation_name: record.operation_name.clone(),
        start_time: record.start_time,
        finish_time: record.finish_time,
        tags,
        logs,
    }
}

impl Inner {
    fn trace(&self, id: u64) -> Result<RawTrace, StorageError> {
        let mut spans: Vec<(u64, &SpanRecord)> = self
            .spans
            .iter()
            .filter(|(_, record)| record.trace_id == id)
            .map(|(span_id, record)| (*span_id, record))
            .collect();
        if spans.is_empty() {
            return Err(StorageError::NotFound);
        }
        spans.sort_by(|a, b| (a.1.start_time, a.0).cmp(&(b.1.start_time, b.0)));

        let relations = self
            .relations
            .iter()
            .filter(|relation| {
                self.spans
                    .get(&relation.parent_id)
                    .map_or(false, |parent| parent.trace_id == id)
            })
            .copied()
            .collect();

        Ok(RawTrace {
            trace_id: id,
            spans: spans
                .into_iter()
                .map(|(span_id, record)| to_raw_span(span_id, record))
                .collect(),
            relations,
        })
    }

    /// All tag rows of a trace, for tag predicates that look across spans.
    fn trace_rows(&self, trace_id: u64) -> impl Iterator<Item = &TagRow> {
        self.spans
            .values()
            .filter(move |record| record.trace_id == trace_id)
            .flat_map(|record| record.rows.iter())
    }
}

fn tag_matches(row: &TagRow, tag: &super::QueryTag) -> bool {
    row.key == tag.key && (!tag.check_value || row.value == tag.value)
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store(&self, span: RawSpan) -> Result<(), StorageError> {
        let span_id = span.context.span_id();
        let trace_id = span.context.trace_id();
        let parent_id = span.context.parent_id();
        let mut inner = self.write();

        let record = inner.spans.entry(span_id).or_insert_with(|| SpanRecord {
            trace_id,
            start_time: span.start_time,
            finish_time: span.finish_time,
            service_name: String::new(),
            operation_name: String::new(),
            rows: Vec::new(),
        });
        record.trace_id = trace_id;
        record.start_time = span.start_time;
        record.finish_time = span.finish_time;
        record.service_name = span.service_name.clone();
        record.operation_name = span.operation_name.clone();
        for (key, value) in &span.tags {
            record.rows.push(TagRow {
                key: key.clone(),
                value: value.to_string(),
                time: None,
            });
        }
        for log in &span.logs {
            record.rows.push(TagRow {
                key: log.event.clone(),
                value: log
                    .payload
                    .as_ref()
                    .map(TagValue::to_string)
                    .unwrap_or_default(),
                time: Some(log.timestamp),
            });
        }

        if parent_id != 0 {
            inner.spans.entry(parent_id).or_insert_with(|| SpanRecord {
                trace_id,
                start_time: UNIX_EPOCH,
                finish_time: UNIX_EPOCH,
                service_name: String::new(),
                operation_name: String::new(),
                rows: Vec::new(),
            });
            inner.spans.entry(trace_id).or_insert_with(|| SpanRecord {
                trace_id,
                start_time: span.start_time,
                finish_time: span.finish_time,
                service_name: String::new(),
                operation_name: String::new(),
                rows: Vec::new(),
            });
            inner.relations.push(RawRelation {
                parent_id,
                child_id: span_id,
                kind: RelationKind::Parent,
            });
        }
        Ok(())
    }

    async fn trace_by_id(&self, id: u64) -> Result<RawTrace, StorageError> {
        self.read().trace(id)
    }

    async fn span_by_id(&self, id: u64) -> Result<RawSpan, StorageError> {
        let inner = self.read();
        inner
            .spans
            .get(&id)
            .map(|record| to_raw_span(id, record))
            .ok_or(StorageError::NotFound)
    }

    async fn query_traces(&self, query: &Query) -> Result<Vec<RawTrace>, StorageError> {
        let inner = self.read();
        let start = query.start_time.unwrap_or(UNIX_EPOCH);
        let finish = query.finish_time.unwrap_or_else(SystemTime::now);
        let max_duration = query.max_duration.unwrap_or(std::time::Duration::MAX);
        let num = query.num.unwrap_or(usize::MAX);

        let mut roots: Vec<(u64, &SpanRecord)> = inner
            .spans
            .iter()
            .filter(|(id, record)| {
                **id == record.trace_id
                    && start <= record.start_time
                    && record.finish_time <= finish
            })
            .filter(|(_, record)| {
                query.operation_name.is_empty() || record.operation_name == query.operation_name
            })
            .filter(|(_, record)| {
                let duration = record
                    .finish_time
                    .duration_since(record.start_time)
                    .unwrap_or_default();
                query.min_duration <= duration && duration <= max_duration
            })
            .map(|(id, record)| (*id, record))
            .collect();

        if !query.and_tags.is_empty() || !query.or_tags.is_empty() {
            roots.retain(|(trace_id, _)| {
                let ands = query.and_tags.iter().all(|tag| {
                    inner.trace_rows(*trace_id).any(|row| tag_matches(row, tag))
                });
                let ors = query.or_tags.is_empty()
                    || query.or_tags.iter().any(|tag| {
                        inner.trace_rows(*trace_id).any(|row| tag_matches(row, tag))
                    });
                ands && ors
            });
        }

        // Newest roots win the limit; results are returned oldest first.
        roots.sort_by(|a, b| (b.1.start_time, b.0).cmp(&(a.1.start_time, a.0)));
        roots.truncate(num);
        roots.sort_by(|a, b| (a.1.start_time, a.0).cmp(&(b.1.start_time, b.0)));

        roots
            .into_iter()
            .map(|(trace_id, _)| inner.trace(trace_id))
            .collect()
    }

    async fn services(&self) -> Result<Vec<String>, StorageError> {
        let inner = self.read();
        let names: BTreeSet<String> = inner
            .spans
            .values()
            .map(|record| record.service_name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn operations(&self, service: &str) -> Result<Vec<String>, StorageError> {
        let inner = self.read();
        let names: BTreeSet<String> = inner
            .spans
            .values()
            .filter(|record| record.service_name == service)
            .map(|record| record.operation_name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn dependencies(&self) -> Result<Vec<Dependency>, StorageError> {
        let inner = self.read();
        let mut counts: BTreeMap<(String, String), u64> = BTreeMap::new();
        for relation in &inner.relations {
            let (Some(parent), Some(child)) = (
                inner.spans.get(&relation.parent_id),
                inner.spans.get(&relation.child_id),
            ) else {
                continue;
            };
            let client_kind = child
                .rows
                .iter()
                .any(|row| row.time.is_none() && row.key == "span.kind" && row.value == "client");
            if !client_kind {
                continue;
            }
            *counts
                .entry((parent.service_name.clone(), child.service_name.clone()))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((parent, child), count)| Dependency {
                parent,
                child,
                count,
            })
            .collect())
    }

    async fn purge(&self, before: SystemTime) -> Result<(), StorageError> {
        let mut inner = self.write();
        let doomed: HashSet<u64> = inner
            .spans
            .iter()
            .filter(|(id, record)| **id == record.trace_id && record.start_time < before)
            .map(|(_, record)| record.trace_id)
            .collect();
        inner
            .spans
            .retain(|_, record| !doomed.contains(&record.trace_id));
        let spans = std::mem::take(&mut inner.spans);
        inner.relations.retain(|relation| {
            spans.contains_key(&relation.parent_id) && spans.contains_key(&relation.child_id)
        });
        inner.spans = spans;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::QueryTag;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn span(trace_id: u64, span_id: u64, parent_id: u64, start: u64, finish: u64) -> RawSpan {
        RawSpan {
            context: SpanContext::new(trace_id, span_id, parent_id, 1, HashMap::new()),
            service_name: "svc".to_owned(),
            operation_name: "op".to_owned(),
            start_time: at(start),
            finish_time: at(finish),
            tags: HashMap::new(),
            logs: Vec::new(),
        }
    }

    fn tagged(mut span: RawSpan, key: &str, value: &str) -> RawSpan {
        span.tags.insert(key.to_owned(), TagValue::from(value));
        span
    }

    #[tokio::test]
    async fn store_and_trace_round_trip() {
        let storage = MemoryStorage::new();
        let mut root = span(1, 1, 0, 10, 40);
        root.logs.push(LogRecord {
            event: "boot".to_owned(),
            payload: Some(TagValue::from(7i64)),
            timestamp: at(11),
        });
        storage.store(root).await.unwrap();
        storage
            .store(tagged(span(1, 2, 1, 20, 30), "url", "/hello"))
            .await
            .unwrap();
        storage.store(span(1, 3, 2, 21, 29)).await.unwrap();

        let trace = storage.trace_by_id(1).await.unwrap();
        assert_eq!(trace.trace_id, 1);
        assert_eq!(
            trace
                .spans
                .iter()
                .map(|span| span.context.span_id())
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(trace.relations.len(), 2);
        assert!(trace
            .relations
            .contains(&RawRelation { parent_id: 1, child_id: 2, kind: RelationKind::Parent }));
        assert!(trace
            .relations
            .contains(&RawRelation { parent_id: 2, child_id: 3, kind: RelationKind::Parent }));

        // Logs ride along; payloads come back stringified.
        let root = &trace.spans[0];
        assert_eq!(root.logs.len(), 1);
        assert_eq!(root.logs[0].payload, Some(TagValue::from("7")));
    }

    #[tokio::test]
    async fn children_of_unseen_parents_get_placeholders() {
        let storage = MemoryStorage::new();
        storage.store(span(1, 2, 1, 20, 30)).await.unwrap();

        let trace = storage.trace_by_id(1).await.unwrap();
        assert_eq!(trace.spans.len(), 2);
        let placeholder = trace
            .spans
            .iter()
            .find(|span| span.context.span_id() == 1)
            .unwrap();
        assert_eq!(placeholder.service_name, "");
    }

    #[tokio::test]
    async fn repeated_stores_accumulate_tags() {
        let storage = MemoryStorage::new();
        storage
            .store(tagged(span(1, 1, 0, 10, 20), "url", "/hello"))
            .await
            .unwrap();
        storage
            .store(tagged(span(1, 1, 0, 10, 21), "url", "/hello"))
            .await
            .unwrap();

        let raw = storage.span_by_id(1).await.unwrap();
        assert_eq!(raw.finish_time, at(21));
        // The duplicate collapses in the map view but both rows exist.
        assert_eq!(raw.tags.len(), 1);
        assert_eq!(storage.read().spans[&1].rows.len(), 2);
    }

    async fn seeded() -> MemoryStorage {
        let storage = MemoryStorage::new();
        // Trace 1: 10..40, tagged url=/hello on a child.
        storage.store(span(1, 1, 0, 10, 40)).await.unwrap();
        storage
            .store(tagged(span(1, 2, 1, 12, 30), "url", "/hello"))
            .await
            .unwrap();
        // Trace 4: 15..20, tagged url=/hello and error.
        storage
            .store(tagged(
                tagged(span(4, 4, 0, 15, 20), "url", "/hello"),
                "error",
                "true",
            ))
            .await
            .unwrap();
        // Trace 7: 50..90, no tags, different operation.
        let mut other = span(7, 7, 0, 50, 90);
        other.operation_name = "other".to_owned();
        storage.store(other).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn time_range_excludes_out_of_range_roots() {
        let storage = seeded().await;
        let traces = storage
            .query_traces(&Query {
                start_time: Some(at(0)),
                finish_time: Some(at(45)),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(trace_ids(&traces), vec![1, 4]);
    }

    #[tokio::test]
    async fn and_tags_require_all_matches_in_the_trace() {
        let storage = seeded().await;
        let query = Query {
            and_tags: vec![QueryTag {
                key: "url".to_owned(),
                value: "/hello".to_owned(),
                check_value: true,
            }],
            ..Query::default()
        };
        let traces = storage.query_traces(&query).await.unwrap();
        assert_eq!(trace_ids(&traces), vec![1, 4]);

        let query = Query {
            and_tags: vec![
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
            ],
            ..Query::default()
        };
        let traces = storage.query_traces(&query).await.unwrap();
        assert_eq!(trace_ids(&traces), vec![4]);
    }

    #[tokio::test]
    async fn or_tags_require_at_least_one_match() {
        let storage = seeded().await;
        let query = Query {
            or_tags: vec![
                QueryTag {
                    key: "error".to_owned(),
                    value: String::new(),
                    check_value: false,
                },
                QueryTag {
                    key: "no-such-key".to_owned(),
                    value: String::new(),
                    check_value: false,
                },
            ],
            ..Query::default()
        };
        let traces = storage.query_traces(&query).await.unwrap();
        assert_eq!(trace_ids(&traces), vec![4]);
    }

    #[tokio::test]
    async fn duration_bounds_are_inclusive() {
        let storage = seeded().await;
        let query = Query {
            min_duration: Duration::from_secs(5),
            max_duration: Some(Duration::from_secs(30)),
            ..Query::default()
        };
        let traces = storage.query_traces(&query).await.unwrap();
        // Trace 1 lasts 30s inclusive, trace 4 lasts 5s inclusive.
        assert_eq!(trace_ids(&traces), vec![1, 4]);
    }

    #[tokio::test]
    async fn num_keeps_the_newest_roots_in_ascending_order() {
        let storage = seeded().await;
        let traces = storage
            .query_traces(&Query {
                num: Some(2),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(trace_ids(&traces), vec![4, 7]);
    }

    #[tokio::test]
    async fn operation_name_filters_roots() {
        let storage = seeded().await;
        let traces = storage
            .query_traces(&Query {
                operation_name: "other".to_owned(),
                ..Query::default()
            })
            .await
            .unwrap();
        assert_eq!(trace_ids(&traces), vec![7]);
    }

    #[tokio::test]
    async fn services_and_operations_are_sorted_and_distinct() {
        let storage = MemoryStorage::new();
        let mut a = span(1, 1, 0, 10, 20);
        a.service_name = "zeta".to_owned();
        a.operation_name = "b".to_owned();
        storage.store(a).await.unwrap();
        let mut b = span(2, 2, 0, 10, 20);
        b.service_name = "alpha".to_owned();
        b.operation_name = "a".to_owned();
        storage.store(b).await.unwrap();
        let mut c = span(3, 3, 0, 10, 20);
        c.service_name = "alpha".to_owned();
        c.operation_name = "a".to_owned();
        storage.store(c).await.unwrap();

        assert_eq!(storage.services().await.unwrap(), vec!["alpha", "zeta"]);
        assert_eq!(storage.operations("alpha").await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn dependencies_count_client_children() {
        let storage = MemoryStorage::new();
        let mut root = span(1, 1, 0, 10, 40);
        root.service_name = "api".to_owned();
        storage.store(root).await.unwrap();
        let mut child = tagged(span(1, 2, 1, 12, 20), "span.kind", "client");
        child.service_name = "db".to_owned();
        storage.store(child).await.unwrap();
        // A second client call and one non-client child.
        let mut child = tagged(span(1, 3, 1, 21, 30), "span.kind", "client");
        child.service_name = "db".to_owned();
        storage.store(child).await.unwrap();
        let mut silent = span(1, 4, 1, 31, 35);
        silent.service_name = "cache".to_owned();
        storage.store(silent).await.unwrap();
        // A log entry keyed span.kind is not a tag and must not count.
        let mut logged = span(1, 5, 1, 36, 38);
        logged.service_name = "queue".to_owned();
        logged.logs.push(LogRecord {
            event: "span.kind".to_owned(),
            payload: Some(TagValue::from("client")),
            timestamp: at(36),
        });
        storage.store(logged).await.unwrap();

        assert_eq!(
            storage.dependencies().await.unwrap(),
            vec![Dependency {
                parent: "api".to_owned(),
                child: "db".to_owned(),
                count: 2,
            }]
        );
    }

    #[tokio::test]
    async fn purge_removes_old_traces_with_their_relations() {
        let storage = MemoryStorage::new();
        storage.store(span(1, 1, 0, 10, 20)).await.unwrap();
        storage.store(span(1, 2, 1, 11, 19)).await.unwrap();
        storage.store(span(5, 5, 0, 50, 60)).await.unwrap();

        storage.purge(at(30)).await.unwrap();
        assert!(matches!(
            storage.trace_by_id(1).await,
            Err(StorageError::NotFound)
        ));
        assert!(storage.read().relations.is_empty());
        assert!(storage.trace_by_id(5).await.is_ok());
    }

    fn trace_ids(traces: &[RawTrace]) -> Vec<u64> {
        traces.iter().map(|trace| trace.trace_id).collect()
    }
}
