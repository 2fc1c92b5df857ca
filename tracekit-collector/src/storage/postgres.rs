//! PostgreSQL storage.
//!
//! Spans live in three tables plus a materialized dependency view. The
//! span's time range is a `tstzrange`; tags and logs share one append-only
//! table, told apart by whether the row carries a timestamp. Parent spans
//! may be referenced before they are stored, which the store path papers
//! over with placeholder rows so foreign keys hold without ordering
//! constraints between shippers.

use super::{Dependency, Query, Storage, StorageError};
use crate::error::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracekit::{RawRelation, RawSpan, RawTrace, RelationKind, SpanContext, TagValue};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS spans (
    id bigint PRIMARY KEY,
    trace_id bigint NOT NULL,
    time tstzrange NOT NULL,
    service_name text NOT NULL,
    operation_name text NOT NULL
);
CREATE INDEX IF NOT EXISTS spans_trace_id_idx ON spans (trace_id);
CREATE INDEX IF NOT EXISTS spans_time_idx ON spans USING gist (time);
CREATE INDEX IF NOT EXISTS spans_operation_name_idx ON spans (operation_name);

CREATE TABLE IF NOT EXISTS tags (
    id bigserial PRIMARY KEY,
    span_id bigint NOT NULL REFERENCES spans (id) ON DELETE CASCADE,
    trace_id bigint NOT NULL,
    key text NOT NULL,
    value text NOT NULL,
    time timestamptz
);
CREATE INDEX IF NOT EXISTS tags_span_id_idx ON tags (span_id);
CREATE INDEX IF NOT EXISTS tags_key_value_idx ON tags (key, value);

DO $$ BEGIN
    CREATE TYPE relation_kind AS ENUM ('parent');
EXCEPTION WHEN duplicate_object THEN NULL;
END $$;

CREATE TABLE IF NOT EXISTS relations (
    id bigserial PRIMARY KEY,
    span1_id bigint NOT NULL REFERENCES spans (id) ON DELETE CASCADE,
    span2_id bigint NOT NULL REFERENCES spans (id) ON DELETE CASCADE,
    kind relation_kind NOT NULL
);
CREATE INDEX IF NOT EXISTS relations_span1_id_idx ON relations (span1_id);
CREATE INDEX IF NOT EXISTS relations_span2_id_idx ON relations (span2_id);

CREATE OR REPLACE FUNCTION duration(r tstzrange) RETURNS bigint AS $$
    SELECT (extract(epoch FROM upper(r) - lower(r)) * 1000000000)::bigint
$$ LANGUAGE sql IMMUTABLE;

CREATE MATERIALIZED VIEW IF NOT EXISTS dependencies AS
    SELECT parent.service_name AS name1, child.service_name AS name2, count(*) AS count
    FROM relations
    JOIN spans AS parent ON parent.id = relations.span1_id
    JOIN spans AS child ON child.id = relations.span2_id
    WHERE relations.kind = 'parent'
      AND EXISTS (
        SELECT 1 FROM tags
        WHERE tags.span_id = child.id AND tags.time IS NULL
          AND tags.key = 'span.kind' AND tags.value = 'client'
      )
    GROUP BY parent.service_name, child.service_name;
";

/// Builds a `postgres` engine from its `[storage.postgres]` table, which
/// must hold a `url` connection string.
pub fn setup(
    conf: toml::Table,
) -> futures_util::future::BoxFuture<'static, Result<Arc<dyn Storage>, Error>> {
    Box::pin(async move {
        let url = conf
            .get("url")
            .and_then(toml::Value::as_str)
            .ok_or_else(|| {
                Error::Storage(StorageError::InvalidConfig(
                    "missing url for postgres backend".to_owned(),
                ))
            })?;
        let storage = PostgresStorage::connect(url).await?;
        Ok(Arc::new(storage) as Arc<dyn Storage>)
    })
}

/// A storage engine backed by PostgreSQL.
pub struct PostgresStorage {
    pool: Pool,
}

impl fmt::Debug for PostgresStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStorage").finish_non_exhaustive()
    }
}

impl PostgresStorage {
    /// Connects to the database at `url`, applies the schema and returns
    /// the engine. The pool it owns hands out up to 16 connections.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let config: tokio_postgres::Config = url.parse()?;
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(16)
            .build()
            .map_err(|err| StorageError::InvalidConfig(err.to_string()))?;
        let storage = PostgresStorage { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        Ok(())
    }
}

fn range_bounds(span: &RawSpan) -> (DateTime<Utc>, DateTime<Utc>) {
    (
        DateTime::<Utc>::from(span.start_time),
        DateTime::<Utc>::from(span.finish_time),
    )
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn store(&self, span: RawSpan) -> Result<(), StorageError> {
        const UPSERT_SPAN: &str = "
INSERT INTO spans (id, trace_id, time, service_name, operation_name)
VALUES ($1, $2, tstzrange($3, $4, '[]'), $5, $6)
ON CONFLICT (id) DO UPDATE SET
    time = excluded.time,
    service_name = excluded.service_name,
    operation_name = excluded.operation_name";
        const UPSERT_PLACEHOLDER: &str = "
INSERT INTO spans (id, trace_id, time, service_name, operation_name)
VALUES ($1, $2, tstzrange($3, $4, '[]'), '', '')
ON CONFLICT (id) DO NOTHING";
        const INSERT_RELATION: &str =
            "INSERT INTO relations (span1_id, span2_id, kind) VALUES ($1, $2, 'parent')";
        const INSERT_TAG: &str =
            "INSERT INTO tags (span_id, trace_id, key, value, time) VALUES ($1, $2, $3, $4, $5)";

        let span_id = span.context.span_id() as i64;
        let trace_id = span.context.trace_id() as i64;
        let parent_id = span.context.parent_id() as i64;
        let (start, finish) = range_bounds(&span);

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        tx.execute(
            UPSERT_SPAN,
            &[
                &span_id,
                &trace_id,
                &start,
                &finish,
                &span.service_name,
                &span.operation_name,
            ],
        )
        .await?;

        if parent_id != 0 {
            let epoch = DateTime::<Utc>::from(UNIX_EPOCH);
            tx.execute(UPSERT_PLACEHOLDER, &[&parent_id, &trace_id, &epoch, &epoch])
                .await?;
            tx.execute(UPSERT_PLACEHOLDER, &[&trace_id, &trace_id, &start, &finish])
                .await?;
            tx.execute(INSERT_RELATION, &[&parent_id, &span_id]).await?;
        }

        for (key, value) in &span.tags {
            let value = value.to_string();
            tx.execute(
                INSERT_TAG,
                &[&span_id, &trace_id, key, &value, &None::<DateTime<Utc>>],
            )
            .await?;
        }
        for log in &span.logs {
            let payload = log.payload.as_ref().map(TagValue::to_string).unwrap_or_default();
            let time = DateTime::<Utc>::from(log.timestamp);
            tx.execute(
                INSERT_TAG,
                &[&span_id, &trace_id, &log.event, &payload, &Some(time)],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn trace_by_id(&self, id: u64) -> Result<RawTrace, StorageError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        trace_in_tx(&tx, id).await
    }

    async fn span_by_id(&self, id: u64) -> Result<RawSpan, StorageError> {
        const SELECT_SPAN: &str = "
SELECT spans.id, spans.trace_id, lower(spans.time), upper(spans.time),
       spans.service_name, spans.operation_name, tags.key, tags.value, tags.time
FROM spans
LEFT JOIN tags ON spans.id = tags.span_id
WHERE spans.id = $1
ORDER BY spans.time ASC, spans.id";

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let rows = tx.query(SELECT_SPAN, &[&(id as i64)]).await?;
        scan_spans(&rows).into_iter().next().ok_or(StorageError::NotFound)
    }

    async fn query_traces(&self, query: &Query) -> Result<Vec<RawTrace>, StorageError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let (sql, params) = compile_query(query, SystemTime::now());
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(SqlParam::as_sql).collect();
        let rows = tx.query(sql.as_str(), &refs).await?;

        let mut traces = Vec::with_capacity(rows.len());
        for row in rows {
            let trace_id: i64 = row.get(0);
            traces.push(trace_in_tx(&tx, trace_id as u64).await?);
        }
        Ok(traces)
    }

    async fn services(&self) -> Result<Vec<String>, StorageError> {
        const QUERY: &str = "SELECT DISTINCT service_name FROM spans ORDER BY service_name ASC";
        let client = self.pool.get().await?;
        let rows = client.query(QUERY, &[]).await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn operations(&self, service: &str) -> Result<Vec<String>, StorageError> {
        const QUERY: &str = "
SELECT DISTINCT operation_name FROM spans WHERE service_name = $1 ORDER BY operation_name ASC";
        let client = self.pool.get().await?;
        let rows = client.query(QUERY, &[&service]).await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn dependencies(&self) -> Result<Vec<Dependency>, StorageError> {
        const QUERY: &str = "SELECT name1, name2, count FROM dependencies";
        let client = self.pool.get().await?;
        let rows = client.query(QUERY, &[]).await?;
        Ok(rows
            .iter()
            .map(|row| Dependency {
                parent: row.get(0),
                child: row.get(1),
                count: row.get::<_, i64>(2) as u64,
            })
            .collect())
    }

    async fn purge(&self, before: SystemTime) -> Result<(), StorageError> {
        const QUERY: &str = "
DELETE FROM spans WHERE trace_id IN (
    SELECT trace_id FROM spans WHERE id = trace_id AND lower(time) < $1)";
        let client = self.pool.get().await?;
        client
            .execute(QUERY, &[&DateTime::<Utc>::from(before)])
            .await?;
        Ok(())
    }
}

async fn trace_in_tx(
    tx: &deadpool_postgres::Transaction<'_>,
    id: u64,
) -> Result<RawTrace, StorageError> {
    const SELECT_TRACE: &str = "
SELECT spans.id, spans.trace_id, lower(spans.time), upper(spans.time),
       spans.service_name, spans.operation_name, tags.key, tags.value, tags.time
FROM spans
LEFT JOIN tags ON spans.id = tags.span_id
WHERE spans.trace_id = $1
ORDER BY spans.time ASC, spans.id";
    const SELECT_RELATIONS: &str = "
SELECT r.span1_id, r.span2_id, r.kind::text
FROM relations AS r
JOIN spans ON spans.id = r.span1_id
WHERE spans.trace_id = $1";

    let rows = tx.query(SELECT_TRACE, &[&(id as i64)]).await?;
    let spans = scan_spans(&rows);
    if spans.is_empty() {
        return Err(StorageError::NotFound);
    }

    let rows = tx.query(SELECT_RELATIONS, &[&(id as i64)]).await?;
    let relations = rows
        .iter()
        .map(|row| RawRelation {
            parent_id: row.get::<_, i64>(0) as u64,
            child_id: row.get::<_, i64>(1) as u64,
            kind: RelationKind::Parent,
        })
        .collect();

    Ok(RawTrace {
        trace_id: id,
        spans,
        relations,
    })
}

/// Collapses the spans⨝tags join back into spans. Rows arrive ordered by
/// span; a row's tag columns are null when the span has no tags at all.
fn scan_spans(rows: &[Row]) -> Vec<RawSpan> {
    let mut spans: Vec<RawSpan> = Vec::new();
    let mut prev_id = 0i64;
    for row in rows {
        let span_id: i64 = row.get(0);
        if span_id != prev_id {
            prev_id = span_id;
            let trace_id: i64 = row.get(1);
            let start: DateTime<Utc> = row.get(2);
            let finish: DateTime<Utc> = row.get(3);
            spans.push(RawSpan {
                context: SpanContext::new(trace_id as u64, span_id as u64, 0, 0, HashMap::new()),
                service_name: row.get(4),
                operation_name: row.get(5),
                start_time: start.into(),
                finish_time: finish.into(),
                tags: HashMap::new(),
                logs: Vec::new(),
            });
        }
        let span = match spans.last_mut() {
            Some(span) => span,
            None => continue,
        };
        let key: Option<String> = row.get(6);
        let value: Option<String> = row.get(7);
        let time: Option<DateTime<Utc>> = row.get(8);
        if let (Some(key), Some(value)) = (key, value) {
            match time {
                Some(time) => span.logs.push(tracekit::LogRecord {
                    event: key,
                    payload: Some(TagValue::String(value)),
                    timestamp: time.into(),
                }),
                None => {
                    span.tags.insert(key, TagValue::String(value));
                }
            }
        }
    }
    spans
}

enum SqlParam {
    Text(String),
    Time(DateTime<Utc>),
    Int(i64),
}

impl SqlParam {
    fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlParam::Text(value) => value,
            SqlParam::Time(value) => value,
            SqlParam::Int(value) => value,
        }
    }
}

/// Compiles a [`Query`] into SQL over root spans.
///
/// The inner query picks the newest matching roots, the outer one restores
/// ascending order. Tag conditions become one EXISTS subquery per AND tag
/// plus one for the whole OR group, each scoped to the root's trace.
fn compile_query(query: &Query, now: SystemTime) -> (String, Vec<SqlParam>) {
    fn place(params: &mut Vec<SqlParam>, param: SqlParam) -> String {
        params.push(param);
        format!("${}", params.len())
    }

    let mut params: Vec<SqlParam> = Vec::new();

    let mut exists = Vec::new();
    for tag in &query.and_tags {
        let key = place(&mut params, SqlParam::Text(tag.key.clone()));
        let cond = if tag.check_value {
            let value = place(&mut params, SqlParam::Text(tag.value.clone()));
            format!("(tags.key = {key} AND tags.value = {value})")
        } else {
            format!("(tags.key = {key})")
        };
        exists.push(cond);
    }
    if !query.or_tags.is_empty() {
        let mut ors = Vec::new();
        for tag in &query.or_tags {
            let key = place(&mut params, SqlParam::Text(tag.key.clone()));
            if tag.check_value {
                let value = place(&mut params, SqlParam::Text(tag.value.clone()));
                ors.push(format!("(tags.key = {key} AND tags.value = {value})"));
            } else {
                ors.push(format!("(tags.key = {key})"));
            }
        }
        exists.push(format!("({})", ors.join(" OR ")));
    }

    let mut conds: Vec<String> = exists
        .into_iter()
        .map(|cond| {
            format!(
                "EXISTS (SELECT 1 FROM tags WHERE tags.trace_id = spans.trace_id AND {cond})"
            )
        })
        .collect();

    let start = place(
        &mut params,
        SqlParam::Time(DateTime::<Utc>::from(query.start_time.unwrap_or(UNIX_EPOCH))),
    );
    let finish = place(
        &mut params,
        SqlParam::Time(DateTime::<Utc>::from(query.finish_time.unwrap_or(now))),
    );
    conds.push(format!("tstzrange({start}, {finish}, '[]') @> spans.time"));

    let op1 = place(&mut params, SqlParam::Text(query.operation_name.clone()));
    let op2 = place(&mut params, SqlParam::Text(query.operation_name.clone()));
    conds.push(format!("({op1} = '' OR operation_name = {op2})"));

    let min = place(
        &mut params,
        SqlParam::Int(query.min_duration.as_nanos() as i64),
    );
    let max = place(
        &mut params,
        SqlParam::Int(
            query
                .max_duration
                .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
                .unwrap_or(i64::MAX),
        ),
    );
    conds.push(format!("duration(time) >= {min}"));
    conds.push(format!("duration(time) <= {max}"));
    conds.push("spans.id = spans.trace_id".to_owned());

    let limit = place(
        &mut params,
        SqlParam::Int(query.num.map(|n| n.min(i64::MAX as usize) as i64).unwrap_or(i64::MAX)),
    );

    let sql = format!(
        "\
SELECT sub.trace_id FROM (
SELECT *
FROM spans
WHERE
  {conds}
ORDER BY
  spans.time DESC,
  spans.trace_id
LIMIT {limit}) AS sub
ORDER BY sub.time ASC, sub.trace_id",
        conds = conds.join(" AND\n  "),
    );
    (sql, params)
}
