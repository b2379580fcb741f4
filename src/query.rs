/// Query specifications and the row-to-metric extraction pipeline.
///
/// One execution evaluates the parameters, runs the SQL, coerces every row
/// and turns each `valueKey` entry into a metric point, backfilling nulls
/// from `defaultValue` and resolving the point's timestamp.
use crate::clock::Clock;
use crate::params::{self, CommandSubstitutionError, Param};
use crate::source::{DataSource, SourceError};
use crate::template;
use crate::value::{self, MetricValue, Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// A configured query, as deserialized from the query file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuerySpec {
    /// Prefixed to every emitted key, joined with `.`.
    pub key_prefix: Option<String>,
    /// Key template → column holding the metric value.
    pub value_key: BTreeMap<String, String>,
    /// Key template → value used when the column is null.
    pub default_value: BTreeMap<String, f64>,
    pub sql: String,
    pub params: Vec<Param>,
    /// Destination service; the collector's default when unset.
    pub service: Option<String>,
    /// Column holding a per-row unix timestamp.
    pub time: Option<String>,
}

/// A single named, timestamped measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub name: String,
    pub time: i64,
    pub value: MetricValue,
}

/// Fatal errors for one query execution. Sibling queries are unaffected.
#[derive(Debug)]
pub enum QueryError {
    /// A `$(...)` parameter command failed.
    Params(CommandSubstitutionError),
    /// The data source rejected or failed the query.
    Source(SourceError),
    /// A `valueKey` entry names a column the result set does not have.
    ColumnNotFound(String),
    /// The configured `time` column is not in the result set.
    TimeColumnMissing(String),
    /// The configured `time` column does not hold an integer.
    TimeColumnNotInteger(String),
    /// The run was cancelled before this query finished.
    Cancelled,
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::Params(e) => write!(f, "{e}"),
            QueryError::Source(e) => write!(f, "{e}"),
            QueryError::ColumnNotFound(c) => write!(f, "{c:?} not exists in columns"),
            QueryError::TimeColumnMissing(c) => {
                write!(f, "time column {c:?} not exists in columns")
            }
            QueryError::TimeColumnNotInteger(c) => {
                write!(f, "failed to convert time column {c:?} to int64")
            }
            QueryError::Cancelled => write!(f, "query cancelled"),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QueryError::Params(e) => Some(e),
            QueryError::Source(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CommandSubstitutionError> for QueryError {
    fn from(e: CommandSubstitutionError) -> Self {
        QueryError::Params(e)
    }
}

impl From<SourceError> for QueryError {
    fn from(e: SourceError) -> Self {
        QueryError::Source(e)
    }
}

/// Parse a YAML document holding a list of query specifications.
pub fn parse_queries(yaml: &str) -> Result<Vec<QuerySpec>, serde_yaml::Error> {
    serde_yaml::from_str(yaml)
}

impl QuerySpec {
    /// The destination service override, if one is set and non-empty.
    pub fn service(&self) -> Option<&str> {
        non_empty(&self.service)
    }

    fn key_prefix(&self) -> Option<&str> {
        non_empty(&self.key_prefix)
    }

    fn time_column(&self) -> Option<&str> {
        non_empty(&self.time)
    }

    /// Run the query once and extract its metric points.
    ///
    /// The execution-start timestamp is taken from `clock` before anything
    /// else happens and is used for every point unless `time` is set.
    pub async fn execute(
        &self,
        source: &dyn DataSource,
        clock: &dyn Clock,
        cancel: &CancellationToken,
    ) -> Result<Vec<MetricPoint>, QueryError> {
        let now = clock.now_unix();

        let params = until_cancelled(cancel, params::eval_params(&self.params)).await??;
        let raw = until_cancelled(cancel, source.query(&self.sql, &params)).await??;

        let rows: Vec<Row> = raw.into_iter().map(value::coerce_row).collect();
        tracing::debug!(sql = %self.sql, rows = rows.len(), "query returned");

        self.extract(&rows, now)
    }

    /// Turn coerced rows into metric points.
    pub fn extract(&self, rows: &[Row], now: i64) -> Result<Vec<MetricPoint>, QueryError> {
        let mut metrics = Vec::with_capacity(self.value_key.len() * rows.len());

        for row in rows {
            let defaults = self.expand_defaults(row);

            for (template, column) in &self.value_key {
                let key = match template::expand(template, row) {
                    Ok(key) => key,
                    Err(e) => {
                        tracing::info!(
                            error = %e,
                            column = e.column(),
                            template = %template,
                            sql = %self.sql,
                            "skipping value key"
                        );
                        continue;
                    }
                };

                let value = row
                    .get(column)
                    .ok_or_else(|| QueryError::ColumnNotFound(column.clone()))?;

                let value = match value.to_metric() {
                    Some(v) => v,
                    None => match defaults.get(&key) {
                        Some(d) => MetricValue::Float(*d),
                        None => continue,
                    },
                };

                let name = match self.key_prefix() {
                    Some(prefix) => format!("{prefix}.{key}"),
                    None => key,
                };

                metrics.push(MetricPoint {
                    name,
                    time: self.resolve_time(row, now)?,
                    value,
                });
            }
        }

        Ok(metrics)
    }

    /// Expanded default key → default value for one row. Entries whose
    /// template does not expand are logged and left out.
    fn expand_defaults(&self, row: &Row) -> HashMap<String, f64> {
        let mut defaults = HashMap::with_capacity(self.default_value.len());
        for (template, value) in &self.default_value {
            match template::expand(template, row) {
                Ok(key) => {
                    defaults.insert(key, *value);
                }
                Err(e) => {
                    tracing::info!(
                        error = %e,
                        column = e.column(),
                        template = %template,
                        sql = %self.sql,
                        "skipping default value"
                    );
                }
            }
        }
        defaults
    }

    fn resolve_time(&self, row: &Row, now: i64) -> Result<i64, QueryError> {
        let Some(column) = self.time_column() else {
            return Ok(now);
        };
        match row.get(column) {
            Some(Value::Int(t)) => Ok(*t),
            Some(_) => Err(QueryError::TimeColumnNotInteger(column.to_string())),
            None => Err(QueryError::TimeColumnMissing(column.to_string())),
        }
    }
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

/// Await `fut` unless `cancel` fires first.
pub(crate) async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T, QueryError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(QueryError::Cancelled),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::value::{RawRow, RawValue};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const T: i64 = 1_641_092_645;

    /// Returns canned rows and records what it was asked to run.
    struct StaticSource {
        rows: Vec<RawRow>,
        seen: Mutex<Vec<(String, Vec<Param>)>>,
    }

    impl StaticSource {
        fn new(rows: Vec<RawRow>) -> Self {
            Self {
                rows,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DataSource for StaticSource {
        async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<RawRow>, SourceError> {
            self.seen
                .lock()
                .unwrap()
                .push((sql.to_string(), params.to_vec()));
            Ok(self.rows.clone())
        }
    }

    fn agent_rows() -> Vec<RawRow> {
        let row = |version: &str, hosts: RawValue| {
            vec![
                ("agent_version".to_string(), RawValue::Bytes(version.as_bytes().to_vec())),
                ("host_num".to_string(), hosts),
            ]
        };
        vec![
            row("0.1.0", RawValue::Int(10)),
            row("0.1.1", RawValue::Null),
            row("0.1.2", RawValue::Null),
        ]
    }

    fn agent_query() -> QuerySpec {
        QuerySpec {
            key_prefix: Some("agent".into()),
            value_key: BTreeMap::from([(
                "versions.#{agent_version}".to_string(),
                "host_num".to_string(),
            )]),
            sql: "SELECT * FROM dummy".into(),
            ..Default::default()
        }
    }

    async fn run(query: &QuerySpec, rows: Vec<RawRow>) -> Result<Vec<MetricPoint>, QueryError> {
        let source = StaticSource::new(rows);
        let mut out = query
            .execute(&source, &FixedClock(T), &CancellationToken::new())
            .await?;
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn point(name: &str, value: MetricValue) -> MetricPoint {
        MetricPoint {
            name: name.into(),
            time: T,
            value,
        }
    }

    #[tokio::test]
    async fn basic_extraction() {
        let out = run(&agent_query(), agent_rows()[..1].to_vec()).await.unwrap();
        assert_eq!(out, vec![point("agent.versions.0_1_0", MetricValue::Int(10))]);
    }

    #[tokio::test]
    async fn nulls_without_default_are_skipped() {
        let out = run(&agent_query(), agent_rows()).await.unwrap();
        assert_eq!(out, vec![point("agent.versions.0_1_0", MetricValue::Int(10))]);
    }

    #[tokio::test]
    async fn literal_default_backfills_matching_key() {
        let mut query = agent_query();
        query.default_value = BTreeMap::from([("versions.0_1_1".to_string(), 0.0)]);

        let out = run(&query, agent_rows()).await.unwrap();
        assert_eq!(
            out,
            vec![
                point("agent.versions.0_1_0", MetricValue::Int(10)),
                point("agent.versions.0_1_1", MetricValue::Float(0.0)),
            ]
        );
    }

    #[tokio::test]
    async fn templated_default_backfills_every_null_row() {
        let mut query = agent_query();
        query.default_value = BTreeMap::from([("versions.#{agent_version}".to_string(), 0.0)]);

        let out = run(&query, agent_rows()).await.unwrap();
        assert_eq!(
            out,
            vec![
                point("agent.versions.0_1_0", MetricValue::Int(10)),
                point("agent.versions.0_1_1", MetricValue::Float(0.0)),
                point("agent.versions.0_1_2", MetricValue::Float(0.0)),
            ]
        );
    }

    #[tokio::test]
    async fn default_never_overrides_present_value() {
        let mut query = agent_query();
        query.default_value = BTreeMap::from([("versions.0_1_0".to_string(), 99.0)]);

        let out = run(&query, agent_rows()[..1].to_vec()).await.unwrap();
        assert_eq!(out, vec![point("agent.versions.0_1_0", MetricValue::Int(10))]);
    }

    #[tokio::test]
    async fn default_for_unproduced_key_emits_nothing() {
        let mut query = agent_query();
        query.default_value = BTreeMap::from([("versions.0_2_0".to_string(), 1.0)]);

        let out = run(&query, agent_rows()).await.unwrap();
        assert_eq!(out, vec![point("agent.versions.0_1_0", MetricValue::Int(10))]);
    }

    #[tokio::test]
    async fn no_prefix_leaves_key_bare() {
        let mut query = agent_query();
        query.key_prefix = Some(String::new());

        let out = run(&query, agent_rows()[..1].to_vec()).await.unwrap();
        assert_eq!(out[0].name, "versions.0_1_0");
    }

    #[tokio::test]
    async fn missing_value_column_fails_query() {
        let mut query = agent_query();
        query
            .value_key
            .insert("other".to_string(), "no_such_column".to_string());

        let err = run(&query, agent_rows()).await.unwrap_err();
        assert!(matches!(err, QueryError::ColumnNotFound(ref c) if c == "no_such_column"));
    }

    #[tokio::test]
    async fn unexpandable_template_skips_only_that_entry() {
        let mut query = agent_query();
        query
            .value_key
            .insert("by_missing.#{nope}".to_string(), "host_num".to_string());

        let out = run(&query, agent_rows()[..1].to_vec()).await.unwrap();
        assert_eq!(out, vec![point("agent.versions.0_1_0", MetricValue::Int(10))]);
    }

    #[tokio::test]
    async fn unexpandable_default_is_ignored() {
        let mut query = agent_query();
        query.default_value = BTreeMap::from([
            ("versions.#{nope}".to_string(), 5.0),
            ("versions.#{agent_version}".to_string(), 1.0),
        ]);

        let out = run(&query, agent_rows()[1..2].to_vec()).await.unwrap();
        assert_eq!(out, vec![point("agent.versions.0_1_1", MetricValue::Float(1.0))]);
    }

    #[tokio::test]
    async fn zero_rows_is_not_an_error() {
        let out = run(&agent_query(), Vec::new()).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn time_column_sets_per_row_timestamp() {
        let mut query = agent_query();
        query.time = Some("ts".into());
        let rows = vec![
            vec![
                ("agent_version".to_string(), RawValue::Text("a".into())),
                ("host_num".to_string(), RawValue::Int(1)),
                ("ts".to_string(), RawValue::Int(100)),
            ],
            vec![
                ("agent_version".to_string(), RawValue::Text("b".into())),
                ("host_num".to_string(), RawValue::Int(2)),
                ("ts".to_string(), RawValue::Bytes(b"200".to_vec())),
            ],
        ];

        let out = run(&query, rows).await.unwrap();
        let times: Vec<i64> = out.iter().map(|p| p.time).collect();
        assert_eq!(times, vec![100, 200]);
    }

    #[tokio::test]
    async fn without_time_column_all_points_share_start_timestamp() {
        let mut query = agent_query();
        query.default_value = BTreeMap::from([("versions.#{agent_version}".to_string(), 0.0)]);

        let out = run(&query, agent_rows()).await.unwrap();
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|p| p.time == T));
    }

    #[tokio::test]
    async fn missing_time_column_fails_query() {
        let mut query = agent_query();
        query.time = Some("ts".into());

        let err = run(&query, agent_rows()).await.unwrap_err();
        assert!(matches!(err, QueryError::TimeColumnMissing(ref c) if c == "ts"));
    }

    #[tokio::test]
    async fn non_integer_time_column_fails_query() {
        let mut query = agent_query();
        query.time = Some("agent_version".into());

        let err = run(&query, agent_rows()).await.unwrap_err();
        assert!(matches!(err, QueryError::TimeColumnNotInteger(_)));
        assert!(err.to_string().contains("int64"));
    }

    #[tokio::test]
    async fn value_types_are_preserved() {
        let query = QuerySpec {
            value_key: BTreeMap::from([
                ("i".to_string(), "i".to_string()),
                ("f".to_string(), "f".to_string()),
                ("b".to_string(), "b".to_string()),
            ]),
            sql: "SELECT 1".into(),
            ..Default::default()
        };
        let rows = vec![vec![
            ("i".to_string(), RawValue::Bytes(b"7".to_vec())),
            ("f".to_string(), RawValue::Float(1.5)),
            ("b".to_string(), RawValue::Bool(true)),
        ]];

        let out = run(&query, rows).await.unwrap();
        assert_eq!(
            out,
            vec![
                point("b", MetricValue::Bool(true)),
                point("f", MetricValue::Float(1.5)),
                point("i", MetricValue::Int(7)),
            ]
        );
    }

    #[tokio::test]
    async fn params_are_evaluated_before_query() {
        let query = QuerySpec {
            sql: "SELECT * FROM t WHERE d = ?".into(),
            params: vec![Param::Text("$(echo 2022-01-02)".into()), Param::Int(3)],
            ..Default::default()
        };
        let source = StaticSource::new(Vec::new());
        query
            .execute(&source, &FixedClock(T), &CancellationToken::new())
            .await
            .unwrap();

        let seen = source.seen.lock().unwrap();
        assert_eq!(
            seen[0].1,
            vec![Param::Text("2022-01-02".into()), Param::Int(3)]
        );
    }

    #[tokio::test]
    async fn failing_param_command_fails_before_query() {
        let query = QuerySpec {
            sql: "SELECT 1".into(),
            params: vec![Param::Text("$(exit 1)".into())],
            ..Default::default()
        };
        let source = StaticSource::new(Vec::new());
        let err = query
            .execute(&source, &FixedClock(T), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, QueryError::Params(_)));
        assert!(source.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_stops_execution() {
        let source = StaticSource::new(agent_rows());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = agent_query()
            .execute(&source, &FixedClock(T), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
    }

    #[tokio::test]
    async fn runs_against_sqlite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("agents.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE dummy (agent_version TEXT, host_num INTEGER);
             INSERT INTO dummy VALUES ('0.1.0', 10), ('0.1.1', NULL);",
        )
        .unwrap();
        drop(conn);
        let source = crate::source::SqliteSource::open(&path).unwrap();

        let mut query = agent_query();
        query.default_value = BTreeMap::from([("versions.#{agent_version}".to_string(), 0.0)]);
        let mut out = query
            .execute(&source, &FixedClock(T), &CancellationToken::new())
            .await
            .unwrap();
        out.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(
            out,
            vec![
                point("agent.versions.0_1_0", MetricValue::Int(10)),
                point("agent.versions.0_1_1", MetricValue::Float(0.0)),
            ]
        );
    }

    #[test]
    fn parses_query_file() {
        let yaml = r#"
- keyPrefix: agent
  valueKey:
    "versions.#{agent_version}": host_num
  defaultValue:
    "versions.#{agent_version}": 0
  sql: SELECT agent_version, host_num FROM hosts WHERE day = ?
  params:
    - "$(date +%F)"
  service: Production
- valueKey:
    total: n
  sql: SELECT COUNT(*) AS n FROM hosts
  time: ts
"#;
        let queries = parse_queries(yaml).unwrap();
        assert_eq!(queries.len(), 2);

        let first = &queries[0];
        assert_eq!(first.key_prefix.as_deref(), Some("agent"));
        assert_eq!(first.value_key["versions.#{agent_version}"], "host_num");
        assert_eq!(first.default_value["versions.#{agent_version}"], 0.0);
        assert_eq!(first.params, vec![Param::Text("$(date +%F)".into())]);
        assert_eq!(first.service(), Some("Production"));
        assert_eq!(first.time, None);

        let second = &queries[1];
        assert_eq!(second.service(), None);
        assert_eq!(second.time.as_deref(), Some("ts"));
        assert!(second.params.is_empty());
    }

    #[test]
    fn empty_service_counts_as_unset() {
        let query = QuerySpec {
            service: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(query.service(), None);
    }
}
