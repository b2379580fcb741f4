/// SQLite data source backed by rusqlite.
use super::{DataSource, SourceError};
use crate::params::Param;
use crate::value::{RawRow, RawValue};
use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const IN_MEMORY: &str = ":memory:";

static MEMORY_DB_SEQ: AtomicUsize = AtomicUsize::new(0);

fn shared_memory_uri() -> String {
    let seq = MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "file:sql-metric-collector-{}-{seq}?mode=memory&cache=shared",
        std::process::id()
    )
}

/// A SQLite database shared by concurrent query tasks.
///
/// Each query checks a connection out of a small idle pool on a blocking
/// thread and returns it afterwards, so no two queries share a `Connection`.
#[derive(Clone)]
pub struct SqliteSource {
    path: PathBuf,
    idle: Arc<Mutex<Vec<Connection>>>,
}

impl SqliteSource {
    /// Open the database at `path` and verify it answers `SELECT 1`.
    ///
    /// `:memory:` becomes a private shared-cache database so that every
    /// pooled connection sees the same tables.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let mut path = path.into();
        if path.as_os_str() == IN_MEMORY {
            path = shared_memory_uri().into();
        }
        let conn = connect(&path)?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| SourceError::Open {
                path: path.clone(),
                source: e,
            })?;

        tracing::debug!(path = %path.display(), "opened sqlite data source");

        Ok(Self {
            path,
            idle: Arc::new(Mutex::new(vec![conn])),
        })
    }

    fn checkout(&self) -> Result<Connection, SourceError> {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => connect(&self.path),
        }
    }

    fn checkin(&self, conn: Connection) {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(conn);
    }

    fn run(&self, sql: &str, params: &[Param]) -> Result<Vec<RawRow>, SourceError> {
        let conn = self.checkout()?;
        let result = query_rows(&conn, sql, params);
        self.checkin(conn);
        result
    }
}

#[async_trait]
impl DataSource for SqliteSource {
    async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<RawRow>, SourceError> {
        let source = self.clone();
        let sql = sql.to_string();
        let params = params.to_vec();
        tokio::task::spawn_blocking(move || source.run(&sql, &params))
            .await
            .map_err(SourceError::Worker)?
    }
}

fn connect(path: &Path) -> Result<Connection, SourceError> {
    let conn = Connection::open(path).map_err(|e| SourceError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| SourceError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(conn)
}

fn query_rows(conn: &Connection, sql: &str, params: &[Param]) -> Result<Vec<RawRow>, SourceError> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut results = Vec::new();

    while let Some(row) = rows.next()? {
        let mut raw = Vec::with_capacity(columns.len());
        for (i, col) in columns.iter().enumerate() {
            let value = match row.get_ref(i)? {
                ValueRef::Null => RawValue::Null,
                ValueRef::Integer(n) => RawValue::Int(n),
                ValueRef::Real(f) => RawValue::Float(f),
                ValueRef::Text(bytes) | ValueRef::Blob(bytes) => RawValue::Bytes(bytes.to_vec()),
            };
            raw.push((col.clone(), value));
        }
        results.push(raw);
    }

    Ok(results)
}

impl ToSql for Param {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Param::Bool(b) => ToSqlOutput::from(*b),
            Param::Int(i) => ToSqlOutput::from(*i),
            Param::Float(f) => ToSqlOutput::from(*f),
            Param::Text(s) => ToSqlOutput::from(s.as_str()),
            Param::Null => ToSqlOutput::from(rusqlite::types::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_source() -> (TempDir, SqliteSource) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE hosts (agent_version TEXT, host_num INTEGER, load REAL, blob BLOB);
             INSERT INTO hosts VALUES ('0.1.0', 10, 0.5, x'3432');
             INSERT INTO hosts VALUES ('0.1.1', NULL, NULL, NULL);",
        )
        .unwrap();
        drop(conn);
        let source = SqliteSource::open(&path).unwrap();
        (dir, source)
    }

    #[tokio::test]
    async fn query_returns_raw_values_in_column_order() {
        let (_dir, source) = test_source();
        let rows = source
            .query("SELECT * FROM hosts ORDER BY agent_version", &[])
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            vec![
                ("agent_version".to_string(), RawValue::Bytes(b"0.1.0".to_vec())),
                ("host_num".to_string(), RawValue::Int(10)),
                ("load".to_string(), RawValue::Float(0.5)),
                ("blob".to_string(), RawValue::Bytes(b"42".to_vec())),
            ]
        );
        assert_eq!(rows[1][1], ("host_num".to_string(), RawValue::Null));
    }

    #[tokio::test]
    async fn query_binds_params() {
        let (_dir, source) = test_source();
        let rows = source
            .query(
                "SELECT host_num FROM hosts WHERE agent_version = ?1 AND ?2",
                &[Param::Text("0.1.0".into()), Param::Bool(true)],
            )
            .await
            .unwrap();
        assert_eq!(rows, vec![vec![("host_num".to_string(), RawValue::Int(10))]]);
    }

    #[tokio::test]
    async fn query_with_no_rows() {
        let (_dir, source) = test_source();
        let rows = source
            .query("SELECT * FROM hosts WHERE host_num > ?", &[Param::Int(100)])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn syntax_error_is_query_error() {
        let (_dir, source) = test_source();
        let err = source.query("SELEC nope", &[]).await.unwrap_err();
        assert!(matches!(err, SourceError::Query(_)));
    }

    #[tokio::test]
    async fn concurrent_queries_use_separate_connections() {
        let (_dir, source) = test_source();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let source = source.clone();
            tasks.spawn(async move { source.query("SELECT COUNT(*) AS n FROM hosts", &[]).await });
        }
        while let Some(res) = tasks.join_next().await {
            let rows = res.unwrap().unwrap();
            assert_eq!(rows, vec![vec![("n".to_string(), RawValue::Int(2))]]);
        }
        assert!(!source.idle.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn in_memory_database_is_shared_by_pooled_connections() {
        let source = SqliteSource::open(":memory:").unwrap();
        source
            .query("CREATE TABLE hosts (name TEXT)", &[])
            .await
            .unwrap();
        source
            .query("INSERT INTO hosts VALUES ('a'), ('b'), ('c')", &[])
            .await
            .unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let source = source.clone();
            tasks.spawn(async move { source.query("SELECT COUNT(*) AS n FROM hosts", &[]).await });
        }
        while let Some(res) = tasks.join_next().await {
            let rows = res.unwrap().unwrap();
            assert_eq!(rows, vec![vec![("n".to_string(), RawValue::Int(3))]]);
        }
    }

    #[tokio::test]
    async fn separate_in_memory_sources_do_not_share_tables() {
        let first = SqliteSource::open(":memory:").unwrap();
        let second = SqliteSource::open(":memory:").unwrap();
        first.query("CREATE TABLE only_here (x INTEGER)", &[]).await.unwrap();

        let err = second.query("SELECT * FROM only_here", &[]).await.unwrap_err();
        assert!(matches!(err, SourceError::Query(_)));
    }
}
