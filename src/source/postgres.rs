/// PostgreSQL data source backed by a sqlx connection pool.
use super::{DataSource, SourceError};
use crate::params::Param;
use crate::value::{RawRow, RawValue};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row, TypeInfo};

/// Column types a Postgres result can carry into a `RawValue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PgKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Bytea,
    Timestamp,
    TimestampTz,
}

fn kind_of(type_name: &str) -> Option<PgKind> {
    Some(match type_name {
        "BOOL" => PgKind::Bool,
        "INT2" => PgKind::Int2,
        "INT4" => PgKind::Int4,
        "INT8" => PgKind::Int8,
        "FLOAT4" => PgKind::Float4,
        "FLOAT8" => PgKind::Float8,
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => PgKind::Text,
        "BYTEA" => PgKind::Bytea,
        "TIMESTAMP" => PgKind::Timestamp,
        "TIMESTAMPTZ" => PgKind::TimestampTz,
        _ => return None,
    })
}

pub struct PgSource {
    pool: PgPool,
}

impl PgSource {
    /// Connect to `url` and keep up to `max_connections` pooled connections.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| SourceError::Connect {
                driver: "postgres",
                source: e,
            })?;

        tracing::debug!(max_connections, "connected to postgres data source");
        Ok(Self { pool })
    }
}

#[async_trait]
impl DataSource for PgSource {
    async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<RawRow>, SourceError> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(raw_row).collect()
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Param],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Param::Bool(b) => query.bind(*b),
            Param::Int(i) => query.bind(*i),
            Param::Float(f) => query.bind(*f),
            Param::Text(s) => query.bind(s.as_str()),
            Param::Null => query.bind(None::<String>),
        };
    }
    query
}

/// Text comes back as bytes so that numeric strings are reparsed like any
/// other driver's.
fn raw_row(row: &PgRow) -> Result<RawRow, SourceError> {
    row.columns()
        .iter()
        .map(|col| -> Result<(String, RawValue), SourceError> {
            let i = col.ordinal();
            let type_name = col.type_info().name();
            let kind = kind_of(type_name).ok_or_else(|| SourceError::UnsupportedColumn {
                column: col.name().to_string(),
                type_name: type_name.to_string(),
            })?;

            let value = match kind {
                PgKind::Bool => row.try_get::<Option<bool>, _>(i)?.map(RawValue::Bool),
                PgKind::Int2 => row
                    .try_get::<Option<i16>, _>(i)?
                    .map(|n| RawValue::Int(n.into())),
                PgKind::Int4 => row
                    .try_get::<Option<i32>, _>(i)?
                    .map(|n| RawValue::Int(n.into())),
                PgKind::Int8 => row.try_get::<Option<i64>, _>(i)?.map(RawValue::Int),
                PgKind::Float4 => row
                    .try_get::<Option<f32>, _>(i)?
                    .map(|f| RawValue::Float(f.into())),
                PgKind::Float8 => row.try_get::<Option<f64>, _>(i)?.map(RawValue::Float),
                PgKind::Text => row
                    .try_get::<Option<String>, _>(i)?
                    .map(|s| RawValue::Bytes(s.into_bytes())),
                PgKind::Bytea => row.try_get::<Option<Vec<u8>>, _>(i)?.map(RawValue::Bytes),
                PgKind::Timestamp => row
                    .try_get::<Option<NaiveDateTime>, _>(i)?
                    .map(|t| RawValue::Text(t.and_utc().to_rfc3339())),
                PgKind::TimestampTz => row
                    .try_get::<Option<DateTime<Utc>>, _>(i)?
                    .map(|t| RawValue::Text(t.to_rfc3339())),
            };

            Ok((col.name().to_string(), value.unwrap_or(RawValue::Null)))
        })
        .collect()
}
