/// MySQL data source backed by a sqlx connection pool.
use super::{DataSource, SourceError};
use crate::params::Param;
use crate::value::{RawRow, RawValue};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, MySql, Row, TypeInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MySqlKind {
    Bool,
    Int,
    UnsignedInt,
    Float,
    Double,
    Bytes,
    DateTime,
    Timestamp,
}

fn kind_of(type_name: &str) -> Option<MySqlKind> {
    Some(match type_name {
        "BOOLEAN" => MySqlKind::Bool,
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => MySqlKind::Int,
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => MySqlKind::UnsignedInt,
        "FLOAT" => MySqlKind::Float,
        "DOUBLE" => MySqlKind::Double,
        "CHAR" | "VARCHAR" | "TINYTEXT" | "TEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM"
        | "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            MySqlKind::Bytes
        }
        "DATETIME" => MySqlKind::DateTime,
        "TIMESTAMP" => MySqlKind::Timestamp,
        _ => return None,
    })
}

pub struct MySqlSource {
    pool: MySqlPool,
}

impl MySqlSource {
    /// Connect to `url` and keep up to `max_connections` pooled connections.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SourceError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| SourceError::Connect {
                driver: "mysql",
                source: e,
            })?;

        tracing::debug!(max_connections, "connected to mysql data source");
        Ok(Self { pool })
    }
}

#[async_trait]
impl DataSource for MySqlSource {
    async fn query(&self, sql: &str, params: &[Param]) -> Result<Vec<RawRow>, SourceError> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(raw_row).collect()
    }
}

fn bind_params<'q>(
    mut query: Query<'q, MySql, MySqlArguments>,
    params: &'q [Param],
) -> Query<'q, MySql, MySqlArguments> {
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

fn raw_row(row: &MySqlRow) -> Result<RawRow, SourceError> {
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
                MySqlKind::Bool => row.try_get::<Option<bool>, _>(i)?.map(RawValue::Bool),
                MySqlKind::Int => row.try_get::<Option<i64>, _>(i)?.map(RawValue::Int),
                MySqlKind::UnsignedInt => row.try_get::<Option<u64>, _>(i)?.map(|n| {
                    i64::try_from(n).map_or(RawValue::Float(n as f64), RawValue::Int)
                }),
                MySqlKind::Float => row
                    .try_get::<Option<f32>, _>(i)?
                    .map(|f| RawValue::Float(f.into())),
                MySqlKind::Double => row.try_get::<Option<f64>, _>(i)?.map(RawValue::Float),
                MySqlKind::Bytes => row.try_get::<Option<Vec<u8>>, _>(i)?.map(RawValue::Bytes),
                MySqlKind::DateTime => row
                    .try_get::<Option<NaiveDateTime>, _>(i)?
                    .map(|t| RawValue::Text(t.and_utc().to_rfc3339())),
                MySqlKind::Timestamp => row
                    .try_get::<Option<DateTime<Utc>>, _>(i)?
                    .map(|t| RawValue::Text(t.to_rfc3339())),
            };

            Ok((col.name().to_string(), value.unwrap_or(RawValue::Null)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_and_unsigned_integers_are_distinguished() {
        assert_eq!(kind_of("BIGINT"), Some(MySqlKind::Int));
        assert_eq!(kind_of("TINYINT"), Some(MySqlKind::Int));
        assert_eq!(kind_of("BIGINT UNSIGNED"), Some(MySqlKind::UnsignedInt));
        assert_eq!(kind_of("BOOLEAN"), Some(MySqlKind::Bool));
    }

    #[test]
    fn string_and_binary_columns_come_back_as_bytes() {
        for name in ["VARCHAR", "CHAR", "TEXT", "VARBINARY", "BLOB", "ENUM"] {
            assert_eq!(kind_of(name), Some(MySqlKind::Bytes), "{name}");
        }
    }

    #[test]
    fn decimal_is_unsupported() {
        assert_eq!(kind_of("DECIMAL"), None);
        assert_eq!(kind_of("JSON"), None);
    }
}
