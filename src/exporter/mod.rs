//! Metric backends. Every collected batch goes through an `Exporter`,
//! once per query execution.

pub mod mackerel;
pub mod stdout;

use crate::query::MetricPoint;
use async_trait::async_trait;
use std::sync::Arc;

/// Sends one query's batch of points to a service on the backend.
///
/// Called concurrently from many query tasks, with the same or different
/// service names.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, service: &str, metrics: &[MetricPoint]) -> Result<(), ExportError>;
}

/// Errors produced while exporting metrics.
#[derive(Debug)]
pub enum ExportError {
    /// The HTTP request could not be sent or its response read.
    Http(reqwest::Error),
    /// The backend answered with a non-success status.
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    /// The backend URL cannot be extended with a service path.
    InvalidUrl(String),
    /// A point's value is not a finite number.
    InvalidValue { name: String, value: String },
    Io(std::io::Error),
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Http(e) => write!(f, "failed to post metrics: {e}"),
            ExportError::Status { status, body } => {
                write!(f, "metrics backend returned {status}: {body}")
            }
            ExportError::InvalidUrl(url) => write!(f, "invalid api base url: {url}"),
            ExportError::InvalidValue { name, value } => {
                write!(f, "invalid metric value: key = {name}, value = {value}")
            }
            ExportError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportError::Http(e) => Some(e),
            ExportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ExportError {
    fn from(e: reqwest::Error) -> Self {
        ExportError::Http(e)
    }
}

impl From<std::io::Error> for ExportError {
    fn from(e: std::io::Error) -> Self {
        ExportError::Io(e)
    }
}

/// Build the exporter named by `name` (`mackerel` or `stdout`).
pub fn build(
    name: &str,
    api_key: &str,
    api_base: &str,
) -> Result<Arc<dyn Exporter>, BuildError> {
    match name {
        stdout::NAME => Ok(Arc::new(stdout::StdoutExporter::new())),
        mackerel::NAME => {
            let exporter = mackerel::MackerelExporter::new(api_key, api_base)?;
            Ok(Arc::new(exporter))
        }
        other => Err(BuildError::Unknown(other.to_string())),
    }
}

/// Errors from constructing an exporter.
#[derive(Debug)]
pub enum BuildError {
    Unknown(String),
    Client(ExportError),
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::Unknown(name) => write!(f, "{name}: unknown exporter"),
            BuildError::Client(e) => write!(f, "failed to build exporter: {e}"),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuildError::Client(e) => Some(e),
            BuildError::Unknown(_) => None,
        }
    }
}

impl From<ExportError> for BuildError {
    fn from(e: ExportError) -> Self {
        BuildError::Client(e)
    }
}
