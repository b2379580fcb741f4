/// Runs every configured query against one shared data source with bounded
/// concurrency and hands each query's points to the exporter.
use crate::clock::{Clock, SystemClock};
use crate::exporter::{ExportError, Exporter};
use crate::query::{QueryError, QuerySpec};
use crate::source::DataSource;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Settings for one collection run.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Maximum number of query executions in flight at once.
    pub max_concurrency: usize,
    /// Service used for queries that do not name one.
    pub default_service: String,
}

/// Failure of a collection run. Only the first failure is reported.
#[derive(Debug)]
pub enum CollectorError {
    /// Query `index` (position in the query list) failed to execute.
    Query { index: usize, source: QueryError },
    /// Exporting a query's points to `service` failed.
    Export {
        service: String,
        source: ExportError,
    },
    /// A query task panicked.
    Join(tokio::task::JoinError),
    /// The run was cancelled before every query was started.
    Cancelled,
}

impl std::fmt::Display for CollectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorError::Query { index, source } => write!(f, "query #{index}: {source}"),
            CollectorError::Export { service, source } => {
                write!(f, "export to service {service:?}: {source}")
            }
            CollectorError::Join(e) => write!(f, "query task failed: {e}"),
            CollectorError::Cancelled => write!(f, "collection cancelled"),
        }
    }
}

impl std::error::Error for CollectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectorError::Query { source, .. } => Some(source),
            CollectorError::Export { source, .. } => Some(source),
            CollectorError::Join(e) => Some(e),
            CollectorError::Cancelled => None,
        }
    }
}

pub struct Collector {
    config: CollectorConfig,
    source: Arc<dyn DataSource>,
    exporter: Arc<dyn Exporter>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

/// What each spawned query task needs, cloned per task.
#[derive(Clone)]
struct TaskContext {
    source: Arc<dyn DataSource>,
    exporter: Arc<dyn Exporter>,
    clock: Arc<dyn Clock>,
    default_service: Arc<str>,
    cancel: CancellationToken,
}

impl Collector {
    pub fn new(
        config: CollectorConfig,
        source: Arc<dyn DataSource>,
        exporter: Arc<dyn Exporter>,
    ) -> Self {
        Self {
            config,
            source,
            exporter,
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the run when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run all queries, admitting at most `max_concurrency` at a time.
    ///
    /// Every admitted query runs to completion even when a sibling fails;
    /// the first failure observed is returned once all of them are done.
    /// Cancelling the token given to `with_cancel` stops admission and makes
    /// in-flight queries give up at their next parameter command, SQL call
    /// or export.
    pub async fn run(&self, queries: Vec<QuerySpec>) -> Result<(), CollectorError> {
        let cancel = &self.cancel;
        let permits = self
            .config
            .max_concurrency
            .clamp(1, Semaphore::MAX_PERMITS);
        let permits = Arc::new(Semaphore::new(permits));
        let ctx = TaskContext {
            source: Arc::clone(&self.source),
            exporter: Arc::clone(&self.exporter),
            clock: Arc::clone(&self.clock),
            default_service: Arc::from(self.config.default_service.as_str()),
            cancel: cancel.clone(),
        };

        let total = queries.len();
        let mut started = 0;
        let mut tasks = JoinSet::new();

        for (index, query) in queries.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let ctx = ctx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                run_query(index, query, ctx).await
            });
            started += 1;
        }

        if started < total {
            tracing::warn!(started, total, "collection cancelled, remaining queries not started");
        }

        let mut first: Option<CollectorError> = None;
        while let Some(joined) = tasks.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => CollectorError::Join(e),
            };
            if first.is_none() {
                first = Some(err);
            } else {
                tracing::error!(error = %err, "query failed");
            }
        }

        match first {
            Some(err) => Err(err),
            None if started < total => Err(CollectorError::Cancelled),
            None => Ok(()),
        }
    }
}

async fn run_query(index: usize, query: QuerySpec, ctx: TaskContext) -> Result<(), CollectorError> {
    let service = query
        .service()
        .unwrap_or(&*ctx.default_service)
        .to_string();

    let metrics = query
        .execute(ctx.source.as_ref(), ctx.clock.as_ref(), &ctx.cancel)
        .await
        .map_err(|e| CollectorError::Query { index, source: e })?;

    let exported = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(CollectorError::Query {
            index,
            source: QueryError::Cancelled,
        }),
        res = ctx.exporter.export(&service, &metrics) => res,
    };
    exported.map_err(|e| CollectorError::Export {
        service: service.clone(),
        source: e,
    })?;

    tracing::info!(
        query = index,
        service = %service,
        metrics = metrics.len(),
        "exported metrics"
    );
    Ok(())
}
