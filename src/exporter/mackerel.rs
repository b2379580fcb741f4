/// Posts points as service metrics to the Mackerel API.
use super::{ExportError, Exporter};
use crate::query::MetricPoint;
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;

pub const NAME: &str = "mackerel";

const DEFAULT_API_BASE: &str = "https://api.mackerelio.com/";
const USER_AGENT: &str = "mackerel-sql-metric-collector";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MackerelExporter {
    client: Client,
    api_key: String,
    api_base: Url,
}

impl MackerelExporter {
    /// Create an exporter for `api_base`, or the public API when it is empty.
    pub fn new(api_key: &str, api_base: &str) -> Result<Self, ExportError> {
        let base = if api_base.is_empty() {
            DEFAULT_API_BASE
        } else {
            api_base
        };
        let api_base = Url::parse(base).map_err(|_| ExportError::InvalidUrl(base.to_string()))?;
        if api_base.cannot_be_a_base() {
            return Err(ExportError::InvalidUrl(base.to_string()));
        }

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            api_base,
        })
    }

    /// `{api_base}/api/v0/services/{service}/tsdb`, with `service` escaped
    /// as a single path segment.
    fn tsdb_url(&self, service: &str) -> Result<Url, ExportError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| ExportError::InvalidUrl(self.api_base.to_string()))?
            .pop_if_empty()
            .extend(["api", "v0", "services", service, "tsdb"]);
        Ok(url)
    }
}

#[async_trait]
impl Exporter for MackerelExporter {
    async fn export(&self, service: &str, metrics: &[MetricPoint]) -> Result<(), ExportError> {
        let url = self.tsdb_url(service)?;
        tracing::debug!(%url, metrics = metrics.len(), "posting service metrics");

        let resp = self
            .client
            .post(url)
            .header("X-Api-Key", &self.api_key)
            .json(metrics)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExportError::Status {
                status,
                body: body.trim().to_string(),
            });
        }
        Ok(())
    }
}
