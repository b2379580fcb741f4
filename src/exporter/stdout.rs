/// Prints points as `name<TAB>value<TAB>time` lines, for dry runs and
/// piping into other tools.
use super::{ExportError, Exporter};
use crate::query::MetricPoint;
use async_trait::async_trait;
use std::io::Write;
use std::sync::Mutex;

pub const NAME: &str = "stdout";

pub struct StdoutExporter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutExporter {
    pub fn new() -> Self {
        Self::with_writer(std::io::stdout())
    }

    pub fn with_writer(w: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(w)),
        }
    }
}

impl Default for StdoutExporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Exporter for StdoutExporter {
    async fn export(&self, _service: &str, metrics: &[MetricPoint]) -> Result<(), ExportError> {
        let mut lines = String::new();
        for m in metrics {
            let v = m
                .value
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ExportError::InvalidValue {
                    name: m.name.clone(),
                    value: m.value.to_string(),
                })?;
            lines.push_str(&format!("{}\t{:.6}\t{}\n", m.name, v, m.time));
        }

        // One write per batch keeps lines from concurrent queries whole.
        let mut out = self
            .out
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        out.write_all(lines.as_bytes())?;
        out.flush()?;
        Ok(())
    }
}
