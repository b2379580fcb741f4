use crate::fetcher::{FetchError, Registry};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Collector settings, optionally loaded from a TOML file and overridden
/// from the command line or environment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// `driver://...` data source name, or a URL to fetch it from.
    pub dsn: String,
    pub default_service: String,
    pub max_concurrency: usize,
    /// Query YAML location; stdin when empty.
    pub query_file: String,
    pub mackerel_apikey: String,
    pub mackerel_apibase: String,
    pub exporter: String,
    pub log_format: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            default_service: String::new(),
            max_concurrency: 5,
            query_file: String::new(),
            mackerel_apikey: String::new(),
            mackerel_apibase: String::new(),
            exporter: "mackerel".to_string(),
            log_format: "console".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Values given on the command line or through the environment. Unset and
/// empty values leave the configured value alone.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub dsn: Option<String>,
    pub default_service: Option<String>,
    pub max_concurrency: Option<usize>,
    pub query_file: Option<String>,
    pub mackerel_apikey: Option<String>,
    pub mackerel_apibase: Option<String>,
    pub exporter: Option<String>,
    pub log_format: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Missing(&'static str),
    Invalid {
        field: &'static str,
        value: String,
    },
    Fetch(FetchError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Missing(field) => write!(f, "{field} is required"),
            ConfigError::Invalid { field, value } => write!(f, "invalid {field}: {value:?}"),
            ConfigError::Fetch(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Fetch(e) => Some(e),
            ConfigError::Missing(_) | ConfigError::Invalid { .. } => None,
        }
    }
}

impl From<FetchError> for ConfigError {
    fn from(e: FetchError) -> Self {
        ConfigError::Fetch(e)
    }
}

const LOG_FORMATS: &[&str] = &["console", "json"];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load settings from a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply every override that carries a non-empty, non-zero value.
    pub fn merge(&mut self, o: Overrides) {
        update(&mut self.dsn, o.dsn);
        update(&mut self.default_service, o.default_service);
        update(&mut self.max_concurrency, o.max_concurrency);
        update(&mut self.query_file, o.query_file);
        update(&mut self.mackerel_apikey, o.mackerel_apikey);
        update(&mut self.mackerel_apibase, o.mackerel_apibase);
        update(&mut self.exporter, o.exporter);
        update(&mut self.log_format, o.log_format);
        update(&mut self.log_level, o.log_level);
    }

    /// Check the settings that can be checked before anything is fetched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dsn.is_empty() {
            return Err(ConfigError::Missing("dsn"));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "max-concurrency",
                value: "0".to_string(),
            });
        }
        if !LOG_FORMATS.contains(&self.log_format.as_str()) {
            return Err(ConfigError::Invalid {
                field: "log-format",
                value: self.log_format.clone(),
            });
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid {
                field: "log-level",
                value: self.log_level.clone(),
            });
        }
        Ok(())
    }

    /// Replace indirect values (URLs with a registered scheme) with the
    /// content they point at. The first failing fetch aborts loading.
    pub async fn load(&mut self, registry: &Registry) -> Result<(), ConfigError> {
        self.dsn = registry.resolve(&self.dsn).await?;
        self.default_service = registry.resolve(&self.default_service).await?;
        self.mackerel_apikey = registry.resolve(&self.mackerel_apikey).await?;
        self.mackerel_apibase = registry.resolve(&self.mackerel_apibase).await?;
        Ok(())
    }
}

fn update<T: Default + PartialEq>(field: &mut T, value: Option<T>) {
    if let Some(v) = value {
        if v != T::default() {
            *field = v;
        }
    }
}
