/// Indirect configuration values: a setting written as a URL with a
/// registered scheme (e.g. `file:///run/secrets/dsn`) is replaced by the
/// content that URL points at.
use async_trait::async_trait;
use reqwest::Url;
use std::collections::HashMap;
use std::path::PathBuf;

/// Errors from registering drivers or fetching content.
#[derive(Debug)]
pub enum FetchError {
    /// A driver was registered twice under the same scheme.
    Duplicate(String),
    /// No driver handles this scheme.
    NotRegistered(String),
    /// The URL cannot be handled by its driver.
    InvalidUrl(String),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Duplicate(name) => write!(f, "driver {name} registered twice"),
            FetchError::NotRegistered(name) => write!(f, "{name} driver not registered"),
            FetchError::InvalidUrl(url) => write!(f, "cannot fetch {url}"),
            FetchError::Io { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Retrieves the bytes a URL refers to.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError>;
}

/// Reads local files from `file://` URLs.
pub struct FileDriver;

#[async_trait]
impl Driver for FileDriver {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let path = url
            .to_file_path()
            .map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        read_file(path).await
    }
}

async fn read_file(path: PathBuf) -> Result<Vec<u8>, FetchError> {
    tokio::fs::read(&path)
        .await
        .map_err(|e| FetchError::Io { path, source: e })
}

/// Scheme → driver table. Built once at startup, read-only afterwards.
#[derive(Default)]
pub struct Registry {
    drivers: HashMap<String, Box<dyn Driver>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in driver.
    pub fn builtin() -> Result<Self, FetchError> {
        let mut registry = Self::new();
        registry.register("file", FileDriver)?;
        Ok(registry)
    }

    /// Register `driver` for URLs with scheme `name`. Fails if the scheme is
    /// already taken.
    pub fn register(&mut self, name: &str, driver: impl Driver + 'static) -> Result<(), FetchError> {
        if self.drivers.contains_key(name) {
            return Err(FetchError::Duplicate(name.to_string()));
        }
        self.drivers.insert(name.to_string(), Box::new(driver));
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    /// Fetch the content of `url` with the driver for its scheme.
    pub async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let driver = self
            .drivers
            .get(url.scheme())
            .ok_or_else(|| FetchError::NotRegistered(url.scheme().to_string()))?;
        driver.fetch(url).await
    }

    /// The registered URL `value` refers to, if it is one.
    fn registered_url(&self, value: &str) -> Option<Url> {
        Url::parse(value)
            .ok()
            .filter(|url| self.is_registered(url.scheme()))
    }

    /// Resolve a configuration value: fetched and trimmed when it is a URL
    /// with a registered scheme, otherwise returned as written.
    pub async fn resolve(&self, value: &str) -> Result<String, FetchError> {
        match self.registered_url(value) {
            Some(url) => {
                let data = self.fetch(&url).await?;
                Ok(String::from_utf8_lossy(&data).trim().to_string())
            }
            None => Ok(value.to_string()),
        }
    }

    /// Read a document from a registered URL, or from a plain file path.
    pub async fn read_location(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        match self.registered_url(location) {
            Some(url) => self.fetch(&url).await,
            None => read_file(PathBuf::from(location)).await,
        }
    }
}
