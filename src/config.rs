//! Configuration loading and types for the datastore.
//!
//! Configuration is read from a YAML file (or built in code) and
//! deserialized into [`StoreConfig`].  It is fixed for the lifetime of a
//! [`crate::store::FileShareStore`].

use serde::Deserialize;
use std::path::Path;

use crate::errors::StoreError;

/// Datastore configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Azure storage account name.
    pub account_name: String,

    /// Base64 account key used for Shared Key signing.
    #[serde(default)]
    pub access_key: String,

    /// File share holding every stored object.
    pub container_name: String,

    /// Optional namespace prefix prepended to every uid.
    #[serde(default)]
    pub root_path: Option<String>,

    /// Scheme used by `url_for` when the caller does not override it.
    #[serde(default = "default_url_scheme")]
    pub url_scheme: String,

    /// Host used by `url_for`; defaults to the account's file endpoint host.
    #[serde(default)]
    pub url_host: Option<String>,

    /// Attach metadata to uploaded files.
    #[serde(default = "default_true")]
    pub store_meta: bool,

    /// Fall back to `<name>.meta.yml` sidecar files on read.
    #[serde(default)]
    pub legacy_meta: bool,

    /// Service endpoint override (emulators, sovereign clouds).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StoreConfig {
    /// Configuration with the given account, key and share, everything else
    /// at its default.
    pub fn new(
        account_name: impl Into<String>,
        access_key: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            account_name: account_name.into(),
            access_key: access_key.into(),
            container_name: container_name.into(),
            root_path: None,
            url_scheme: default_url_scheme(),
            url_host: None,
            store_meta: true,
            legacy_meta: false,
            endpoint: None,
            logging: LoggingConfig::default(),
        }
    }

    /// Reject configurations that cannot address a share.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.account_name.trim().is_empty() {
            return Err(StoreError::Config("account_name must not be empty".into()));
        }
        if self.container_name.trim().is_empty() {
            return Err(StoreError::Config("container_name must not be empty".into()));
        }
        if self.container_name.contains('/') {
            return Err(StoreError::Config(format!(
                "container_name '{}' must not contain '/'",
                self.container_name
            )));
        }
        Ok(())
    }

    /// Host of the account's file service, e.g. `acct.file.core.windows.net`.
    pub fn default_host(&self) -> String {
        format!("{}.file.core.windows.net", self.account_name)
    }

    /// Base URL of the file service used for REST calls.
    pub fn service_endpoint(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}", self.default_host()),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_url_scheme() -> String {
    "http".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load, parse and validate configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<StoreConfig> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: StoreConfig = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}
