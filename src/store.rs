//! The datastore: write, read, update_metadata, destroy and url_for.
//!
//! Callers only ever see uids.  The physical path of an object is always
//! `root_path/uid`, computed the same way for every operation.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::content::Content;
use crate::directory::ensure_directory;
use crate::errors::StoreError;
use crate::metadata::{MetadataResolver, ReadObject};
use crate::metrics::{describe_metrics_once, record_operation};
use crate::paths::{full_path, generate_uid, split_path};
use crate::storage::azure::AzureBackendFactory;
use crate::storage::backend::FileShareBackend;
use crate::transport::{BackendFactory, RetryingTransport};
use crate::Metadata;

/// Per-call overrides for [`FileShareStore::url_for`].
#[derive(Debug, Clone, Default)]
pub struct UrlOptions {
    pub scheme: Option<String>,
    pub host: Option<String>,
}

/// Attachment datastore backed by a file share.
pub struct FileShareStore {
    config: Arc<StoreConfig>,
    transport: RetryingTransport,
}

impl FileShareStore {
    /// Store talking to Azure Files, connecting on first use.
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        Self::with_factory(config, AzureBackendFactory)
    }

    /// Store whose backend client is built by `factory` on first use.
    pub fn with_factory(
        config: StoreConfig,
        factory: impl BackendFactory,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        describe_metrics_once();
        let config = Arc::new(config);
        let transport = RetryingTransport::new(config.clone(), factory);
        Ok(Self { config, transport })
    }

    /// Store over an existing backend client.
    pub fn with_backend(
        config: StoreConfig,
        backend: Arc<dyn FileShareBackend>,
    ) -> Result<Self, StoreError> {
        config.validate()?;
        describe_metrics_once();
        let config = Arc::new(config);
        let transport = RetryingTransport::with_backend(config.clone(), backend);
        Ok(Self { config, transport })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Physical path of `uid` inside the share.
    pub fn path_for(&self, uid: &str) -> String {
        full_path(self.config.root_path.as_deref(), uid)
    }

    /// Upload `content` under a freshly generated uid and return the uid.
    pub async fn write(&self, content: &impl Content) -> Result<String, StoreError> {
        let result = self.write_inner(content).await;
        record_operation("write", result.is_ok());
        result
    }

    async fn write_inner(&self, content: &impl Content) -> Result<String, StoreError> {
        let uid = generate_uid(content.name().unwrap_or("file"));
        let (dir, name) = split_path(&self.path_for(&uid));

        self.transport.ensure_share().await?;
        ensure_directory(&self.transport, &dir).await?;

        let empty = Metadata::new();
        let metadata = if self.config.store_meta {
            content.meta()
        } else {
            &empty
        };
        self.transport
            .create_file(&dir, &name, content, metadata)
            .await?;

        info!("Stored {} ({} bytes)", uid, content.size());
        Ok(uid)
    }

    /// Fetch the body and metadata of `uid`.
    pub async fn read(&self, uid: &str) -> Result<ReadObject, StoreError> {
        let result = MetadataResolver::new(&self.transport)
            .resolve(&self.path_for(uid))
            .await;
        record_operation("read", result.is_ok());
        result
    }

    /// Move legacy sidecar metadata of `uid` inline.  Returns `true` if a
    /// migration happened.
    pub async fn update_metadata(&self, uid: &str) -> Result<bool, StoreError> {
        let result = MetadataResolver::new(&self.transport)
            .migrate(&self.path_for(uid))
            .await;
        record_operation("update_metadata", result.is_ok());
        result
    }

    /// Delete `uid`.
    ///
    /// Returns `false` when the backend refuses the delete, including when
    /// the file is already gone.  Only exhausted transient failures are
    /// returned as errors.
    pub async fn destroy(&self, uid: &str) -> Result<bool, StoreError> {
        let (dir, name) = split_path(&self.path_for(uid));
        let result = match self.transport.delete_file(&dir, &name).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_backend() => {
                warn!("Could not delete {}: {}", uid, err);
                Ok(false)
            }
            Err(err) => Err(err),
        };
        record_operation("destroy", result.is_ok());
        result
    }

    /// Public URL of `uid`.
    pub fn url_for(&self, uid: &str, opts: &UrlOptions) -> String {
        let scheme = opts.scheme.as_deref().unwrap_or(&self.config.url_scheme);
        let host = opts
            .host
            .clone()
            .or_else(|| self.config.url_host.clone())
            .unwrap_or_else(|| self.config.default_host());
        format!(
            "{}://{}/{}/{}",
            scheme,
            host,
            self.config.container_name,
            self.path_for(uid)
        )
    }
}
