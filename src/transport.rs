//! Retrying transport around the file-share backend.
//!
//! The transport owns the backend client.  The client is built on first use
//! by a [`BackendFactory`] behind a `tokio::sync::OnceCell`, so concurrent
//! first calls construct it exactly once.  Every backend call goes through
//! [`RetryingTransport::call`], which retries transient failures according
//! to the [`RetryPolicy`] and hands every other error straight back.

use metrics::counter;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::content::Content;
use crate::errors::{ErrorKind, StoreError};
use crate::metadata::normalize_metadata;
use crate::metrics::{BACKEND_CALLS_TOTAL, BACKEND_RETRIES_TOTAL};
use crate::storage::backend::{BackendFuture, FileShareBackend, RemoteFile};
use crate::Metadata;

/// Builds the backend client from configuration.
pub trait BackendFactory: Send + Sync + 'static {
    fn build<'a>(&'a self, config: &'a StoreConfig) -> BackendFuture<'a, Arc<dyn FileShareBackend>>;
}

/// Retry policy for backend calls.
///
/// Only transient (connection-level) failures are retried, immediately and
/// without backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per call, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl RetryPolicy {
    /// Whether `err`, seen on attempt number `attempt` (1-indexed), earns
    /// another attempt.
    pub fn should_retry(&self, err: &StoreError, attempt: u32) -> bool {
        err.kind() == ErrorKind::Transient && attempt < self.max_attempts
    }
}

/// Backend access with lazy client construction and bounded retry.
pub struct RetryingTransport {
    config: Arc<StoreConfig>,
    factory: Option<Box<dyn BackendFactory>>,
    client: OnceCell<Arc<dyn FileShareBackend>>,
    share_ready: OnceCell<()>,
    policy: RetryPolicy,
}

impl RetryingTransport {
    /// Transport that builds its client with `factory` on first use.
    pub fn new(config: Arc<StoreConfig>, factory: impl BackendFactory) -> Self {
        Self {
            config,
            factory: Some(Box::new(factory)),
            client: OnceCell::new(),
            share_ready: OnceCell::new(),
            policy: RetryPolicy::default(),
        }
    }

    /// Transport over an already constructed client.
    pub fn with_backend(config: Arc<StoreConfig>, backend: Arc<dyn FileShareBackend>) -> Self {
        Self {
            config,
            factory: None,
            client: OnceCell::new_with(Some(backend)),
            share_ready: OnceCell::new(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Name of the share every call targets.
    pub fn share(&self) -> &str {
        &self.config.container_name
    }

    /// The shared client, built on first use.
    pub async fn client(&self) -> Result<Arc<dyn FileShareBackend>, StoreError> {
        let client = self
            .client
            .get_or_try_init(|| async {
                let factory = self.factory.as_ref().ok_or_else(|| {
                    StoreError::Config("no backend client and no factory to build one".into())
                })?;
                info!(
                    "Building file share client: account={} share={}",
                    self.config.account_name, self.config.container_name
                );
                factory.build(&self.config).await
            })
            .await?;
        Ok(Arc::clone(client))
    }

    /// Run `f` against the client, retrying transient failures.
    pub async fn call<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        F: Fn(Arc<dyn FileShareBackend>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let client = self.client().await?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            counter!(BACKEND_CALLS_TOTAL, "operation" => operation).increment(1);
            debug!("Backend call {} (attempt {})", operation, attempt);
            match f(Arc::clone(&client)).await {
                Ok(value) => return Ok(value),
                Err(err) if self.policy.should_retry(&err, attempt) => {
                    counter!(BACKEND_RETRIES_TOTAL, "operation" => operation).increment(1);
                    warn!("Retrying {} after transient failure: {}", operation, err);
                }
                Err(err) if err.kind() == ErrorKind::Transient => {
                    return Err(StoreError::RetryExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Make sure the share exists, creating it if the backend reports it
    /// missing.  Memoized for the transport's lifetime once it succeeds.
    pub async fn ensure_share(&self) -> Result<(), StoreError> {
        self.share_ready
            .get_or_try_init(|| async {
                match self.get_share_properties().await {
                    Ok(()) => Ok(()),
                    Err(err) if err.is_not_found() => match self.create_share().await {
                        Ok(()) => {
                            info!("Created share {}", self.share());
                            Ok(())
                        }
                        Err(err) if err.is_already_exists() => Ok(()),
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                }
            })
            .await?;
        Ok(())
    }

    // -- Wrapped backend operations ------------------------------------------
    //
    // Metadata keys are lower-cased here, before any backend sees them, so
    // every backend stores the same map Azure would hand back.

    /// Upload `content` to `dir/name`.  The body is opened afresh for every
    /// attempt.
    pub async fn create_file(
        &self,
        dir: &str,
        name: &str,
        content: &dyn Content,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let share = self.share();
        let metadata = &normalize_metadata(metadata)?;
        let size = content.size();
        self.call("create_file", |client| async move {
            let body = content.open()?;
            client.create_file(share, dir, name, size, body, metadata).await
        })
        .await
    }

    pub async fn get_file(&self, dir: &str, name: &str) -> Result<RemoteFile, StoreError> {
        let share = self.share();
        self.call("get_file", |client| async move {
            client.get_file(share, dir, name).await
        })
        .await
    }

    pub async fn set_file_metadata(
        &self,
        dir: &str,
        name: &str,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let share = self.share();
        let metadata = &normalize_metadata(metadata)?;
        self.call("set_file_metadata", |client| async move {
            client.set_file_metadata(share, dir, name, metadata).await
        })
        .await
    }

    pub async fn delete_file(&self, dir: &str, name: &str) -> Result<(), StoreError> {
        let share = self.share();
        self.call("delete_file", |client| async move {
            client.delete_file(share, dir, name).await
        })
        .await
    }

    pub async fn create_directory(&self, path: &str) -> Result<(), StoreError> {
        let share = self.share();
        self.call("create_directory", |client| async move {
            client.create_directory(share, path).await
        })
        .await
    }

    pub async fn get_share_properties(&self) -> Result<(), StoreError> {
        let share = self.share();
        self.call("get_share_properties", |client| async move {
            client.get_share_properties(share).await
        })
        .await
    }

    pub async fn create_share(&self) -> Result<(), StoreError> {
        let share = self.share();
        self.call("create_share", |client| async move {
            client.create_share(share).await
        })
        .await
    }
}
