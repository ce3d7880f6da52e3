//! In-memory file-share backend.
//!
//! Shares, directories and files are held in a `tokio::sync::RwLock`
//! protected map and follow the same rules and error codes as Azure Files:
//! a file needs its parent directory, a directory needs its parent, and
//! creating something twice is a `409 ResourceAlreadyExists`.  Metadata
//! names come back lower-cased, as they do from Azure.
//!
//! The backend records every call it receives and can be told to fail, which
//! makes it the double used by the datastore tests.  It is also handy for
//! local development without an Azure account.

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::io::AsyncReadExt;

use super::backend::{BackendFuture, FileProperties, FileShareBackend, RemoteFile};
use crate::content::ContentReader;
use crate::errors::{
    StoreError, PARENT_NOT_FOUND, RESOURCE_ALREADY_EXISTS, RESOURCE_NOT_FOUND,
    SHARE_ALREADY_EXISTS, SHARE_NOT_FOUND,
};
use crate::Metadata;

#[derive(Debug, Default)]
struct Share {
    /// Share-relative directory paths.
    directories: HashSet<String>,
    /// Share-relative file path -> (body, metadata).
    files: HashMap<String, (Bytes, Metadata)>,
}

/// A recorded backend call: operation name and share-relative target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub operation: &'static str,
    pub target: String,
}

/// In-memory file-share backend.
#[derive(Debug, Default)]
pub struct MemoryFileShare {
    shares: tokio::sync::RwLock<HashMap<String, Share>>,
    calls: Mutex<Vec<BackendCall>>,
    /// Number of upcoming calls that fail with a transient error.
    transient_failures: AtomicU32,
    /// Fail every `set_file_metadata` call with a permanent error.
    fail_set_metadata: AtomicBool,
    /// Accept `set_file_metadata` calls without applying them.
    discard_metadata_writes: AtomicBool,
}

impl MemoryFileShare {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend that already holds an empty `share`.
    pub fn with_share(share: &str) -> Self {
        let mut shares = HashMap::new();
        shares.insert(share.to_string(), Share::default());
        Self {
            shares: tokio::sync::RwLock::new(shares),
            ..Self::default()
        }
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next_transient(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// Make `set_file_metadata` fail with a permanent error.
    pub fn fail_set_metadata(&self, fail: bool) {
        self.fail_set_metadata.store(fail, Ordering::SeqCst);
    }

    /// Make `set_file_metadata` succeed without changing anything.
    pub fn discard_metadata_writes(&self, discard: bool) {
        self.discard_metadata_writes.store(discard, Ordering::SeqCst);
    }

    /// Every call received so far, including failed ones.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Targets of every call to `operation`, in order.
    pub fn calls_to(&self, operation: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.target)
            .collect()
    }

    /// Forget the recorded calls.
    pub fn clear_calls(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }

    /// Store a file directly, creating missing directories.  Used to seed
    /// objects written by older deployments.
    pub async fn seed_file(&self, share: &str, path: &str, body: impl Into<Bytes>, metadata: Metadata) {
        let mut shares = self.shares.write().await;
        let share = shares.entry(share.to_string()).or_default();
        let mut dir = String::new();
        let segments: Vec<&str> = path.split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            dir = join(&dir, segment);
            share.directories.insert(dir.clone());
        }
        share
            .files
            .insert(path.to_string(), (body.into(), metadata));
    }

    /// Inline metadata of a stored file, if the file exists.
    pub async fn file_metadata(&self, share: &str, path: &str) -> Option<Metadata> {
        let shares = self.shares.read().await;
        shares
            .get(share)
            .and_then(|s| s.files.get(path))
            .map(|(_, meta)| meta.clone())
    }

    /// True if `path` is a stored file.
    pub async fn file_exists(&self, share: &str, path: &str) -> bool {
        let shares = self.shares.read().await;
        shares
            .get(share)
            .map(|s| s.files.contains_key(path))
            .unwrap_or(false)
    }

    /// True if `path` is an existing directory.
    pub async fn directory_exists(&self, share: &str, path: &str) -> bool {
        let shares = self.shares.read().await;
        shares
            .get(share)
            .map(|s| s.directories.contains(path))
            .unwrap_or(false)
    }

    /// True if `share` exists.
    pub async fn share_exists(&self, share: &str) -> bool {
        self.shares.read().await.contains_key(share)
    }

    /// Record the call and apply any pending transient failure.
    fn enter(&self, operation: &'static str, target: String) -> Result<(), StoreError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(BackendCall { operation, target });
        }
        let failed = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::transient(operation, "simulated connection failure"));
        }
        Ok(())
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn share_not_found(share: &str) -> StoreError {
    StoreError::backend(404, SHARE_NOT_FOUND, format!("share {} does not exist", share))
}

fn resource_not_found(path: &str) -> StoreError {
    StoreError::backend(404, RESOURCE_NOT_FOUND, format!("{} does not exist", path))
}

fn parent_not_found(path: &str) -> StoreError {
    StoreError::backend(404, PARENT_NOT_FOUND, format!("parent of {} does not exist", path))
}

fn lowercase_keys(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.clone()))
        .collect()
}

impl Share {
    fn has_directory(&self, dir: &str) -> bool {
        dir.is_empty() || self.directories.contains(dir)
    }
}

impl FileShareBackend for MemoryFileShare {
    fn create_file<'a>(
        &'a self,
        share: &'a str,
        dir: &'a str,
        name: &'a str,
        size: u64,
        mut body: ContentReader<'a>,
        metadata: &'a Metadata,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let path = join(dir, name);
            self.enter("create_file", path.clone())?;
            let mut data = Vec::new();
            body.read_to_end(&mut data)
                .await
                .map_err(|e| StoreError::Content(format!("reading body of {}: {}", path, e)))?;
            if data.len() as u64 != size {
                return Err(StoreError::Content(format!(
                    "{} declared {} bytes but the body had {}",
                    path,
                    size,
                    data.len()
                )));
            }
            let mut shares = self.shares.write().await;
            let share_state = shares.get_mut(share).ok_or_else(|| share_not_found(share))?;
            if !share_state.has_directory(dir) {
                return Err(parent_not_found(&path));
            }
            if share_state.directories.contains(&path) {
                return Err(StoreError::backend(
                    409,
                    "ResourceTypeMismatch",
                    format!("{} is a directory", path),
                ));
            }
            share_state
                .files
                .insert(path, (Bytes::from(data), lowercase_keys(metadata)));
            Ok(())
        })
    }

    fn get_file<'a>(
        &'a self,
        share: &'a str,
        dir: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, RemoteFile> {
        Box::pin(async move {
            let path = join(dir, name);
            self.enter("get_file", path.clone())?;
            let shares = self.shares.read().await;
            let share_state = shares.get(share).ok_or_else(|| share_not_found(share))?;
            let (body, metadata) = share_state
                .files
                .get(&path)
                .ok_or_else(|| resource_not_found(&path))?;
            Ok(RemoteFile {
                properties: FileProperties {
                    metadata: metadata.clone(),
                    content_length: body.len() as u64,
                },
                body: body.clone(),
            })
        })
    }

    fn set_file_metadata<'a>(
        &'a self,
        share: &'a str,
        dir: &'a str,
        name: &'a str,
        metadata: &'a Metadata,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let path = join(dir, name);
            self.enter("set_file_metadata", path.clone())?;
            if self.fail_set_metadata.load(Ordering::SeqCst) {
                return Err(StoreError::backend(
                    403,
                    "AuthorizationPermissionMismatch",
                    "metadata writes are not permitted",
                ));
            }
            let mut shares = self.shares.write().await;
            let share_state = shares.get_mut(share).ok_or_else(|| share_not_found(share))?;
            let entry = share_state
                .files
                .get_mut(&path)
                .ok_or_else(|| resource_not_found(&path))?;
            if !self.discard_metadata_writes.load(Ordering::SeqCst) {
                entry.1 = lowercase_keys(metadata);
            }
            Ok(())
        })
    }

    fn delete_file<'a>(
        &'a self,
        share: &'a str,
        dir: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let path = join(dir, name);
            self.enter("delete_file", path.clone())?;
            let mut shares = self.shares.write().await;
            let share_state = shares.get_mut(share).ok_or_else(|| share_not_found(share))?;
            share_state
                .files
                .remove(&path)
                .map(|_| ())
                .ok_or_else(|| resource_not_found(&path))
        })
    }

    fn create_directory<'a>(&'a self, share: &'a str, path: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.enter("create_directory", path.to_string())?;
            let mut shares = self.shares.write().await;
            let share_state = shares.get_mut(share).ok_or_else(|| share_not_found(share))?;
            if share_state.directories.contains(path) {
                return Err(StoreError::backend(
                    409,
                    RESOURCE_ALREADY_EXISTS,
                    format!("{} already exists", path),
                ));
            }
            if share_state.files.contains_key(path) {
                return Err(StoreError::backend(
                    409,
                    "ResourceTypeMismatch",
                    format!("{} is a file", path),
                ));
            }
            if !share_state.has_directory(parent_of(path)) {
                return Err(parent_not_found(path));
            }
            share_state.directories.insert(path.to_string());
            Ok(())
        })
    }

    fn get_share_properties<'a>(&'a self, share: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.enter("get_share_properties", share.to_string())?;
            if self.shares.read().await.contains_key(share) {
                Ok(())
            } else {
                Err(share_not_found(share))
            }
        })
    }

    fn create_share<'a>(&'a self, share: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.enter("create_share", share.to_string())?;
            let mut shares = self.shares.write().await;
            if shares.contains_key(share) {
                return Err(StoreError::backend(
                    409,
                    SHARE_ALREADY_EXISTS,
                    format!("share {} already exists", share),
                ));
            }
            shares.insert(share.to_string(), Share::default());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn reader(data: &'static str) -> ContentReader<'static> {
        Box::pin(std::io::Cursor::new(data.as_bytes()))
    }

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_create_and_get_file() {
        let backend = MemoryFileShare::with_share("files");
        backend.create_directory("files", "a").await.unwrap();
        backend
            .create_file("files", "a", "x.txt", 5, reader("hello"), &meta(&[("k", "v")]))
            .await
            .unwrap();

        let file = backend.get_file("files", "a", "x.txt").await.unwrap();
        assert_eq!(file.body, Bytes::from("hello"));
        assert_eq!(file.properties.content_length, 5);
        assert_eq!(file.properties.metadata, meta(&[("k", "v")]));
    }

    #[tokio::test]
    async fn test_file_in_share_root() {
        let backend = MemoryFileShare::with_share("files");
        backend
            .create_file("files", "", "x.txt", 1, reader("x"), &Metadata::new())
            .await
            .unwrap();
        assert!(backend.file_exists("files", "x.txt").await);
    }

    #[tokio::test]
    async fn test_create_file_requires_parent() {
        let backend = MemoryFileShare::with_share("files");
        let err = backend
            .create_file("files", "missing", "x.txt", 0, reader(""), &Metadata::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_create_file_size_mismatch_leaves_nothing() {
        let backend = MemoryFileShare::with_share("files");
        let err = backend
            .create_file("files", "", "x.txt", 10, reader("short"), &Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Content(_)));
        assert!(!backend.file_exists("files", "x.txt").await);
    }

    #[tokio::test]
    async fn test_metadata_names_come_back_lowercased() {
        let backend = MemoryFileShare::with_share("files");
        backend
            .create_file("files", "", "x.txt", 1, reader("x"), &meta(&[("Author", "Me")]))
            .await
            .unwrap();
        let file = backend.get_file("files", "", "x.txt").await.unwrap();
        assert_eq!(file.properties.metadata, meta(&[("author", "Me")]));

        backend
            .set_file_metadata("files", "", "x.txt", &meta(&[("Width", "20")]))
            .await
            .unwrap();
        assert_eq!(
            backend.file_metadata("files", "x.txt").await,
            Some(meta(&[("width", "20")]))
        );
    }

    #[tokio::test]
    async fn test_create_directory_rules() {
        let backend = MemoryFileShare::with_share("files");
        let err = backend.create_directory("files", "a/b").await.unwrap_err();
        assert!(err.is_not_found());

        backend.create_directory("files", "a").await.unwrap();
        backend.create_directory("files", "a/b").await.unwrap();
        let err = backend.create_directory("files", "a").await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_missing_share() {
        let backend = MemoryFileShare::new();
        let err = backend.get_share_properties("files").await.unwrap_err();
        assert!(err.is_not_found());
        backend.create_share("files").await.unwrap();
        backend.get_share_properties("files").await.unwrap();
        let err = backend.create_share("files").await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let backend = MemoryFileShare::with_share("files");
        let err = backend.delete_file("files", "", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_transient_failures_are_consumed() {
        let backend = MemoryFileShare::with_share("files");
        backend.fail_next_transient(2);
        for _ in 0..2 {
            let err = backend.get_share_properties("files").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Transient);
        }
        backend.get_share_properties("files").await.unwrap();
        assert_eq!(backend.calls_to("get_share_properties").len(), 3);
    }

    #[tokio::test]
    async fn test_seed_file_creates_directories() {
        let backend = MemoryFileShare::new();
        backend
            .seed_file("files", "a/b/c.txt", "data", Metadata::new())
            .await;
        assert!(backend.share_exists("files").await);
        assert!(backend.directory_exists("files", "a").await);
        assert!(backend.directory_exists("files", "a/b").await);
        assert!(backend.file_exists("files", "a/b/c.txt").await);
    }

    #[tokio::test]
    async fn test_discarded_metadata_writes() {
        let backend = MemoryFileShare::new();
        backend.seed_file("files", "x", "data", Metadata::new()).await;
        backend.discard_metadata_writes(true);
        backend
            .set_file_metadata("files", "", "x", &meta(&[("a", "1")]))
            .await
            .unwrap();
        assert_eq!(backend.file_metadata("files", "x").await, Some(Metadata::new()));
    }
}
