//! Abstract file-share backend trait.
//!
//! Every backend must implement [`FileShareBackend`].  The operations mirror
//! a hierarchical file service: shares contain directories, directories
//! contain files, and files carry a flat string metadata map.  Directory
//! arguments are share-relative paths without leading or trailing slashes;
//! the empty string is the share root.

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

use crate::content::ContentReader;
use crate::errors::StoreError;
use crate::Metadata;

/// Boxed future returned by backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Properties returned alongside a file body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileProperties {
    /// Inline metadata; empty when the file has none.
    pub metadata: Metadata,
    /// Size of the file in bytes.
    pub content_length: u64,
}

/// A file fetched from the backend.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub properties: FileProperties,
    pub body: Bytes,
}

/// Async file-share contract.
pub trait FileShareBackend: Send + Sync + 'static {
    /// Create (or overwrite) `dir/name` with `metadata` and the `size`
    /// bytes read from `body`.  A body shorter or longer than `size` is an
    /// error and leaves no file behind.
    fn create_file<'a>(
        &'a self,
        share: &'a str,
        dir: &'a str,
        name: &'a str,
        size: u64,
        body: ContentReader<'a>,
        metadata: &'a Metadata,
    ) -> BackendFuture<'a, ()>;

    /// Fetch `dir/name` with its properties.
    fn get_file<'a>(&'a self, share: &'a str, dir: &'a str, name: &'a str)
        -> BackendFuture<'a, RemoteFile>;

    /// Replace the metadata of `dir/name`.
    fn set_file_metadata<'a>(
        &'a self,
        share: &'a str,
        dir: &'a str,
        name: &'a str,
        metadata: &'a Metadata,
    ) -> BackendFuture<'a, ()>;

    /// Delete `dir/name`.
    fn delete_file<'a>(&'a self, share: &'a str, dir: &'a str, name: &'a str)
        -> BackendFuture<'a, ()>;

    /// Create a single directory; its parent must exist.
    fn create_directory<'a>(&'a self, share: &'a str, path: &'a str) -> BackendFuture<'a, ()>;

    /// Fetch share properties; fails with a not-found error if absent.
    fn get_share_properties<'a>(&'a self, share: &'a str) -> BackendFuture<'a, ()>;

    /// Create a share.
    fn create_share<'a>(&'a self, share: &'a str) -> BackendFuture<'a, ()>;
}
