//! Inbound content contract.
//!
//! The host attachment library hands the store something that has a name,
//! a size, a metadata map and a body.  The body is a byte stream that is
//! only borrowed for the duration of the upload; it is opened again for
//! every upload attempt, so a retried upload starts from the first byte.

use bytes::Bytes;
use std::pin::Pin;
use tokio::io::AsyncRead;

use crate::errors::StoreError;
use crate::Metadata;

/// Body stream of a [`Content`], borrowed from it.
pub type ContentReader<'a> = Pin<Box<dyn AsyncRead + Send + 'a>>;

/// Content supplied by the host attachment library.
pub trait Content: Send + Sync {
    /// Original file name, if known.
    fn name(&self) -> Option<&str>;

    /// Size of the body in bytes.  The stream returned by [`Content::open`]
    /// must yield exactly this many bytes.
    fn size(&self) -> u64;

    /// Metadata to attach to the stored file.
    fn meta(&self) -> &Metadata;

    /// Open a fresh stream over the body.
    fn open(&self) -> Result<ContentReader<'_>, StoreError>;
}

/// In-memory [`Content`] backed by a [`Bytes`] buffer.
#[derive(Debug, Clone, Default)]
pub struct BytesContent {
    name: Option<String>,
    data: Bytes,
    meta: Metadata,
}

impl BytesContent {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            name: None,
            data: data.into(),
            meta: Metadata::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

impl Content for BytesContent {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn meta(&self) -> &Metadata {
        &self.meta
    }

    fn open(&self) -> Result<ContentReader<'_>, StoreError> {
        Ok(Box::pin(std::io::Cursor::new(self.data.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_bytes_content() {
        let content = BytesContent::new("hello")
            .with_name("greeting.txt")
            .with_meta("a", "1");
        assert_eq!(content.name(), Some("greeting.txt"));
        assert_eq!(content.size(), 5);
        assert_eq!(content.meta().get("a").map(String::as_str), Some("1"));

        let mut body = Vec::new();
        content.open().unwrap().read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_each_open_starts_at_the_beginning() {
        let content = BytesContent::new("abcdef");
        let mut first = content.open().unwrap();
        let mut prefix = [0u8; 3];
        first.read_exact(&mut prefix).await.unwrap();
        assert_eq!(&prefix, b"abc");

        let mut body = Vec::new();
        content.open().unwrap().read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"abcdef");
    }

    #[test]
    fn test_unnamed_content() {
        let content = BytesContent::new(Vec::<u8>::new());
        assert!(content.name().is_none());
        assert_eq!(content.size(), 0);
    }
}
