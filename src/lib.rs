//! sharestore -- attachment datastore backed by Azure Files.
//!
//! This crate stores uploaded attachments in a hierarchical file share and
//! hands back opaque uids.  It generates date-partitioned paths, creates
//! parent directories on demand, keeps metadata inline on each file (with a
//! fallback to legacy `.meta.yml` sidecar files) and retries transient
//! connection failures once.
//!
//! The entry point is [`store::FileShareStore`].

use std::collections::BTreeMap;

pub mod config;
pub mod content;
pub mod directory;
pub mod errors;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod paths;
pub mod storage;
pub mod store;
pub mod transport;

/// Flat string metadata attached to a stored file.
pub type Metadata = BTreeMap<String, String>;

pub use config::{load_config, StoreConfig};
pub use content::{BytesContent, Content, ContentReader};
pub use errors::{ErrorKind, StoreError};
pub use metadata::ReadObject;
pub use store::{FileShareStore, UrlOptions};
