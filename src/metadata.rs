//! Metadata resolution for stored files.
//!
//! Files written by this crate carry their metadata inline.  Files written
//! by older deployments may instead have a `<name>.meta.yml` sidecar next to
//! them.  Inline metadata always wins; the sidecar is only read when the
//! inline map is empty and `legacy_meta` is enabled.  A file with neither
//! gets `{name: <basename>}` written back during the read.

use bytes::Bytes;
use metrics::counter;
use serde_yaml::Value;
use tracing::{debug, info, warn};

use crate::errors::StoreError;
use crate::metrics::{METADATA_HEALS_TOTAL, METADATA_MIGRATIONS_TOTAL};
use crate::paths::{sidecar_name, split_path};
use crate::transport::RetryingTransport;
use crate::Metadata;

/// Body and resolved metadata of a stored file.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadObject {
    pub body: Bytes,
    pub meta: Metadata,
}

/// Decides where a file's metadata lives and repairs it when missing.
pub struct MetadataResolver<'a> {
    transport: &'a RetryingTransport,
}

impl<'a> MetadataResolver<'a> {
    pub fn new(transport: &'a RetryingTransport) -> Self {
        Self { transport }
    }

    /// Fetch the file at `path` together with its metadata.
    ///
    /// When no metadata is found the default `{name: <basename>}` is written
    /// back and the file fetched once more.  A failed write-back is reported
    /// as [`StoreError::SelfHeal`], a second empty fetch as
    /// [`StoreError::MetadataUnresolved`].  With `store_meta` disabled the
    /// default is returned without writing anything.
    pub async fn resolve(&self, path: &str) -> Result<ReadObject, StoreError> {
        let (dir, name) = split_path(path);
        let first = self.fetch(&dir, &name).await?;
        if !first.meta.is_empty() {
            return Ok(first);
        }

        let default = default_metadata(&name);
        if !self.transport.config().store_meta {
            return Ok(ReadObject {
                body: first.body,
                meta: default,
            });
        }

        warn!("No metadata found for {}, writing default", path);
        self.transport
            .set_file_metadata(&dir, &name, &default)
            .await
            .map_err(|err| StoreError::SelfHeal {
                path: path.to_string(),
                source: Box::new(err),
            })?;
        counter!(METADATA_HEALS_TOTAL).increment(1);

        let second = self.fetch(&dir, &name).await?;
        if second.meta.is_empty() {
            return Err(StoreError::MetadataUnresolved {
                path: path.to_string(),
            });
        }
        Ok(second)
    }

    /// Move sidecar metadata inline and delete the sidecar.
    ///
    /// Returns `false` without touching anything when `store_meta` is off,
    /// the file already has inline metadata, or there is no usable sidecar.
    pub async fn migrate(&self, path: &str) -> Result<bool, StoreError> {
        if !self.transport.config().store_meta {
            return Ok(false);
        }

        let (dir, name) = split_path(path);
        let file = self.transport.get_file(&dir, &name).await?;
        if !file.properties.metadata.is_empty() {
            return Ok(false);
        }

        let legacy = self.load_sidecar(&dir, &name).await;
        if legacy.is_empty() {
            return Ok(false);
        }

        self.transport.set_file_metadata(&dir, &name, &legacy).await?;
        match self.transport.delete_file(&dir, &sidecar_name(&name)).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        counter!(METADATA_MIGRATIONS_TOTAL).increment(1);
        info!("Migrated sidecar metadata for {}", path);
        Ok(true)
    }

    async fn fetch(&self, dir: &str, name: &str) -> Result<ReadObject, StoreError> {
        let file = self.transport.get_file(dir, name).await?;
        let mut meta = file.properties.metadata;
        if meta.is_empty() && self.transport.config().legacy_meta {
            meta = self.load_sidecar(dir, name).await;
        }
        Ok(ReadObject {
            body: file.body,
            meta,
        })
    }

    /// Metadata from the sidecar of `dir/name`; empty if it cannot be read.
    async fn load_sidecar(&self, dir: &str, name: &str) -> Metadata {
        let sidecar = sidecar_name(name);
        match self.transport.get_file(dir, &sidecar).await {
            Ok(file) => parse_sidecar(&file.body),
            Err(err) => {
                debug!("No sidecar {} in '{}': {}", sidecar, dir, err);
                Metadata::new()
            }
        }
    }
}

/// Metadata written for files that have none.
pub fn default_metadata(basename: &str) -> Metadata {
    let mut meta = Metadata::new();
    meta.insert("name".to_string(), basename.to_string());
    meta
}

/// Fold metadata keys to lower case, the form Azure returns them in.
///
/// Keys that only differ by case would land on the same `x-ms-meta-*`
/// header, so they are rejected instead of one silently replacing the
/// other.  Empty keys are rejected too.
pub fn normalize_metadata(meta: &Metadata) -> Result<Metadata, StoreError> {
    let mut normalized = Metadata::new();
    for (key, value) in meta {
        if key.is_empty() {
            return Err(StoreError::InvalidMetadata("empty metadata key".into()));
        }
        if normalized.insert(key.to_lowercase(), value.clone()).is_some() {
            return Err(StoreError::InvalidMetadata(format!(
                "key '{}' collides with another key once lower-cased",
                key
            )));
        }
    }
    Ok(normalized)
}

/// Parse a sidecar body into a flat string map.
///
/// Only scalar entries are kept: strings as-is, numbers and booleans in
/// their YAML spelling.  Anything unparsable, or a document that is not a
/// mapping, gives an empty map.
pub fn parse_sidecar(body: &[u8]) -> Metadata {
    let Ok(text) = std::str::from_utf8(body) else {
        return Metadata::new();
    };
    let mapping = match serde_yaml::from_str::<Value>(text) {
        Ok(Value::Mapping(mapping)) => mapping,
        Ok(_) => return Metadata::new(),
        Err(err) => {
            debug!("Unparsable sidecar metadata: {}", err);
            return Metadata::new();
        }
    };

    mapping
        .into_iter()
        .filter_map(|(key, value)| Some((scalar(&key)?, scalar(&value)?)))
        .collect()
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
