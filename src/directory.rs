//! Parent directory provisioning.
//!
//! A file share only accepts a file whose directory already exists, and a
//! directory only when its own parent exists.  [`ensure_directory`] walks a
//! relative path from the shallowest segment to the deepest and creates each
//! one, treating "already exists" as done.

use tracing::debug;

use crate::errors::StoreError;
use crate::transport::RetryingTransport;

/// Create every missing directory along `relative_dir`.
///
/// For `a/b/c` the backend is asked for `a`, then `a/b`, then `a/b/c`.
/// An already-existing directory counts as created; any other error stops
/// the walk and is returned.
pub async fn ensure_directory(
    transport: &RetryingTransport,
    relative_dir: &str,
) -> Result<(), StoreError> {
    let mut current = String::new();
    for segment in relative_dir.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() {
            current.push('/');
        }
        current.push_str(segment);

        match transport.create_directory(&current).await {
            Ok(()) => debug!("Created directory {}", current),
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
