//! File-share backends.
//!
//! The [`backend::FileShareBackend`] trait abstracts over where files
//! physically live.  Implementations include the Azure Files REST API and
//! an in-memory share.

pub mod azure;
pub mod backend;
pub mod memory;
