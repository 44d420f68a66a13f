//! Backing stores for archive file systems.

mod zip_store;

pub use zip_store::{ArchiveLocation, ZipStore, ZipStoreError, ZipStoreResult};
