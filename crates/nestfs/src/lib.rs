//! # nestfs
//!
//! Federated file systems over ZIP archives, including archives nested in
//! other archives.
//!
//! This crate provides:
//! - A ZIP backing store that stages writes and rewrites the archive on sync
//! - TOML configuration with environment overrides
//! - The [`NestFs`] context tying stores, caches and the mount manager together
//! - The `nestfs` command line tool (with the `cli` feature)
//!
//! ## Example
//!
//! ```ignore
//! use nestfs::{Config, NestFs};
//! use nestfs_core::SyncOptions;
//!
//! let fs = NestFs::new(Config::default())?;
//! fs.write("data.zip!/notes.txt", b"hello")?;
//! let inner = fs.read("data.zip!/lib.zip!/readme.txt")?;
//! fs.sync(&SyncOptions::UMOUNT)?;
//! ```

pub mod config;
mod context;
pub mod store;

pub use config::{BufferPoolKind, Config, ConfigError};
pub use context::NestFs;
pub use store::{ArchiveLocation, ZipStore, ZipStoreError};

// Re-export the kernel for convenience
pub use nestfs_core;
