//! # nestfs-core
//!
//! I/O kernel for federated archive file systems.
//!
//! This crate provides:
//! - Input and output sockets that open closeable streams against one entry
//! - Buffer pools backed by memory or temporary files
//! - Write-through and write-back entry caches
//! - Accounting of open streams so that a file system can be synchronized
//!   safely while other threads use it
//! - A manager that keeps a bounded number of file systems mounted and
//!   evicts the least recently used ones
//!
//! ## Example
//!
//! ```ignore
//! use nestfs_core::{EvictingManager, FsController, MemoryPool, MountPoint, Strategy};
//!
//! let manager = Arc::new(EvictingManager::new(5)?);
//! let controller = manager.register(Arc::new(FsController::new(
//!     MountPoint::new("data.zip"),
//!     store,
//!     Arc::new(MemoryPool::new()),
//!     Strategy::WriteBack,
//! )));
//! let input = controller.input("readme.txt")?;
//! ```

pub mod cache;
pub mod controller;
mod entry;
mod error;
pub mod guard;
pub mod manager;
mod mount;
pub mod pool;
pub mod socket;
pub mod stream;
pub mod sync;

pub use cache::{EntryCache, Strategy};
pub use controller::{BackingStore, Controller, FsController};
pub use entry::{Access, Entry, Size};
pub use error::{Error, Result};
pub use guard::StreamGuard;
pub use manager::{
    EvictingManager, ManagerStats, PacedController, DEFAULT_EVICTION_TIMEOUT_MS,
    DEFAULT_MAX_MOUNTED,
};
pub use mount::{MountPoint, SEPARATOR};
pub use pool::{IoBuffer, IoBufferPool, MemoryPool, TempFilePool};
pub use socket::{copy, InputSocket, OutputSocket, SharedInput, SharedOutput};
pub use stream::{Closeable, InputChannel, InputStream, OutputChannel, OutputStream};
pub use sync::{Severity, SyncError, SyncFailure, SyncOptions};
