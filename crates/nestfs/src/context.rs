use crate::config::{BufferPoolKind, Config};
use crate::store::{ArchiveLocation, ZipStore};
use log::debug;
use nestfs_core::socket::{LazyInputStream, LazyOutputStream};
use nestfs_core::{
    Closeable, Controller, Entry, Error, EvictingManager, FsController, IoBufferPool,
    ManagerStats, MemoryPool, MountPoint, PacedController, Result, SyncError, SyncOptions,
    TempFilePool,
};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Entry point to a federation of ZIP archives.
///
/// Paths address entries inside archives with `!/` separators, e.g.
/// `data.zip!/docs/readme.txt` or `data.zip!/inner.zip!/notes.txt`.
/// Archives are mounted on first access and synced back when evicted or on
/// [`NestFs::sync`].
pub struct NestFs {
    config: Config,
    pool: Arc<dyn IoBufferPool>,
    manager: Arc<EvictingManager>,
}

impl NestFs {
    pub fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|err| Error::InvalidArgument(err.to_string()))?;
        let pool: Arc<dyn IoBufferPool> = match (&config.buffer_pool, &config.temp_dir) {
            (BufferPoolKind::Memory, _) => Arc::new(MemoryPool::new()),
            (BufferPoolKind::TempFile, Some(dir)) => Arc::new(TempFilePool::in_dir(dir.clone())),
            (BufferPoolKind::TempFile, None) => Arc::new(TempFilePool::new()),
        };
        let manager = Arc::new(EvictingManager::new(config.max_mounted)?);
        manager.set_eviction_timeout_ms(config.eviction_timeout_ms);
        Ok(Self {
            config,
            pool,
            manager,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<EvictingManager> {
        &self.manager
    }

    pub fn pool(&self) -> &Arc<dyn IoBufferPool> {
        &self.pool
    }

    /// The controller for `mount_point`, mounting enclosing archives first.
    pub fn mount(&self, mount_point: &MountPoint) -> Result<Arc<PacedController>> {
        if let Some(controller) = self.manager.get(mount_point) {
            return Ok(controller);
        }
        let location = match mount_point.parent() {
            None => ArchiveLocation::File(PathBuf::from(mount_point.as_str())),
            Some(parent) => ArchiveLocation::Entry {
                parent: self.mount(&parent)?.recording(),
                name: mount_point.archive_name().to_string(),
            },
        };
        debug!("mounting {}", mount_point);
        let controller = FsController::new(
            mount_point.clone(),
            ZipStore::new(location),
            self.pool.clone(),
            self.config.strategy,
        );
        Ok(self.manager.register(Arc::new(controller)))
    }

    fn resolve(&self, path: &str) -> Result<(Arc<PacedController>, String)> {
        let (mount_point, name) = MountPoint::parse_entry_path(path).ok_or_else(|| {
            Error::InvalidArgument(format!("not an archive entry path: {}", path))
        })?;
        Ok((self.mount(&mount_point)?, name))
    }

    /// Read the whole content of the entry at `path`.
    pub fn read(&self, path: &str) -> Result<Vec<u8>> {
        let (controller, name) = self.resolve(path)?;
        let mut stream = controller.input(&name)?.stream(None)?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data)?;
        stream.close()?;
        Ok(data)
    }

    /// Replace the content of the entry at `path`.
    pub fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let (controller, name) = self.resolve(path)?;
        let mut stream = controller.output(&name)?.stream(None)?;
        stream.write_all(data)?;
        stream.close()?;
        Ok(())
    }

    /// A stream reading the entry at `path`, opened on the first read.
    ///
    /// The archive is mounted at once, but the stream does not hold it open
    /// until data is read.
    pub fn open_input(&self, path: &str) -> Result<LazyInputStream> {
        let (controller, name) = self.resolve(path)?;
        Ok(LazyInputStream::new(controller.input(&name)?))
    }

    /// A stream replacing the entry at `path`, opened on the first write.
    ///
    /// Closing it without writing leaves the entry untouched.
    pub fn open_output(&self, path: &str) -> Result<LazyOutputStream> {
        let (controller, name) = self.resolve(path)?;
        Ok(LazyOutputStream::new(controller.output(&name)?))
    }

    /// Entries of the archive at `mount_point`, including unsynced writes.
    pub fn entries(&self, mount_point: &MountPoint) -> Result<Vec<Entry>> {
        self.mount(mount_point)?.entries()
    }

    /// Synchronize every mounted archive.
    ///
    /// Without an explicit timeout the configured `sync-timeout-ms` applies.
    pub fn sync(&self, options: &SyncOptions) -> std::result::Result<(), SyncError> {
        let options = if options.timeout_ms == 0 {
            options.with_timeout_ms(self.config.sync_timeout_ms)
        } else {
            *options
        };
        self.manager.sync(&options)
    }

    /// Wait for open streams, then sync and unmount every archive.
    pub fn umount(&self) -> std::result::Result<(), SyncError> {
        self.sync(&SyncOptions::UMOUNT)
    }

    pub fn stats(&self) -> ManagerStats {
        self.manager.stats()
    }
}
