//! File system controllers: the per-mount state machine over a backing store.

use crate::cache::{EntryCache, Strategy};
use crate::guard::StreamGuard;
use crate::pool::IoBufferPool;
use crate::socket::{SharedInput, SharedOutput};
use crate::sync::{SyncError, SyncOptions};
use crate::{Entry, Error, MountPoint, Result};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The archive or protocol level provider of entries for one mount.
pub trait BackingStore: Send + Sync {
    /// A socket reading the entry `name`.
    fn input(&self, name: &str) -> Result<SharedInput>;

    /// A socket replacing the content of the entry `name`.
    fn output(&self, name: &str) -> Result<SharedOutput>;

    /// Every entry currently known to the store.
    fn entries(&self) -> Result<Vec<Entry>>;

    /// Persist everything written so far.
    fn sync(&self) -> Result<()>;
}

/// One mounted file system.
pub trait Controller: Send + Sync {
    fn mount_point(&self) -> &MountPoint;

    /// Returns `true` while the file system holds state that a sync would release.
    fn is_mounted(&self) -> bool;

    fn input(&self, name: &str) -> Result<SharedInput>;

    fn output(&self, name: &str) -> Result<SharedOutput>;

    fn entries(&self) -> Result<Vec<Entry>>;

    /// Synchronize the file system with its backing store.
    ///
    /// Returns every failure recorded; check [`SyncError::severity`] to tell
    /// warnings from failures.
    fn sync(&self, options: &SyncOptions) -> std::result::Result<(), SyncError>;
}

/// A controller caching every entry of a [`BackingStore`].
pub struct FsController<B> {
    mount_point: MountPoint,
    store: B,
    pool: Arc<dyn IoBufferPool>,
    strategy: Strategy,
    caches: Mutex<HashMap<String, EntryCache>>,
    guard: StreamGuard,
    mounted: AtomicBool,
}

impl<B: BackingStore> FsController<B> {
    pub fn new(
        mount_point: MountPoint,
        store: B,
        pool: Arc<dyn IoBufferPool>,
        strategy: Strategy,
    ) -> Self {
        Self {
            mount_point,
            store,
            pool,
            strategy,
            caches: Mutex::new(HashMap::new()),
            guard: StreamGuard::new(),
            mounted: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &B {
        &self.store
    }

    pub fn guard(&self) -> &StreamGuard {
        &self.guard
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// The cache for `name`, reconfigured with fresh sockets of the store.
    fn cache(&self, name: &str) -> Result<EntryCache> {
        let input = self.store.input(name)?;
        let output = self.store.output(name)?;
        let cache = self
            .caches
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| EntryCache::new(self.strategy, self.pool.clone()))
            .clone();
        cache.configure(input, output);
        Ok(cache)
    }

    fn snapshot(&self) -> Vec<(String, EntryCache)> {
        let caches = self.caches.lock();
        caches
            .iter()
            .map(|(name, cache)| (name.clone(), cache.clone()))
            .collect()
    }
}

impl<B: BackingStore> Controller for FsController<B> {
    fn mount_point(&self) -> &MountPoint {
        &self.mount_point
    }

    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn input(&self, name: &str) -> Result<SharedInput> {
        let cache = self.cache(name)?;
        self.mounted.store(true, Ordering::SeqCst);
        Ok(self.guard.input(cache.input()))
    }

    fn output(&self, name: &str) -> Result<SharedOutput> {
        let cache = self.cache(name)?;
        self.mounted.store(true, Ordering::SeqCst);
        Ok(self.guard.output(cache.output()))
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        let mut entries = self.store.entries()?;
        for (name, cache) in self.snapshot() {
            let Some(cached) = cache.cached_entry() else {
                continue;
            };
            match entries.iter_mut().find(|entry| entry.name() == name) {
                Some(entry) => entry.merge_from(&cached),
                None => {
                    let mut entry = Entry::new(name);
                    entry.merge_from(&cached);
                    entries.push(entry);
                }
            }
        }
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(entries)
    }

    fn sync(&self, options: &SyncOptions) -> std::result::Result<(), SyncError> {
        let mp = &self.mount_point;
        let mut errors = SyncError::new();
        trace!("syncing {} with {:?}", mp, options);

        if options.wait_close_io {
            let open = self.guard.wait_close_all(options.timeout_ms);
            if open > 0 {
                debug!("{} stream(s) of {} still open after waiting", open, mp);
            }
        }
        if options.force_close_io {
            let closed = self.guard.close_all(|err| errors.warn(mp, err));
            if closed > 0 {
                errors.warn(mp, Error::busy(format!("{} stream(s) forced closed", closed)));
            }
        } else if options.clear_cache {
            let open = self.guard.open_streams();
            if open > 0 {
                errors.fatal(mp, Error::busy(format!("{} stream(s) still open", open)));
                return Err(errors);
            }
        }

        let mut cleared = Vec::new();
        for (name, cache) in self.snapshot() {
            match cache.flush() {
                Ok(()) if options.clear_cache => {
                    cache.clear();
                    cleared.push(name);
                }
                Ok(()) => {}
                Err(err) => errors.fatal(mp, err),
            }
        }
        if !cleared.is_empty() {
            let mut caches = self.caches.lock();
            for name in &cleared {
                caches.remove(name);
            }
        }

        if let Err(err) = self.store.sync() {
            errors.fatal(mp, err);
        }

        if options.clear_cache && !errors.is_fatal() {
            self.mounted.store(false, Ordering::SeqCst);
            debug!("unmounted {}", mp);
        }
        errors.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;
    use crate::socket::{InputSocket, OutputSocket};
    use crate::stream::{Closeable, InputStream, OutputStream, ReadAdapter};
    use crate::sync::Severity;
    use std::io::{self, Cursor, Read, Write};

    #[derive(Default)]
    struct MapStore {
        data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        syncs: Arc<Mutex<usize>>,
    }

    struct MapInput(Arc<Mutex<HashMap<String, Vec<u8>>>>, String);
    struct MapOutput(Arc<Mutex<HashMap<String, Vec<u8>>>>, String);

    struct MapWriter(Arc<Mutex<HashMap<String, Vec<u8>>>>, String, Vec<u8>);

    impl Write for MapWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.2.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Closeable for MapWriter {
        fn close(&mut self) -> io::Result<()> {
            self.0.lock().insert(self.1.clone(), std::mem::take(&mut self.2));
            Ok(())
        }
    }

    impl InputSocket for MapInput {
        fn target(&self) -> Result<Entry> {
            Ok(Entry::new(self.1.clone()))
        }

        fn stream(&self, _peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputStream>> {
            let data = self
                .0
                .lock()
                .get(&self.1)
                .cloned()
                .ok_or_else(|| Error::not_found(self.1.clone()))?;
            Ok(Box::new(ReadAdapter::new(Cursor::new(data))))
        }
    }

    impl OutputSocket for MapOutput {
        fn target(&self) -> Result<Entry> {
            Ok(Entry::new(self.1.clone()))
        }

        fn stream(&self, _peer: Option<&dyn InputSocket>) -> Result<Box<dyn OutputStream>> {
            Ok(Box::new(MapWriter(self.0.clone(), self.1.clone(), Vec::new())))
        }
    }

    impl BackingStore for MapStore {
        fn input(&self, name: &str) -> Result<SharedInput> {
            Ok(Arc::new(MapInput(self.data.clone(), name.to_string())))
        }

        fn output(&self, name: &str) -> Result<SharedOutput> {
            Ok(Arc::new(MapOutput(self.data.clone(), name.to_string())))
        }

        fn entries(&self) -> Result<Vec<Entry>> {
            Ok(self.data.lock().keys().map(Entry::new).collect())
        }

        fn sync(&self) -> Result<()> {
            *self.syncs.lock() += 1;
            Ok(())
        }
    }

    fn controller() -> (FsController<MapStore>, MemoryPool) {
        let pool = MemoryPool::new();
        let controller = FsController::new(
            MountPoint::new("test.zip"),
            MapStore::default(),
            Arc::new(pool.clone()),
            Strategy::WriteBack,
        );
        (controller, pool)
    }

    fn write(controller: &dyn Controller, name: &str, data: &[u8]) {
        let mut out = controller.output(name).unwrap().stream(None).unwrap();
        out.write_all(data).unwrap();
        out.close().unwrap();
    }

    #[test]
    fn sync_flushes_and_unmounts() {
        let (controller, pool) = controller();
        assert!(!controller.is_mounted());
        write(&controller, "a.txt", b"alpha");
        assert!(controller.is_mounted());
        assert!(controller.store().data.lock().is_empty());

        let entries = controller.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size(crate::Size::Data), Some(5));

        controller.sync(&SyncOptions::SYNC).unwrap();
        assert!(!controller.is_mounted());
        assert_eq!(controller.store().data.lock()["a.txt"], b"alpha");
        assert_eq!(*controller.store().syncs.lock(), 1);
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn flush_keeps_the_mount() {
        let (controller, pool) = controller();
        write(&controller, "a.txt", b"alpha");
        controller.sync(&SyncOptions::FLUSH).unwrap();
        assert!(controller.is_mounted());
        assert_eq!(pool.size(), 1);
        assert_eq!(controller.store().data.lock()["a.txt"], b"alpha");
    }

    #[test]
    fn reset_refuses_while_streams_are_open() {
        let (controller, _pool) = controller();
        write(&controller, "a.txt", b"alpha");
        let mut reader = controller.input("a.txt").unwrap().stream(None).unwrap();

        let err = controller.sync(&SyncOptions::RESET).unwrap_err();
        assert_eq!(err.severity(), Severity::Fatal);
        assert!(controller.is_mounted());

        reader.close().unwrap();
        controller.sync(&SyncOptions::RESET).unwrap();
        assert!(!controller.is_mounted());
    }

    #[test]
    fn forced_close_is_a_warning() {
        let (controller, _pool) = controller();
        write(&controller, "a.txt", b"alpha");
        let mut reader = controller.input("a.txt").unwrap().stream(None).unwrap();

        let err = controller.sync(&SyncOptions::SYNC).unwrap_err();
        assert_eq!(err.severity(), Severity::Warning);
        assert!(!controller.is_mounted());
        let io_err = reader.read(&mut [0u8; 1]).unwrap_err();
        assert!(Error::is_closed_by_sync(&io_err));
    }
}
