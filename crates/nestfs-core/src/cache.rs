//! A single-entry cache that stages reads and writes in a pooled buffer.
//!
//! The cache sits between the clients of an entry and its backing store.
//! The first read copies the backing entry into a buffer and every later
//! read is served from that buffer. Writes go to a fresh buffer which
//! replaces the cached one when the output stream is closed; depending on
//! the [`Strategy`] the new content is relayed to the backing store at once
//! or on [`EntryCache::flush`].
//!
//! All operations of one cache run in a single critical section.

use crate::pool::{IoBuffer, IoBufferPool};
use crate::socket::{copy, InputSocket, OutputSocket, SharedInput, SharedOutput};
use crate::stream::{closed, Closeable, InputChannel, InputStream, OutputStream};
use crate::{Entry, Error, Result};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

/// When written data reaches the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Relay every completed write immediately.
    WriteThrough,
    /// Keep writes in the buffer until the cache is flushed.
    #[default]
    WriteBack,
}

/// Keeps a buffer allocated while the cache or any of its streams use it.
///
/// The buffer goes back to its pool when the last holder lets go.
#[derive(Debug)]
struct Lease {
    buffer: IoBuffer,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(err) = self.buffer.release() {
            warn!("failed to release {}: {}", self.buffer.name(), err);
        }
    }
}

struct State {
    strategy: Strategy,
    pool: Arc<dyn IoBufferPool>,
    input: Option<SharedInput>,
    output: Option<SharedOutput>,
    lease: Option<Arc<Lease>>,
    dirty: bool,
}

impl State {
    fn populate(&mut self) -> Result<Arc<Lease>> {
        if let Some(lease) = &self.lease {
            return Ok(lease.clone());
        }
        let input = self
            .input
            .clone()
            .ok_or_else(|| Error::illegal_state("cache has no input configured"))?;
        let lease = Arc::new(Lease {
            buffer: self.pool.allocate()?,
        });
        match copy(&*input, &lease.buffer.output()) {
            Ok(n) => {
                debug!("populated {} with {} bytes", lease.buffer.name(), n);
                self.lease = Some(lease.clone());
                self.dirty = false;
                Ok(lease)
            }
            // Dropping the lease releases the partially filled buffer.
            Err(err) => Err(Error::Population(Box::new(err))),
        }
    }

    fn commit(&mut self, lease: Arc<Lease>) -> Result<()> {
        trace!("committing {}", lease.buffer.name());
        self.lease = Some(lease);
        self.dirty = true;
        match self.strategy {
            Strategy::WriteThrough => self.flush(),
            Strategy::WriteBack => Ok(()),
        }
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(lease) = self.lease.clone() else {
            self.dirty = false;
            return Ok(());
        };
        let output = self
            .output
            .clone()
            .ok_or_else(|| Error::illegal_state("cache has no output configured"))?;
        copy(&lease.buffer.input(), &*output).map_err(|err| Error::Flush(Box::new(err)))?;
        debug!("flushed {}", lease.buffer.name());
        self.dirty = false;
        Ok(())
    }

    /// The bound entry carrying the cached buffer's metadata.
    ///
    /// An entry that exists only in the cache is named by the other socket.
    fn cached_target(&self, lease: &Lease, prefer_output: bool) -> Result<Entry> {
        let input = || self.input.as_ref().map(|socket| socket.target());
        let output = || self.output.as_ref().map(|socket| socket.target());
        let (first, second) = if prefer_output {
            (output(), input())
        } else {
            (input(), output())
        };
        let backing = match (first, second) {
            (Some(Ok(entry)), _) => Ok(entry),
            (Some(Err(err)), _) if !err.is_not_found() => Err(err),
            (_, Some(Ok(entry))) => Ok(entry),
            (Some(Err(err)), _) | (None, Some(Err(err))) => Err(err),
            (None, None) => Err(Error::illegal_state("cache has no sockets configured")),
        };
        backing.map(|mut entry| {
            entry.merge_from(&lease.buffer.entry());
            entry
        })
    }

    fn clear(&mut self) {
        if let Some(lease) = self.lease.take() {
            trace!("clearing {}", lease.buffer.name());
        }
        self.dirty = false;
    }
}

/// A write-through or write-back cache for one entry.
///
/// Cloning yields another handle to the same cache.
#[derive(Clone)]
pub struct EntryCache {
    state: Arc<Mutex<State>>,
}

impl EntryCache {
    /// Create an empty cache allocating its buffers from `pool`.
    pub fn new(strategy: Strategy, pool: Arc<dyn IoBufferPool>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                strategy,
                pool,
                input: None,
                output: None,
                lease: None,
                dirty: false,
            })),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.state.lock().strategy
    }

    /// Set the backing sockets. The cached entry, if any, is kept.
    pub fn configure(&self, input: SharedInput, output: SharedOutput) -> &Self {
        let mut state = self.state.lock();
        state.input = Some(input);
        state.output = Some(output);
        self
    }

    /// A socket reading through this cache.
    pub fn input(&self) -> SharedInput {
        Arc::new(CacheInput {
            state: self.state.clone(),
        })
    }

    /// A socket writing through this cache.
    pub fn output(&self) -> SharedOutput {
        Arc::new(CacheOutput {
            state: self.state.clone(),
        })
    }

    /// Relay pending writes to the backing store.
    ///
    /// On failure the cached data stays dirty so the flush can be retried.
    pub fn flush(&self) -> Result<()> {
        self.state.lock().flush()
    }

    /// Forget the cached entry, discarding unflushed writes.
    pub fn clear(&self) {
        self.state.lock().clear()
    }

    /// Metadata of the cached entry, if present.
    pub fn cached_entry(&self) -> Option<Entry> {
        self.state
            .lock()
            .lease
            .as_ref()
            .map(|lease| lease.buffer.entry())
    }

    /// Returns `true` if the cached entry has writes not yet relayed.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }
}

struct CacheInput {
    state: Arc<Mutex<State>>,
}

impl InputSocket for CacheInput {
    fn target(&self) -> Result<Entry> {
        let state = self.state.lock();
        if let Some(lease) = &state.lease {
            return state.cached_target(lease, false);
        }
        state
            .input
            .as_ref()
            .ok_or_else(|| Error::illegal_state("cache has no input configured"))?
            .target()
    }

    fn stream(&self, _peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputStream>> {
        let lease = self.state.lock().populate()?;
        let inner = lease.buffer.input().stream(None)?;
        Ok(Box::new(LeasedReader {
            _lease: lease,
            inner,
        }))
    }

    fn channel(&self, _peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputChannel>> {
        let lease = self.state.lock().populate()?;
        let inner = lease.buffer.input().channel(None)?;
        Ok(Box::new(LeasedReader {
            _lease: lease,
            inner,
        }))
    }
}

/// Reads a cached buffer, keeping it allocated until dropped.
struct LeasedReader<S: ?Sized> {
    _lease: Arc<Lease>,
    inner: Box<S>,
}

impl<S: Read + ?Sized> Read for LeasedReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<S: Seek + ?Sized> Seek for LeasedReader<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl<S: Closeable + ?Sized> Closeable for LeasedReader<S> {
    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

struct CacheOutput {
    state: Arc<Mutex<State>>,
}

impl OutputSocket for CacheOutput {
    fn target(&self) -> Result<Entry> {
        let state = self.state.lock();
        if let Some(lease) = &state.lease {
            return state.cached_target(lease, true);
        }
        state
            .output
            .as_ref()
            .ok_or_else(|| Error::illegal_state("cache has no output configured"))?
            .target()
    }

    fn stream(&self, _peer: Option<&dyn InputSocket>) -> Result<Box<dyn OutputStream>> {
        let lease = Arc::new(Lease {
            buffer: self.state.lock().pool.allocate()?,
        });
        let inner = lease.buffer.output().stream(None)?;
        Ok(Box::new(CacheWriter {
            state: self.state.clone(),
            pending: Some((lease, inner)),
        }))
    }
}

/// Writes into a fresh buffer that replaces the cached one on close.
struct CacheWriter {
    state: Arc<Mutex<State>>,
    pending: Option<(Arc<Lease>, Box<dyn OutputStream>)>,
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.pending {
            Some((_, inner)) => inner.write(buf),
            None => Err(closed()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.pending {
            Some((_, inner)) => inner.flush(),
            None => Err(closed()),
        }
    }
}

impl Closeable for CacheWriter {
    fn close(&mut self) -> io::Result<()> {
        let Some((lease, mut inner)) = self.pending.take() else {
            return Ok(());
        };
        inner.close()?;
        self.state.lock().commit(lease)?;
        Ok(())
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if let Some((lease, _)) = &self.pending {
            debug!("discarding unclosed write to {}", lease.buffer.name());
        }
    }
}
