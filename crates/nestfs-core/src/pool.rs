//! Pools of anonymous staging buffers.
//!
//! A pool hands out [`IoBuffer`]s which stay exclusively owned by the caller
//! until released. Pools are thread-safe; buffers are internally locked so
//! that their sockets can be shared, but concurrent writers on one buffer are
//! not supported.

use crate::socket::{InputSocket, OutputSocket};
use crate::stream::{closed, Closeable, InputChannel, InputStream, OutputChannel, OutputStream};
use crate::{Access, Entry, Error, Result, Size};
use chrono::Utc;
use log::{debug, trace};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Allocator of staging buffers.
pub trait IoBufferPool: Send + Sync {
    /// Allocate a new, empty buffer.
    fn allocate(&self) -> Result<IoBuffer>;

    /// Number of buffers allocated and not yet released.
    fn size(&self) -> usize;
}

/// Shared allocation counters of one pool.
#[derive(Debug, Default)]
struct PoolStats {
    outstanding: AtomicUsize,
    allocated: AtomicU64,
}

impl PoolStats {
    fn acquire(&self) -> u64 {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.allocated.fetch_add(1, Ordering::SeqCst)
    }

    fn release(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A pool of heap-allocated buffers.
#[derive(Debug, Default, Clone)]
pub struct MemoryPool {
    stats: Arc<PoolStats>,
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IoBufferPool for MemoryPool {
    fn allocate(&self) -> Result<IoBuffer> {
        let id = self.stats.acquire();
        Ok(IoBuffer::new(
            format!("memory-buffer-{}", id),
            Storage::Memory(Vec::new()),
            self.stats.clone(),
        ))
    }

    fn size(&self) -> usize {
        self.stats.outstanding.load(Ordering::SeqCst)
    }
}

/// A pool of buffers backed by anonymous temporary files.
#[derive(Debug, Default, Clone)]
pub struct TempFilePool {
    dir: Option<PathBuf>,
    stats: Arc<PoolStats>,
}

impl TempFilePool {
    /// Create a pool placing its files in the system temp directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool placing its files in `dir`.
    pub fn in_dir<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: Some(dir.into()),
            stats: Arc::default(),
        }
    }
}

impl IoBufferPool for TempFilePool {
    fn allocate(&self) -> Result<IoBuffer> {
        let file = match &self.dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let id = self.stats.acquire();
        Ok(IoBuffer::new(
            format!("file-buffer-{}", id),
            Storage::File(file),
            self.stats.clone(),
        ))
    }

    fn size(&self) -> usize {
        self.stats.outstanding.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
enum Storage {
    Memory(Vec<u8>),
    File(File),
}

impl Storage {
    fn len(&self) -> io::Result<u64> {
        match self {
            Storage::Memory(data) => Ok(data.len() as u64),
            Storage::File(file) => Ok(file.metadata()?.len()),
        }
    }

    fn truncate(&mut self) -> io::Result<()> {
        match self {
            Storage::Memory(data) => {
                data.clear();
                Ok(())
            }
            Storage::File(file) => file.set_len(0),
        }
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Storage::Memory(data) => {
                let start = usize::try_from(pos).unwrap_or(usize::MAX).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            Storage::File(file) => {
                file.seek(SeekFrom::Start(pos))?;
                file.read(buf)
            }
        }
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> io::Result<usize> {
        match self {
            Storage::Memory(data) => {
                let start = usize::try_from(pos)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset too large"))?;
                if data.len() < start {
                    data.resize(start, 0);
                }
                let overlap = buf.len().min(data.len() - start);
                data[start..start + overlap].copy_from_slice(&buf[..overlap]);
                data.extend_from_slice(&buf[overlap..]);
                Ok(buf.len())
            }
            Storage::File(file) => {
                file.seek(SeekFrom::Start(pos))?;
                file.write(buf)
            }
        }
    }
}

#[derive(Debug)]
struct BufferState {
    storage: Storage,
    entry: Entry,
}

#[derive(Debug)]
struct Shared {
    name: String,
    stats: Arc<PoolStats>,
    released: AtomicBool,
    state: Mutex<BufferState>,
}

impl Shared {
    fn check(&self) -> io::Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(Error::illegal_state(format!("{} has been released", self.name)).into());
        }
        Ok(())
    }

    fn touch(&self, kind: Access) {
        self.state.lock().entry.set_time(kind, Some(Utc::now()));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!("releasing unreleased buffer {}", self.name);
            self.stats.release();
        }
    }
}

/// A staging buffer obtained from an [`IoBufferPool`].
///
/// The buffer is an entry in its own right and exposes sockets over its
/// content. It must be released exactly once; releasing again is an error.
#[derive(Debug)]
pub struct IoBuffer {
    shared: Arc<Shared>,
}

impl IoBuffer {
    fn new(name: String, storage: Storage, stats: Arc<PoolStats>) -> Self {
        trace!("allocated {}", name);
        let entry = Entry::new(name.clone())
            .with_size(Size::Data, 0)
            .with_time(Access::Create, Utc::now());
        Self {
            shared: Arc::new(Shared {
                name,
                stats,
                released: AtomicBool::new(false),
                state: Mutex::new(BufferState { storage, entry }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Snapshot of the buffer's metadata.
    pub fn entry(&self) -> Entry {
        let state = self.shared.state.lock();
        let mut entry = state.entry.clone();
        entry.set_size(Size::Data, state.storage.len().ok());
        entry
    }

    /// A socket reading this buffer.
    pub fn input(&self) -> BufferInput {
        BufferInput {
            shared: self.shared.clone(),
        }
    }

    /// A socket replacing this buffer's content.
    pub fn output(&self) -> BufferOutput {
        BufferOutput {
            shared: self.shared.clone(),
        }
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Return the buffer to its pool.
    pub fn release(&self) -> Result<()> {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return Err(Error::illegal_state(format!(
                "{} has already been released",
                self.shared.name
            )));
        }
        self.shared.stats.release();
        // Drop the content eagerly; sockets still referencing the buffer fail from now on.
        let mut state = self.shared.state.lock();
        state.storage = Storage::Memory(Vec::new());
        trace!("released {}", self.shared.name);
        Ok(())
    }
}

/// Input socket of an [`IoBuffer`].
#[derive(Debug, Clone)]
pub struct BufferInput {
    shared: Arc<Shared>,
}

/// Output socket of an [`IoBuffer`].
#[derive(Debug, Clone)]
pub struct BufferOutput {
    shared: Arc<Shared>,
}

fn snapshot(shared: &Shared) -> Result<Entry> {
    shared.check()?;
    let state = shared.state.lock();
    let mut entry = state.entry.clone();
    entry.set_size(Size::Data, Some(state.storage.len()?));
    Ok(entry)
}

impl InputSocket for BufferInput {
    fn target(&self) -> Result<Entry> {
        snapshot(&self.shared)
    }

    fn stream(&self, _peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputStream>> {
        Ok(Box::new(BufferReader::open(self.shared.clone())?))
    }

    fn channel(&self, _peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputChannel>> {
        Ok(Box::new(BufferReader::open(self.shared.clone())?))
    }
}

impl OutputSocket for BufferOutput {
    fn target(&self) -> Result<Entry> {
        snapshot(&self.shared)
    }

    fn stream(&self, _peer: Option<&dyn InputSocket>) -> Result<Box<dyn OutputStream>> {
        Ok(Box::new(BufferWriter::open(self.shared.clone())?))
    }

    fn channel(&self, _peer: Option<&dyn InputSocket>) -> Result<Box<dyn OutputChannel>> {
        Ok(Box::new(BufferWriter::open(self.shared.clone())?))
    }
}

struct BufferReader {
    shared: Arc<Shared>,
    position: u64,
    closed: bool,
}

impl BufferReader {
    fn open(shared: Arc<Shared>) -> io::Result<Self> {
        shared.check()?;
        shared.touch(Access::Read);
        Ok(Self {
            shared,
            position: 0,
            closed: false,
        })
    }
}

impl Read for BufferReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed());
        }
        self.shared.check()?;
        let n = self.shared.state.lock().storage.read_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for BufferReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if self.closed {
            return Err(closed());
        }
        self.shared.check()?;
        let len = self.shared.state.lock().storage.len()?;
        self.position = seek_position(self.position, len, pos)?;
        Ok(self.position)
    }
}

impl Closeable for BufferReader {
    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

struct BufferWriter {
    shared: Arc<Shared>,
    position: u64,
    closed: bool,
}

impl BufferWriter {
    fn open(shared: Arc<Shared>) -> io::Result<Self> {
        shared.check()?;
        shared.state.lock().storage.truncate()?;
        shared.touch(Access::Write);
        Ok(Self {
            shared,
            position: 0,
            closed: false,
        })
    }
}

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed());
        }
        self.shared.check()?;
        let n = self.shared.state.lock().storage.write_at(self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for BufferWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if self.closed {
            return Err(closed());
        }
        self.shared.check()?;
        let len = self.shared.state.lock().storage.len()?;
        self.position = seek_position(self.position, len, pos)?;
        Ok(self.position)
    }
}

impl Closeable for BufferWriter {
    fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            self.shared.touch(Access::Write);
        }
        Ok(())
    }
}

fn seek_position(current: u64, len: u64, pos: SeekFrom) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::End(n) => len.checked_add_signed(n),
        SeekFrom::Current(n) => current.checked_add_signed(n),
    };
    target.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid seek to a negative or overflowing position",
        )
    })
}
