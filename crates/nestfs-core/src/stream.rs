//! Closeable byte streams and seekable channels.
//!
//! Dropping a stream is not the same as closing it: output streams commit
//! their data only on an explicit [`Closeable::close`], and close failures are
//! reported to the caller instead of being lost in `Drop`.

use crate::Error;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// A resource that must be closed explicitly.
pub trait Closeable {
    /// Close the resource. Calling this again after success must succeed too.
    fn close(&mut self) -> io::Result<()>;
}

impl<T: Closeable + ?Sized> Closeable for Box<T> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// A closeable byte source.
pub trait InputStream: Read + Closeable + Send {}

impl<T: Read + Closeable + Send + ?Sized> InputStream for T {}

/// A closeable byte sink.
pub trait OutputStream: Write + Closeable + Send {}

impl<T: Write + Closeable + Send + ?Sized> OutputStream for T {}

/// A closeable byte source with random access.
pub trait InputChannel: Read + Seek + Closeable + Send {}

impl<T: Read + Seek + Closeable + Send + ?Sized> InputChannel for T {}

/// A closeable byte sink with random access.
pub trait OutputChannel: Write + Seek + Closeable + Send {}

impl<T: Write + Seek + Closeable + Send + ?Sized> OutputChannel for T {}

pub(crate) fn closed() -> io::Error {
    Error::StreamClosed.into()
}

/// Lifts a plain reader into an [`InputStream`].
///
/// After `close()` the reader is dropped and every further read fails.
#[derive(Debug)]
pub struct ReadAdapter<R> {
    inner: Option<R>,
}

impl<R> ReadAdapter<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: Some(inner) }
    }
}

impl<R: Read> Read for ReadAdapter<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.as_mut().ok_or_else(closed)?.read(buf)
    }
}

impl<R: Seek> Seek for ReadAdapter<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.as_mut().ok_or_else(closed)?.seek(pos)
    }
}

impl<R> Closeable for ReadAdapter<R> {
    fn close(&mut self) -> io::Result<()> {
        self.inner = None;
        Ok(())
    }
}

/// Lifts a plain writer into an [`OutputStream`]; closing flushes it.
#[derive(Debug)]
pub struct WriteAdapter<W: Write> {
    inner: Option<W>,
}

impl<W: Write> WriteAdapter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner: Some(inner) }
    }
}

impl<W: Write> Write for WriteAdapter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.as_mut().ok_or_else(closed)?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.as_mut().ok_or_else(closed)?.flush()
    }
}

impl<W: Write + Seek> Seek for WriteAdapter<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.as_mut().ok_or_else(closed)?.seek(pos)
    }
}

impl<W: Write> Closeable for WriteAdapter<W> {
    fn close(&mut self) -> io::Result<()> {
        match self.inner.take() {
            Some(mut inner) => inner.flush(),
            None => Ok(()),
        }
    }
}
