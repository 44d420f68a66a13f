//! Input and output sockets: handles bound to one entry that open streams on demand.
//!
//! A socket may be told about a *peer* socket of the opposite direction.
//! The peer is advisory: a store may look at the peer's target to choose a
//! cheaper transfer path, but it must behave correctly without one.

use crate::stream::{closed, Closeable, InputChannel, InputStream, OutputChannel, OutputStream};
use crate::{Entry, Error, Result};
use log::trace;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// An input socket shared between owners.
pub type SharedInput = Arc<dyn InputSocket>;

/// An output socket shared between owners.
pub type SharedOutput = Arc<dyn OutputSocket>;

/// A source of bytes for one entry.
pub trait InputSocket: Send + Sync {
    /// The entry this socket reads from.
    fn target(&self) -> Result<Entry>;

    /// Open a byte stream.
    fn stream(&self, peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputStream>>;

    /// Open a seekable channel.
    fn channel(&self, _peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputChannel>> {
        Err(Error::Unsupported(format!(
            "input channels for {}",
            self.target()?.name()
        )))
    }
}

/// A sink of bytes for one entry.
pub trait OutputSocket: Send + Sync {
    /// The entry this socket writes to.
    fn target(&self) -> Result<Entry>;

    /// Open a byte stream. The written data replaces the entry's content.
    fn stream(&self, peer: Option<&dyn InputSocket>) -> Result<Box<dyn OutputStream>>;

    /// Open a seekable channel.
    fn channel(&self, _peer: Option<&dyn InputSocket>) -> Result<Box<dyn OutputChannel>> {
        Err(Error::Unsupported(format!(
            "output channels for {}",
            self.target()?.name()
        )))
    }
}

impl<'s> dyn InputSocket + 's {
    /// Bind this socket to `peer` so every open negotiates against it.
    pub fn bind<'a>(&'a self, peer: &'a dyn OutputSocket) -> BoundInput<'a> {
        BoundInput { socket: self, peer }
    }
}

impl<'s> dyn OutputSocket + 's {
    /// Bind this socket to `peer` so every open negotiates against it.
    pub fn bind<'a>(&'a self, peer: &'a dyn InputSocket) -> BoundOutput<'a> {
        BoundOutput { socket: self, peer }
    }
}

/// An input socket bound to an output peer.
#[derive(Clone, Copy)]
pub struct BoundInput<'a> {
    socket: &'a dyn InputSocket,
    peer: &'a dyn OutputSocket,
}

impl<'a> BoundInput<'a> {
    pub fn target(&self) -> Result<Entry> {
        self.socket.target()
    }

    pub fn peer_target(&self) -> Result<Entry> {
        self.peer.target()
    }

    pub fn stream(&self) -> Result<Box<dyn InputStream>> {
        self.socket.stream(Some(self.peer))
    }

    pub fn channel(&self) -> Result<Box<dyn InputChannel>> {
        self.socket.channel(Some(self.peer))
    }
}

/// An output socket bound to an input peer.
#[derive(Clone, Copy)]
pub struct BoundOutput<'a> {
    socket: &'a dyn OutputSocket,
    peer: &'a dyn InputSocket,
}

impl<'a> BoundOutput<'a> {
    pub fn target(&self) -> Result<Entry> {
        self.socket.target()
    }

    pub fn peer_target(&self) -> Result<Entry> {
        self.peer.target()
    }

    pub fn stream(&self) -> Result<Box<dyn OutputStream>> {
        self.socket.stream(Some(self.peer))
    }

    pub fn channel(&self) -> Result<Box<dyn OutputChannel>> {
        self.socket.channel(Some(self.peer))
    }
}

/// Copy all bytes from `input` to `output`, each side seeing the other as its peer.
///
/// The output stream is closed before the input stream so that a failed
/// commit is reported even if the input closes cleanly.
pub fn copy(input: &dyn InputSocket, output: &dyn OutputSocket) -> Result<u64> {
    let mut reader = input.bind(output).stream()?;
    let mut writer = match output.bind(input).stream() {
        Ok(writer) => writer,
        Err(err) => {
            let _ = reader.close();
            return Err(err);
        }
    };

    let copied = io::copy(&mut reader, &mut writer);
    let copied = match copied {
        Ok(n) => n,
        Err(err) => {
            // The partial output is abandoned, not committed.
            drop(writer);
            let _ = reader.close();
            return Err(err.into());
        }
    };

    let committed = writer.close();
    let released = reader.close();
    committed?;
    released?;
    trace!("copied {} bytes", copied);
    Ok(copied)
}

enum Lazy<S> {
    Pending,
    Open(S),
    Closed,
}

/// An input stream that is opened on first read.
pub struct LazyInputStream {
    socket: SharedInput,
    state: Lazy<Box<dyn InputStream>>,
}

impl LazyInputStream {
    pub fn new(socket: SharedInput) -> Self {
        Self {
            socket,
            state: Lazy::Pending,
        }
    }

    /// Returns `true` once the underlying stream has been opened.
    pub fn is_open(&self) -> bool {
        matches!(self.state, Lazy::Open(_))
    }

    fn get(&mut self) -> io::Result<&mut Box<dyn InputStream>> {
        if let Lazy::Pending = self.state {
            self.state = Lazy::Open(self.socket.stream(None)?);
        }
        match &mut self.state {
            Lazy::Open(stream) => Ok(stream),
            _ => Err(closed()),
        }
    }
}

impl Read for LazyInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.get()?.read(buf)
    }
}

impl Closeable for LazyInputStream {
    fn close(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.state, Lazy::Closed) {
            Lazy::Open(mut stream) => stream.close(),
            _ => Ok(()),
        }
    }
}

/// An output stream that is opened on first write.
///
/// Closing a stream that never wrote anything does not open the entry, so the
/// entry's content is left untouched.
pub struct LazyOutputStream {
    socket: SharedOutput,
    state: Lazy<Box<dyn OutputStream>>,
}

impl LazyOutputStream {
    pub fn new(socket: SharedOutput) -> Self {
        Self {
            socket,
            state: Lazy::Pending,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, Lazy::Open(_))
    }

    fn get(&mut self) -> io::Result<&mut Box<dyn OutputStream>> {
        if let Lazy::Pending = self.state {
            self.state = Lazy::Open(self.socket.stream(None)?);
        }
        match &mut self.state {
            Lazy::Open(stream) => Ok(stream),
            _ => Err(closed()),
        }
    }
}

impl Write for LazyOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.get()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            Lazy::Open(stream) => stream.flush(),
            Lazy::Pending => Ok(()),
            Lazy::Closed => Err(closed()),
        }
    }
}

impl Closeable for LazyOutputStream {
    fn close(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.state, Lazy::Closed) {
            Lazy::Open(mut stream) => stream.close(),
            _ => Ok(()),
        }
    }
}
