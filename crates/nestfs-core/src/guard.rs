//! Accounting of the streams opened against one filesystem.
//!
//! A [`StreamGuard`] wraps sockets so that every stream or channel they open
//! is registered together with the opening thread. Synchronization uses the
//! guard to wait until other threads have closed their streams and to
//! force-close whatever is left.

use crate::socket::{InputSocket, OutputSocket, SharedInput, SharedOutput};
use crate::stream::{closed, Closeable, InputChannel, InputStream, OutputChannel, OutputStream};
use crate::{Entry, Error, Result};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Tracks open streams and can wait for or force their closing.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct StreamGuard {
    registry: Arc<Registry>,
}

impl StreamGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap `socket` so that every stream it opens is accounted for.
    pub fn input(&self, socket: SharedInput) -> SharedInput {
        Arc::new(GuardedInput {
            socket,
            registry: self.registry.clone(),
        })
    }

    /// Wrap `socket` so that every stream it opens is accounted for.
    pub fn output(&self, socket: SharedOutput) -> SharedOutput {
        Arc::new(GuardedOutput {
            socket,
            registry: self.registry.clone(),
        })
    }

    /// Block until every stream opened by another thread is closed.
    ///
    /// Gives up after `timeout_ms` milliseconds (zero waits indefinitely) or
    /// when [`interrupt`](Self::interrupt) is called. Returns the number of
    /// streams still open, including those of the calling thread.
    pub fn wait_close_all(&self, timeout_ms: u64) -> usize {
        let me = thread::current().id();
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        let mut state = self.registry.state.lock();
        let generation = state.interrupts;
        loop {
            state.purge();
            let foreign = state.count_foreign(me);
            if foreign == 0 {
                break;
            }
            if state.interrupts != generation {
                warn!(
                    "interrupted while waiting for {} stream(s) of other threads to close",
                    foreign
                );
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .registry
                        .changed
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        state.purge();
                        debug!("timed out waiting for {} stream(s) to close", foreign);
                        break;
                    }
                }
                None => self.registry.changed.wait(&mut state),
            }
        }
        state.streams.len()
    }

    /// Wake every thread blocked in [`wait_close_all`](Self::wait_close_all).
    pub fn interrupt(&self) {
        let mut state = self.registry.state.lock();
        state.interrupts = state.interrupts.wrapping_add(1);
        self.registry.changed.notify_all();
    }

    /// Force-close every registered stream.
    ///
    /// Streams cannot be registered while the sweep runs. Close failures are
    /// passed to `on_error` and the sweep continues. Returns the number of
    /// streams closed; later I/O on them fails with
    /// [`Error::StreamClosedBySync`].
    pub fn close_all<F: FnMut(io::Error)>(&self, mut on_error: F) -> usize {
        let victims: Vec<Weak<dyn Tracked>> = {
            let mut state = self.registry.state.lock();
            state.stopped = true;
            state.streams.drain().map(|(_, reg)| reg.stream).collect()
        };

        let mut count = 0;
        for victim in victims {
            let Some(stream) = victim.upgrade() else {
                continue;
            };
            match stream.force_close() {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(err) => {
                    count += 1;
                    on_error(err);
                }
            }
        }

        let mut state = self.registry.state.lock();
        state.stopped = false;
        self.registry.changed.notify_all();
        if count > 0 {
            debug!("force-closed {} stream(s)", count);
        }
        count
    }

    /// Number of streams currently open.
    pub fn open_streams(&self) -> usize {
        let mut state = self.registry.state.lock();
        state.purge();
        state.streams.len()
    }

    /// Number of streams opened by the calling thread that are still open.
    pub fn open_streams_by_current_thread(&self) -> usize {
        let me = thread::current().id();
        let mut state = self.registry.state.lock();
        state.purge();
        state.streams.values().filter(|reg| reg.owner == me).count()
    }
}

#[derive(Default)]
struct Registry {
    state: Mutex<RegistryState>,
    changed: Condvar,
}

#[derive(Default)]
struct RegistryState {
    streams: HashMap<u64, Registration>,
    next_id: u64,
    stopped: bool,
    interrupts: u64,
}

struct Registration {
    owner: ThreadId,
    stream: Weak<dyn Tracked>,
}

impl RegistryState {
    fn purge(&mut self) {
        self.streams.retain(|_, reg| reg.stream.strong_count() > 0);
    }

    fn count_foreign(&self, me: ThreadId) -> usize {
        self.streams.values().filter(|reg| reg.owner != me).count()
    }
}

impl Registry {
    fn check_running(&self) -> Result<()> {
        if self.state.lock().stopped {
            return Err(Error::busy("streams are being closed for synchronization"));
        }
        Ok(())
    }

    fn register<S>(self: &Arc<Self>, mut stream: S) -> Result<GuardedStream<S>>
    where
        S: Closeable + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.stopped {
            drop(state);
            if let Err(err) = stream.close() {
                debug!("failed to close rejected stream: {}", err);
            }
            return Err(Error::busy("streams are being closed for synchronization"));
        }
        state.purge();
        let id = state.next_id;
        state.next_id += 1;
        let core = Arc::new(Core {
            slot: Mutex::new(Slot::Open(stream)),
        });
        let weak: Weak<dyn Tracked> = Arc::downgrade(&core) as Weak<dyn Tracked>;
        state.streams.insert(
            id,
            Registration {
                owner: thread::current().id(),
                stream: weak,
            },
        );
        trace!("registered stream {}", id);
        Ok(GuardedStream {
            id,
            core,
            registry: self.clone(),
        })
    }

    fn unregister(&self, id: u64) {
        let mut state = self.state.lock();
        if state.streams.remove(&id).is_some() {
            trace!("unregistered stream {}", id);
        }
        self.changed.notify_all();
    }
}

trait Tracked: Send + Sync {
    /// Close the stream unless it is already closed. Returns `true` if it was open.
    fn force_close(&self) -> io::Result<bool>;
}

enum Slot<S> {
    Open(S),
    Closed,
    ClosedBySync,
}

struct Core<S> {
    slot: Mutex<Slot<S>>,
}

impl<S: Closeable + Send> Tracked for Core<S> {
    fn force_close(&self) -> io::Result<bool> {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Open(_)) {
            return Ok(false);
        }
        let Slot::Open(mut stream) = std::mem::replace(&mut *slot, Slot::ClosedBySync) else {
            return Ok(false);
        };
        drop(slot);
        stream.close().map(|()| true)
    }
}

/// A registered stream. Closing or dropping it unregisters it.
struct GuardedStream<S: Closeable> {
    id: u64,
    core: Arc<Core<S>>,
    registry: Arc<Registry>,
}

impl<S: Closeable> GuardedStream<S> {
    fn with<T>(&mut self, f: impl FnOnce(&mut S) -> io::Result<T>) -> io::Result<T> {
        match &mut *self.core.slot.lock() {
            Slot::Open(stream) => f(stream),
            Slot::Closed => Err(closed()),
            Slot::ClosedBySync => Err(Error::StreamClosedBySync.into()),
        }
    }

    fn take(&self) -> Option<S> {
        let mut slot = self.core.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Closed) {
            Slot::Open(stream) => Some(stream),
            Slot::Closed => None,
            Slot::ClosedBySync => {
                *slot = Slot::ClosedBySync;
                None
            }
        }
    }
}

impl<S: Closeable + Read> Read for GuardedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with(|stream| stream.read(buf))
    }
}

impl<S: Closeable + Write> Write for GuardedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with(|stream| stream.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with(|stream| stream.flush())
    }
}

impl<S: Closeable + Seek> Seek for GuardedStream<S> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.with(|stream| stream.seek(pos))
    }
}

impl<S: Closeable> Closeable for GuardedStream<S> {
    fn close(&mut self) -> io::Result<()> {
        let result = match self.take() {
            Some(mut stream) => stream.close(),
            None => Ok(()),
        };
        self.registry.unregister(self.id);
        result
    }
}

impl<S: Closeable> Drop for GuardedStream<S> {
    fn drop(&mut self) {
        if let Some(mut stream) = self.take() {
            debug!("closing abandoned stream {}", self.id);
            if let Err(err) = stream.close() {
                warn!("failed to close abandoned stream {}: {}", self.id, err);
            }
        }
        self.registry.unregister(self.id);
    }
}

struct GuardedInput {
    socket: SharedInput,
    registry: Arc<Registry>,
}

impl InputSocket for GuardedInput {
    fn target(&self) -> Result<Entry> {
        self.socket.target()
    }

    fn stream(&self, peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputStream>> {
        self.registry.check_running()?;
        let stream = self.socket.stream(peer)?;
        Ok(Box::new(self.registry.register(stream)?))
    }

    fn channel(&self, peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputChannel>> {
        self.registry.check_running()?;
        let channel = self.socket.channel(peer)?;
        Ok(Box::new(self.registry.register(channel)?))
    }
}

struct GuardedOutput {
    socket: SharedOutput,
    registry: Arc<Registry>,
}

impl OutputSocket for GuardedOutput {
    fn target(&self) -> Result<Entry> {
        self.socket.target()
    }

    fn stream(&self, peer: Option<&dyn InputSocket>) -> Result<Box<dyn OutputStream>> {
        self.registry.check_running()?;
        let stream = self.socket.stream(peer)?;
        Ok(Box::new(self.registry.register(stream)?))
    }

    fn channel(&self, peer: Option<&dyn InputSocket>) -> Result<Box<dyn OutputChannel>> {
        self.registry.check_running()?;
        let channel = self.socket.channel(peer)?;
        Ok(Box::new(self.registry.register(channel)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{ReadAdapter, WriteAdapter};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Text;

    impl InputSocket for Text {
        fn target(&self) -> Result<Entry> {
            Ok(Entry::new("text"))
        }

        fn stream(&self, _peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputStream>> {
            Ok(Box::new(ReadAdapter::new(Cursor::new(b"hello".to_vec()))))
        }

        fn channel(&self, _peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputChannel>> {
            Ok(Box::new(ReadAdapter::new(Cursor::new(b"hello".to_vec()))))
        }
    }

    struct FailingClose(Arc<AtomicUsize>);

    impl Write for FailingClose {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Closeable for FailingClose {
        fn close(&mut self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::other("disk full"))
        }
    }

    struct Sink(Arc<AtomicUsize>);

    impl OutputSocket for Sink {
        fn target(&self) -> Result<Entry> {
            Ok(Entry::new("sink"))
        }

        fn stream(&self, _peer: Option<&dyn InputSocket>) -> Result<Box<dyn OutputStream>> {
            Ok(Box::new(FailingClose(self.0.clone())))
        }
    }

    #[test]
    fn forced_close_poisons_further_io_but_not_close() {
        let guard = StreamGuard::new();
        let input = guard.input(Arc::new(Text));
        let mut stream = input.stream(None).unwrap();
        let mut channel = input.channel(None).unwrap();
        assert_eq!(guard.open_streams(), 2);

        assert_eq!(guard.close_all(|err| panic!("unexpected {}", err)), 2);
        assert_eq!(guard.open_streams(), 0);

        let err = stream.read(&mut [0u8; 4]).unwrap_err();
        assert!(Error::is_closed_by_sync(&err));
        let err = channel.seek(SeekFrom::Start(1)).unwrap_err();
        assert!(Error::is_closed_by_sync(&err));
        stream.close().unwrap();
        channel.close().unwrap();
    }

    #[test]
    fn close_all_is_idempotent_and_reports_failures() {
        let closes = Arc::new(AtomicUsize::new(0));
        let guard = StreamGuard::new();
        let output = guard.output(Arc::new(Sink(closes.clone())));
        let _stream = output.stream(None).unwrap();

        let mut errors = Vec::new();
        assert_eq!(guard.close_all(|err| errors.push(err.to_string())), 1);
        assert_eq!(errors, vec!["disk full".to_string()]);
        assert_eq!(guard.close_all(|_| {}), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registration_is_refused_while_stopped() {
        let guard = StreamGuard::new();
        guard.registry.state.lock().stopped = true;
        let err = guard.input(Arc::new(Text)).stream(None).err().unwrap();
        assert!(err.is_busy());
        guard.registry.state.lock().stopped = false;
        assert!(guard.input(Arc::new(Text)).stream(None).is_ok());
    }

    #[test]
    fn dropped_streams_are_closed_and_unregistered() {
        let closes = Arc::new(AtomicUsize::new(0));
        let guard = StreamGuard::new();
        let stream = guard.output(Arc::new(Sink(closes.clone()))).stream(None).unwrap();
        assert_eq!(guard.open_streams_by_current_thread(), 1);
        drop(stream);
        assert_eq!(guard.open_streams(), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiting_ignores_streams_of_the_calling_thread() {
        let guard = StreamGuard::new();
        let _mine = guard.input(Arc::new(Text)).stream(None).unwrap();
        assert_eq!(guard.wait_close_all(0), 1);
    }

    #[test]
    fn waiting_returns_when_other_threads_close() {
        let guard = StreamGuard::new();
        let (opened_tx, opened_rx) = std::sync::mpsc::channel();
        let worker = {
            let guard = guard.clone();
            thread::spawn(move || {
                let mut stream = guard.input(Arc::new(Text)).stream(None).unwrap();
                opened_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                stream.close().unwrap();
            })
        };
        opened_rx.recv().unwrap();
        assert_eq!(guard.wait_close_all(0), 0);
        worker.join().unwrap();
    }

    #[test]
    fn waiting_times_out_or_can_be_interrupted() {
        let guard = StreamGuard::new();
        let (opened_tx, opened_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let worker = {
            let guard = guard.clone();
            thread::spawn(move || {
                let _stream = guard.input(Arc::new(Text)).stream(None).unwrap();
                opened_tx.send(()).unwrap();
                let _ = done_rx.recv();
            })
        };
        opened_rx.recv().unwrap();
        assert_eq!(guard.wait_close_all(20), 1);

        let interrupter = {
            let guard = guard.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                guard.interrupt();
            })
        };
        let started = Instant::now();
        assert_eq!(guard.wait_close_all(10_000), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        interrupter.join().unwrap();

        drop(done_tx);
        worker.join().unwrap();
        assert_eq!(guard.open_streams(), 0);
    }

    #[test]
    fn io_through_guarded_streams() {
        let guard = StreamGuard::new();
        let mut stream = guard.input(Arc::new(Text)).stream(None).unwrap();
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert_eq!(text, "hello");
        stream.close().unwrap();
        assert!(stream.read(&mut [0u8; 1]).is_err());

        struct Plain;
        impl OutputSocket for Plain {
            fn target(&self) -> Result<Entry> {
                Ok(Entry::new("plain"))
            }
            fn stream(&self, _peer: Option<&dyn InputSocket>) -> Result<Box<dyn OutputStream>> {
                Ok(Box::new(WriteAdapter::new(Vec::new())))
            }
        }
        let mut out = guard.output(Arc::new(Plain)).stream(None).unwrap();
        out.write_all(b"x").unwrap();
        out.close().unwrap();
        assert_eq!(guard.open_streams(), 0);
    }
}
