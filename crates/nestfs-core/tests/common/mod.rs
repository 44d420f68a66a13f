#![allow(dead_code)]

use nestfs_core::stream::ReadAdapter;
use nestfs_core::{
    BackingStore, Closeable, Entry, Error, InputSocket, InputStream, OutputSocket, OutputStream,
    Result, SharedInput, SharedOutput, Size,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Cursor, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    data: Mutex<HashMap<String, Vec<u8>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    syncs: AtomicUsize,
    broken: AtomicBool,
    busy: AtomicBool,
}

impl Inner {
    fn check(&self) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::other("backing store is broken")));
        }
        if self.busy.load(Ordering::SeqCst) {
            return Err(Error::busy("backing store is busy"));
        }
        Ok(())
    }
}

/// An in-memory backing store counting every stream it opens.
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Inner>,
}

impl MockStore {
    pub fn with(name: &str, content: &str) -> Self {
        let store = Self::default();
        store.put(name, content);
        store
    }

    pub fn put(&self, name: &str, content: &str) {
        self.inner
            .data
            .lock()
            .insert(name.to_string(), content.as_bytes().to_vec());
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.inner
            .data
            .lock()
            .get(name)
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    pub fn reads(&self) -> usize {
        self.inner.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn syncs(&self) -> usize {
        self.inner.syncs.load(Ordering::SeqCst)
    }

    pub fn set_broken(&self, broken: bool) {
        self.inner.broken.store(broken, Ordering::SeqCst);
    }

    pub fn set_busy(&self, busy: bool) {
        self.inner.busy.store(busy, Ordering::SeqCst);
    }

    pub fn input_socket(&self, name: &str) -> SharedInput {
        Arc::new(MockInput {
            inner: self.inner.clone(),
            name: name.to_string(),
        })
    }

    pub fn output_socket(&self, name: &str) -> SharedOutput {
        Arc::new(MockOutput {
            inner: self.inner.clone(),
            name: name.to_string(),
        })
    }
}

impl BackingStore for MockStore {
    fn input(&self, name: &str) -> Result<SharedInput> {
        Ok(self.input_socket(name))
    }

    fn output(&self, name: &str) -> Result<SharedOutput> {
        Ok(self.output_socket(name))
    }

    fn entries(&self) -> Result<Vec<Entry>> {
        self.inner.check()?;
        Ok(self
            .inner
            .data
            .lock()
            .iter()
            .map(|(name, data)| Entry::new(name.clone()).with_size(Size::Data, data.len() as u64))
            .collect())
    }

    fn sync(&self) -> Result<()> {
        self.inner.check()?;
        self.inner.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockInput {
    inner: Arc<Inner>,
    name: String,
}

impl InputSocket for MockInput {
    fn target(&self) -> Result<Entry> {
        self.inner.check()?;
        let data = self.inner.data.lock();
        let content = data
            .get(&self.name)
            .ok_or_else(|| Error::not_found(self.name.clone()))?;
        Ok(Entry::new(self.name.clone()).with_size(Size::Data, content.len() as u64))
    }

    fn stream(&self, _peer: Option<&dyn OutputSocket>) -> Result<Box<dyn InputStream>> {
        self.inner.check()?;
        let content = self
            .inner
            .data
            .lock()
            .get(&self.name)
            .cloned()
            .ok_or_else(|| Error::not_found(self.name.clone()))?;
        self.inner.reads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ReadAdapter::new(Cursor::new(content))))
    }
}

struct MockOutput {
    inner: Arc<Inner>,
    name: String,
}

impl OutputSocket for MockOutput {
    fn target(&self) -> Result<Entry> {
        self.inner.check()?;
        Ok(Entry::new(self.name.clone()))
    }

    fn stream(&self, _peer: Option<&dyn InputSocket>) -> Result<Box<dyn OutputStream>> {
        self.inner.check()?;
        self.inner.writes.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockWriter {
            inner: self.inner.clone(),
            name: self.name.clone(),
            buf: Some(Vec::new()),
        }))
    }
}

struct MockWriter {
    inner: Arc<Inner>,
    name: String,
    buf: Option<Vec<u8>>,
}

impl Write for MockWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.buf {
            Some(buf) => buf.write(data),
            None => Err(Error::StreamClosed.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Closeable for MockWriter {
    fn close(&mut self) -> io::Result<()> {
        if let Some(buf) = self.buf.take() {
            self.inner.data.lock().insert(self.name.clone(), buf);
        }
        Ok(())
    }
}
