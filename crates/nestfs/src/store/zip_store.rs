use log::{debug, trace};
use nestfs_core::stream::ReadAdapter;
use nestfs_core::{
    BackingStore, Closeable, Controller, Entry, InputSocket, InputStream, OutputSocket,
    OutputStream, SharedInput, SharedOutput, Size,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Debug, thiserror::Error)]
pub enum ZipStoreError {
    #[error("invalid entry path: {0}")]
    InvalidPath(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Zip(#[from] ZipError),
}

pub type ZipStoreResult<T> = Result<T, ZipStoreError>;

impl From<ZipStoreError> for nestfs_core::Error {
    fn from(err: ZipStoreError) -> Self {
        match err {
            ZipStoreError::InvalidPath(path) => {
                nestfs_core::Error::InvalidArgument(format!("invalid entry path: {}", path))
            }
            ZipStoreError::Io(err) => nestfs_core::Error::from(err),
            ZipStoreError::Zip(ZipError::FileNotFound) => {
                nestfs_core::Error::not_found("entry is not in the archive")
            }
            ZipStoreError::Zip(ZipError::Io(err)) => nestfs_core::Error::from(err),
            ZipStoreError::Zip(err) => {
                nestfs_core::Error::Io(io::Error::new(io::ErrorKind::InvalidData, err))
            }
        }
    }
}

/// Where the bytes of an archive live.
#[derive(Clone)]
pub enum ArchiveLocation {
    /// A file on disk.
    File(PathBuf),
    /// An entry of another archive, accessed through its controller.
    Entry {
        parent: Arc<dyn Controller>,
        name: String,
    },
}

impl fmt::Debug for ArchiveLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveLocation::File(path) => f.debug_tuple("File").field(path).finish(),
            ArchiveLocation::Entry { parent, name } => f
                .debug_struct("Entry")
                .field("parent", &parent.mount_point().as_str())
                .field("name", name)
                .finish(),
        }
    }
}

enum Source {
    File(File),
    Memory(Cursor<Vec<u8>>),
}

impl Read for Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Source::File(file) => file.read(buf),
            Source::Memory(cursor) => cursor.read(buf),
        }
    }
}

impl Seek for Source {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        match self {
            Source::File(file) => file.seek(pos),
            Source::Memory(cursor) => cursor.seek(pos),
        }
    }
}

impl ArchiveLocation {
    /// Open the archive, or `None` if it does not exist yet.
    fn open(&self) -> nestfs_core::Result<Option<ZipArchive<Source>>> {
        let source = match self {
            ArchiveLocation::File(path) => match File::open(path) {
                Ok(file) => Source::File(file),
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err.into()),
            },
            ArchiveLocation::Entry { parent, name } => {
                let mut data = Vec::new();
                let opened = parent.input(name).and_then(|input| input.stream(None));
                let mut stream = match opened {
                    Ok(stream) => stream,
                    Err(err) if err.is_not_found() => return Ok(None),
                    Err(err) => return Err(err),
                };
                stream.read_to_end(&mut data)?;
                stream.close()?;
                Source::Memory(Cursor::new(data))
            }
        };
        let archive = ZipArchive::new(source).map_err(ZipStoreError::from)?;
        Ok(Some(archive))
    }

    /// Replace the archive with the bytes produced by `write`.
    fn replace<F>(&self, write: F) -> nestfs_core::Result<()>
    where
        F: FnOnce(&mut dyn WriteSeek) -> ZipStoreResult<()>,
    {
        match self {
            ArchiveLocation::File(path) => {
                let parent = match path.parent() {
                    Some(dir) if !dir.as_os_str().is_empty() => dir,
                    _ => Path::new("."),
                };
                let mut temp = tempfile::Builder::new()
                    .prefix(".tmp.nestfs-")
                    .suffix(".zip")
                    .tempfile_in(parent)?;
                write(temp.as_file_mut())?;
                persist_tempfile(temp, path)?;
            }
            ArchiveLocation::Entry { parent, name } => {
                let mut buffer = Cursor::new(Vec::new());
                write(&mut buffer)?;
                let mut stream = parent.output(name)?.stream(None)?;
                stream.write_all(buffer.get_ref())?;
                stream.close()?;
            }
        }
        Ok(())
    }
}

trait WriteSeek: Write + Seek {}

impl<T: Write + Seek> WriteSeek for T {}

#[derive(Default)]
struct StoreState {
    staged: BTreeMap<String, Arc<Vec<u8>>>,
    writing: bool,
}

/// A ZIP archive served entry by entry.
///
/// Writes are staged in memory and applied by [`BackingStore::sync`], which
/// rewrites the whole archive. Only one output stream may be open at a time.
#[derive(Clone)]
pub struct ZipStore {
    location: ArchiveLocation,
    state: Arc<Mutex<StoreState>>,
}

impl ZipStore {
    pub fn new(location: ArchiveLocation) -> Self {
        Self {
            location,
            state: Arc::default(),
        }
    }

    pub fn location(&self) -> &ArchiveLocation {
        &self.location
    }

    /// Number of entries written but not yet applied to the archive.
    pub fn staged_count(&self) -> usize {
        self.state.lock().staged.len()
    }

    fn socket(&self, name: &str) -> nestfs_core::Result<ZipSocket> {
        Ok(ZipSocket {
            store: self.clone(),
            name: normalize_entry_name(name)?,
        })
    }
}

impl BackingStore for ZipStore {
    fn input(&self, name: &str) -> nestfs_core::Result<SharedInput> {
        Ok(Arc::new(self.socket(name)?))
    }

    fn output(&self, name: &str) -> nestfs_core::Result<SharedOutput> {
        Ok(Arc::new(self.socket(name)?))
    }

    fn entries(&self) -> nestfs_core::Result<Vec<Entry>> {
        let mut entries = BTreeMap::new();
        if let Some(mut archive) = self.location.open()? {
            for i in 0..archive.len() {
                let file = archive.by_index(i).map_err(ZipStoreError::from)?;
                if file.is_dir() {
                    continue;
                }
                let entry = Entry::new(file.name())
                    .with_size(Size::Data, file.size())
                    .with_size(Size::Storage, file.compressed_size());
                entries.insert(file.name().to_string(), entry);
            }
        }
        for (name, data) in &self.state.lock().staged {
            let mut entry = Entry::new(name.clone()).with_size(Size::Data, data.len() as u64);
            entry.set_size(Size::Storage, None);
            entries.insert(name.clone(), entry);
        }
        Ok(entries.into_values().collect())
    }

    fn sync(&self) -> nestfs_core::Result<()> {
        let mut state = self.state.lock();
        if state.staged.is_empty() {
            return Ok(());
        }
        let existing = self.location.open()?;
        self.location
            .replace(|writer| write_updated_archive(writer, existing, &state.staged))?;
        debug!(
            "applied {} staged entr(ies) to {:?}",
            state.staged.len(),
            self.location
        );
        state.staged.clear();
        Ok(())
    }
}

struct ZipSocket {
    store: ZipStore,
    name: String,
}

impl ZipSocket {
    fn read_entry(&self) -> nestfs_core::Result<Vec<u8>> {
        if let Some(data) = self.store.state.lock().staged.get(&self.name) {
            return Ok(data.to_vec());
        }
        let mut archive = self
            .store
            .location
            .open()?
            .ok_or_else(|| nestfs_core::Error::not_found(self.name.clone()))?;
        let mut file = match archive.by_name(&self.name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => {
                return Err(nestfs_core::Error::not_found(self.name.clone()))
            }
            Err(err) => return Err(ZipStoreError::from(err).into()),
        };
        let mut data = Vec::with_capacity(usize::try_from(file.size()).unwrap_or(0));
        file.read_to_end(&mut data)?;
        Ok(data)
    }
}

impl InputSocket for ZipSocket {
    fn target(&self) -> nestfs_core::Result<Entry> {
        if let Some(data) = self.store.state.lock().staged.get(&self.name) {
            return Ok(Entry::new(self.name.clone()).with_size(Size::Data, data.len() as u64));
        }
        let mut archive = self
            .store
            .location
            .open()?
            .ok_or_else(|| nestfs_core::Error::not_found(self.name.clone()))?;
        let file = match archive.by_name(&self.name) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => {
                return Err(nestfs_core::Error::not_found(self.name.clone()))
            }
            Err(err) => return Err(ZipStoreError::from(err).into()),
        };
        Ok(Entry::new(self.name.clone())
            .with_size(Size::Data, file.size())
            .with_size(Size::Storage, file.compressed_size()))
    }

    fn stream(&self, _peer: Option<&dyn OutputSocket>) -> nestfs_core::Result<Box<dyn InputStream>> {
        let data = self.read_entry()?;
        trace!("reading {} ({} bytes)", self.name, data.len());
        Ok(Box::new(ReadAdapter::new(Cursor::new(data))))
    }
}

impl OutputSocket for ZipSocket {
    fn target(&self) -> nestfs_core::Result<Entry> {
        InputSocket::target(self).or_else(|err| {
            if err.is_not_found() {
                Ok(Entry::new(self.name.clone()))
            } else {
                Err(err)
            }
        })
    }

    fn stream(&self, _peer: Option<&dyn InputSocket>) -> nestfs_core::Result<Box<dyn OutputStream>> {
        let mut state = self.store.state.lock();
        if state.writing {
            return Err(nestfs_core::Error::busy(format!(
                "another entry of {:?} is being written",
                self.store.location
            )));
        }
        state.writing = true;
        Ok(Box::new(StagingWriter {
            state: self.store.state.clone(),
            name: self.name.clone(),
            buf: Some(Vec::new()),
        }))
    }
}

/// Collects an entry's new content and stages it on close.
struct StagingWriter {
    state: Arc<Mutex<StoreState>>,
    name: String,
    buf: Option<Vec<u8>>,
}

impl Write for StagingWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.buf {
            Some(buf) => buf.write(data),
            None => Err(nestfs_core::Error::StreamClosed.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Closeable for StagingWriter {
    fn close(&mut self) -> io::Result<()> {
        if let Some(buf) = self.buf.take() {
            let mut state = self.state.lock();
            trace!("staged {} ({} bytes)", self.name, buf.len());
            state.staged.insert(self.name.clone(), Arc::new(buf));
            state.writing = false;
        }
        Ok(())
    }
}

impl Drop for StagingWriter {
    fn drop(&mut self) {
        if self.buf.take().is_some() {
            debug!("discarding unclosed write to {}", self.name);
            self.state.lock().writing = false;
        }
    }
}

fn write_updated_archive(
    writer: &mut dyn WriteSeek,
    existing: Option<ZipArchive<Source>>,
    staged: &BTreeMap<String, Arc<Vec<u8>>>,
) -> ZipStoreResult<()> {
    let mut zip = ZipWriter::new(writer);

    if let Some(mut archive) = existing {
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            let name = file.name().to_string();
            if staged.contains_key(&name) {
                continue;
            }

            let options: FileOptions<()> =
                FileOptions::default().compression_method(file.compression());
            if file.is_dir() {
                zip.add_directory(name.as_str(), options)?;
                continue;
            }
            zip.start_file(name.as_str(), options)?;
            io::copy(&mut file, &mut zip)?;
        }
    }

    let staged_options: FileOptions<()> =
        FileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, data) in staged {
        zip.start_file(name.as_str(), staged_options)?;
        zip.write_all(data)?;
    }

    zip.finish()?;
    Ok(())
}

fn persist_tempfile(temp: NamedTempFile, final_path: &Path) -> ZipStoreResult<()> {
    temp.persist(final_path)
        .map(|_| ())
        .map_err(|err| ZipStoreError::Io(err.error))
}

fn normalize_entry_name(name: &str) -> ZipStoreResult<String> {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        return Err(ZipStoreError::InvalidPath(name.to_string()));
    }

    for component in Path::new(trimmed).components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ZipStoreError::InvalidPath(name.to_string()));
            }
            _ => {}
        }
    }

    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_names_are_normalized() {
        assert_eq!(normalize_entry_name("/dir/file.txt").unwrap(), "dir/file.txt");
        assert!(matches!(
            normalize_entry_name("../escape"),
            Err(ZipStoreError::InvalidPath(_))
        ));
        assert!(normalize_entry_name("dir/").is_err());
        assert!(normalize_entry_name("").is_err());
    }

    #[test]
    fn missing_zip_entries_map_to_not_found() {
        let err: nestfs_core::Error = ZipStoreError::Zip(ZipError::FileNotFound).into();
        assert!(err.is_not_found());

        let err: nestfs_core::Error = ZipStoreError::InvalidPath("..".into()).into();
        assert!(matches!(err, nestfs_core::Error::InvalidArgument(_)));
    }
}
