use nestfs::nestfs_core::{
    BackingStore, Closeable, Error, MountPoint, Size, Strategy, SyncOptions,
};
use nestfs::{ArchiveLocation, BufferPoolKind, Config, NestFs, ZipStore};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::{write::FileOptions, ZipArchive, ZipWriter};

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options: FileOptions<()> =
        FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, data) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn create_test_archive(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();
    file.write_all(&zip_bytes(entries)).unwrap();
    path
}

fn read_archive<R: Read + std::io::Seek>(reader: R) -> BTreeMap<String, Vec<u8>> {
    let mut archive = ZipArchive::new(reader).unwrap();
    let mut entries = BTreeMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        entries.insert(file.name().to_string(), data);
    }
    entries
}

fn entry_path(archive: &Path, entry: &str) -> String {
    format!("{}!/{}", archive.display(), entry)
}

fn nestfs(max_mounted: usize) -> NestFs {
    NestFs::new(Config {
        max_mounted,
        ..Config::default()
    })
    .unwrap()
}

#[test]
fn reads_entries_of_an_archive() {
    let temp = TempDir::new().unwrap();
    let archive = create_test_archive(
        temp.path(),
        "test.zip",
        &[("readme.txt", b"hello"), ("data/config.toml", b"key = 1")],
    );
    let fs = nestfs(5);

    assert_eq!(fs.read(&entry_path(&archive, "readme.txt")).unwrap(), b"hello");
    assert_eq!(
        fs.read(&entry_path(&archive, "data/config.toml")).unwrap(),
        b"key = 1"
    );

    let entries = fs.entries(&MountPoint::new(archive.display().to_string())).unwrap();
    let names: Vec<_> = entries.iter().map(|entry| entry.name()).collect();
    assert_eq!(names, vec!["data/config.toml", "readme.txt"]);
    assert_eq!(entries[1].size(Size::Data), Some(5));
}

#[test]
fn missing_entries_and_bad_paths_are_reported() {
    let temp = TempDir::new().unwrap();
    let archive = create_test_archive(temp.path(), "test.zip", &[("readme.txt", b"hello")]);
    let fs = nestfs(5);

    let err = fs.read(&entry_path(&archive, "missing.txt")).unwrap_err();
    assert!(err.is_not_found());

    let err = fs.read("plain.txt").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = fs.read(&entry_path(&archive, "../escape.txt")).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[test]
fn write_back_reaches_the_archive_on_sync() {
    let temp = TempDir::new().unwrap();
    let archive = create_test_archive(temp.path(), "test.zip", &[("readme.txt", b"hello")]);
    let fs = nestfs(5);

    fs.write(&entry_path(&archive, "notes.txt"), b"remember").unwrap();
    fs.write(&entry_path(&archive, "readme.txt"), b"updated").unwrap();
    assert_eq!(fs.read(&entry_path(&archive, "notes.txt")).unwrap(), b"remember");

    let on_disk = read_archive(File::open(&archive).unwrap());
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk["readme.txt"], b"hello");

    fs.umount().unwrap();
    let on_disk = read_archive(File::open(&archive).unwrap());
    assert_eq!(on_disk["notes.txt"], b"remember");
    assert_eq!(on_disk["readme.txt"], b"updated");
    assert_eq!(fs.pool().size(), 0);
}

#[test]
fn missing_archives_are_created_on_sync() {
    let temp = TempDir::new().unwrap();
    let archive = temp.path().join("new.zip");
    let fs = nestfs(5);

    fs.write(&entry_path(&archive, "a.txt"), b"alpha").unwrap();
    assert!(!archive.exists());
    fs.sync(&SyncOptions::SYNC).unwrap();
    assert_eq!(read_archive(File::open(&archive).unwrap())["a.txt"], b"alpha");
}

#[test]
fn nested_archives_are_read_and_written_through_their_parents() {
    let temp = TempDir::new().unwrap();
    let inner = zip_bytes(&[("deep.txt", b"deep")]);
    let outer = create_test_archive(
        temp.path(),
        "outer.zip",
        &[("inner.zip", inner.as_slice()), ("top.txt", b"top")],
    );
    let fs = nestfs(5);
    let nested = format!("{}!/inner.zip", outer.display());

    assert_eq!(fs.read(&format!("{}!/deep.txt", nested)).unwrap(), b"deep");
    fs.write(&format!("{}!/new.txt", nested), b"fresh").unwrap();
    assert_eq!(fs.stats().total, 2);
    assert_eq!(fs.stats().top_level_total, 1);

    fs.umount().unwrap();

    let on_disk = read_archive(File::open(&outer).unwrap());
    assert_eq!(on_disk["top.txt"], b"top");
    let inner_entries = read_archive(Cursor::new(on_disk["inner.zip"].clone()));
    assert_eq!(inner_entries["deep.txt"], b"deep");
    assert_eq!(inner_entries["new.txt"], b"fresh");
}

#[test]
fn least_recently_used_archive_is_synced_when_the_limit_is_exceeded() {
    let temp = TempDir::new().unwrap();
    let a = create_test_archive(temp.path(), "a.zip", &[("a.txt", b"old")]);
    let b = create_test_archive(temp.path(), "b.zip", &[("b.txt", b"beta")]);
    let fs = nestfs(1);

    fs.write(&entry_path(&a, "a.txt"), b"new").unwrap();
    assert_eq!(fs.read(&entry_path(&b, "b.txt")).unwrap(), b"beta");
    assert_eq!(read_archive(File::open(&a).unwrap())["a.txt"], b"old");

    assert_eq!(fs.read(&entry_path(&b, "b.txt")).unwrap(), b"beta");
    assert_eq!(read_archive(File::open(&a).unwrap())["a.txt"], b"new");
    assert_eq!(fs.manager().mounted_count(), 1);
}

#[test]
fn parents_of_nested_archives_count_against_the_limit() {
    let temp = TempDir::new().unwrap();
    let inner = zip_bytes(&[("deep.txt", b"deep")]);
    let outer = create_test_archive(temp.path(), "outer.zip", &[("inner.zip", inner.as_slice())]);
    let c = create_test_archive(temp.path(), "c.zip", &[("c.txt", b"see")]);
    let fs = nestfs(1);

    let deep = format!("{}!/inner.zip!/deep.txt", outer.display());
    assert_eq!(fs.read(&deep).unwrap(), b"deep");
    for _ in 0..3 {
        assert_eq!(fs.read(&entry_path(&c, "c.txt")).unwrap(), b"see");
        assert!(fs.stats().active <= 1, "{:?}", fs.stats());
    }

    let stats = fs.stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.mounted, 1);
    assert_eq!(stats.queued_for_eviction, 0);
}

#[test]
fn evicting_a_nested_archive_reaches_the_disk() {
    let temp = TempDir::new().unwrap();
    let inner = zip_bytes(&[("deep.txt", b"deep")]);
    let outer = create_test_archive(temp.path(), "outer.zip", &[("inner.zip", inner.as_slice())]);
    let c = create_test_archive(temp.path(), "c.zip", &[("c.txt", b"see")]);
    let fs = nestfs(1);

    fs.write(&format!("{}!/inner.zip!/new.txt", outer.display()), b"fresh")
        .unwrap();
    for _ in 0..3 {
        fs.read(&entry_path(&c, "c.txt")).unwrap();
    }

    let on_disk = read_archive(File::open(&outer).unwrap());
    let inner_entries = read_archive(Cursor::new(on_disk["inner.zip"].clone()));
    assert_eq!(inner_entries["deep.txt"], b"deep");
    assert_eq!(inner_entries["new.txt"], b"fresh");
    assert_eq!(fs.stats().mounted, 1);
}

#[test]
fn lazy_streams_open_on_first_use() {
    let temp = TempDir::new().unwrap();
    let archive = create_test_archive(temp.path(), "test.zip", &[("readme.txt", b"hello")]);
    let fs = nestfs(5);
    let path = entry_path(&archive, "readme.txt");

    let mut untouched = fs.open_output(&path).unwrap();
    assert!(!untouched.is_open());
    untouched.close().unwrap();

    // An input that was never read does not hold the archive open.
    let mut input = fs.open_input(&path).unwrap();
    fs.umount().unwrap();
    let mut data = Vec::new();
    input.read_to_end(&mut data).unwrap();
    input.close().unwrap();
    assert_eq!(data, b"hello");

    fs.umount().unwrap();
    assert_eq!(read_archive(File::open(&archive).unwrap())["readme.txt"], b"hello");
}

#[test]
fn zip_store_allows_a_single_writer() {
    let temp = TempDir::new().unwrap();
    let archive = create_test_archive(temp.path(), "test.zip", &[("readme.txt", b"hello")]);
    let store = ZipStore::new(ArchiveLocation::File(archive.clone()));

    let mut first = store.output("x.txt").unwrap().stream(None).unwrap();
    let err = store.output("y.txt").unwrap().stream(None).err().unwrap();
    assert!(err.is_busy());

    first.write_all(b"x").unwrap();
    first.close().unwrap();
    assert_eq!(store.staged_count(), 1);

    let mut second = store.output("y.txt").unwrap().stream(None).unwrap();
    second.write_all(b"y").unwrap();
    second.close().unwrap();

    store.sync().unwrap();
    assert_eq!(store.staged_count(), 0);
    let on_disk = read_archive(File::open(&archive).unwrap());
    assert_eq!(on_disk.len(), 3);
    assert_eq!(on_disk["y.txt"], b"y");
}

#[test]
fn write_through_over_temp_file_buffers() {
    let temp = TempDir::new().unwrap();
    let buffers = TempDir::new().unwrap();
    let archive = create_test_archive(temp.path(), "test.zip", &[("readme.txt", b"hello")]);
    let fs = NestFs::new(Config {
        strategy: Strategy::WriteThrough,
        buffer_pool: BufferPoolKind::TempFile,
        temp_dir: Some(buffers.path().to_path_buf()),
        ..Config::default()
    })
    .unwrap();

    fs.write(&entry_path(&archive, "readme.txt"), b"through").unwrap();
    let store_entries = fs
        .entries(&MountPoint::new(archive.display().to_string()))
        .unwrap();
    assert_eq!(store_entries[0].size(Size::Data), Some(7));

    fs.sync(&SyncOptions::FLUSH).unwrap();
    assert_eq!(read_archive(File::open(&archive).unwrap())["readme.txt"], b"through");
    assert_eq!(fs.pool().size(), 1);

    fs.umount().unwrap();
    assert_eq!(fs.pool().size(), 0);
}

#[test]
fn stats_serialize_to_json() {
    let temp = TempDir::new().unwrap();
    let archive = create_test_archive(temp.path(), "test.zip", &[("readme.txt", b"hello")]);
    let fs = nestfs(3);
    fs.read(&entry_path(&archive, "readme.txt")).unwrap();

    let json = serde_json::to_value(fs.stats()).unwrap();
    assert_eq!(json["total"], 1);
    assert_eq!(json["mounted"], 1);
    assert_eq!(json["max-mounted"], 3);
}

#[test]
fn invalid_config_is_rejected() {
    let err = NestFs::new(Config {
        max_mounted: 0,
        ..Config::default()
    })
    .err()
    .unwrap();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
