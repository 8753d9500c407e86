use std::fs;
use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::fs_buf::tests::{all_paths, record_bytes, sample_buf};
use crate::fs_buf::{Error, FsBuf, DEFAULT_CAPACITY, MAGIC, VERSION};

#[test]
fn test_save_load_roundtrip_is_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("t.lft");

    let buf = sample_buf();
    buf.save(&file).unwrap();
    let loaded = FsBuf::load(&file).unwrap();

    assert_eq!(loaded.root_path(), buf.root_path());
    assert_eq!(loaded.tail(), buf.tail());
    assert_eq!(loaded.first_name(), buf.first_name());
    assert_eq!(record_bytes(&loaded), record_bytes(&buf));
    assert_eq!(all_paths(&loaded), all_paths(&buf));
}

#[test]
fn test_load_allocates_at_least_the_default_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("t.lft");
    sample_buf().save(&file).unwrap();
    let loaded = FsBuf::load(&file).unwrap();
    assert_eq!(loaded.capacity(), DEFAULT_CAPACITY as usize);
}

#[test]
fn test_empty_tree_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("empty.lft");
    let buf = FsBuf::new(1024, b"/mnt/empty").unwrap();
    buf.save(&file).unwrap();

    // An empty filesystem is a valid index, not a corrupt one.
    let loaded = FsBuf::load(&file).unwrap();
    assert!(loaded.is_empty());
    assert_eq!(loaded.root_path(), b"/mnt/empty");
}

#[test]
fn test_save_leaves_no_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("t.lft");
    sample_buf().save(&file).unwrap();
    let names: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names, vec!["t.lft"]);
}

#[test]
fn test_load_rejects_bad_magic() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("bad.lft");
    fs::write(&file, b"not an index file at all").unwrap();
    assert!(matches!(FsBuf::load(&file), Err(Error::BadMagic)));
}

#[test]
fn test_load_rejects_version_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("vers.lft");
    let mut data = Vec::new();
    data.write_u32::<LittleEndian>(MAGIC).unwrap();
    data.write_u32::<LittleEndian>(VERSION + 1).unwrap();
    data.write_u32::<LittleEndian>(2).unwrap();
    data.write_all(b"/r").unwrap();
    data.write_u32::<LittleEndian>(3).unwrap();
    fs::write(&file, &data).unwrap();
    assert!(matches!(FsBuf::load(&file), Err(Error::VersionMismatch)));
}

#[test]
fn test_load_rejects_truncated_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("trunc.lft");
    sample_buf().save(&file).unwrap();
    let full = fs::read(&file).unwrap();
    fs::write(&file, &full[..full.len() - 5]).unwrap();
    assert!(matches!(FsBuf::load(&file), Err(Error::Truncated)));
}

#[test]
fn test_load_rejects_header_only_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("header.lft");
    let mut data = Vec::new();
    data.write_u32::<LittleEndian>(MAGIC).unwrap();
    fs::write(&file, &data).unwrap();
    assert!(matches!(FsBuf::load(&file), Err(Error::Truncated)));
}

#[test]
fn test_load_missing_file_is_io() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(FsBuf::load(&dir.path().join("absent.lft")), Err(Error::Io(_))));
}

#[test]
fn test_mutations_survive_a_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("t.lft");

    let mut buf = sample_buf();
    buf.insert_path(b"/tmp/t/sub/late.txt", false).unwrap();
    buf.remove_path(b"/tmp/t/b.txt", 10).unwrap();
    buf.save(&file).unwrap();

    let loaded = FsBuf::load(&file).unwrap();
    assert_eq!(all_paths(&loaded), all_paths(&buf));
    // And the reloaded tree stays mutable.
    let mut loaded = loaded;
    loaded.insert_path(b"/tmp/t/post.txt", false).unwrap();
    assert!(all_paths(&loaded).contains(&"/tmp/t/post.txt".to_string()));
}
