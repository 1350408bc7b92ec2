//! Integration tests exercising the public API the way a caller (or the
//! `zippy` binary) actually would: through a real file on disk.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use tempfile::NamedTempFile;
use zippy::{Error, OpenMode, ZipArchive};

fn scratch_file() -> std::fs::File {
    let tmp = NamedTempFile::new().expect("create temp file");
    let (file, path) = tmp.keep().expect("persist temp file");
    // The file is only needed for its lifetime within this process; drop the
    // path so the OS cleans it up once the last handle closes.
    drop(path);
    file
}

fn write_entry<T: Read + Write + Seek>(archive: &mut ZipArchive<T>, name: &str, contents: &[u8]) {
    let mut entry = archive
        .entry(name, OpenMode::write(contents.len() as u64 + 64))
        .unwrap()
        .unwrap();
    entry.write_all(contents).unwrap();
    entry.close().unwrap();
}

fn read_entry<T: Read + Write + Seek>(archive: &mut ZipArchive<T>, name: &str) -> Vec<u8> {
    let mut entry = archive.entry(name, OpenMode::Read).unwrap().unwrap();
    let mut out = Vec::new();
    entry.read_to_end(&mut out).unwrap();
    out
}

#[test]
fn archive_survives_a_close_and_reopen_over_a_real_file() {
    let mut file = scratch_file();
    let mut archive = ZipArchive::create(file.try_clone().unwrap());
    write_entry(&mut archive, "greeting.txt", b"hello from disk");
    write_entry(&mut archive, "nested/dir/entry.bin", &[7u8; 4096]);
    archive.close().unwrap();
    drop(archive);

    file.seek(SeekFrom::Start(0)).unwrap();
    let mut reopened = ZipArchive::open(file).unwrap();
    assert_eq!(reopened.len(), 2);
    assert_eq!(read_entry(&mut reopened, "greeting.txt"), b"hello from disk");
    assert_eq!(read_entry(&mut reopened, "nested/dir/entry.bin"), vec![7u8; 4096]);
}

#[test]
fn removing_then_compacting_reclaims_space() {
    let mut file = scratch_file();
    let mut archive = ZipArchive::create(file.try_clone().unwrap());
    write_entry(&mut archive, "a.txt", &vec![b'a'; 8192]);
    write_entry(&mut archive, "b.txt", &vec![b'b'; 64]);
    archive.close().unwrap();

    let len_before = file.metadata().unwrap().len();
    assert!(archive.remove("a.txt").unwrap());
    archive.compact().unwrap();
    let len_after = file.metadata().unwrap().len();
    assert!(len_after < len_before);

    file.seek(SeekFrom::Start(0)).unwrap();
    let mut reopened = ZipArchive::open(file).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(read_entry(&mut reopened, "b.txt"), vec![b'b'; 64]);
}

#[test]
fn reading_an_entry_with_an_unsupported_compression_method_is_rejected() {
    // Hand-craft a minimal one-entry archive whose method is "Stored" (0),
    // which this crate's read path does not support.
    let mut file = scratch_file();
    let name = b"plain.txt";
    let data = b"not deflated";

    let lfh_offset = 0u32;
    let mut lfh = Vec::new();
    lfh.extend_from_slice(&0x0403_4B50u32.to_le_bytes());
    lfh.extend_from_slice(&20u16.to_le_bytes()); // version needed
    lfh.extend_from_slice(&0u16.to_le_bytes()); // flags
    lfh.extend_from_slice(&0u16.to_le_bytes()); // method = stored
    lfh.extend_from_slice(&0u32.to_le_bytes()); // mod time/date
    lfh.extend_from_slice(&0u32.to_le_bytes()); // crc32
    lfh.extend_from_slice(&(data.len() as u32).to_le_bytes()); // compressed size
    lfh.extend_from_slice(&(data.len() as u32).to_le_bytes()); // uncompressed size
    lfh.extend_from_slice(&(name.len() as u16).to_le_bytes());
    lfh.extend_from_slice(&0u16.to_le_bytes()); // extra len
    lfh.extend_from_slice(name);
    file.write_all(&lfh).unwrap();
    file.write_all(data).unwrap();

    let cd_offset = file.stream_position().unwrap() as u32;
    let mut cdh = Vec::new();
    cdh.extend_from_slice(&0x0201_4B50u32.to_le_bytes());
    cdh.extend_from_slice(&20u16.to_le_bytes()); // version made by
    cdh.extend_from_slice(&20u16.to_le_bytes()); // version needed
    cdh.extend_from_slice(&0u16.to_le_bytes()); // flags
    cdh.extend_from_slice(&0u16.to_le_bytes()); // method = stored
    cdh.extend_from_slice(&0u32.to_le_bytes()); // mod time/date
    cdh.extend_from_slice(&0u32.to_le_bytes()); // crc32
    cdh.extend_from_slice(&(data.len() as u32).to_le_bytes());
    cdh.extend_from_slice(&(data.len() as u32).to_le_bytes());
    cdh.extend_from_slice(&(name.len() as u16).to_le_bytes());
    cdh.extend_from_slice(&0u16.to_le_bytes()); // extra len
    cdh.extend_from_slice(&0u16.to_le_bytes()); // comment len
    cdh.extend_from_slice(&0u16.to_le_bytes()); // disk number start
    cdh.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
    cdh.extend_from_slice(&0u32.to_le_bytes()); // external attrs
    cdh.extend_from_slice(&lfh_offset.to_le_bytes());
    cdh.extend_from_slice(name);
    file.write_all(&cdh).unwrap();
    let cd_end = file.stream_position().unwrap() as u32;

    let mut eocd = Vec::new();
    eocd.extend_from_slice(&0x0605_4B50u32.to_le_bytes());
    eocd.extend_from_slice(&0u16.to_le_bytes());
    eocd.extend_from_slice(&0u16.to_le_bytes());
    eocd.extend_from_slice(&1u16.to_le_bytes());
    eocd.extend_from_slice(&1u16.to_le_bytes());
    eocd.extend_from_slice(&(cd_end - cd_offset).to_le_bytes());
    eocd.extend_from_slice(&cd_offset.to_le_bytes());
    eocd.extend_from_slice(&0u16.to_le_bytes());
    file.write_all(&eocd).unwrap();

    file.seek(SeekFrom::Start(0)).unwrap();
    let mut archive = ZipArchive::open(file).unwrap();
    let result = archive.entry("plain.txt", OpenMode::Read);
    assert!(matches!(result, Err(Error::UnsupportedMethod(0))));
}

#[test]
fn opening_a_non_archive_file_fails_cleanly() {
    let mut file = scratch_file();
    file.write_all(b"this is not a zip file, just some text").unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    let result = ZipArchive::open(file);
    assert!(matches!(result, Err(Error::OpenFailure(_))));
}

#[test]
fn opening_as_read_only_handle_still_works_via_options() {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(std::env::temp_dir().join(format!("zippy-test-{}.zip", std::process::id())))
        .unwrap();
    let mut archive = ZipArchive::create(file.try_clone().unwrap());
    write_entry(&mut archive, "only.txt", b"contents");
    archive.close().unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();

    let mut reopened = ZipArchive::open(file).unwrap();
    assert_eq!(read_entry(&mut reopened, "only.txt"), b"contents");
}
