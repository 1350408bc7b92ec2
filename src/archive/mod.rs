//! Random-access ZIP32 archive: directory scanning, gap-allocated entry
//! creation and lazy central-directory persistence.

mod gap;
mod index;
pub mod record;

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::ManuallyDrop;

use flate2::Compression;
use log::{debug, warn};

use crate::codec::{Mode as CodecMode, Options as CodecOptions, ZStream};
use crate::entry::Entry;
use crate::error::{Error, Result};
use index::DirectoryIndex;
use record::{
    encode_dos, DirectoryRecord, EndOfCentralDir, LocalFileHeader, Timestamp,
    CENTRAL_FILE_HEADER_SIGNATURE, END_OF_CENTRAL_DIR_SIGNATURE, LFH_SIZE,
};

const VERSION_NEEDED_TO_EXTRACT: u16 = 20;
const VERSION_MADE_BY: u16 = 20;
/// General purpose bit 11: file name and comment are UTF-8, which every
/// `String` name/comment this crate writes already is.
const UTF8_NAME_FLAG: u16 = 0x0800;
const DEFLATE_METHOD: u16 = 8;
const ENHANCED_DEFLATE_METHOD: u16 = 9;

/// Width of the backward signature-search window, and how much consecutive
/// windows overlap so a signature straddling a window boundary is never missed.
const SEARCH_WINDOW: u64 = 32;
const SEARCH_OVERLAP: u64 = 3;

/// Backing stores that can shrink. Only [`ZipArchive::close`] and
/// [`ZipArchive::compact`] need this — every other operation works over any
/// `Read + Write + Seek` store, including a fixed-size `Cursor<&mut [u8]>`
/// that can't be truncated at all.
pub trait Truncate {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;
}

impl Truncate for std::fs::File {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

impl Truncate for std::io::Cursor<Vec<u8>> {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.get_mut().truncate(len as usize);
        Ok(())
    }
}

/// Requests a read-mode or write-mode entry handle from [`ZipArchive::entry`].
pub enum OpenMode {
    /// Open an existing entry for decompression.
    Read,
    /// Create (or replace) an entry for compression.
    Write {
        /// Upper bound on the compressed payload size; reserves this much
        /// space when choosing where to place the entry.
        declared_size: u64,
        /// DEFLATE compression level.
        level: Compression,
        /// Modification timestamp to store; defaults to the DOS epoch if omitted.
        timestamp: Option<Timestamp>,
    },
}

impl OpenMode {
    /// Convenience constructor for the common write case at default compression.
    pub fn write(declared_size: u64) -> Self {
        OpenMode::Write {
            declared_size,
            level: Compression::default(),
            timestamp: None,
        }
    }
}

fn find_signature_backward<T: Read + Seek>(io: &mut T, signature: u32, search_end: u64) -> std::io::Result<Option<u64>> {
    let mut pos = search_end;
    loop {
        if pos == 0 {
            return Ok(None);
        }
        let read_len = SEARCH_WINDOW.min(pos);
        let window_start = pos - read_len;
        io.seek(SeekFrom::Start(window_start))?;
        let mut buf = vec![0u8; read_len as usize];
        io.read_exact(&mut buf)?;

        if read_len >= 4 {
            for i in (0..=(read_len as usize - 4)).rev() {
                let word = u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
                if word == signature {
                    return Ok(Some(window_start + i as u64));
                }
            }
        }

        if window_start == 0 {
            return Ok(None);
        }
        pos = window_start + SEARCH_OVERLAP;
    }
}

/// A ZIP32 archive opened over a seekable backing store, indexed for
/// random-access reads, gap-allocated writes and in-place replacement.
pub struct ZipArchive<T> {
    io: T,
    eocd: EndOfCentralDir,
    index: DirectoryIndex,
    open_entries: HashSet<usize>,
    archive_len: u64,
    dirty: bool,
}

impl<T: Read + Write + Seek> ZipArchive<T> {
    /// Scans `io` for the End-Of-Central-Directory record and loads the
    /// central directory it points to.
    pub fn open(mut io: T) -> Result<Self> {
        let archive_len = io
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::OpenFailure(e.to_string()))?;

        let eocd_pos = find_signature_backward(&mut io, END_OF_CENTRAL_DIR_SIGNATURE, archive_len)
            .map_err(|e| Error::OpenFailure(e.to_string()))?
            .ok_or_else(|| {
                let err = "no End-Of-Central-Directory record found".to_string();
                warn!("{err}");
                err
            })
            .map_err(Error::OpenFailure)?;

        io.seek(SeekFrom::Start(eocd_pos + 4))
            .map_err(|e| Error::OpenFailure(e.to_string()))?;
        let eocd = EndOfCentralDir::read(&mut io).map_err(|e| Error::OpenFailure(e.to_string()))?;

        io.seek(SeekFrom::Start(eocd.cd_offset as u64))
            .map_err(|e| Error::OpenFailure(e.to_string()))?;
        let mut index = DirectoryIndex::new();
        for _ in 0..eocd.cd_records_total {
            let mut sig_buf = [0u8; 4];
            io.read_exact(&mut sig_buf)
                .map_err(|e| Error::OpenFailure(e.to_string()))?;
            if u32::from_le_bytes(sig_buf) != CENTRAL_FILE_HEADER_SIGNATURE {
                let err = "central directory file header has a bad signature".to_string();
                warn!("{err}");
                return Err(Error::OpenFailure(err));
            }
            let record = DirectoryRecord::read(&mut io).map_err(|e| Error::OpenFailure(e.to_string()))?;
            if index.find_by_name(&record.file_name).is_some() {
                let err = format!("duplicate entry name {:?} in central directory", record.file_name);
                warn!("{err}");
                return Err(Error::OpenFailure(err));
            }
            index.insert(record);
        }

        debug!("opened archive with {} entries", index.len());
        Ok(Self {
            io,
            eocd,
            index,
            open_entries: HashSet::new(),
            archive_len,
            dirty: false,
        })
    }

    /// Creates an empty archive over `io` (which need not contain anything yet).
    pub fn create(io: T) -> Self {
        Self {
            io,
            eocd: EndOfCentralDir::default(),
            index: DirectoryIndex::new(),
            open_entries: HashSet::new(),
            archive_len: 0,
            dirty: true,
        }
    }

    /// Entry names, in lexicographic order.
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.index.names_sorted()
    }

    /// Number of entries currently in the directory.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The archive-level comment stored in the EOCD record.
    pub fn comment(&self) -> &[u8] {
        &self.eocd.comment
    }

    pub fn set_comment(&mut self, comment: Vec<u8>) {
        self.eocd.comment = comment;
        self.dirty = true;
    }

    /// Opens an entry by name for reading or writing.
    ///
    /// Returns `Ok(None)` if `mode` is [`OpenMode::Read`] and no entry by
    /// that name exists. A write request for a name that is already open
    /// latches [`Error::AlreadyOpen`]; otherwise any existing entry of that
    /// name is replaced.
    pub fn entry<'a>(&'a mut self, name: &str, mode: OpenMode) -> Result<Option<Entry<'a, T>>> {
        match mode {
            OpenMode::Read => self.open_for_read(name),
            OpenMode::Write { declared_size, level, timestamp } => {
                self.open_for_write(name, declared_size, level, timestamp)
            }
        }
    }

    fn open_for_read<'a>(&'a mut self, name: &str) -> Result<Option<Entry<'a, T>>> {
        let idx = match self.index.find_by_name(name) {
            Some(idx) => idx,
            None => return Ok(None),
        };

        let (method, data_offset, compressed_size, uncompressed_size) = {
            let record = self.index.get(idx).expect("idx just looked up");
            (
                record.compression_method,
                record.data_offset(),
                record.compressed_size as u64,
                record.uncompressed_size as u64,
            )
        };
        if method != DEFLATE_METHOD && method != ENHANCED_DEFLATE_METHOD {
            let err = Error::UnsupportedMethod(method);
            warn!("{err}");
            return Err(err);
        }

        self.open_entries.insert(idx);
        let zstream = ZStream::open(
            &mut self.io,
            CodecMode::Read,
            data_offset,
            compressed_size,
            uncompressed_size,
            CodecOptions::default(),
        )?;
        Ok(Some(Entry::new_read(
            &mut self.open_entries,
            idx,
            zstream,
            self.index.get_mut(idx).expect("idx just looked up"),
        )))
    }

    fn open_for_write<'a>(
        &'a mut self,
        name: &str,
        declared_size: u64,
        level: Compression,
        timestamp: Option<Timestamp>,
    ) -> Result<Option<Entry<'a, T>>> {
        if let Some(existing) = self.index.find_by_name(name) {
            if self.open_entries.contains(&existing) {
                let err = Error::AlreadyOpen(name.to_string());
                warn!("{err}");
                return Err(err);
            }
            self.index.remove_by_name(name);
        }

        let required = LFH_SIZE + name.len() as u64 + declared_size;
        let gap_start = gap::find_gap(&self.index, required);

        let record = DirectoryRecord {
            version_made_by: VERSION_MADE_BY,
            version_needed: VERSION_NEEDED_TO_EXTRACT,
            flags: UTF8_NAME_FLAG,
            compression_method: DEFLATE_METHOD,
            mod_time_dos: encode_dos(timestamp.unwrap_or(Timestamp {
                year: 1980,
                month: 0,
                day: 1,
                hour: 0,
                minute: 0,
                second: 0,
            })),
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            disk_number_start: 0,
            internal_attributes: 0,
            external_attributes: 0,
            relative_offset: u32::try_from(gap_start).map_err(|_| {
                Error::BadConfig("archive has grown past the 4 GiB ZIP32 offset limit")
            })?,
            file_name: name.to_string(),
            extra_field: Vec::new(),
            comment: String::new(),
        };

        let idx = self.index.insert(record);
        self.open_entries.insert(idx);
        self.dirty = true;

        self.io
            .seek(SeekFrom::Start(gap_start))
            .map_err(Error::from)?;
        let lfh = LocalFileHeader::from_record(self.index.get(idx).expect("just inserted"));
        lfh.write(&mut self.io).map_err(Error::from)?;

        let data_offset = gap_start + LFH_SIZE + name.len() as u64;
        let zstream = ZStream::open(
            &mut self.io,
            CodecMode::Write,
            data_offset,
            declared_size,
            0,
            CodecOptions {
                level,
                ..CodecOptions::default()
            },
        )?;
        Ok(Some(Entry::new_write(
            &mut self.open_entries,
            idx,
            zstream,
            self.index.get_mut(idx).expect("just inserted"),
        )))
    }

    /// Removes an entry from the directory. Returns `false` if no entry by
    /// that name exists. The space it occupied becomes available to the gap
    /// allocator but is not reclaimed from the file until [`compact`](Self::compact).
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        if let Some(idx) = self.index.find_by_name(name) {
            if self.open_entries.contains(&idx) {
                let err = Error::AlreadyOpen(name.to_string());
                warn!("{err}");
                return Err(err);
            }
        } else {
            return Ok(false);
        }
        self.index.remove_by_name(name);
        self.dirty = true;
        Ok(true)
    }

    /// Consumes the archive and returns its backing store, without closing
    /// it first. Since `ZipArchive` implements `Drop` (to flush a `dirty`
    /// directory on best-effort basis, see the `Drop` impl below), the
    /// backing store can't just be moved out of a field the ordinary way;
    /// call `close()` first if the directory/EOCD need to be up to date in
    /// the returned store.
    pub fn into_inner(self) -> T {
        let mut this = ManuallyDrop::new(self);
        // SAFETY: `io` is read out exactly once and never accessed through
        // `this` again. The remaining fields are still live values owned by
        // `this`, so they are dropped explicitly in place below instead of
        // through `this`'s own (suppressed) `Drop` glue, rather than leaked.
        unsafe {
            let io = std::ptr::read(&mut this.io);
            std::ptr::drop_in_place(&mut this.eocd);
            std::ptr::drop_in_place(&mut this.index);
            std::ptr::drop_in_place(&mut this.open_entries);
            io
        }
    }

    /// Rewrites the central directory and EOCD record and truncates the
    /// archive to the end of the last entry's data, if anything changed
    /// since `open`. A no-op otherwise.
    pub fn close(&mut self) -> Result<()>
    where
        T: Truncate,
    {
        if !self.dirty {
            return Ok(());
        }

        let body_end = self
            .index
            .records_by_offset()
            .map(DirectoryRecord::span_end)
            .max()
            .unwrap_or(0);

        self.io.seek(SeekFrom::Start(body_end)).map_err(Error::from)?;
        let mut records_written: u16 = 0;
        for record in self.index.records_by_offset() {
            record.write(&mut self.io).map_err(Error::from)?;
            records_written += 1;
        }
        let cd_end = self.io.stream_position().map_err(Error::from)?;
        let cd_size = (cd_end - body_end) as u32;

        self.eocd.cd_first_disk = 0;
        self.eocd.disk_number = 0;
        self.eocd.cd_records_this_disk = records_written;
        self.eocd.cd_records_total = records_written;
        self.eocd.cd_size = cd_size;
        self.eocd.cd_offset = u32::try_from(body_end)
            .map_err(|_| Error::BadConfig("archive has grown past the 4 GiB ZIP32 offset limit"))?;
        self.eocd.write(&mut self.io).map_err(Error::from)?;

        let new_len = self.io.stream_position().map_err(Error::from)?;
        self.io.truncate_to(new_len).map_err(Error::from)?;
        self.archive_len = new_len;
        self.dirty = false;
        debug!("closed archive: {} entries, {} directory bytes", records_written, cd_size);
        Ok(())
    }

    /// Rewrites entry payloads contiguously from the start of the archive,
    /// eliminating every gap, then persists the directory. Entries are
    /// copied byte-for-byte; nothing is recompressed.
    pub fn compact(&mut self) -> Result<()>
    where
        T: Truncate,
    {
        if !self.open_entries.is_empty() {
            return Err(Error::BadConfig("cannot compact while entries are open"));
        }

        let mut cursor = 0u64;
        let mut ordered_idx: Vec<(u64, usize)> = self
            .index
            .indices()
            .map(|idx| (self.index.get(idx).expect("idx from index").relative_offset as u64, idx))
            .collect();
        ordered_idx.sort_by_key(|&(offset, _)| offset);
        let ordered_idx: Vec<usize> = ordered_idx.into_iter().map(|(_, idx)| idx).collect();

        for idx in ordered_idx {
            let (old_offset, span_len, name_len, extra_len) = {
                let record = self.index.get(idx).expect("ordered index is live");
                (
                    record.relative_offset as u64,
                    record.span_end() - record.relative_offset as u64,
                    record.file_name.len() as u64,
                    record.extra_field.len() as u64,
                )
            };
            let _ = (name_len, extra_len);

            if old_offset != cursor {
                let mut remaining = span_len;
                let mut read_at = old_offset;
                let mut write_at = cursor;
                let mut buf = vec![0u8; 64 * 1024];
                while remaining > 0 {
                    let chunk = remaining.min(buf.len() as u64) as usize;
                    self.io.seek(SeekFrom::Start(read_at)).map_err(Error::from)?;
                    self.io.read_exact(&mut buf[..chunk]).map_err(Error::from)?;
                    self.io.seek(SeekFrom::Start(write_at)).map_err(Error::from)?;
                    self.io.write_all(&buf[..chunk]).map_err(Error::from)?;
                    read_at += chunk as u64;
                    write_at += chunk as u64;
                    remaining -= chunk as u64;
                }

                self.index.reindex_offset(idx, old_offset, cursor);
                let record = self.index.get_mut(idx).expect("ordered index is live");
                record.relative_offset = u32::try_from(cursor).map_err(|_| {
                    Error::BadConfig("archive has grown past the 4 GiB ZIP32 offset limit")
                })?;
            }
            cursor += span_len;
        }

        self.dirty = true;
        self.close()
    }
}

/// Best-effort fallback for a `dirty` archive that is dropped without an
/// explicit [`ZipArchive::close`]: rewrites the central directory and EOCD
/// the same way `close` does, logging rather than propagating a failure
/// since `Drop` cannot return a `Result`. Scoped to `T: Truncate`, the same
/// bound `close` itself requires.
impl<T: Read + Write + Seek + Truncate> Drop for ZipArchive<T> {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.close() {
                warn!("archive dropped without an explicit close and failed to flush its directory: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn new_archive() -> ZipArchive<Cursor<Vec<u8>>> {
        ZipArchive::create(Cursor::new(Vec::new()))
    }

    fn write_entry(archive: &mut ZipArchive<Cursor<Vec<u8>>>, name: &str, contents: &[u8]) {
        let mut entry = archive
            .entry(name, OpenMode::write(contents.len() as u64 + 64))
            .unwrap()
            .unwrap();
        entry.write_all(contents).unwrap();
        entry.close().unwrap();
    }

    fn read_entry(archive: &mut ZipArchive<Cursor<Vec<u8>>>, name: &str) -> Vec<u8> {
        let mut entry = archive.entry(name, OpenMode::Read).unwrap().unwrap();
        let mut out = Vec::new();
        entry.read_to_end(&mut out).unwrap();
        out
    }

    /// A small xorshift PRNG, so a test can build a payload DEFLATE cannot
    /// meaningfully shrink, without pulling in a `rand` dependency for one
    /// fixture. Deterministic across runs.
    fn pseudo_random_bytes(n: usize) -> Vec<u8> {
        let mut state: u32 = 0x2545_F491;
        (0..n)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state & 0xFF) as u8
            })
            .collect()
    }

    #[test]
    fn create_write_close_reopen_round_trips() {
        let mut archive = new_archive();
        write_entry(&mut archive, "hello.txt", b"hello, world!");
        archive.close().unwrap();

        let buf = archive.into_inner().into_inner();
        let mut reopened = ZipArchive::open(Cursor::new(buf)).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(read_entry(&mut reopened, "hello.txt"), b"hello, world!");
    }

    #[test]
    fn eocd_comment_round_trips_and_entries_stay_readable() {
        let comment = b"0123456789ABCDEFG".to_vec();
        assert_eq!(comment.len(), 17);

        let mut archive = new_archive();
        write_entry(&mut archive, "a.txt", b"alpha");
        write_entry(&mut archive, "c.dat", b"gamma");
        archive.set_comment(comment.clone());
        archive.close().unwrap();

        let buf = archive.into_inner().into_inner();
        let mut reopened = ZipArchive::open(Cursor::new(buf)).unwrap();
        assert_eq!(reopened.comment(), comment.as_slice());
        assert_eq!(
            reopened.entries().collect::<Vec<_>>(),
            vec!["a.txt", "c.dat"]
        );
        assert_eq!(read_entry(&mut reopened, "a.txt"), b"alpha");
        assert_eq!(read_entry(&mut reopened, "c.dat"), b"gamma");
    }

    #[test]
    fn replacing_an_entry_reuses_its_gap_when_it_fits() {
        // `a.txt`'s initial content must be incompressible: the gap a closed
        // entry leaves behind is its *real* on-disk span (LFH + name +
        // however many bytes DEFLATE actually emitted), not the declared
        // reservation passed to `entry()` at open time (see
        // `Entry::close_mut`, which overwrites `compressed_size` with the
        // true emitted byte count). Pseudo-random bytes can't be shrunk much
        // by DEFLATE, so the real gap stays close to the input size and is
        // guaranteed to dwarf the tiny replacement below, regardless of
        // exactly how many bytes the DEFLATE engine emits.
        let mut archive = new_archive();
        write_entry(&mut archive, "a.txt", &pseudo_random_bytes(4096));
        write_entry(&mut archive, "b.txt", b"small");
        let a_offset_before = archive.index.get(0).unwrap().relative_offset;
        assert_eq!(a_offset_before, 0);

        archive.close().unwrap();
        let buf = archive.into_inner().into_inner();
        let mut reopened = ZipArchive::open(Cursor::new(buf)).unwrap();

        write_entry(&mut reopened, "a.txt", b"short now");
        let a_idx = reopened.index.find_by_name("a.txt").unwrap();
        let a_offset_after = reopened.index.get(a_idx).unwrap().relative_offset;
        assert_eq!(a_offset_after, a_offset_before);
    }

    #[test]
    fn reopening_an_already_open_entry_for_write_is_an_error() {
        let mut archive = new_archive();
        let _first = archive.entry("x.txt", OpenMode::write(64)).unwrap().unwrap();
        let second = archive.entry("x.txt", OpenMode::write(64));
        assert!(matches!(second, Err(Error::AlreadyOpen(_))));
    }

    #[test]
    fn compact_removes_interior_gaps() {
        let mut archive = new_archive();
        write_entry(&mut archive, "a.txt", &vec![b'x'; 2000]);
        write_entry(&mut archive, "b.txt", b"small");
        archive.close().unwrap();

        // Replace "a.txt" with something much smaller, leaving a large gap.
        write_entry(&mut archive, "a.txt", b"tiny");
        archive.close().unwrap();

        archive.compact().unwrap();
        let a_idx = archive.index.find_by_name("a.txt").unwrap();
        let b_idx = archive.index.find_by_name("b.txt").unwrap();
        let a = archive.index.get(a_idx).unwrap();
        let b = archive.index.get(b_idx).unwrap();
        assert!(a.relative_offset < b.relative_offset);
        assert_eq!(a.span_end(), b.relative_offset as u64);
    }
}
