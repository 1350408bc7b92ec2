//! A handle to one open archive entry.

use std::collections::HashSet;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crc32fast::Hasher;
use log::warn;

use crate::archive::record::{DirectoryRecord, LocalFileHeader, Timestamp, LFH_SIZE};
use crate::codec::ZStream;
use crate::error::{Error, Result};

/// An open entry, borrowed out of its owning [`crate::ZipArchive`].
///
/// Dropping an `Entry` without calling [`Entry::close`] closes it anyway
/// (flushing and rewriting the Local File Header in write mode) on a
/// best-effort basis; the error, if any, is logged rather than propagated,
/// so callers that care about write failures should call `close` explicitly.
pub struct Entry<'a, T> {
    zstream: ZStream<&'a mut T>,
    open_entries: &'a mut HashSet<usize>,
    record: &'a mut DirectoryRecord,
    idx: usize,
    crc: Option<Hasher>,
    closed: bool,
}

impl<'a, T: Read + Write + Seek> Entry<'a, T> {
    pub(crate) fn new_read(
        open_entries: &'a mut HashSet<usize>,
        idx: usize,
        zstream: ZStream<&'a mut T>,
        record: &'a mut DirectoryRecord,
    ) -> Self {
        Self {
            zstream,
            open_entries,
            record,
            idx,
            crc: None,
            closed: false,
        }
    }

    pub(crate) fn new_write(
        open_entries: &'a mut HashSet<usize>,
        idx: usize,
        zstream: ZStream<&'a mut T>,
        record: &'a mut DirectoryRecord,
    ) -> Self {
        Self {
            zstream,
            open_entries,
            record,
            idx,
            crc: Some(Hasher::new()),
            closed: false,
        }
    }

    /// The entry's name within the archive.
    pub fn name(&self) -> &str {
        &self.record.file_name
    }

    /// The entry's own comment field.
    pub fn comment(&self) -> &str {
        &self.record.comment
    }

    /// Decoded modification timestamp.
    pub fn timestamp(&self) -> Timestamp {
        self.record.timestamp()
    }

    /// Compressed size. Zero until `close` for an entry opened for writing.
    pub fn compressed_size(&self) -> u64 {
        self.record.compressed_size as u64
    }

    /// Uncompressed size. Zero until `close` for an entry opened for writing.
    pub fn uncompressed_size(&self) -> u64 {
        self.record.uncompressed_size as u64
    }

    /// CRC-32 of the uncompressed data. Zero until `close` for an entry
    /// opened for writing.
    pub fn crc32(&self) -> u32 {
        self.record.crc32
    }

    /// No more bytes are readable/writable on this entry.
    pub fn eof(&self) -> bool {
        self.zstream.eof()
    }

    /// The latched codec error, if any.
    pub fn error(&self) -> Option<&str> {
        self.zstream.error()
    }

    /// Bytes produced/consumed by the last `read`/`write` call.
    pub fn gcount(&self) -> u64 {
        self.zstream.gcount()
    }

    /// Total uncompressed bytes produced/consumed since open.
    pub fn tcount(&self) -> u64 {
        self.zstream.tcount()
    }

    /// Compressed-side cursor within the entry's data window.
    pub fn zoffset(&self) -> u64 {
        self.zstream.zoffset()
    }

    /// Closes the entry: flushes the codec, finalizes `crc32`/sizes, and
    /// rewrites the Local File Header with them (write mode only), then
    /// deregisters the entry so its name can be reopened.
    pub fn close(mut self) -> Result<()> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(crc) = self.crc.take() {
            self.zstream.flush()?;
            let compressed_size = self.zstream.zoffset();
            let uncompressed_size = self.zstream.tcount();
            self.record.compressed_size = u32::try_from(compressed_size)
                .map_err(|_| Error::BadConfig("entry exceeds the 4 GiB ZIP32 size limit"))?;
            self.record.uncompressed_size = u32::try_from(uncompressed_size)
                .map_err(|_| Error::BadConfig("entry exceeds the 4 GiB ZIP32 size limit"))?;
            self.record.crc32 = crc.finalize();

            let lfh = LocalFileHeader::from_record(self.record);
            let lfh_offset = self.zstream.window_start()
                - LFH_SIZE
                - self.record.file_name.len() as u64
                - self.record.extra_field.len() as u64;
            self.zstream.io_mut().seek(SeekFrom::Start(lfh_offset))?;
            lfh.write(self.zstream.io_mut())?;
        }

        self.open_entries.remove(&self.idx);
        Ok(())
    }
}

impl<'a, T: Read + Write + Seek> Read for Entry<'a, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.zstream
            .read(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl<'a, T: Read + Write + Seek> Write for Entry<'a, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self
            .zstream
            .write(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if let Some(crc) = &mut self.crc {
            crc.update(&buf[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        // A mid-stream flush would finalize the DEFLATE block early; the
        // real finalization happens in `close`.
        Ok(())
    }
}

impl<'a, T: Read + Write + Seek> Drop for Entry<'a, T> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_mut() {
                warn!("entry {:?} failed to close cleanly: {e}", self.record.file_name);
            }
        }
    }
}
