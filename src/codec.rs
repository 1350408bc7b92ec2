//! Byte-count DEFLATE stream adapter.
//!
//! Converts between the "feed a chunk, get a chunk" model of a block DEFLATE
//! engine and a caller-driven "give me exactly N decompressed bytes" model.
//! The engine itself is [`flate2::Compress`]/[`flate2::Decompress`], which
//! already exposes the `total_in`/`total_out`-tracked, slice-in/slice-out
//! shape that a raw zlib `z_stream` would — this module is the adapter layer
//! on top of it, not a reimplementation of it.

use std::io::{Read, Seek, SeekFrom, Write};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Default size of the internal input (compressed-side) buffer.
pub const DEFAULT_IN_BUF: usize = 128 * 1024;
/// Default size of the internal output (decompressed-side) buffer.
pub const DEFAULT_OUT_BUF: usize = 1024 * 1024;

/// Selects whether a [`ZStream`] inflates or deflates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Decompress (inflate) on `read`.
    Read,
    /// Compress (deflate) on `write`.
    Write,
}

/// Configuration recognized at [`ZStream`] open time.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Use raw DEFLATE (no zlib header/trailer). ZIP entries always require this.
    pub raw: bool,
    /// Compression level, only meaningful in [`Mode::Write`].
    pub level: Compression,
    /// Size of the internal input buffer.
    pub in_buf: usize,
    /// Size of the internal output buffer.
    pub out_buf: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            raw: true,
            level: Compression::default(),
            in_buf: DEFAULT_IN_BUF,
            out_buf: DEFAULT_OUT_BUF,
        }
    }
}

/// Tiny `Clone`-able snapshot of an error message, so a latched error can be
/// reported again on every subsequent call without requiring `Error: Clone`
/// (it isn't, since `std::io::Error` isn't).
#[derive(Debug, Clone)]
struct Latched(String);

enum Engine {
    Inflate(Box<Decompress>),
    Deflate(Box<Compress>),
}

/// Adapts a block DEFLATE engine to a byte-count read/write API over either
/// an in-memory buffer or a seekable stream confined to an absolute offset
/// window `[window_start, window_start + compressed_limit)`.
pub struct ZStream<T> {
    io: T,
    window_start: u64,
    compressed_limit: u64,
    uncompressed_limit: u64,
    mode: Mode,
    raw: bool,
    engine: Engine,

    in_buf: Vec<u8>,
    in_pos: usize,
    in_len: usize,
    finished_input: bool,

    out_buf: Vec<u8>,
    out_pos: usize,
    out_len: usize,

    zoffset: u64,
    tcount: u64,
    gcount: u64,
    eof: bool,
    err: Option<Latched>,
}

impl<T: Read + Write + Seek> ZStream<T> {
    /// Opens an adapter over `io`, confined to the window
    /// `[offset, offset + compressed_size)`.
    ///
    /// `uncompressed_size` bounds how many decompressed bytes `read` will
    /// ever produce before setting `eof`; it is ignored in [`Mode::Write`].
    pub fn open(
        io: T,
        mode: Mode,
        offset: u64,
        compressed_size: u64,
        uncompressed_size: u64,
        options: Options,
    ) -> Result<Self> {
        if options.in_buf == 0 || options.out_buf == 0 {
            return Err(Error::BadConfig("buffer sizes must be non-zero"));
        }
        let engine = match mode {
            Mode::Read => Engine::Inflate(Box::new(Decompress::new(!options.raw))),
            Mode::Write => Engine::Deflate(Box::new(Compress::new(options.level, !options.raw))),
        };
        Ok(Self {
            io,
            window_start: offset,
            compressed_limit: compressed_size,
            uncompressed_limit: uncompressed_size,
            mode,
            raw: options.raw,
            engine,
            in_buf: vec![0; options.in_buf],
            in_pos: 0,
            in_len: 0,
            finished_input: false,
            out_buf: vec![0; options.out_buf],
            out_pos: 0,
            out_len: 0,
            zoffset: 0,
            tcount: 0,
            gcount: 0,
            eof: false,
            err: None,
        })
    }

    /// Current mode (read/inflate or write/deflate).
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether this adapter was opened for raw (headerless) DEFLATE.
    pub fn raw(&self) -> bool {
        self.raw
    }

    /// No more decompressed bytes are producible, or no more compressed
    /// bytes will be accepted.
    pub fn eof(&self) -> bool {
        self.eof
    }

    /// Whether this adapter is in a latched error state.
    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }

    /// The latched error message, if any operation has failed.
    pub fn error(&self) -> Option<&str> {
        self.err.as_ref().map(|Latched(msg)| msg.as_str())
    }

    /// Bytes produced (read mode) or consumed (write mode) by the last call.
    pub fn gcount(&self) -> u64 {
        self.gcount
    }

    /// Total bytes produced/consumed since open.
    pub fn tcount(&self) -> u64 {
        self.tcount
    }

    /// Compressed-side cursor within the window.
    pub fn zoffset(&self) -> u64 {
        self.zoffset
    }

    fn latch(&mut self, err: Error) -> Error {
        self.err = Some(Latched(err.to_string()));
        err
    }

    fn latched_err(&self) -> Error {
        match &self.err {
            Some(Latched(msg)) => Error::CodecFailure(msg.clone()),
            None => unreachable!("latched_err called without a latched error"),
        }
    }

    fn seek_to_cursor(&mut self) -> Result<()> {
        let target = self.window_start + self.zoffset;
        match self.io.seek(SeekFrom::Start(target)) {
            Ok(_) => Ok(()),
            Err(e) => Err(self.latch(Error::from(e))),
        }
    }

    fn refill(&mut self) -> Result<()> {
        if self.in_pos < self.in_len {
            return Ok(());
        }
        self.seek_to_cursor()?;
        let remaining_window = self.compressed_limit.saturating_sub(self.zoffset);
        if remaining_window == 0 {
            self.finished_input = true;
            self.in_pos = 0;
            self.in_len = 0;
            return Ok(());
        }
        let want = (self.in_buf.len() as u64).min(remaining_window) as usize;
        let n = match self.io.read(&mut self.in_buf[..want]) {
            Ok(n) => n,
            Err(e) => return Err(self.latch(Error::from(e))),
        };
        self.in_pos = 0;
        self.in_len = n;
        self.zoffset += n as u64;
        if n == 0 || self.zoffset >= self.compressed_limit {
            self.finished_input = true;
        }
        Ok(())
    }

    /// Reads up to `dst.len()` decompressed bytes, returning the number
    /// actually written (fewer than `dst.len()` only at end-of-entry).
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        self.gcount = 0;
        if self.eof {
            return Ok(0);
        }
        if self.err.is_some() {
            return Err(self.latched_err());
        }
        if self.mode != Mode::Read {
            return Err(Error::BadConfig("read() called on a write-mode ZStream"));
        }

        let mut written = 0usize;
        while written < dst.len() {
            if self.out_pos < self.out_len {
                let avail = self.out_len - self.out_pos;
                let take = avail.min(dst.len() - written);
                dst[written..written + take]
                    .copy_from_slice(&self.out_buf[self.out_pos..self.out_pos + take]);
                self.out_pos += take;
                written += take;
                self.tcount += take as u64;
                continue;
            }

            if self.tcount >= self.uncompressed_limit {
                self.eof = true;
                break;
            }

            self.refill()?;

            let flush = if self.finished_input {
                FlushDecompress::Finish
            } else {
                FlushDecompress::None
            };
            let Engine::Inflate(engine) = &mut self.engine else {
                unreachable!("read() on an adapter opened in write mode")
            };
            let before_in = engine.total_in();
            let before_out = engine.total_out();
            let status = match engine.decompress(
                &self.in_buf[self.in_pos..self.in_len],
                &mut self.out_buf,
                flush,
            ) {
                Ok(status) => status,
                Err(e) => return Err(self.latch(Error::CodecFailure(e.to_string()))),
            };
            let consumed = (engine.total_in() - before_in) as usize;
            let produced = (engine.total_out() - before_out) as usize;
            self.in_pos += consumed;
            self.out_pos = 0;
            self.out_len = produced;

            if matches!(status, Status::StreamEnd) && produced == 0 {
                self.eof = true;
                break;
            }
            if consumed == 0 && produced == 0 && self.finished_input {
                return Err(self.latch(Error::CodecFailure(
                    "DEFLATE stream stalled before producing all expected bytes".to_string(),
                )));
            }
        }

        self.gcount = written as u64;
        if self.tcount >= self.uncompressed_limit {
            self.eof = true;
        }
        Ok(written)
    }

    fn emit_output(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        if self.zoffset + n as u64 > self.compressed_limit {
            return Err(self.latch(Error::BufferOverflow {
                limit: self.compressed_limit,
            }));
        }
        self.seek_to_cursor()?;
        if let Err(e) = self.io.write_all(&self.out_buf[..n]) {
            return Err(self.latch(Error::from(e)));
        }
        self.zoffset += n as u64;
        Ok(())
    }

    /// Accepts `src` as input, buffering/compressing it and emitting
    /// compressed output to the backing window.
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        self.gcount = 0;
        if self.eof {
            return Ok(0);
        }
        if self.err.is_some() {
            return Err(self.latched_err());
        }
        if self.mode != Mode::Write {
            return Err(Error::BadConfig("write() called on a read-mode ZStream"));
        }

        let mut consumed_total = 0usize;
        while consumed_total < src.len() {
            let Engine::Deflate(engine) = &mut self.engine else {
                unreachable!("write() on an adapter opened in read mode")
            };
            let before_in = engine.total_in();
            let before_out = engine.total_out();
            let status = match engine.compress(
                &src[consumed_total..],
                &mut self.out_buf,
                FlushCompress::None,
            ) {
                Ok(status) => status,
                Err(e) => return Err(self.latch(Error::CodecFailure(e.to_string()))),
            };
            let consumed = (engine.total_in() - before_in) as usize;
            let produced = (engine.total_out() - before_out) as usize;
            consumed_total += consumed;
            self.tcount += consumed as u64;

            self.emit_output(produced)?;

            if consumed == 0 && produced == 0 {
                break;
            }
            let _ = status;
        }

        self.gcount = consumed_total as u64;
        Ok(consumed_total)
    }

    /// Finalizes the compressed stream (write mode), emitting any remaining
    /// buffered output. A no-op in read mode.
    pub fn flush(&mut self) -> Result<()> {
        if self.err.is_some() {
            return Err(self.latched_err());
        }
        if self.mode != Mode::Write {
            return Ok(());
        }
        if self.eof {
            return Ok(());
        }
        loop {
            let Engine::Deflate(engine) = &mut self.engine else {
                unreachable!("flush() on an adapter opened in read mode")
            };
            let before_out = engine.total_out();
            let status = match engine.compress(&[], &mut self.out_buf, FlushCompress::Finish) {
                Ok(status) => status,
                Err(e) => return Err(self.latch(Error::CodecFailure(e.to_string()))),
            };
            let produced = (engine.total_out() - before_out) as usize;
            self.emit_output(produced)?;
            if matches!(status, Status::StreamEnd) || produced == 0 {
                break;
            }
        }
        self.eof = true;
        Ok(())
    }

    /// Releases the adapter. In write mode, flushes first if not already
    /// finished. Runs regardless of prior error state; internal buffers and
    /// the engine are freed by `Drop` either way.
    pub fn close(&mut self) -> Result<()> {
        if self.mode == Mode::Write && !self.eof && self.err.is_none() {
            self.flush()?;
        }
        Ok(())
    }

    /// Total compressed bytes this adapter's window is bounded to.
    pub fn compressed_limit(&self) -> u64 {
        self.compressed_limit
    }

    /// Consumes the adapter and returns the backing I/O object.
    pub fn into_inner(self) -> T {
        self.io
    }

    /// Absolute offset this adapter's compressed-data window starts at.
    pub(crate) fn window_start(&self) -> u64 {
        self.window_start
    }

    /// Direct access to the backing I/O, for rewriting a header that sits
    /// just before this adapter's window once final sizes are known.
    pub(crate) fn io_mut(&mut self) -> &mut T {
        &mut self.io
    }
}
