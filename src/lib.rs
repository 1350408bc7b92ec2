//! # zippy
//!
//! A random-access ZIP32 archive library: open an existing archive, read
//! any entry by name, and replace or add entries in place, reusing the
//! space left behind by anything smaller than what used to be there
//! instead of always appending to the end of the file.
//!
//! ```no_run
//! use std::fs::OpenOptions;
//! use std::io::{Read, Write};
//!
//! use zippy::{OpenMode, ZipArchive};
//!
//! # fn run() -> zippy::Result<()> {
//! let file = OpenOptions::new().read(true).write(true).open("archive.zip")?;
//! let mut archive = ZipArchive::open(file)?;
//!
//! // Read an existing entry.
//! if let Some(mut entry) = archive.entry("readme.txt", OpenMode::Read)? {
//!     let mut contents = Vec::new();
//!     entry.read_to_end(&mut contents)?;
//!     entry.close()?;
//! }
//!
//! // Replace it with something else; if it fits in the old entry's
//! // footprint the new data lands in the same gap, otherwise wherever the
//! // next gap large enough is found.
//! let mut entry = archive
//!     .entry("readme.txt", OpenMode::write(64))?
//!     .expect("write mode always returns Some");
//! entry.write_all(b"updated contents")?;
//! entry.close()?;
//!
//! archive.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! The [`codec`] module is also usable on its own: [`codec::ZStream`] adapts
//! a block DEFLATE engine ([`flate2::Compress`]/[`flate2::Decompress`]) to a
//! byte-count `read`/`write` API over any `Read + Write + Seek` backing
//! store, independent of the ZIP format.

pub mod archive;
pub mod codec;
pub mod entry;
pub mod error;

pub use archive::record::Timestamp;
pub use archive::{OpenMode, Truncate, ZipArchive};
pub use entry::Entry;
pub use error::{Error, Result};
