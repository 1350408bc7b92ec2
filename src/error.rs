//! Error types shared by the codec adapter, the archive directory and entry handles.

/// Everything that can go wrong while reading, allocating or writing a ZIP32 archive.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backing file could not be opened, or its EOCD record could not be located.
    #[error("could not open archive: {0}")]
    OpenFailure(String),

    /// An adapter or entry was requested with an invalid combination of options.
    #[error("invalid configuration: {0}")]
    BadConfig(&'static str),

    /// The entry's compression method is not DEFLATE (8) or enhanced-DEFLATE (9).
    #[error("compression method {0} is not supported")]
    UnsupportedMethod(u16),

    /// A write-mode `entry()` was requested for a name that already has an open handle.
    #[error("entry {0:?} is already open for writing")]
    AlreadyOpen(String),

    /// The DEFLATE engine reported a failure (stream, data, memory or need-dict).
    #[error("DEFLATE engine failure: {0}")]
    CodecFailure(String),

    /// A seek or read/write on the backing stream failed.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// A memory-mode write would exceed the declared compressed-size limit.
    #[error("write would exceed the declared compressed size ({limit} bytes)")]
    BufferOverflow {
        /// The compressed-size limit that would have been exceeded.
        limit: u64,
    },
}

/// Shorthand for `Result<T, Error>`, used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;
