//! Error kinds surfaced by the store.
//!
//! Everything that can go wrong while reading or writing a container maps to
//! one of the variants below. Corruption detected in untrusted file contents
//! (overlapping entries, out-of-file offsets, inconsistent section
//! bookkeeping) is reported as [`Error::Corrupted`] rather than panicking;
//! a container that reports corruption should be considered unusable.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Cell coordinates outside `[0, 31]`.
    #[error("invalid cell position ({0}, {1})")]
    InvalidPosition(u8, u8),

    /// File size is not a multiple of 4096, or is between 1 and 8191 bytes.
    #[error("invalid container file size: {0} bytes")]
    InvalidSize(u64),

    /// The container holds data that violates the format invariants.
    #[error("corrupted container: {0}")]
    Corrupted(&'static str),

    /// The cell has never been written (or was removed).
    #[error("cell has no data")]
    NotExist,

    /// The cell's payload lives in a sibling file and this container was
    /// opened without a directory backend to resolve it.
    #[error("cell data is stored in an external file")]
    External,

    /// Write attempted on a handle opened read-only.
    #[error("container is opened read-only")]
    ReadOnly,

    /// Operation on a closed container or a closed cached handle.
    #[error("container is closed")]
    Closed,

    /// The method byte does not name a known codec.
    #[error("unsupported compression method {0}")]
    UnsupportedCompression(u8),

    /// An underlying filesystem or codec failure, tagged with the step that
    /// observed it.
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: &'static str, source: io::Error) -> Self {
        Error::Io { context, source }
    }
}

/// Extension for tagging `io::Result`s with the step that failed.
pub(crate) trait IoContext<T> {
    fn context(self, context: &'static str) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn context(self, context: &'static str) -> Result<T> {
        self.map_err(|source| Error::Io { context, source })
    }
}
