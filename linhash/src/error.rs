//! Error types reported by the map and its components.

use thiserror::Error;

/// Everything that can go wrong while operating on a map.
#[derive(Debug, Error)]
pub enum Error {
    /// A key or value failed validation. Reported before any I/O is issued;
    /// the map is unaffected.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The underlying channel failed or returned short data. The map may be
    /// partially updated; there is no rollback.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An on-disk structure violated a layout invariant. Fatal to the open
    /// map; the instance should be discarded.
    #[error("corrupted map file: {0}")]
    Corruption(String),

    /// The operation needs growth the addressing state cannot represent.
    #[error("not supported: {0}")]
    NotSupported(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
