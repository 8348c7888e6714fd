//! Contains the error type for this library.

use snafu::{Backtrace, Snafu};
use std::path::PathBuf;
use tuf_schema::RoleType;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for this library.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A metadata file exists but could not be parsed.
    #[snafu(display("Corrupt metadata in {}: {}", path.display(), source))]
    CorruptMetadata {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create directory {}: {}", path.display(), source))]
    DirCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to encode {} metadata: {}", role, source))]
    Encode {
        role: RoleType,
        source: tuf_schema::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to list {}: {}", path.display(), source))]
    ListDir {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to lock {}: {}", path.display(), source))]
    Lock {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to persist {}: {}", path.display(), source.error))]
    Persist {
        path: PathBuf,
        source: tempfile::PersistError,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to remove {}: {}", path.display(), source))]
    Remove {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create temporary file in {}: {}", path.display(), source))]
    TempCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// A versioned file holds a document with a different version than its name says.
    #[snafu(display(
        "{} claims version {} but contains version {}",
        path.display(),
        expected,
        actual
    ))]
    VersionMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to write {}: {}", path.display(), source))]
    Write {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Returns true if the error is due to unparseable metadata rather than an I/O failure.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Error::CorruptMetadata { .. } | Error::VersionMismatch { .. }
        )
    }
}
