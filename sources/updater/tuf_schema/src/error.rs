//! Contains the error type for this library.

use crate::RoleType;
use snafu::{Backtrace, Snafu};

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for this library.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A duplicate key ID was present in the root metadata.
    #[snafu(display("Duplicate key ID: {}", keyid))]
    DuplicateKeyId { keyid: String },

    /// A key ID listed in root metadata does not match the key it names.
    #[snafu(display("Invalid key ID {}: calculated {}", keyid, calculated))]
    InvalidKeyId {
        keyid: String,
        calculated: String,
        backtrace: Backtrace,
    },

    /// Failed to decode a hexadecimal-encoded string.
    #[snafu(display("Invalid hex string: {}", source))]
    HexDecode {
        source: hex::FromHexError,
        backtrace: Backtrace,
    },

    /// The library failed to serialize an object to canonical JSON.
    #[snafu(display("Failed to serialize {} to canonical JSON: {}", what, source))]
    JsonSerialization {
        what: String,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    /// A required role is missing from the root metadata file.
    #[snafu(display("Role {} missing from root metadata", role))]
    MissingRole {
        role: RoleType,
        backtrace: Backtrace,
    },

    /// A signature threshold specified in root.json was not met when verifying a role.
    #[snafu(display(
        "Signature threshold of {} not met for role {} ({} valid signatures)",
        threshold,
        role,
        valid,
    ))]
    SignatureThreshold {
        role: RoleType,
        threshold: u64,
        valid: u64,
        backtrace: Backtrace,
    },

    /// A target path does not follow the `<name>-<version>.tar.gz` convention.
    #[snafu(display(
        "Target path '{}' does not match its descriptor (expected '{}')",
        path,
        expected
    ))]
    TargetPath {
        path: String,
        expected: String,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Returns true if the error means too few authorized keys signed the metadata, as opposed
    /// to the metadata being structurally unusable.
    pub fn is_threshold(&self) -> bool {
        matches!(self, Error::SignatureThreshold { .. })
    }
}
