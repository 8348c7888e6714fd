#![allow(clippy::default_trait_access)]

use semver::Version;
use snafu::{Backtrace, Snafu};
use std::path::PathBuf;
use tuf_schema::RoleType;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Repository at {} is already initialized", path.display()))]
    AlreadyInitialized { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("Failed to write archive for {}: {}", name, source))]
    ArchiveCreate {
        name: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to parse {}: {}", path.display(), source))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to serialize repository config: {}", source))]
    ConfigSerialize {
        source: toml::ser::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create directory {}: {}", path.display(), source))]
    DirCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to persist {}: {}", path.display(), source.error))]
    FilePersist {
        path: PathBuf,
        source: tempfile::PersistError,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to remove {}: {}", path.display(), source))]
    FileRemove {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create temporary file in {}: {}", path.display(), source))]
    FileTempCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to write to {}: {}", path.display(), source))]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to decrypt key {}: wrong passphrase or damaged file", path.display()))]
    KeyDecrypt { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("Failed to encrypt key"))]
    KeyEncrypt { backtrace: Backtrace },

    #[snafu(display("Failed to generate key pair"))]
    KeyGenerate { backtrace: Backtrace },

    #[snafu(display("Unable to calculate key ID: {}", source))]
    KeyId {
        source: tuf_schema::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Key {} is encrypted; set TUFTOOL_PASSPHRASE", path.display()))]
    KeyPassphrase { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("Private key rejected: {}", source))]
    KeyRejected {
        source: ring::error::KeyRejected,
        backtrace: Backtrace,
    },

    #[snafu(display("Unrecognized private key format in {}", path.display()))]
    KeyUnrecognized { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("No {} metadata in repository; run `tuftool init` first", role))]
    MissingMetadata { role: RoleType, backtrace: Backtrace },

    #[snafu(display(
        "Cannot publish {} version {}: version {} is already published",
        name,
        version,
        latest
    ))]
    NonMonotonicVersion {
        name: String,
        version: Version,
        latest: Version,
        backtrace: Backtrace,
    },

    #[snafu(display("Path {} has no parent directory", path.display()))]
    PathParent { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("Failed to serialize {} role for signing: {}", role, source))]
    SignJson {
        role: RoleType,
        source: tuf_schema::Error,
        backtrace: Backtrace,
    },

    /// The keys on hand can't produce enough valid signatures for a role.
    #[snafu(display("Cannot sign {} metadata: {}", role, source))]
    SignThreshold {
        role: RoleType,
        source: tuf_schema::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Metadata store error: {}", source))]
    Store {
        #[snafu(backtrace)]
        source: tuf_store::Error,
    },
}
