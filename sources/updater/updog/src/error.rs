#![allow(clippy::default_trait_access)]

use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_plain::derive_display_from_serialize;
use snafu::{Backtrace, Snafu};
use std::path::PathBuf;
use tuf_schema::RoleType;
use url::Url;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Another update is being applied to {}", path.display()))]
    ApplyLocked { path: PathBuf, backtrace: Backtrace },

    #[snafu(display("Artifact {} is longer than the {} bytes its metadata records", url, length))]
    ArtifactLength {
        url: Url,
        length: u64,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Artifact {} does not match its metadata: expected {} bytes, got {}, or digests differ",
        url,
        expected,
        actual
    ))]
    ArtifactMismatch {
        url: Url,
        expected: u64,
        actual: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid base URL {}: {}", url, source))]
    BaseUrl {
        url: Url,
        source: url::ParseError,
        backtrace: Backtrace,
    },

    #[snafu(display("Update was cancelled"))]
    Cancelled { backtrace: Backtrace },

    #[snafu(display("Failed to parse config file {}: {}", path.display(), source))]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to read config file {}: {}", path.display(), source))]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create directory {}: {}", path.display(), source))]
    DirCreate {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("{} metadata expired at {}", role, expires))]
    Expired {
        role: RoleType,
        expires: DateTime<Utc>,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to unpack {}: {}", path.display(), source))]
    Extract {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to build HTTP client: {}", source))]
    HttpClient {
        source: reqwest::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Background task failed: {}", source))]
    Join {
        source: tokio::task::JoinError,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to list {}: {}", path.display(), source))]
    ListDir {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to acquire lock {}: {}", path.display(), source))]
    Lock {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("{} metadata does not list {}", role, file))]
    MetaMissing {
        role: RoleType,
        file: String,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "{} metadata does not match the length and digests recorded for it by {}",
        role,
        by
    ))]
    MetaHashMismatch {
        role: RoleType,
        by: RoleType,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "{} metadata is version {}, but {} metadata refers to version {}",
        role,
        actual,
        by,
        expected
    ))]
    MetaVersionMismatch {
        role: RoleType,
        by: RoleType,
        expected: u64,
        actual: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("{} is larger than the {} byte limit", url, max_size))]
    MetadataTooLarge {
        url: Url,
        max_size: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Repository has no {}", url))]
    MetadataMissing { url: Url, backtrace: Backtrace },

    #[snafu(display("Failed to parse {} metadata: {}", role, source))]
    MetadataParse {
        role: RoleType,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to remove {}: {}", path.display(), source))]
    Remove {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    ReadLink {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to move {} into place: {}", path.display(), source))]
    Rename {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Gave up after accepting {} new root metadata versions", max))]
    RootUpdateLimit { max: u64, backtrace: Backtrace },

    #[snafu(display("Root metadata file for version {} claims version {}", expected, actual))]
    RootVersion {
        expected: u64,
        actual: u64,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "{} metadata version {} is older than the cached version {}",
        role,
        fetched,
        cached
    ))]
    Rollback {
        role: RoleType,
        fetched: u64,
        cached: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to verify {} metadata: {}", role, source))]
    Signature {
        role: RoleType,
        source: tuf_schema::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to create staging area in {}: {}", path.display(), source))]
    Staging {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Metadata cache error: {}", source))]
    Store {
        #[snafu(backtrace)]
        source: tuf_store::Error,
    },

    #[snafu(display("Failed to switch active version to {}: {}", version, source))]
    Symlink {
        version: Version,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Target {} changed its length or digests since it was first published", path))]
    TargetChanged { path: String, backtrace: Backtrace },

    #[snafu(display("Invalid target list: {}", source))]
    TargetPath {
        source: tuf_schema::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Timed out after {}s fetching {}", secs, url))]
    Timeout {
        url: Url,
        secs: u64,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to fetch {}: {}", url, source))]
    Transport {
        url: Url,
        source: TransportError,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to read trusted root {}: {}", path.display(), source))]
    TrustedRootRead {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Trusted root {} is not valid: {}", path.display(), source))]
    TrustedRootParse {
        path: PathBuf,
        source: serde_json::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Trusted root {} is not signed by its own keys: {}", path.display(), source))]
    TrustedRootSignature {
        path: PathBuf,
        source: tuf_schema::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to write {}: {}", path.display(), source))]
    Write {
        path: PathBuf,
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

/// Why a check or apply did not succeed. This is all the surrounding application learns about a
/// failure; the detail goes to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    /// Metadata was malformed, oversized, or inconsistent with the metadata that refers to it.
    CorruptMetadata,
    /// Metadata carried no valid signature from an authorized key.
    InvalidSignature,
    /// Metadata carried some valid signatures, but fewer than the role's threshold.
    ThresholdNotMet,
    ExpiredMetadata,
    /// Fetched metadata is older than metadata the client has already trusted.
    VersionRollback,
    /// A downloaded artifact does not match its verified descriptor, or a published version
    /// changed its content.
    IntegrityMismatch,
    Network,
    Timeout,
    Cancelled,
    /// Another apply holds the installation lock.
    ApplyInProgress,
    /// A local filesystem or configuration problem.
    Local,
}

derive_display_from_serialize!(FailureReason);

impl Error {
    /// Reduces this error to the reason reported to callers.
    pub fn reason(&self) -> FailureReason {
        match self {
            Error::ApplyLocked { .. } => FailureReason::ApplyInProgress,
            Error::ArtifactLength { .. }
            | Error::ArtifactMismatch { .. }
            | Error::TargetChanged { .. } => FailureReason::IntegrityMismatch,
            Error::Cancelled { .. } => FailureReason::Cancelled,
            Error::Expired { .. } => FailureReason::ExpiredMetadata,
            Error::MetaMissing { .. }
            | Error::MetaHashMismatch { .. }
            | Error::MetaVersionMismatch { .. }
            | Error::MetadataTooLarge { .. }
            | Error::MetadataParse { .. }
            | Error::RootUpdateLimit { .. }
            | Error::TargetPath { .. } => FailureReason::CorruptMetadata,
            Error::MetadataMissing { .. } | Error::Transport { .. } => FailureReason::Network,
            Error::Rollback { .. } | Error::RootVersion { .. } => FailureReason::VersionRollback,
            Error::Signature { source, .. } => match source {
                tuf_schema::Error::SignatureThreshold { valid, .. } if *valid > 0 => {
                    FailureReason::ThresholdNotMet
                }
                _ => FailureReason::InvalidSignature,
            },
            Error::Store { source } if source.is_corrupt() => FailureReason::CorruptMetadata,
            Error::Timeout { .. } => FailureReason::Timeout,
            _ => FailureReason::Local,
        }
    }
}
