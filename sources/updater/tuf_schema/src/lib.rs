/*!
The signed metadata model shared by the publisher (`tuftool`) and the client (`updog`).

A repository has exactly four roles, each with its own document:

* `root` assigns keys and signature thresholds to every role, including itself.
* `targets` lists the distributable archives: path, length, digests, application name and
  version.
* `snapshot` pins the version (and digest) of `targets.json` that belongs to a publication.
* `timestamp` pins the version (and digest) of the current `snapshot.json`; it is re-signed on
  every publication and is the first thing a client fetches.

Signatures are made over the OLPC canonical JSON form of the `signed` payload, see
[`to_canonical_bytes`].
*/

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod canonical;
mod de;
pub mod decoded;
pub mod error;
pub mod key;
mod verify;

pub use crate::canonical::to_canonical_bytes;
pub use crate::error::{Error, Result};

use crate::decoded::{Decoded, Hex};
use crate::key::Key;
use chrono::{DateTime, Utc};
use ring::digest::{digest, SHA256, SHA512};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_plain::{derive_display_from_serialize, derive_fromstr_from_deserialize};
use snafu::ensure;
use std::collections::BTreeMap;
use std::num::NonZeroU64;

/// The metadata format version written by this library.
pub const SPEC_VERSION: &str = "1.0.0";

/// A role type.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RoleType {
    Root,
    Snapshot,
    Targets,
    Timestamp,
}

derive_display_from_serialize!(RoleType);
derive_fromstr_from_deserialize!(RoleType);

impl RoleType {
    /// All four roles, in the order a publication signs them.
    pub const ALL: [RoleType; 4] = [
        RoleType::Root,
        RoleType::Targets,
        RoleType::Snapshot,
        RoleType::Timestamp,
    ];

    /// The name of the latest copy of this role's metadata, e.g. `snapshot.json`.
    pub fn filename(self) -> String {
        format!("{self}.json")
    }

    /// The name of a specific version of this role's metadata, e.g. `3.snapshot.json`.
    pub fn versioned_filename(self, version: NonZeroU64) -> String {
        format!("{version}.{self}.json")
    }

    /// Root and targets keys sign rarely and are kept offline; snapshot and timestamp keys are
    /// used on every publication and refresh.
    pub fn is_offline(self) -> bool {
        matches!(self, RoleType::Root | RoleType::Targets)
    }
}

/// Common trait implemented by all roles.
pub trait Role: Serialize {
    const TYPE: RoleType;

    fn expires(&self) -> DateTime<Utc>;

    fn version(&self) -> NonZeroU64;

    /// The canonical bytes that signatures for this role are made over.
    fn canonical_form(&self) -> Result<Vec<u8>> {
        to_canonical_bytes(self, &format!("{} role", Self::TYPE))
    }
}

/// A signed metadata object.
///
/// Deserializing fails if the `signed` payload holds anything `T` does not model, since
/// signatures are checked over `T`'s canonical form.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Signed<T> {
    /// The role that is signed.
    pub signed: T,
    /// A list of signatures and their key IDs.
    pub signatures: Vec<Signature>,
}

impl<T> Signed<T> {
    /// Wraps a role payload with no signatures yet.
    pub fn unsigned(signed: T) -> Self {
        Self {
            signed,
            signatures: Vec::new(),
        }
    }
}

/// A signature and the key ID that made it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signature {
    /// The key ID (listed in root.json) that made this signature.
    pub keyid: Decoded<Hex>,
    /// A hex-encoded signature of the canonical JSON form of a role.
    pub sig: Decoded<Hex>,
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "root")]
pub struct Root {
    pub spec_version: String,
    pub version: NonZeroU64,
    pub expires: DateTime<Utc>,
    #[serde(deserialize_with = "de::deserialize_keys")]
    pub keys: BTreeMap<Decoded<Hex>, Key>,
    pub roles: BTreeMap<RoleType, RoleKeys>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoleKeys {
    pub keyids: Vec<Decoded<Hex>>,
    pub threshold: NonZeroU64,
}

impl Root {
    /// The public keys currently authorized for `role`.
    pub fn keys(&self, role: RoleType) -> impl Iterator<Item = &Key> {
        self.roles
            .get(&role)
            .map(|role_keys| role_keys.keyids.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(move |keyid| self.keys.get(keyid))
    }

    /// Returns true if `other` authorizes a different key set or threshold for `role`.
    pub fn role_changed(&self, other: &Root, role: RoleType) -> bool {
        self.roles.get(&role) != other.roles.get(&role)
    }
}

impl Role for Root {
    const TYPE: RoleType = RoleType::Root;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A reference from one metadata file to another: the version it must have and, for exact
/// matching, its length and digests.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Meta {
    pub version: NonZeroU64,
    pub length: u64,
    pub hashes: Hashes,
}

impl Meta {
    /// Describes the given serialized metadata file.
    pub fn describe(version: NonZeroU64, bytes: &[u8]) -> Self {
        Self {
            version,
            length: bytes.len() as u64,
            hashes: Hashes::compute(bytes),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Hashes {
    pub sha256: Decoded<Hex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha512: Option<Decoded<Hex>>,
}

impl Hashes {
    /// Computes every digest this library knows about.
    pub fn compute(data: &[u8]) -> Self {
        Self {
            sha256: digest(&SHA256, data).as_ref().into(),
            sha512: Some(digest(&SHA512, data).as_ref().into()),
        }
    }

    /// Returns true if every digest recorded here agrees with the digests in `calculated`.
    /// The SHA-256 digest is always compared; SHA-512 is compared when recorded.
    pub fn matches(&self, calculated: &Hashes) -> bool {
        if self.sha256 != calculated.sha256 {
            return false;
        }
        match (&self.sha512, &calculated.sha512) {
            (None, _) => true,
            (Some(expected), Some(actual)) => expected == actual,
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "snapshot")]
pub struct Snapshot {
    pub spec_version: String,
    pub version: NonZeroU64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, Meta>,
}

impl Snapshot {
    /// The entry pinning `targets.json`.
    pub fn targets_meta(&self) -> Option<&Meta> {
        self.meta.get(&RoleType::Targets.filename())
    }
}

impl Role for Snapshot {
    const TYPE: RoleType = RoleType::Snapshot;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

// Delegated targets roles are not supported.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "targets")]
pub struct Targets {
    pub spec_version: String,
    pub version: NonZeroU64,
    pub expires: DateTime<Utc>,
    pub targets: BTreeMap<String, Target>,
}

/// A target descriptor: one published archive of one version of an application.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Target {
    pub length: u64,
    pub hashes: Hashes,
    pub custom: TargetCustom,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TargetCustom {
    /// The application this archive belongs to.
    pub name: String,
    pub version: Version,
}

impl Target {
    /// The path an archive for `name` at `version` is published under.
    pub fn archive_name(name: &str, version: &Version) -> String {
        format!("{name}-{version}.tar.gz")
    }

    /// Checks that `path` is the conventional archive name for this descriptor.
    pub fn check_path(&self, path: &str) -> Result<()> {
        let expected = Self::archive_name(&self.custom.name, &self.custom.version);
        ensure!(
            path == expected,
            error::TargetPathSnafu { path, expected }
        );
        Ok(())
    }
}

/// How archives are arranged under the targets base URL.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TargetLayout {
    /// Every archive directly under the base: `<name>-<version>.tar.gz`.
    #[default]
    Flat,
    /// One directory per release tag, as release-hosting services serve them:
    /// `v<version>/<name>-<version>.tar.gz`.
    Release,
}

derive_display_from_serialize!(TargetLayout);
derive_fromstr_from_deserialize!(TargetLayout);

impl TargetLayout {
    /// Where the archive with target path `path` for `version` lives, relative to the targets
    /// base.
    pub fn location(self, path: &str, version: &Version) -> String {
        match self {
            TargetLayout::Flat => path.to_owned(),
            TargetLayout::Release => format!("v{version}/{path}"),
        }
    }
}

impl Targets {
    /// Every release of `name`, ordered from oldest to newest version.
    pub fn releases<'a>(&'a self, name: &'a str) -> Vec<(&'a str, &'a Target)> {
        let mut releases: Vec<_> = self
            .targets
            .iter()
            .filter(|(_, target)| target.custom.name == name)
            .map(|(path, target)| (path.as_str(), target))
            .collect();
        releases.sort_by(|(_, a), (_, b)| a.custom.version.cmp(&b.custom.version));
        releases
    }

    /// The versions published for `name`, in ascending semver order.
    pub fn versions(&self, name: &str) -> Vec<Version> {
        self.releases(name)
            .into_iter()
            .map(|(_, target)| target.custom.version.clone())
            .collect()
    }

    /// The release of `name` with the highest version.
    pub fn latest<'a>(&'a self, name: &'a str) -> Option<(&'a str, &'a Target)> {
        self.releases(name).pop()
    }

    /// The release of `name` at exactly `version`.
    pub fn find<'a>(&'a self, name: &'a str, version: &Version) -> Option<(&'a str, &'a Target)> {
        self.releases(name)
            .into_iter()
            .find(|(_, target)| target.custom.version == *version)
    }

    /// Checks every target path against the archive naming convention.
    pub fn check_paths(&self) -> Result<()> {
        for (path, target) in &self.targets {
            target.check_path(path)?;
        }
        Ok(())
    }
}

impl Role for Targets {
    const TYPE: RoleType = RoleType::Targets;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "timestamp")]
pub struct Timestamp {
    pub spec_version: String,
    pub version: NonZeroU64,
    pub expires: DateTime<Utc>,
    pub meta: BTreeMap<String, Meta>,
}

impl Timestamp {
    /// The entry pinning `snapshot.json`.
    pub fn snapshot_meta(&self) -> Option<&Meta> {
        self.meta.get(&RoleType::Snapshot.filename())
    }
}

impl Role for Timestamp {
    const TYPE: RoleType = RoleType::Timestamp;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}
