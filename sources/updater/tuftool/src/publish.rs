//! The release builder: every operation that produces a new set of signed metadata.
//!
//! Each operation takes the repository lock, builds and signs all of the affected roles in
//! memory, and only then writes anything. A missing key or an unmet threshold therefore aborts
//! before a single file changes.

use crate::archive;
use crate::error::{self, Result};
use crate::key::{sign_role, sign_root_successor, KeyPair};
use crate::repo::{encode, Repository};
use crate::write_atomic;
use log::{debug, info};
use semver::Version;
use snafu::{ensure, OptionExt, ResultExt};
use std::fs;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use tuf_schema::{Hashes, RoleKeys, RoleType, Root, Target, TargetCustom, Targets};

/// What a successful publication produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRelease {
    pub version: Version,
    /// The target path, `<name>-<version>.tar.gz`.
    pub path: String,
    /// Where the archive was written in the targets directory, per the configured layout.
    pub archive: PathBuf,
    pub target: Target,
    pub targets_version: NonZeroU64,
    pub snapshot_version: NonZeroU64,
    pub timestamp_version: NonZeroU64,
}

impl Repository {
    /// Packages `artifact` as version `version` of the application and publishes it.
    ///
    /// `version` must be greater than every version already published.
    pub fn publish(&self, version: &Version, artifact: &[u8]) -> Result<PublishedRelease> {
        let _lock = self.lock()?;
        self.check_monotonic(version)?;
        let archive = archive::create(&self.config().app_name, artifact)?;
        self.release(version, &archive)
    }

    /// Like [`Repository::publish`], reading the artifact from `path`.
    pub fn publish_file(&self, version: &Version, path: &Path) -> Result<PublishedRelease> {
        let artifact = fs::read(path).context(error::FileReadSnafu { path })?;
        self.publish(version, &artifact)
    }

    /// Publishes an archive that was already packaged elsewhere.
    pub fn add(&self, version: &Version, archive: &Path) -> Result<PublishedRelease> {
        let _lock = self.lock()?;
        self.check_monotonic(version)?;
        let bytes = fs::read(archive).context(error::FileReadSnafu { path: archive })?;
        self.release(version, &bytes)
    }

    /// Re-signs snapshot and timestamp with new versions and expirations, leaving targets as is.
    pub fn refresh(&self) -> Result<()> {
        let _lock = self.lock()?;
        let root = self.load_required::<Root>()?.signed;
        let targets = encode(&self.load_required::<Targets>()?)?;
        let keyring = self.keyring()?;
        let [snapshot, timestamp] = self.sign_snapshot_and_timestamp(&root, &keyring, &targets)?;
        info!(
            "Refreshed snapshot (version {}) and timestamp (version {})",
            snapshot.version(),
            timestamp.version()
        );
        self.store()
            .save_all(&[snapshot, timestamp])
            .context(error::StoreSnafu)
    }

    /// Replaces the keys of `role` with freshly generated ones.
    ///
    /// The new root is signed by the current root keys and by its own, so existing clients can
    /// follow the rotation. Targets (when its keys rotate), snapshot and timestamp are re-signed
    /// under the new root. Old key files are deleted once the new metadata is written.
    pub fn rotate_key(&self, role: RoleType) -> Result<Root> {
        let _lock = self.lock()?;
        let current = self.load_required::<Root>()?.signed;
        let mut keyring = self.keyring()?;

        let threshold = current
            .roles
            .get(&role)
            .map_or(NonZeroU64::MIN, |role_keys| role_keys.threshold);
        let retired: Vec<_> = current
            .roles
            .get(&role)
            .map(|role_keys| role_keys.keyids.clone())
            .unwrap_or_default();

        let mut next = current.clone();
        next.version = current.version.saturating_add(1);
        next.expires = self.expires(RoleType::Root);
        let mut keyids = Vec::new();
        for _ in 0..threshold.get() {
            let pair = KeyPair::generate()?;
            let public = pair.public_key();
            let keyid = keyring.add(role, pair)?;
            next.keys.insert(keyid.clone(), public);
            keyids.push(keyid);
        }
        next.roles.insert(role, RoleKeys { keyids, threshold });
        next.keys
            .retain(|keyid, _| next.roles.values().any(|rk| rk.keyids.contains(keyid)));

        let signed_root = encode(&sign_root_successor(&current, &keyring, next.clone())?)?;
        let mut docs = vec![signed_root];

        let mut targets = self.load_required::<Targets>()?;
        if role == RoleType::Targets {
            targets.signed.version = self.next_version::<Targets>()?;
            targets.signed.expires = self.expires(RoleType::Targets);
            targets = sign_role(&next, &keyring, targets.signed)?;
            docs.push(encode(&targets)?);
        }
        let targets = encode(&targets)?;
        let [snapshot, timestamp] = self.sign_snapshot_and_timestamp(&next, &keyring, &targets)?;
        docs.push(snapshot);
        docs.push(timestamp);

        keyring.save(self.passphrase())?;
        self.store().save_all(&docs).context(error::StoreSnafu)?;
        for keyid in &retired {
            if !next.keys.contains_key(keyid) {
                keyring.remove(role, keyid)?;
            }
        }
        info!("Rotated {} keys; root is now version {}", role, next.version);
        Ok(next)
    }

    fn check_monotonic(&self, version: &Version) -> Result<()> {
        let name = &self.config().app_name;
        if let Some(latest) = self.versions()?.pop() {
            ensure!(
                *version > latest,
                error::NonMonotonicVersionSnafu {
                    name,
                    version: version.clone(),
                    latest,
                }
            );
        }
        Ok(())
    }

    /// Adds `archive` as a target and signs targets, snapshot and timestamp. The caller holds the
    /// lock and has checked the version.
    fn release(&self, version: &Version, archive: &[u8]) -> Result<PublishedRelease> {
        let name = self.config().app_name.clone();
        let root = self.load_required::<Root>()?.signed;
        let mut targets = self.load_required::<Targets>()?.signed;

        let path = Target::archive_name(&name, version);
        let target = Target {
            length: archive.len() as u64,
            hashes: Hashes::compute(archive),
            custom: TargetCustom {
                name,
                version: version.clone(),
            },
        };
        targets.version = self.next_version::<Targets>()?;
        targets.expires = self.expires(RoleType::Targets);
        targets.targets.insert(path.clone(), target.clone());

        let keyring = self.keyring()?;
        let targets = encode(&sign_role(&root, &keyring, targets)?)?;
        let [snapshot, timestamp] = self.sign_snapshot_and_timestamp(&root, &keyring, &targets)?;
        debug!("Signed targets, snapshot and timestamp for {}", path);

        let archive_path = self
            .targets_dir()
            .join(self.config().target_layout.location(&path, version));
        let archive_dir = archive_path
            .parent()
            .context(error::PathParentSnafu { path: &archive_path })?;
        fs::create_dir_all(archive_dir).context(error::DirCreateSnafu { path: archive_dir })?;
        write_atomic(&archive_path, archive)?;

        let release = PublishedRelease {
            version: version.clone(),
            path,
            archive: archive_path,
            target,
            targets_version: targets.version(),
            snapshot_version: snapshot.version(),
            timestamp_version: timestamp.version(),
        };
        self.store()
            .save_all(&[targets, snapshot, timestamp])
            .context(error::StoreSnafu)?;
        info!(
            "Published {} (targets {}, snapshot {}, timestamp {})",
            release.path, release.targets_version, release.snapshot_version, release.timestamp_version
        );
        Ok(release)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::RepoConfig;
    use crate::error::Error;
    use crate::Repository;
    use semver::Version;
    use std::fs;
    use std::num::NonZeroU64;
    use tuf_schema::{RoleType, Root, Snapshot, TargetLayout, Targets, Timestamp};

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path(), RepoConfig::new("demo"), None).unwrap();
        (dir, repo)
    }

    fn latest_versions(repo: &Repository) -> [u64; 3] {
        let store = repo.store();
        [
            store.load::<Targets>().unwrap().unwrap().signed.version.get(),
            store.load::<Snapshot>().unwrap().unwrap().signed.version.get(),
            store.load::<Timestamp>().unwrap().unwrap().signed.version.get(),
        ]
    }

    #[test]
    fn init_publishes_version_one() {
        let (dir, repo) = repo();
        assert_eq!(latest_versions(&repo), [1, 1, 1]);
        assert!(repo.versions().unwrap().is_empty());
        let root = repo.store().load::<Root>().unwrap().unwrap();
        root.signed.verify_role(&root).unwrap();
        assert!(matches!(
            Repository::init(dir.path(), RepoConfig::new("demo"), None),
            Err(Error::AlreadyInitialized { .. })
        ));
    }

    #[test]
    fn publish_bumps_every_counter() {
        let (_dir, repo) = repo();
        let first = repo.publish(&v("1.0.0"), b"one").unwrap();
        assert_eq!(first.path, "demo-1.0.0.tar.gz");
        assert!(first.archive.is_file());
        assert_eq!(latest_versions(&repo), [2, 2, 2]);

        repo.publish(&v("1.0.2"), b"two").unwrap();
        assert_eq!(latest_versions(&repo), [3, 3, 3]);
        assert_eq!(repo.versions().unwrap(), vec![v("1.0.0"), v("1.0.2")]);

        let root = repo.store().load::<Root>().unwrap().unwrap().signed;
        let targets = repo.store().load::<Targets>().unwrap().unwrap();
        root.verify_role(&targets).unwrap();
        let snapshot = repo.store().load::<Snapshot>().unwrap().unwrap();
        assert_eq!(
            snapshot.signed.targets_meta().unwrap().version,
            targets.signed.version
        );
    }

    #[test]
    fn non_monotonic_publish_changes_nothing() {
        let (_dir, repo) = repo();
        repo.publish(&v("1.0.2"), b"two").unwrap();
        let before = fs::read(repo.metadata_dir().join("timestamp.json")).unwrap();

        for version in ["1.0.1", "1.0.2"] {
            assert!(matches!(
                repo.publish(&v(version), b"again"),
                Err(Error::NonMonotonicVersion { .. })
            ));
        }
        assert_eq!(
            fs::read(repo.metadata_dir().join("timestamp.json")).unwrap(),
            before
        );
        assert!(!repo.targets_dir().join("demo-1.0.1.tar.gz").exists());
        assert_eq!(latest_versions(&repo), [2, 2, 2]);
    }

    #[test]
    fn missing_targets_key_aborts_without_writes() {
        let (_dir, repo) = repo();
        fs::remove_dir_all(repo.keys_dir().join("targets")).unwrap();
        let err = repo.publish(&v("1.0.0"), b"one").unwrap_err();
        assert!(matches!(
            err,
            Error::SignThreshold {
                role: RoleType::Targets,
                ..
            }
        ));
        assert_eq!(latest_versions(&repo), [1, 1, 1]);
        assert!(!repo.targets_dir().join("demo-1.0.0.tar.gz").exists());
        assert!(repo
            .store()
            .load_version::<Targets>(NonZeroU64::new(2).unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn refresh_keeps_targets() {
        let (_dir, repo) = repo();
        repo.publish(&v("1.0.0"), b"one").unwrap();
        repo.refresh().unwrap();
        assert_eq!(latest_versions(&repo), [2, 3, 3]);
    }

    #[test]
    fn rotated_root_is_accepted_by_old_root() {
        let (_dir, repo) = repo();
        let old = repo.store().load::<Root>().unwrap().unwrap().signed;
        let old_timestamp_key = old.roles[&RoleType::Timestamp].keyids.clone();

        let next = repo.rotate_key(RoleType::Timestamp).unwrap();
        assert_eq!(next.version.get(), 2);
        assert_ne!(next.roles[&RoleType::Timestamp].keyids, old_timestamp_key);
        assert!(!next.keys.contains_key(&old_timestamp_key[0]));

        let signed = repo
            .store()
            .load_version::<Root>(NonZeroU64::new(2).unwrap())
            .unwrap()
            .unwrap();
        old.verify_successor(&signed).unwrap();
        let timestamp = repo.store().load::<Timestamp>().unwrap().unwrap();
        next.verify_role(&timestamp).unwrap();
        assert!(old.verify_role(&timestamp).is_err());

        // Later publications sign with the new key.
        repo.publish(&v("2.0.0"), b"two").unwrap();
    }

    #[test]
    fn rotate_root_key() {
        let (_dir, repo) = repo();
        let old = repo.store().load::<Root>().unwrap().unwrap().signed;
        repo.rotate_key(RoleType::Root).unwrap();
        let signed = repo.store().load::<Root>().unwrap().unwrap();
        old.verify_successor(&signed).unwrap();
        assert_eq!(repo.keyring().unwrap().len(), 4);
    }

    #[test]
    fn release_layout_uses_tag_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RepoConfig::new("demo");
        config.target_layout = TargetLayout::Release;
        let repo = Repository::init(dir.path(), config, None).unwrap();

        let release = repo.publish(&v("1.0.2"), b"two").unwrap();
        assert_eq!(release.path, "demo-1.0.2.tar.gz");
        assert_eq!(
            release.archive,
            repo.targets_dir().join("v1.0.2").join("demo-1.0.2.tar.gz")
        );
        assert!(release.archive.is_file());
        assert!(!repo.targets_dir().join("demo-1.0.2.tar.gz").exists());

        // The target path in metadata is the same for either layout.
        let targets = repo.store().load::<Targets>().unwrap().unwrap().signed;
        assert!(targets.targets.contains_key("demo-1.0.2.tar.gz"));
    }
}
