use crate::config::{RepoConfig, CONFIG_FILE};
use crate::error::{self, Result};
use crate::key::{sign_role, KeyPair, Keyring};
use chrono::{DateTime, Duration, Timelike, Utc};
use log::info;
use semver::Version;
use serde::de::DeserializeOwned;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use tuf_schema::{
    Role, RoleKeys, RoleType, Root, Signed, Snapshot, Targets, Timestamp, SPEC_VERSION,
};
use tuf_store::{Encoded, MetadataStore, StoreLock};

/// A publisher's repository directory.
#[derive(Debug)]
pub struct Repository {
    dir: PathBuf,
    config: RepoConfig,
    store: MetadataStore,
    passphrase: Option<String>,
}

impl Repository {
    /// Creates a new repository in `dir`: writes the config, generates `threshold` keys for each
    /// role, and publishes version 1 of every role with no targets.
    pub fn init(dir: &Path, config: RepoConfig, passphrase: Option<&str>) -> Result<Self> {
        ensure!(
            !dir.join(CONFIG_FILE).exists(),
            error::AlreadyInitializedSnafu { path: dir }
        );
        fs::create_dir_all(dir).context(error::DirCreateSnafu { path: dir })?;
        let repo = Self::with_config(dir, config, passphrase);
        let _lock = repo.lock()?;

        let mut keyring = repo.keyring()?;
        let mut keys = BTreeMap::new();
        let mut roles = BTreeMap::new();
        for role in RoleType::ALL {
            let threshold = repo.config.thresholds.get(role);
            let mut keyids = Vec::new();
            for _ in 0..threshold.get() {
                let pair = KeyPair::generate()?;
                let public = pair.public_key();
                let keyid = keyring.add(role, pair)?;
                keys.insert(keyid.clone(), public);
                keyids.push(keyid);
            }
            roles.insert(role, RoleKeys { keyids, threshold });
        }
        let root = Root {
            spec_version: SPEC_VERSION.to_owned(),
            version: NonZeroU64::MIN,
            expires: repo.expires(RoleType::Root),
            keys,
            roles,
        };
        let targets = Targets {
            spec_version: SPEC_VERSION.to_owned(),
            version: NonZeroU64::MIN,
            expires: repo.expires(RoleType::Targets),
            targets: BTreeMap::new(),
        };

        let signed_root = encode(&sign_role(&root, &keyring, root.clone())?)?;
        let targets = encode(&sign_role(&root, &keyring, targets)?)?;
        let [snapshot, timestamp] = repo.sign_snapshot_and_timestamp(&root, &keyring, &targets)?;

        keyring.save(repo.passphrase())?;
        fs::create_dir_all(repo.targets_dir()).context(error::DirCreateSnafu {
            path: repo.targets_dir(),
        })?;
        repo.store
            .save_all(&[signed_root, targets, snapshot, timestamp])
            .context(error::StoreSnafu)?;
        repo.config.save(dir)?;
        info!(
            "Initialized repository for '{}' in {}",
            repo.config.app_name,
            dir.display()
        );
        Ok(repo)
    }

    /// Opens an existing repository.
    pub fn open(dir: &Path, passphrase: Option<&str>) -> Result<Self> {
        let config = RepoConfig::load(dir)?;
        Ok(Self::with_config(dir, config, passphrase))
    }

    fn with_config(dir: &Path, config: RepoConfig, passphrase: Option<&str>) -> Self {
        let store = MetadataStore::new(dir.join(&config.metadata_dir));
        Self {
            dir: dir.to_owned(),
            config,
            store,
            passphrase: passphrase.map(str::to_owned),
        }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Mutable access to the configuration, e.g. to change an expiration before a refresh.
    /// Changes are not saved to `tuftool.toml`.
    pub fn config_mut(&mut self) -> &mut RepoConfig {
        &mut self.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn metadata_dir(&self) -> &Path {
        self.store.path()
    }

    pub fn targets_dir(&self) -> PathBuf {
        self.dir.join(&self.config.targets_dir)
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.dir.join(&self.config.keys_dir)
    }

    pub(crate) fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }

    pub fn keyring(&self) -> Result<Keyring> {
        Keyring::load(&self.keys_dir(), self.passphrase())
    }

    /// Serializes publishers working on this repository.
    pub(crate) fn lock(&self) -> Result<StoreLock> {
        self.store.lock().context(error::StoreSnafu)
    }

    /// Every published version of the application, oldest first.
    pub fn versions(&self) -> Result<Vec<Version>> {
        self.store
            .list_target_versions(&self.config.app_name)
            .context(error::StoreSnafu)
    }

    /// The expiration for a role signed now, rounded down to the second.
    pub(crate) fn expires(&self, role: RoleType) -> DateTime<Utc> {
        let time = Utc::now() + Duration::days(self.config.expiration_days.get(role));
        time.with_nanosecond(0).unwrap_or(time)
    }

    pub(crate) fn load_required<T: Role + DeserializeOwned>(&self) -> Result<Signed<T>> {
        self.store
            .load::<T>()
            .context(error::StoreSnafu)?
            .context(error::MissingMetadataSnafu { role: T::TYPE })
    }

    /// The version the next copy of role `T` should carry.
    pub(crate) fn next_version<T: Role + DeserializeOwned>(&self) -> Result<NonZeroU64> {
        Ok(self
            .store
            .load::<T>()
            .context(error::StoreSnafu)?
            .map_or(NonZeroU64::MIN, |current| {
                current.signed.version().saturating_add(1)
            }))
    }

    /// Signs a snapshot pinning `targets` and a timestamp pinning that snapshot, each with the
    /// next version number and a fresh expiration.
    pub(crate) fn sign_snapshot_and_timestamp(
        &self,
        root: &Root,
        keyring: &Keyring,
        targets: &Encoded,
    ) -> Result<[Encoded; 2]> {
        let snapshot = Snapshot {
            spec_version: SPEC_VERSION.to_owned(),
            version: self.next_version::<Snapshot>()?,
            expires: self.expires(RoleType::Snapshot),
            meta: BTreeMap::from([(RoleType::Targets.filename(), targets.meta())]),
        };
        let snapshot = encode(&sign_role(root, keyring, snapshot)?)?;

        let timestamp = Timestamp {
            spec_version: SPEC_VERSION.to_owned(),
            version: self.next_version::<Timestamp>()?,
            expires: self.expires(RoleType::Timestamp),
            meta: BTreeMap::from([(RoleType::Snapshot.filename(), snapshot.meta())]),
        };
        let timestamp = encode(&sign_role(root, keyring, timestamp)?)?;
        Ok([snapshot, timestamp])
    }
}

pub(crate) fn encode<T: Role>(signed: &Signed<T>) -> Result<Encoded> {
    Encoded::new(signed).context(error::StoreSnafu)
}
