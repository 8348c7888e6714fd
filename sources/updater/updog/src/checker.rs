use crate::apply::Installation;
use crate::config::Config;
use crate::error::{self, Result};
use crate::io::Fetcher;
use crate::{check_expiry, join_url, parse, trust};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use semver::Version;
use serde::de::DeserializeOwned;
use serde::Serialize;
use snafu::{ensure, OptionExt, ResultExt};
use std::fmt;
use std::num::NonZeroU64;
use tuf_schema::{Meta, Role, RoleType, Root, Signed, Snapshot, Target, Targets, Timestamp};
use tuf_store::MetadataStore;

/// A release that is newer than the installed version, as listed in verified targets metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Update {
    pub name: String,
    pub version: Version,
    /// Path of the archive under the targets base URL.
    pub path: String,
    pub target: Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    UpdatingRoot,
    FetchingTimestamp,
    VerifyingTimestamp,
    FetchingSnapshot,
    VerifyingSnapshot,
    FetchingTargets,
    VerifyingTargets,
    ComparingVersions,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Idle => "idle",
            State::UpdatingRoot => "updating root",
            State::FetchingTimestamp => "fetching timestamp",
            State::VerifyingTimestamp => "verifying timestamp",
            State::FetchingSnapshot => "fetching snapshot",
            State::VerifyingSnapshot => "verifying snapshot",
            State::FetchingTargets => "fetching targets",
            State::VerifyingTargets => "verifying targets",
            State::ComparingVersions => "comparing versions",
        })
    }
}

/// One update check. Nothing fetched is acted on or cached until it has been verified, and the
/// cache is only written once timestamp, snapshot and targets have all been verified together.
pub(crate) struct Checker<'a> {
    config: &'a Config,
    fetcher: Fetcher<'a>,
    cache: &'a MetadataStore,
    installation: &'a Installation,
    now: DateTime<Utc>,
    state: State,
}

impl<'a> Checker<'a> {
    pub(crate) fn new(
        config: &'a Config,
        fetcher: Fetcher<'a>,
        cache: &'a MetadataStore,
        installation: &'a Installation,
    ) -> Self {
        Self {
            config,
            fetcher,
            cache,
            installation,
            now: Utc::now(),
            state: State::Idle,
        }
    }

    fn enter(&mut self, next: State) {
        debug!("Update check: {} -> {}", self.state, next);
        self.state = next;
    }

    pub(crate) async fn check(mut self) -> Result<Option<Update>> {
        self.enter(State::UpdatingRoot);
        let root = trust::update_root(self.config, &self.fetcher, self.cache, self.now).await?;
        let root = &root.signed;

        self.enter(State::FetchingTimestamp);
        let timestamp_bytes = self
            .fetch_role(RoleType::Timestamp, self.config.max_metadata_size)
            .await?;
        self.enter(State::VerifyingTimestamp);
        let timestamp: Signed<Timestamp> = self.verify(root, &timestamp_bytes)?;
        let cached_timestamp = self.cached::<Timestamp>()?;
        check_rollback(cached_timestamp.as_ref(), &timestamp)?;
        check_expiry(&timestamp.signed, self.now, self.config.clock_skew())?;

        let unchanged = cached_timestamp
            .is_some_and(|cached| cached.signed.version == timestamp.signed.version);
        let cached_targets = if unchanged {
            debug!(
                "Timestamp is still version {}; using cached targets",
                timestamp.signed.version
            );
            self.cached_targets(root)?
        } else {
            None
        };
        let targets = match cached_targets {
            Some(targets) => targets,
            None => {
                self.fetch_snapshot_and_targets(root, &timestamp, &timestamp_bytes)
                    .await?
            }
        };

        self.enter(State::ComparingVersions);
        let installed = self
            .installation
            .installed_version(&self.config.current_version)?;
        let app_name = &self.config.app_name;
        match targets.latest(app_name) {
            Some((path, target)) if target.custom.version > installed => {
                info!(
                    "Update available: {} {} -> {}",
                    app_name, installed, target.custom.version
                );
                Ok(Some(Update {
                    name: app_name.clone(),
                    version: target.custom.version.clone(),
                    path: path.to_owned(),
                    target: target.clone(),
                }))
            }
            _ => {
                info!("No update available: {} {} is current", app_name, installed);
                Ok(None)
            }
        }
    }

    async fn fetch_snapshot_and_targets(
        &mut self,
        root: &Root,
        timestamp: &Signed<Timestamp>,
        timestamp_bytes: &[u8],
    ) -> Result<Targets> {
        self.enter(State::FetchingSnapshot);
        let snapshot_meta = timestamp
            .signed
            .snapshot_meta()
            .context(error::MetaMissingSnafu {
                role: RoleType::Timestamp,
                file: RoleType::Snapshot.filename(),
            })?;
        let snapshot_bytes = self
            .fetch_role(RoleType::Snapshot, snapshot_meta.length)
            .await?;
        self.enter(State::VerifyingSnapshot);
        let snapshot: Signed<Snapshot> = self.verify(root, &snapshot_bytes)?;
        let cached_snapshot = self.cached::<Snapshot>()?;
        check_rollback(cached_snapshot.as_ref(), &snapshot)?;
        check_meta(
            RoleType::Timestamp,
            snapshot_meta,
            snapshot.signed.version,
            &snapshot_bytes,
        )?;
        check_expiry(&snapshot.signed, self.now, self.config.clock_skew())?;
        let targets_meta = snapshot
            .signed
            .targets_meta()
            .context(error::MetaMissingSnafu {
                role: RoleType::Snapshot,
                file: RoleType::Targets.filename(),
            })?;
        if let Some(cached) = cached_snapshot
            .as_ref()
            .and_then(|cached| cached.signed.targets_meta())
        {
            ensure!(
                targets_meta.version >= cached.version,
                error::RollbackSnafu {
                    role: RoleType::Targets,
                    fetched: targets_meta.version.get(),
                    cached: cached.version.get(),
                }
            );
        }

        self.enter(State::FetchingTargets);
        let targets_bytes = self
            .fetch_role(RoleType::Targets, targets_meta.length)
            .await?;
        self.enter(State::VerifyingTargets);
        let targets: Signed<Targets> = self.verify(root, &targets_bytes)?;
        let cached_targets = self.cached::<Targets>()?;
        check_rollback(cached_targets.as_ref(), &targets)?;
        check_meta(
            RoleType::Snapshot,
            targets_meta,
            targets.signed.version,
            &targets_bytes,
        )?;
        check_expiry(&targets.signed, self.now, self.config.clock_skew())?;
        targets
            .signed
            .check_paths()
            .context(error::TargetPathSnafu)?;
        if let Some(cached) = &cached_targets {
            check_immutable(&cached.signed, &targets.signed)?;
        }

        self.persist(&[
            (RoleType::Targets, targets.signed.version, targets_bytes.as_slice()),
            (
                RoleType::Snapshot,
                snapshot.signed.version,
                snapshot_bytes.as_slice(),
            ),
            (
                RoleType::Timestamp,
                timestamp.signed.version,
                timestamp_bytes,
            ),
        ])?;
        Ok(targets.signed)
    }

    async fn fetch_role(&self, role: RoleType, max_size: u64) -> Result<Vec<u8>> {
        let url = join_url(&self.config.metadata_base_url, &role.filename())?;
        debug!("Fetching {}", url);
        self.fetcher.fetch(&url, max_size).await
    }

    fn verify<T: Role + DeserializeOwned>(&self, root: &Root, bytes: &[u8]) -> Result<Signed<T>> {
        let role: Signed<T> = parse(bytes)?;
        if let Err(source) = root.verify_role(&role) {
            warn!("Rejected {} metadata: {}", T::TYPE, source);
            return Err(source).context(error::SignatureSnafu { role: T::TYPE });
        }
        Ok(role)
    }

    /// The cached copy of a role. A cache entry that can't be parsed is treated as missing.
    fn cached<T: Role + DeserializeOwned>(&self) -> Result<Option<Signed<T>>> {
        match self.cache.load::<T>() {
            Ok(cached) => Ok(cached),
            Err(e) if e.is_corrupt() => {
                warn!("Ignoring cached {} metadata: {}", T::TYPE, e);
                Ok(None)
            }
            Err(e) => Err(e).context(error::StoreSnafu),
        }
    }

    /// Cached targets that still verify under `root` and haven't expired.
    fn cached_targets(&self, root: &Root) -> Result<Option<Targets>> {
        let Some(targets) = self.cached::<Targets>()? else {
            return Ok(None);
        };
        if root.verify_role(&targets).is_err() {
            debug!("Cached targets no longer verify; fetching again");
            return Ok(None);
        }
        check_expiry(&targets.signed, self.now, self.config.clock_skew())?;
        Ok(Some(targets.signed))
    }

    /// Writes verified metadata to the cache, versioned files first and the timestamp alias last,
    /// so an interrupted write never leaves a cached timestamp that is ahead of its snapshot.
    fn persist(&self, docs: &[(RoleType, NonZeroU64, &[u8])]) -> Result<()> {
        for (role, version, bytes) in docs {
            self.cache
                .write(&role.versioned_filename(*version), bytes)
                .context(error::StoreSnafu)?;
        }
        for (role, version, bytes) in docs {
            self.cache
                .write(&role.filename(), bytes)
                .context(error::StoreSnafu)?;
            debug!("Cached {} version {}", role, version);
        }
        Ok(())
    }
}

fn check_rollback<T: Role>(cached: Option<&Signed<T>>, fetched: &Signed<T>) -> Result<()> {
    if let Some(cached) = cached {
        let (cached, fetched) = (cached.signed.version(), fetched.signed.version());
        if fetched < cached {
            warn!(
                "Fetched {} version {} is older than cached version {}",
                T::TYPE,
                fetched,
                cached
            );
        }
        ensure!(
            fetched >= cached,
            error::RollbackSnafu {
                role: T::TYPE,
                fetched: fetched.get(),
                cached: cached.get(),
            }
        );
    }
    Ok(())
}

/// Checks fetched metadata against the entry `by` recorded for it.
fn check_meta(by: RoleType, meta: &Meta, version: NonZeroU64, bytes: &[u8]) -> Result<()> {
    let role = match by {
        RoleType::Timestamp => RoleType::Snapshot,
        _ => RoleType::Targets,
    };
    ensure!(
        version == meta.version,
        error::MetaVersionMismatchSnafu {
            role,
            by,
            expected: meta.version.get(),
            actual: version.get(),
        }
    );
    let calculated = Meta::describe(version, bytes);
    ensure!(
        calculated.length == meta.length && meta.hashes.matches(&calculated.hashes),
        error::MetaHashMismatchSnafu { role, by }
    );
    Ok(())
}

/// A path published once must keep its length and digests.
fn check_immutable(cached: &Targets, fetched: &Targets) -> Result<()> {
    for (path, target) in &fetched.targets {
        if let Some(previous) = cached.targets.get(path) {
            ensure!(
                previous.length == target.length && previous.hashes == target.hashes,
                error::TargetChangedSnafu { path }
            );
        }
    }
    Ok(())
}
