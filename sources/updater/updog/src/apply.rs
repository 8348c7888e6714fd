//! Side-by-side installation. Each version is unpacked into its own directory under `versions/`
//! and the `current` symlink names the active one. Switching versions replaces the symlink with a
//! single rename, so a crash at any point leaves `current` pointing at a complete directory.

use crate::checker::Update;
use crate::config::{Config, STATE_DIR};
use crate::error::{self, Result};
use crate::io::Fetcher;
use crate::join_url;
use flate2::read::GzDecoder;
use fs2::FileExt;
use log::{debug, info, warn};
use semver::Version;
use snafu::{ensure, ResultExt};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

const VERSIONS_DIR: &str = "versions";
const CURRENT_LINK: &str = "current";
const LOCK_FILE: &str = "apply.lock";
const STAGING_PREFIX: &str = ".staging-";

/// An installation root: the versions installed side by side and the pointer to the active one.
#[derive(Debug, Clone)]
pub struct Installation {
    root: PathBuf,
}

impl Installation {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }

    pub fn version_dir(&self, version: &Version) -> PathBuf {
        self.versions_dir().join(version.to_string())
    }

    /// The symlink naming the active version directory.
    pub fn current_link(&self) -> PathBuf {
        self.root.join(CURRENT_LINK)
    }

    /// Creates the installation's directories if they don't exist yet.
    pub fn prepare(&self) -> Result<()> {
        for path in [self.versions_dir(), self.root.join(STATE_DIR)] {
            fs::create_dir_all(&path).context(error::DirCreateSnafu { path })?;
        }
        Ok(())
    }

    /// The version the `current` link points at, or `None` if nothing was installed by the
    /// client yet.
    pub fn active_version(&self) -> Result<Option<Version>> {
        let link = self.current_link();
        let target = match fs::read_link(&link) {
            Ok(target) => target,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(error::ReadLinkSnafu { path: link }),
        };
        let version = target
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| Version::parse(name).ok());
        if version.is_none() {
            warn!(
                "{} points at {}, which is not a version directory",
                link.display(),
                target.display()
            );
        }
        Ok(version)
    }

    /// The newer of the provisioned version and the active version.
    pub fn installed_version(&self, provisioned: &Version) -> Result<Version> {
        Ok(match self.active_version()? {
            Some(active) if active > *provisioned => active,
            _ => provisioned.clone(),
        })
    }

    /// Every version directory, oldest first.
    pub fn versions(&self) -> Result<Vec<Version>> {
        let dir = self.versions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(error::ListDirSnafu { path: dir }),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.context(error::ListDirSnafu { path: &dir })?;
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| Version::parse(name).ok())
            {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Takes the installation's apply lock, or fails if another process or task holds it.
    fn try_lock(&self) -> Result<InstallLock> {
        let path = self.root.join(STATE_DIR).join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .context(error::LockSnafu { path: &path })?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(InstallLock { _file: file }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                error::ApplyLockedSnafu { path: &self.root }.fail()
            }
            Err(e) => Err(e).context(error::LockSnafu { path }),
        }
    }

    /// Points `current` at `version` by renaming a fresh symlink over it.
    fn activate(&self, version: &Version) -> Result<()> {
        let target = Path::new(VERSIONS_DIR).join(version.to_string());
        let temp_link = self
            .root
            .join(format!(".{CURRENT_LINK}.{}", std::process::id()));
        match fs::remove_file(&temp_link) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).context(error::SymlinkSnafu {
                    version: version.clone(),
                })
            }
        }
        std::os::unix::fs::symlink(&target, &temp_link).context(error::SymlinkSnafu {
            version: version.clone(),
        })?;
        fs::rename(&temp_link, self.current_link()).context(error::SymlinkSnafu {
            version: version.clone(),
        })?;
        info!("Active version is now {}", version);
        Ok(())
    }

    /// Removes staging directories left behind by an apply that was killed. Only called with the
    /// apply lock held, so none of them can belong to a running apply.
    fn remove_stale_staging(&self) -> Result<()> {
        let dir = self.versions_dir();
        for entry in fs::read_dir(&dir).context(error::ListDirSnafu { path: &dir })? {
            let entry = entry.context(error::ListDirSnafu { path: &dir })?;
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                let path = entry.path();
                fs::remove_dir_all(&path).context(error::RemoveSnafu { path: &path })?;
                info!("Removed stale staging directory {}", path.display());
            }
        }
        Ok(())
    }

    /// Removes all but the newest `retain` versions. The active version is always kept.
    fn prune(&self, retain: usize) -> Result<()> {
        let active = self.active_version()?;
        let versions = self.versions()?;
        let keep_from = versions.len().saturating_sub(retain.max(1));
        for version in &versions[..keep_from] {
            if Some(version) == active.as_ref() {
                continue;
            }
            let path = self.version_dir(version);
            fs::remove_dir_all(&path).context(error::RemoveSnafu { path })?;
            info!("Removed old version {}", version);
        }
        Ok(())
    }
}

/// Held while an update is applied; dropping it releases the lock.
#[derive(Debug)]
struct InstallLock {
    _file: File,
}

/// Downloads, verifies and installs `update`, returning true if the application must restart to
/// run it. Until the final rename nothing outside the staging directory changes; if `cancel`
/// fires or anything fails before then, the staging directory is removed and the installation
/// is left as it was.
pub(crate) async fn apply(
    config: &Config,
    fetcher: &Fetcher<'_>,
    installation: &Installation,
    update: &Update,
    cancel: &CancellationToken,
) -> Result<bool> {
    installation.prepare()?;
    let _lock = installation.try_lock()?;
    if let Err(e) = installation.remove_stale_staging() {
        warn!("Failed to remove stale staging directories: {}", e);
    }

    if installation.active_version()?.as_ref() == Some(&update.version) {
        info!("{} {} is already active", update.name, update.version);
        return Ok(false);
    }
    update
        .target
        .check_path(&update.path)
        .context(error::TargetPathSnafu)?;

    let versions_dir = installation.versions_dir();
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(&versions_dir)
        .context(error::StagingSnafu {
            path: &versions_dir,
        })?;
    let archive_path = staging.path().join(&update.path);
    let url = archive_url(config, update)?;
    info!("Downloading {}", url);
    let mut file = tokio::fs::File::create(&archive_path)
        .await
        .context(error::WriteSnafu {
            path: &archive_path,
        })?;
    fetcher.download(&url, &update.target, &mut file).await?;
    file.sync_all().await.context(error::WriteSnafu {
        path: &archive_path,
    })?;
    drop(file);
    debug!("Verified {} ({} bytes)", update.path, update.target.length);

    let unpacked = staging.path().join("unpacked");
    let staging = {
        let unpacked = unpacked.clone();
        tokio::task::spawn_blocking(move || -> Result<TempDir> {
            unpack(&archive_path, &unpacked)?;
            Ok(staging)
        })
        .await
        .context(error::JoinSnafu)??
    };

    // Nothing below awaits, so a cancellation can't interrupt the switch.
    ensure!(!cancel.is_cancelled(), error::CancelledSnafu);
    let dest = installation.version_dir(&update.version);
    if dest.exists() {
        debug!("Replacing inactive copy of {}", update.version);
        fs::remove_dir_all(&dest).context(error::RemoveSnafu { path: &dest })?;
    }
    fs::rename(&unpacked, &dest).context(error::RenameSnafu { path: &dest })?;
    drop(staging);
    installation.activate(&update.version)?;

    if let Err(e) = installation.prune(config.retain_versions) {
        warn!("Failed to remove old versions: {}", e);
    }
    Ok(true)
}

/// The URL of the archive for `update`, per the configured target layout.
fn archive_url(config: &Config, update: &Update) -> Result<Url> {
    let location = config.target_layout.location(&update.path, &update.version);
    join_url(&config.targets_base_url, &location)
}

fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).context(error::ExtractSnafu { path: archive })?;
    let mut archive_reader = tar::Archive::new(GzDecoder::new(file));
    archive_reader.set_preserve_permissions(true);
    fs::create_dir_all(dest).context(error::DirCreateSnafu { path: dest })?;
    archive_reader
        .unpack(dest)
        .context(error::ExtractSnafu { path: archive })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(dir: &Path, versions: &[&str]) -> Installation {
        let installation = Installation::new(dir);
        installation.prepare().unwrap();
        for version in versions {
            let version = Version::parse(version).unwrap();
            fs::create_dir_all(installation.version_dir(&version)).unwrap();
        }
        installation
    }

    #[test]
    fn activate_switches_current() {
        let dir = tempfile::tempdir().unwrap();
        let installation = installed(dir.path(), &["1.0.0", "1.0.2"]);
        assert_eq!(installation.active_version().unwrap(), None);

        installation.activate(&Version::new(1, 0, 0)).unwrap();
        assert_eq!(
            installation.active_version().unwrap(),
            Some(Version::new(1, 0, 0))
        );
        installation.activate(&Version::new(1, 0, 2)).unwrap();
        assert_eq!(
            installation.active_version().unwrap(),
            Some(Version::new(1, 0, 2))
        );
        assert_eq!(
            fs::read_link(installation.current_link()).unwrap(),
            Path::new("versions/1.0.2")
        );
    }

    #[test]
    fn installed_version_prefers_newer() {
        let dir = tempfile::tempdir().unwrap();
        let installation = installed(dir.path(), &["1.0.2"]);
        let provisioned = Version::new(1, 0, 0);
        assert_eq!(installation.installed_version(&provisioned).unwrap(), provisioned);
        installation.activate(&Version::new(1, 0, 2)).unwrap();
        assert_eq!(
            installation.installed_version(&provisioned).unwrap(),
            Version::new(1, 0, 2)
        );
        assert_eq!(
            installation
                .installed_version(&Version::new(2, 0, 0))
                .unwrap(),
            Version::new(2, 0, 0)
        );
    }

    #[test]
    fn prune_keeps_active_and_newest() {
        let dir = tempfile::tempdir().unwrap();
        let installation = installed(dir.path(), &["0.9.0", "1.0.0", "1.1.0", "1.2.0"]);
        installation.activate(&Version::new(0, 9, 0)).unwrap();
        installation.prune(2).unwrap();
        assert_eq!(
            installation.versions().unwrap(),
            vec![
                Version::new(0, 9, 0),
                Version::new(1, 1, 0),
                Version::new(1, 2, 0)
            ]
        );
    }

    #[test]
    fn second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let installation = installed(dir.path(), &[]);
        let held = installation.try_lock().unwrap();
        let err = installation.try_lock().unwrap_err();
        assert_eq!(err.reason(), crate::FailureReason::ApplyInProgress);
        drop(held);
        installation.try_lock().unwrap();
    }

    #[test]
    fn stale_staging_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let installation = installed(dir.path(), &["1.0.0"]);
        let stale = installation
            .versions_dir()
            .join(format!("{STAGING_PREFIX}abc123"));
        fs::create_dir_all(stale.join("unpacked")).unwrap();

        installation.remove_stale_staging().unwrap();
        assert!(!stale.exists());
        assert_eq!(installation.versions().unwrap(), vec![Version::new(1, 0, 0)]);
    }

    #[test]
    fn archive_url_follows_layout() {
        use tuf_schema::{Hashes, Target, TargetCustom, TargetLayout};

        let version = Version::new(1, 0, 2);
        let update = Update {
            name: "demo".to_owned(),
            version: version.clone(),
            path: "demo-1.0.2.tar.gz".to_owned(),
            target: Target {
                length: 3,
                hashes: Hashes::compute(b"abc"),
                custom: TargetCustom {
                    name: "demo".to_owned(),
                    version,
                },
            },
        };
        let mut config = Config::new(
            "demo",
            Version::new(1, 0, 0),
            Url::parse("https://example.com/metadata/").unwrap(),
            Url::parse("https://github.com/example/demo/releases/download").unwrap(),
            PathBuf::from("/usr/share/demo/root.json"),
            PathBuf::from("/opt/demo"),
        );
        assert_eq!(
            archive_url(&config, &update).unwrap().as_str(),
            "https://github.com/example/demo/releases/download/demo-1.0.2.tar.gz"
        );
        config.target_layout = TargetLayout::Release;
        assert_eq!(
            archive_url(&config, &update).unwrap().as_str(),
            "https://github.com/example/demo/releases/download/v1.0.2/demo-1.0.2.tar.gz"
        );
    }
}
