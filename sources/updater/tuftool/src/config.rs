//! The repository's `tuftool.toml`, written by `init` and read by every other command.

use crate::error::{self, Result};
use crate::write_atomic;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::fs;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use tuf_schema::{RoleType, TargetLayout};

pub const CONFIG_FILE: &str = "tuftool.toml";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RepoConfig {
    /// The application this repository publishes.
    pub app_name: String,
    /// Relative paths are resolved against the repository directory.
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,
    #[serde(default = "default_targets_dir")]
    pub targets_dir: PathBuf,
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,
    /// How archives are arranged in `targets_dir`; clients must be configured to match.
    #[serde(default)]
    pub target_layout: TargetLayout,
    #[serde(default)]
    pub expiration_days: PerRole<i64>,
    #[serde(default)]
    pub thresholds: PerRole<NonZeroU64>,
}

/// A value for each of the four roles.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct PerRole<T> {
    pub root: T,
    pub targets: T,
    pub snapshot: T,
    pub timestamp: T,
}

impl<T: Copy> PerRole<T> {
    pub fn get(&self, role: RoleType) -> T {
        match role {
            RoleType::Root => self.root,
            RoleType::Targets => self.targets,
            RoleType::Snapshot => self.snapshot,
            RoleType::Timestamp => self.timestamp,
        }
    }
}

impl Default for PerRole<i64> {
    fn default() -> Self {
        Self {
            root: 365,
            targets: 365,
            snapshot: 7,
            timestamp: 1,
        }
    }
}

impl Default for PerRole<NonZeroU64> {
    fn default() -> Self {
        let one = NonZeroU64::MIN;
        Self {
            root: one,
            targets: one,
            snapshot: one,
            timestamp: one,
        }
    }
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("metadata")
}

fn default_targets_dir() -> PathBuf {
    PathBuf::from("targets")
}

fn default_keys_dir() -> PathBuf {
    PathBuf::from("keys")
}

impl RepoConfig {
    /// A configuration with default directories, expirations and thresholds.
    pub fn new<S: Into<String>>(app_name: S) -> Self {
        Self {
            app_name: app_name.into(),
            metadata_dir: default_metadata_dir(),
            targets_dir: default_targets_dir(),
            keys_dir: default_keys_dir(),
            target_layout: TargetLayout::default(),
            expiration_days: PerRole::default(),
            thresholds: PerRole::default(),
        }
    }

    pub fn load(repo: &Path) -> Result<Self> {
        let path = repo.join(CONFIG_FILE);
        let s = fs::read_to_string(&path).context(error::FileReadSnafu { path: &path })?;
        toml::from_str(&s).context(error::ConfigParseSnafu { path })
    }

    pub fn save(&self, repo: &Path) -> Result<()> {
        let s = toml::to_string_pretty(self).context(error::ConfigSerializeSnafu)?;
        write_atomic(&repo.join(CONFIG_FILE), s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: RepoConfig = toml::from_str(r#"app_name = "demo""#).unwrap();
        assert_eq!(config, RepoConfig::new("demo"));
        assert_eq!(config.expiration_days.get(RoleType::Timestamp), 1);
        assert_eq!(config.thresholds.get(RoleType::Root).get(), 1);
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RepoConfig::new("demo");
        config.thresholds.targets = NonZeroU64::new(2).unwrap();
        config.target_layout = TargetLayout::Release;
        config.save(dir.path()).unwrap();
        assert_eq!(RepoConfig::load(dir.path()).unwrap(), config);
    }
}
