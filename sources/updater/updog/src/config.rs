//! The client's configuration record.

use crate::error::{self, Result};
use semver::Version;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tuf_schema::TargetLayout;

/// Where the `updog` binary looks for its configuration unless told otherwise.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/updog.toml";

/// Directory under the installation root that holds the client's own state.
pub(crate) const STATE_DIR: &str = ".updog";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    /// Name of the application, as recorded in target descriptors.
    pub app_name: String,
    /// The version that was installed out-of-band, e.g. by the system package. An active version
    /// installed by this client takes precedence when it is newer.
    pub current_version: Version,
    pub metadata_base_url: url::Url,
    pub targets_base_url: url::Url,
    /// Provisioned root metadata; never modified by the client.
    pub trusted_root: PathBuf,
    /// Directory holding `versions/<version>` and the `current` link.
    pub install_root: PathBuf,
    /// Cache of verified metadata; defaults to `<install_root>/.updog/metadata`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    /// Bounds each metadata fetch as a whole, and each request and chunk of an artifact download.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Bounds an artifact download as a whole.
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Where archives live under `targets_base_url`.
    #[serde(default)]
    pub target_layout: TargetLayout,
    /// How far past its expiration metadata is still accepted.
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
    /// Number of installed versions to keep, including the active one.
    #[serde(default = "default_retain_versions")]
    pub retain_versions: usize,
    #[serde(default = "default_max_root_updates")]
    pub max_root_updates: u64,
    #[serde(default = "default_max_metadata_size")]
    pub max_metadata_size: u64,
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_download_timeout_secs() -> u64 {
    600
}

fn default_clock_skew_secs() -> u64 {
    60
}

fn default_retain_versions() -> usize {
    2
}

fn default_max_root_updates() -> u64 {
    1024
}

fn default_max_metadata_size() -> u64 {
    1024 * 1024
}

impl Config {
    /// A configuration with every optional setting at its default.
    pub fn new(
        app_name: &str,
        current_version: Version,
        metadata_base_url: url::Url,
        targets_base_url: url::Url,
        trusted_root: PathBuf,
        install_root: PathBuf,
    ) -> Self {
        Self {
            app_name: app_name.to_owned(),
            current_version,
            metadata_base_url,
            targets_base_url,
            trusted_root,
            install_root,
            cache_dir: None,
            fetch_timeout_secs: default_fetch_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            target_layout: TargetLayout::default(),
            clock_skew_secs: default_clock_skew_secs(),
            retain_versions: default_retain_versions(),
            max_root_updates: default_max_root_updates(),
            max_metadata_size: default_max_metadata_size(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path).context(error::ConfigReadSnafu { path })?;
        toml::from_str(&s).context(error::ConfigParseSnafu { path })
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.install_root.join(STATE_DIR).join("metadata"))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.clock_skew_secs).unwrap_or(i64::MAX))
    }
}
