//! Starting the updater from inside the application it updates.
//!
//! Call [`init`] early during startup to fail fast on a broken configuration, then [`spawn`] to
//! check and apply in the background while the application keeps running its current version:
//!
//! ```no_run
//! # async fn run(config: updog::Config) -> updog::Result<()> {
//! updog::bootstrap::init(&config)?;
//! let update = updog::bootstrap::spawn(config, &tokio::runtime::Handle::current())?;
//! // ... on shutdown:
//! update.cancel();
//! let outcome = update.outcome().await;
//! # Ok(())
//! # }
//! ```

use crate::apply::Installation;
use crate::config::Config;
use crate::error::{self, Result};
use crate::trust::load_trusted_root;
use crate::updater::{Outcome, Updater};
use log::info;
use snafu::ResultExt;
use std::fs;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Prepares the installation and cache directories and checks that the provisioned trusted root
/// can be read and is signed by its own keys.
pub fn init(config: &Config) -> Result<Installation> {
    let installation = Installation::new(&config.install_root);
    installation.prepare()?;
    let cache_dir = config.cache_dir();
    fs::create_dir_all(&cache_dir).context(error::DirCreateSnafu { path: cache_dir })?;
    let root = load_trusted_root(config)?;
    info!(
        "{} {} trusts root version {} (expires {})",
        config.app_name, config.current_version, root.signed.version, root.signed.expires
    );
    Ok(installation)
}

/// A check-and-apply running on a background task.
#[derive(Debug)]
pub struct BackgroundUpdate {
    cancel: CancellationToken,
    handle: JoinHandle<Outcome>,
}

impl BackgroundUpdate {
    /// Stops the update at its next suspension point. The installation is left untouched unless
    /// the new version was already activated.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the update to finish.
    pub async fn outcome(self) -> Outcome {
        self.handle
            .await
            .context(error::JoinSnafu)
            .unwrap_or_else(Outcome::from)
    }
}

/// Runs [`Updater::check_and_apply`] for `config` on `handle`.
pub fn spawn(config: Config, handle: &Handle) -> Result<BackgroundUpdate> {
    Ok(spawn_updater(Updater::new(config)?, handle))
}

/// Like [`spawn`], for an updater built with its own transport.
pub fn spawn_updater(updater: Updater, handle: &Handle) -> BackgroundUpdate {
    let cancel = updater.cancellation_token();
    let handle = handle.spawn(async move { updater.check_and_apply().await });
    BackgroundUpdate { cancel, handle }
}
