use crate::apply::{self, Installation};
use crate::checker::{Checker, Update};
use crate::config::Config;
use crate::error::{self, Error, FailureReason, Result};
use crate::io::Fetcher;
use crate::transport::{DefaultTransport, Transport};
use log::{info, warn};
use semver::Version;
use serde::Serialize;
use snafu::ResultExt;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tuf_store::MetadataStore;

/// The result of a check or an apply, which is all the calling application sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum Outcome {
    NoUpdate,
    UpdateAvailable(Update),
    /// The new version is installed and active; `restart_required` is false if it already was.
    Applied {
        version: Version,
        restart_required: bool,
    },
    Failed {
        reason: FailureReason,
        message: String,
    },
}

impl From<Error> for Outcome {
    fn from(err: Error) -> Self {
        let reason = err.reason();
        match reason {
            FailureReason::Cancelled => info!("Update cancelled"),
            _ => warn!("Update failed ({}): {}", reason, err),
        }
        Outcome::Failed {
            reason,
            message: err.to_string(),
        }
    }
}

/// Checks for and applies updates for one installation.
#[derive(Debug)]
pub struct Updater {
    config: Config,
    transport: Box<dyn Transport>,
    cache: MetadataStore,
    installation: Installation,
    cancel: CancellationToken,
}

impl Updater {
    /// An updater that fetches `http(s)://` and `file://` URLs.
    pub fn new(config: Config) -> Result<Self> {
        let transport =
            DefaultTransport::new(config.fetch_timeout()).context(error::HttpClientSnafu)?;
        Ok(Self::with_transport(config, Box::new(transport)))
    }

    pub fn with_transport(config: Config, transport: Box<dyn Transport>) -> Self {
        let cache = MetadataStore::new(config.cache_dir());
        let installation = Installation::new(&config.install_root);
        Self {
            config,
            transport,
            cache,
            installation,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn installation(&self) -> &Installation {
        &self.installation
    }

    /// A token that cancels this updater's current and future operations. Cancelling leaves the
    /// installation as it was.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn fetcher(&self) -> Fetcher<'_> {
        Fetcher::new(
            self.transport.as_ref(),
            self.config.fetch_timeout(),
            self.config.download_timeout(),
        )
    }

    /// Runs `fut` unless it is cancelled first.
    async fn cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => error::CancelledSnafu.fail(),
            result = fut => result,
        }
    }

    async fn check_inner(&self) -> Result<Option<Update>> {
        let fetcher = self.fetcher();
        Checker::new(&self.config, fetcher, &self.cache, &self.installation)
            .check()
            .await
    }

    async fn apply_inner(&self, update: &Update) -> Result<Outcome> {
        let restart_required = apply::apply(
            &self.config,
            &self.fetcher(),
            &self.installation,
            update,
            &self.cancel,
        )
        .await?;
        Ok(Outcome::Applied {
            version: update.version.clone(),
            restart_required,
        })
    }

    /// Checks the repository for a release newer than the installed version.
    pub async fn check(&self) -> Outcome {
        match self.cancellable(self.check_inner()).await {
            Ok(Some(update)) => Outcome::UpdateAvailable(update),
            Ok(None) => Outcome::NoUpdate,
            Err(err) => err.into(),
        }
    }

    /// Downloads, verifies and activates `update`, as returned by [`Updater::check`].
    pub async fn apply(&self, update: &Update) -> Outcome {
        self.cancellable(self.apply_inner(update))
            .await
            .unwrap_or_else(Outcome::from)
    }

    /// Checks and, if there is an update, applies it.
    pub async fn check_and_apply(&self) -> Outcome {
        match self.check().await {
            Outcome::UpdateAvailable(update) => self.apply(&update).await,
            other => other,
        }
    }
}
