/*!
The client side of the update protocol.

An [`Updater`] checks the repository described by its [`Config`] and installs the newest release
of the application when it is newer than the installed one:

1. The root of trust is brought up to date by walking the root rotation chain from the
   provisioned `trusted_root`.
2. `timestamp.json`, `snapshot.json` and `targets.json` are fetched in that order, each one
   verified against the current root, against the metadata that refers to it, against the
   previously cached copy (versions never go backwards) and against the clock.
3. The newest target for the application is compared with the installed version.
4. To apply, the archive is streamed into a staging directory while its length and digests are
   checked, unpacked beside the installed versions, and the `current` link is switched to it in
   one rename.

Every operation reports an [`Outcome`]; errors never escape to the caller, only a
[`FailureReason`]. [`bootstrap::spawn`] runs the whole thing on a background task.

```text
<install_root>/
  current -> versions/1.0.2
  versions/1.0.0/
  versions/1.0.2/
  .updog/apply.lock
  .updog/metadata/        verified metadata cache
```
*/

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

mod apply;
pub mod bootstrap;
mod checker;
pub mod config;
pub mod error;
mod io;
pub mod transport;
mod trust;
mod updater;

pub use crate::apply::Installation;
pub use crate::checker::Update;
pub use crate::config::Config;
pub use crate::error::{Error, FailureReason, Result};
pub use crate::updater::{Outcome, Updater};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use snafu::{ensure, ResultExt};
use tuf_schema::{Role, Signed};
use url::Url;

/// Resolves `name` under a base URL, treating the base as a directory whether or not it ends in
/// a slash.
pub(crate) fn join_url(base: &Url, name: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(name).context(error::BaseUrlSnafu { url: base.clone() })
}

pub(crate) fn parse<T: Role + DeserializeOwned>(bytes: &[u8]) -> Result<Signed<T>> {
    serde_json::from_slice(bytes).context(error::MetadataParseSnafu { role: T::TYPE })
}

/// Fails if `role` expired more than `skew` before `now`.
pub(crate) fn check_expiry<T: Role>(
    role: &T,
    now: DateTime<Utc>,
    skew: chrono::Duration,
) -> Result<()> {
    let expires = role.expires();
    ensure!(
        now - skew <= expires,
        error::ExpiredSnafu {
            role: T::TYPE,
            expires
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_treats_base_as_directory() {
        for base in ["file:///srv/repo/metadata", "file:///srv/repo/metadata/"] {
            let url = join_url(&Url::parse(base).unwrap(), "timestamp.json").unwrap();
            assert_eq!(url.as_str(), "file:///srv/repo/metadata/timestamp.json");
        }
        let url = join_url(
            &Url::parse("https://example.com/targets").unwrap(),
            "demo-1.0.2.tar.gz",
        )
        .unwrap();
        assert_eq!(url.as_str(), "https://example.com/targets/demo-1.0.2.tar.gz");
    }
}
