/*!
Publisher-side tooling for an update repository.

A repository directory holds a `tuftool.toml` ([`config::RepoConfig`]), the role keys, the signed
metadata, and the published archives:

```text
repo/
  tuftool.toml
  keys/<role>/<keyid>.pem
  metadata/root.json, 1.root.json, targets.json, 1.targets.json, ...
  targets/<app>-<version>.tar.gz
```

The `metadata` and `targets` directories are what gets uploaded to the metadata and targets base
URLs; keys never leave the publisher. See [`repo::Repository`] for the operations.
*/

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod archive;
pub mod config;
pub mod error;
pub mod key;
mod publish;
pub mod repo;

pub use crate::error::{Error, Result};
pub use crate::publish::PublishedRelease;
pub use crate::repo::Repository;

use snafu::{OptionExt, ResultExt};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

/// Environment variable holding the passphrase for encrypted offline keys.
pub const PASSPHRASE_ENV: &str = "TUFTOOL_PASSPHRASE";

/// Writes `bytes` to `path` so that readers see either the old file or the new one, never a
/// partial write.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().context(error::PathParentSnafu { path })?;
    let mut writer =
        NamedTempFile::new_in(parent).context(error::FileTempCreateSnafu { path: parent })?;
    writer
        .write_all(bytes)
        .context(error::FileWriteSnafu { path })?;
    writer.persist(path).context(error::FilePersistSnafu { path })?;
    Ok(())
}
