/*!
A directory of signed role metadata.

Every document is stored twice, in canonical JSON: once as `<version>.<role>.json`, which never
changes after it is written, and once as `<role>.json`, the alias for the latest version. The
publisher writes into a `MetadataStore` and uploads the directory; the client keeps its cache of
verified metadata in one.

Writes are atomic (a temporary file in the same directory is renamed into place). When several
documents are saved together with [`MetadataStore::save_all`], every versioned file lands before
any alias, and aliases are written in the order given, so a publisher that passes the timestamp
last never exposes a timestamp that refers to metadata that isn't on disk yet.
*/

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;

pub use crate::error::{Error, Result};

use fs2::FileExt;
use log::debug;
use semver::Version;
use serde::de::DeserializeOwned;
use snafu::{ensure, ResultExt};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tuf_schema::{to_canonical_bytes, Meta, Role, RoleType, Signed, Targets};

const LOCK_FILE: &str = ".lock";

/// A signed document serialized to the exact bytes that will be stored and served.
#[derive(Debug, Clone)]
pub struct Encoded {
    role: RoleType,
    version: NonZeroU64,
    bytes: Vec<u8>,
}

impl Encoded {
    pub fn new<T: Role>(signed: &Signed<T>) -> Result<Self> {
        let bytes = to_canonical_bytes(signed, &format!("signed {} metadata", T::TYPE))
            .context(error::EncodeSnafu { role: T::TYPE })?;
        Ok(Self {
            role: T::TYPE,
            version: signed.signed.version(),
            bytes,
        })
    }

    pub fn role(&self) -> RoleType {
        self.role
    }

    pub fn version(&self) -> NonZeroU64 {
        self.version
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The snapshot/timestamp entry describing this file.
    pub fn meta(&self) -> Meta {
        Meta::describe(self.version, &self.bytes)
    }
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    /// Opens a store rooted at `dir`, which does not need to exist yet.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).context(error::DirCreateSnafu { path: &self.dir })
    }

    /// Loads the latest copy of role `T`, or `None` if it has never been saved.
    pub fn load<T: Role + DeserializeOwned>(&self) -> Result<Option<Signed<T>>> {
        self.load_file(&T::TYPE.filename())
    }

    /// Loads a specific version of role `T`, or `None` if that version was never saved.
    pub fn load_version<T: Role + DeserializeOwned>(
        &self,
        version: NonZeroU64,
    ) -> Result<Option<Signed<T>>> {
        let file = T::TYPE.versioned_filename(version);
        let signed: Option<Signed<T>> = self.load_file(&file)?;
        if let Some(signed) = &signed {
            let actual = signed.signed.version();
            ensure!(
                actual == version,
                error::VersionMismatchSnafu {
                    path: self.dir.join(&file),
                    expected: version.get(),
                    actual: actual.get(),
                }
            );
        }
        Ok(signed)
    }

    /// Reads the raw bytes of a stored file, or `None` if it doesn't exist.
    pub fn read(&self, file: &str) -> Result<Option<Vec<u8>>> {
        let path = self.dir.join(file);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(error::ReadSnafu { path }),
        }
    }

    fn load_file<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>> {
        match self.read(file)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .context(error::CorruptMetadataSnafu {
                    path: self.dir.join(file),
                }),
            None => Ok(None),
        }
    }

    /// Saves one document as both its versioned file and its latest alias.
    pub fn save<T: Role>(&self, signed: &Signed<T>) -> Result<Encoded> {
        let encoded = Encoded::new(signed)?;
        self.save_all(std::slice::from_ref(&encoded))?;
        Ok(encoded)
    }

    /// Saves several documents: all versioned files first, then the aliases in the given order.
    pub fn save_all(&self, docs: &[Encoded]) -> Result<()> {
        self.ensure_dir()?;
        for doc in docs {
            self.write(&doc.role.versioned_filename(doc.version), &doc.bytes)?;
        }
        for doc in docs {
            self.write(&doc.role.filename(), &doc.bytes)?;
            debug!("Saved {} version {}", doc.role, doc.version);
        }
        Ok(())
    }

    /// Atomically writes `bytes` to `file` in the store.
    pub fn write(&self, file: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_dir()?;
        let path = self.dir.join(file);
        let mut writer =
            NamedTempFile::new_in(&self.dir).context(error::TempCreateSnafu { path: &self.dir })?;
        writer
            .write_all(bytes)
            .and_then(|()| writer.as_file().sync_all())
            .context(error::WriteSnafu { path: &path })?;
        writer.persist(&path).context(error::PersistSnafu { path })?;
        Ok(())
    }

    /// Removes the latest alias of `role`. Versioned files are kept. Removing a file that
    /// doesn't exist is not an error.
    pub fn remove(&self, role: RoleType) -> Result<()> {
        let path = self.dir.join(role.filename());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(error::RemoveSnafu { path }),
        }
    }

    /// The versions of `role` that have a versioned file in the store, in ascending order.
    pub fn versions(&self, role: RoleType) -> Result<Vec<NonZeroU64>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).context(error::ListDirSnafu { path: &self.dir }),
        };
        let suffix = format!(".{}", role.filename());
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.context(error::ListDirSnafu { path: &self.dir })?;
            let name = entry.file_name();
            if let Some(version) = name
                .to_str()
                .and_then(|name| name.strip_suffix(&suffix))
                .and_then(|prefix| prefix.parse::<NonZeroU64>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Every version of `app_name` listed in the latest targets metadata, in ascending semver
    /// order. An empty store has no versions.
    pub fn list_target_versions(&self, app_name: &str) -> Result<Vec<Version>> {
        Ok(self
            .load::<Targets>()?
            .map(|targets| targets.signed.versions(app_name))
            .unwrap_or_default())
    }

    fn open_lock_file(&self) -> Result<(File, PathBuf)> {
        self.ensure_dir()?;
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .context(error::LockSnafu { path: &path })?;
        Ok((file, path))
    }

    /// Blocks until this process holds the store's exclusive lock. The lock is released when the
    /// returned guard is dropped.
    pub fn lock(&self) -> Result<StoreLock> {
        let (file, path) = self.open_lock_file()?;
        file.lock_exclusive()
            .context(error::LockSnafu { path: &path })?;
        debug!("Locked {}", path.display());
        Ok(StoreLock { _file: file })
    }

    /// Takes the store's exclusive lock if nobody else holds it.
    pub fn try_lock(&self) -> Result<Option<StoreLock>> {
        let (file, path) = self.open_lock_file()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(StoreLock { _file: file })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(err) => Err(err).context(error::LockSnafu { path }),
        }
    }
}

/// Holds a [`MetadataStore`]'s lock until dropped.
#[derive(Debug)]
pub struct StoreLock {
    _file: File,
}
