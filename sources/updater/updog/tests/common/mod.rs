#![allow(dead_code)]

use async_trait::async_trait;
use semver::Version;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tuftool::config::RepoConfig;
use tuftool::Repository;
use updog::transport::{FilesystemTransport, Transport, TransportError, TransportStream};
use updog::{Config, Installation, Updater};
use url::Url;

pub const APP: &str = "demo";

pub fn version(v: &str) -> Version {
    Version::parse(v).unwrap()
}

/// The bytes the packaging step would produce for `v`.
pub fn artifact(v: &str) -> Vec<u8> {
    format!("#!/bin/sh\necho {APP} {v}\n").into_bytes()
}

/// A publisher repository and a client configured against it over `file://` URLs.
pub struct Fixture {
    pub dir: TempDir,
    pub repo: Repository,
    pub config: Config,
}

impl Fixture {
    /// A repository with `1.0.0` published and a client that has `1.0.0` installed and trusts
    /// root version 1.
    pub fn new() -> Self {
        Self::with_repo_config(RepoConfig::new(APP))
    }

    /// Like [`Fixture::new`], for a repository with non-default settings. The client uses the
    /// same target layout as the repository.
    pub fn with_repo_config(repo_config: RepoConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(&dir.path().join("repo"), repo_config, None).unwrap();
        repo.publish(&version("1.0.0"), &artifact("1.0.0")).unwrap();

        let trusted_root = dir.path().join("root.json");
        fs::copy(repo.metadata_dir().join("1.root.json"), &trusted_root).unwrap();
        let config = Config::new(
            APP,
            version("1.0.0"),
            Url::from_directory_path(repo.metadata_dir()).unwrap(),
            Url::from_directory_path(repo.targets_dir()).unwrap(),
            trusted_root,
            dir.path().join("install"),
        );
        let config = Config {
            target_layout: repo.config().target_layout,
            ..config
        };
        Self { dir, repo, config }
    }

    pub fn publish(&self, v: &str) {
        self.repo.publish(&version(v), &artifact(v)).unwrap();
    }

    pub fn updater(&self) -> Updater {
        Updater::with_transport(self.config.clone(), Box::new(FilesystemTransport))
    }

    pub fn installation(&self) -> Installation {
        Installation::new(&self.config.install_root)
    }

    pub fn metadata(&self, file: &str) -> PathBuf {
        self.repo.metadata_dir().join(file)
    }

    pub fn archive(&self, v: &str) -> PathBuf {
        let version = version(v);
        let path = format!("{APP}-{version}.tar.gz");
        self.repo
            .targets_dir()
            .join(self.repo.config().target_layout.location(&path, &version))
    }

    /// Directory entries under `versions/`, including any staging leftovers.
    pub fn version_dirs(&self) -> Vec<String> {
        let mut names: Vec<_> = match fs::read_dir(self.installation().versions_dir()) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().into_string().unwrap())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

/// Records every URL fetched through it.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    pub fetched: Arc<Mutex<Vec<Url>>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError> {
        self.fetched.lock().unwrap().push(url.clone());
        FilesystemTransport.fetch(url).await
    }
}

/// Serves metadata normally but never delivers a byte of any archive.
#[derive(Debug, Clone, Copy, Default)]
pub struct StallingTransport;

#[async_trait]
impl Transport for StallingTransport {
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError> {
        if url.path().ends_with(".tar.gz") {
            use futures::StreamExt;
            return Ok(futures::stream::pending().boxed());
        }
        FilesystemTransport.fetch(url).await
    }
}

/// Serves every file one byte at a time, `interval` apart.
#[derive(Debug, Clone, Copy)]
pub struct DripTransport {
    pub interval: Duration,
}

#[async_trait]
impl Transport for DripTransport {
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError> {
        use futures::StreamExt;
        let interval = self.interval;
        let stream = FilesystemTransport.fetch(url).await?;
        Ok(stream
            .flat_map(|chunk| {
                let items: Vec<Result<u8, TransportError>> = match chunk {
                    Ok(chunk) => chunk.into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                futures::stream::iter(items)
            })
            .then(move |byte| async move {
                tokio::time::sleep(interval).await;
                byte.map(|byte| bytes::Bytes::from(vec![byte]))
            })
            .boxed())
    }
}
