//! Bounded fetches: a metadata fetch has one deadline for the whole file, an artifact download has
//! an overall deadline plus one for each request and chunk, metadata has a size limit, and
//! artifacts are checked against their descriptor while they stream to disk.

use crate::error::{self, Result};
use crate::transport::{Transport, TransportErrorKind, TransportStream};
use bytes::Bytes;
use futures::StreamExt;
use ring::digest::{Context, SHA256, SHA512};
use snafu::{ensure, OptionExt, ResultExt};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tuf_schema::{Hashes, Target};
use url::Url;

/// A transport plus the deadlines applied to its operations.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fetcher<'a> {
    transport: &'a dyn Transport,
    timeout: Duration,
    download_timeout: Duration,
}

async fn deadline<F: Future>(limit: Duration, url: &Url, fut: F) -> Result<F::Output> {
    tokio::time::timeout(limit, fut)
        .await
        .ok()
        .context(error::TimeoutSnafu {
            url: url.clone(),
            secs: limit.as_secs(),
        })
}

impl<'a> Fetcher<'a> {
    pub(crate) fn new(
        transport: &'a dyn Transport,
        timeout: Duration,
        download_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            timeout,
            download_timeout,
        }
    }

    /// Starts a request; `None` means the file doesn't exist.
    async fn open(&self, url: &Url) -> Result<Option<TransportStream>> {
        match deadline(self.timeout, url, self.transport.fetch(url.clone())).await? {
            Ok(stream) => Ok(Some(stream)),
            Err(e) if e.kind() == TransportErrorKind::FileNotFound => Ok(None),
            Err(e) => Err(e).context(error::TransportSnafu { url: url.clone() }),
        }
    }

    async fn next_chunk(&self, url: &Url, stream: &mut TransportStream) -> Result<Option<Bytes>> {
        deadline(self.timeout, url, stream.next())
            .await?
            .transpose()
            .context(error::TransportSnafu { url: url.clone() })
    }

    /// Fetches a whole file of at most `max_size` bytes, or `None` if it doesn't exist. The fetch
    /// as a whole must finish within the timeout, however the server paces its chunks.
    pub(crate) async fn fetch_optional(&self, url: &Url, max_size: u64) -> Result<Option<Vec<u8>>> {
        deadline(self.timeout, url, self.read_all(url, max_size)).await?
    }

    async fn read_all(&self, url: &Url, max_size: u64) -> Result<Option<Vec<u8>>> {
        let Some(mut stream) = self.open(url).await? else {
            return Ok(None);
        };
        let mut data = Vec::new();
        while let Some(chunk) = self.next_chunk(url, &mut stream).await? {
            ensure!(
                data.len() as u64 + chunk.len() as u64 <= max_size,
                error::MetadataTooLargeSnafu {
                    url: url.clone(),
                    max_size
                }
            );
            data.extend_from_slice(&chunk);
        }
        Ok(Some(data))
    }

    /// Like [`Fetcher::fetch_optional`], but a missing file is an error.
    pub(crate) async fn fetch(&self, url: &Url, max_size: u64) -> Result<Vec<u8>> {
        self.fetch_optional(url, max_size)
            .await?
            .context(error::MetadataMissingSnafu { url: url.clone() })
    }

    /// Streams the artifact for `target` into `dest`, failing as soon as it grows past the
    /// descriptor's length, and checks length and digests at the end. On error the caller must
    /// discard whatever was written.
    pub(crate) async fn download<W>(&self, url: &Url, target: &Target, dest: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        deadline(
            self.download_timeout,
            url,
            self.stream_to(url, target, dest),
        )
        .await?
    }

    async fn stream_to<W>(&self, url: &Url, target: &Target, dest: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut stream = self
            .open(url)
            .await?
            .context(error::MetadataMissingSnafu { url: url.clone() })?;
        let mut verifier = Verifier::new(target);
        while let Some(chunk) = self.next_chunk(url, &mut stream).await? {
            ensure!(
                verifier.update(&chunk),
                error::ArtifactLengthSnafu {
                    url: url.clone(),
                    length: target.length,
                }
            );
            dest.write_all(&chunk)
                .await
                .context(error::WriteSnafu { path: url.path() })?;
        }
        dest.flush()
            .await
            .context(error::WriteSnafu { path: url.path() })?;
        let actual = verifier.received;
        ensure!(
            verifier.finish(),
            error::ArtifactMismatchSnafu {
                url: url.clone(),
                expected: target.length,
                actual,
            }
        );
        Ok(())
    }
}

/// Running length and digests of a download.
struct Verifier<'a> {
    target: &'a Target,
    received: u64,
    sha256: Context,
    sha512: Context,
}

impl<'a> Verifier<'a> {
    fn new(target: &'a Target) -> Self {
        Self {
            target,
            received: 0,
            sha256: Context::new(&SHA256),
            sha512: Context::new(&SHA512),
        }
    }

    /// Returns false once more data has arrived than the descriptor allows.
    fn update(&mut self, chunk: &[u8]) -> bool {
        self.received += chunk.len() as u64;
        if self.received > self.target.length {
            return false;
        }
        self.sha256.update(chunk);
        self.sha512.update(chunk);
        true
    }

    fn finish(self) -> bool {
        let calculated = Hashes {
            sha256: self.sha256.finish().as_ref().into(),
            sha512: Some(self.sha512.finish().as_ref().into()),
        };
        self.received == self.target.length && self.target.hashes.matches(&calculated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transport::{FilesystemTransport, TransportError};
    use async_trait::async_trait;
    use semver::Version;
    use std::time::Instant;
    use tuf_schema::TargetCustom;

    const SECS_5: Duration = Duration::from_secs(5);

    /// Serves `data` one byte at a time, `interval` apart.
    #[derive(Debug)]
    struct DripTransport {
        data: Vec<u8>,
        interval: Duration,
    }

    #[async_trait]
    impl Transport for DripTransport {
        async fn fetch(&self, _url: Url) -> std::result::Result<TransportStream, TransportError> {
            let interval = self.interval;
            let bytes = self.data.clone().into_iter();
            Ok(futures::stream::iter(bytes)
                .then(move |byte| async move {
                    tokio::time::sleep(interval).await;
                    Ok::<_, TransportError>(Bytes::from(vec![byte]))
                })
                .boxed())
        }
    }

    fn target(data: &[u8]) -> Target {
        Target {
            length: data.len() as u64,
            hashes: Hashes::compute(data),
            custom: TargetCustom {
                name: "demo".to_owned(),
                version: Version::new(1, 0, 0),
            },
        }
    }

    fn serve(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> Url {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        Url::from_file_path(path).unwrap()
    }

    #[tokio::test]
    async fn metadata_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve(&dir, "hello", b"hello");
        let fetcher = Fetcher::new(&FilesystemTransport, SECS_5, SECS_5);

        assert_eq!(fetcher.fetch(&url, 5).await.unwrap(), b"hello");
        assert!(matches!(
            fetcher.fetch(&url, 4).await,
            Err(Error::MetadataTooLarge { .. })
        ));
        let missing = Url::from_file_path(dir.path().join("missing")).unwrap();
        assert!(fetcher.fetch_optional(&missing, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn download_checks_digests() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(&FilesystemTransport, SECS_5, SECS_5);
        let url = serve(&dir, "demo-1.0.0.tar.gz", b"hello");

        let mut out = Vec::new();
        fetcher
            .download(&url, &target(b"hello"), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"hello");

        let err = fetcher
            .download(&url, &target(b"jello"), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactMismatch { .. }), "{err}");

        let err = fetcher
            .download(&url, &target(b"hell"), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactLength { .. }), "{err}");

        let err = fetcher
            .download(&url, &target(b"hello!"), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactMismatch { .. }), "{err}");
    }

    #[tokio::test]
    async fn slow_metadata_fetch_times_out_as_a_whole() {
        let transport = DripTransport {
            data: vec![b'x'; 64],
            interval: Duration::from_millis(100),
        };
        let fetcher = Fetcher::new(&transport, Duration::from_secs(1), SECS_5);
        let url = Url::parse("https://example.com/timestamp.json").unwrap();

        let started = Instant::now();
        let err = fetcher.fetch(&url, 1024).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { secs: 1, .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn slow_download_times_out_as_a_whole() {
        let data = vec![b'x'; 64];
        let transport = DripTransport {
            data: data.clone(),
            interval: Duration::from_millis(100),
        };
        let fetcher = Fetcher::new(&transport, SECS_5, Duration::from_secs(1));
        let url = Url::parse("https://example.com/demo-1.0.0.tar.gz").unwrap();

        let started = Instant::now();
        let err = fetcher
            .download(&url, &target(&data), &mut Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { secs: 1, .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
