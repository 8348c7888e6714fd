//! How the client reaches the repository. Metadata and artifacts are plain GET requests against
//! the two base URLs; a `file://` transport serves local mirrors and tests.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::StatusCode;
use std::fmt::{self, Debug, Display};
use std::io;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use url::Url;

/// The body of a fetched file, delivered in chunks.
pub type TransportStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Fetches files by URL.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    /// Starts fetching `url`. A file that doesn't exist is reported with
    /// [`TransportErrorKind::FileNotFound`], which the client distinguishes from other failures.
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    UnsupportedUrlScheme,
    FileNotFound,
    Other,
}

/// The error type a [`Transport`] reports.
#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    url: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    pub fn new<S>(kind: TransportErrorKind, url: S) -> Self
    where
        S: AsRef<str>,
    {
        Self {
            kind,
            url: url.as_ref().to_owned(),
            source: None,
        }
    }

    pub fn new_with_cause<S, E>(kind: TransportErrorKind, url: S, source: E) -> Self
    where
        S: AsRef<str>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            url: url.as_ref().to_owned(),
            source: Some(source.into()),
        }
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportErrorKind::UnsupportedUrlScheme => write!(f, "unsupported URL scheme")?,
            TransportErrorKind::FileNotFound => write!(f, "file not found")?,
            TransportErrorKind::Other => write!(f, "transport error")?,
        }
        if let Some(source) = &self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Serves `file://` URLs from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemTransport;

#[async_trait]
impl Transport for FilesystemTransport {
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError> {
        if url.scheme() != "file" {
            return Err(TransportError::new(
                TransportErrorKind::UnsupportedUrlScheme,
                url,
            ));
        }
        let path = url.to_file_path().map_err(|()| {
            TransportError::new_with_cause(TransportErrorKind::Other, &url, "not a local path")
        })?;
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            let kind = match e.kind() {
                io::ErrorKind::NotFound => TransportErrorKind::FileNotFound,
                _ => TransportErrorKind::Other,
            };
            TransportError::new_with_cause(kind, &url, e)
        })?;
        let stream = ReaderStream::new(file)
            .map_err(move |e| TransportError::new_with_cause(TransportErrorKind::Other, &url, e));
        Ok(stream.boxed())
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Fetches `http://` and `https://` URLs.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// `connect_timeout` bounds connection setup; the caller bounds the rest of each request.
    pub fn new(connect_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("updog/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransportError::new(
                TransportErrorKind::UnsupportedUrlScheme,
                url,
            ));
        }
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TransportError::new_with_cause(TransportErrorKind::Other, &url, e))?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                // S3-style hosts answer 403 for missing keys in a bucket that isn't listable.
                return Err(TransportError::new(TransportErrorKind::FileNotFound, url));
            }
            status if !status.is_success() => {
                return Err(TransportError::new_with_cause(
                    TransportErrorKind::Other,
                    &url,
                    format!("HTTP status {status}"),
                ));
            }
            _ => {}
        }
        let stream = response
            .bytes_stream()
            .map_err(move |e| TransportError::new_with_cause(TransportErrorKind::Other, &url, e));
        Ok(stream.boxed())
    }
}

/// Dispatches on the URL scheme, so one client can use an HTTP metadata host and a local
/// mirror of the targets, or the other way around.
#[derive(Debug, Clone)]
pub struct DefaultTransport {
    file: FilesystemTransport,
    http: HttpTransport,
}

impl DefaultTransport {
    pub fn new(connect_timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            file: FilesystemTransport,
            http: HttpTransport::new(connect_timeout)?,
        })
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn fetch(&self, url: Url) -> Result<TransportStream, TransportError> {
        match url.scheme() {
            "file" => self.file.fetch(url).await,
            _ => self.http.fetch(url).await,
        }
    }
}
