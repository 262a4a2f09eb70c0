//! Byte-stream production from update sources

use futures::TryStreamExt;
use sprout_errors::{Error, NetworkError};
use std::path::PathBuf;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::NetClient;

/// Where update payload bytes originate
#[derive(Debug, Clone)]
pub enum UpdateSource {
    /// A local archive file
    File(PathBuf),
    /// A remote archive fetched over HTTP
    Url(String),
}

impl UpdateSource {
    /// Human-readable description used in status details
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Url(url) => url.clone(),
        }
    }
}

/// An opened source: the raw byte stream and, when known, its total length
pub type SourceStream = (Box<dyn AsyncRead + Send + Unpin>, Option<u64>);

/// Opens update sources as byte streams
#[derive(Clone)]
pub struct SourceFetcher {
    client: NetClient,
}

impl SourceFetcher {
    #[must_use]
    pub fn new(client: NetClient) -> Self {
        Self { client }
    }

    /// Open a source, consuming it.
    ///
    /// For files the total length comes from filesystem metadata; for URLs
    /// from the response's declared content length, when present.
    ///
    /// # Errors
    ///
    /// `NotFound` / `PermissionDenied` for local paths, `ConnectionFailed`
    /// or `Timeout` for unreachable hosts, `HttpStatus` for non-success
    /// responses. No retries happen here.
    pub async fn open(&self, source: &UpdateSource) -> Result<SourceStream, Error> {
        match source {
            UpdateSource::File(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => NetworkError::NotFound {
                        path: path.display().to_string(),
                    },
                    std::io::ErrorKind::PermissionDenied => NetworkError::PermissionDenied {
                        path: path.display().to_string(),
                    },
                    _ => NetworkError::DownloadFailed(e.to_string()),
                })?;

                let total = file.metadata().await.ok().map(|m| m.len());
                info!(path = %path.display(), size = ?total, "opening update archive from file");

                Ok((Box::new(file) as Box<dyn AsyncRead + Send + Unpin>, total))
            }
            UpdateSource::Url(url) => {
                let response = self.client.get(url).await?;

                let status = response.status();
                if !status.is_success() {
                    return Err(NetworkError::HttpStatus {
                        status: status.as_u16(),
                        message: status.to_string(),
                    }
                    .into());
                }

                let total = response.content_length();
                info!(url, size = ?total, "downloading update archive");
                if total.is_none() {
                    debug!(url, "no content length declared; progress will be unknown");
                }

                let stream = response.bytes_stream().map_err(std::io::Error::other);
                let reader = StreamReader::new(stream);

                Ok((Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>, total))
            }
        }
    }
}
