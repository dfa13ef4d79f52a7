//! Artifact download with atomic placement
//!
//! Bytes stream into `<name>.part` next to the final path while being
//! hashed. Only a fully received, digest-matching file is renamed into
//! place; every other exit path removes the temp file.

use super::checksum::digests_match;
use super::progress::{ProgressEvent, ProgressSink};
use crate::errors::{OrchestratorError, Result};
use crate::registry::{ArtifactSpec, ServiceId};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

const FILE_CHUNK: usize = 64 * 1024;

/// Emit a byte-progress event at most once per this many bytes
const PROGRESS_STEP: u64 = 1024 * 1024;

/// An opened artifact stream
pub struct ArtifactBody {
    /// Content length, when the source reports one
    pub total: Option<u64>,
    pub chunks: BoxStream<'static, std::result::Result<Bytes, String>>,
}

/// Where artifact bytes come from
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Open a stream for one artifact. Errors are transport failures.
    async fn open(
        &self,
        artifact: &ArtifactSpec,
        credential: Option<&str>,
    ) -> std::result::Result<ArtifactBody, String>;
}

/// HTTP(S) source with `file://` support for mirrors on local disk
pub struct HttpArtifactSource {
    client: reqwest::Client,
}

impl HttpArtifactSource {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("gary4local/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    async fn open_file(path: &Path) -> std::result::Result<ArtifactBody, String> {
        let file = File::open(path)
            .await
            .map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
        let total = file.metadata().await.ok().map(|m| m.len());

        let chunks = stream::unfold(Some(file), |state| async move {
            let mut file = state?;
            let mut buffer = vec![0u8; FILE_CHUNK];
            match file.read(&mut buffer).await {
                Ok(0) => None,
                Ok(n) => {
                    buffer.truncate(n);
                    Some((Ok(Bytes::from(buffer)), Some(file)))
                }
                Err(e) => Some((Err(e.to_string()), None)),
            }
        });

        Ok(ArtifactBody {
            total,
            chunks: chunks.boxed(),
        })
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn open(
        &self,
        artifact: &ArtifactSpec,
        credential: Option<&str>,
    ) -> std::result::Result<ArtifactBody, String> {
        if let Some(path) = artifact.url.strip_prefix("file://") {
            return Self::open_file(Path::new(path)).await;
        }

        let mut request = self.client.get(&artifact.url);
        if let Some(token) = credential {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("server returned {}", status));
        }

        let total = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| e.to_string()));

        Ok(ArtifactBody {
            total,
            chunks: chunks.boxed(),
        })
    }
}

/// Temp path used while an artifact is in flight
pub fn temp_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Removes the temp file unless the download was committed
struct TempFileGuard {
    path: PathBuf,
    committed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Fetch one artifact into `destination`, returning its verified digest
pub async fn download_artifact(
    source: &dyn ArtifactSource,
    service: ServiceId,
    artifact: &ArtifactSpec,
    destination: &Path,
    credential: Option<&str>,
    sink: &dyn ProgressSink,
) -> Result<String> {
    let failed = |reason: String| OrchestratorError::DownloadFailed {
        service,
        artifact: artifact.name.clone(),
        reason,
    };

    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }

    let part = temp_path(destination);
    match fs::remove_file(&part).await {
        Ok(()) => debug!(service = %service, path = %part.display(), "removed stale partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let credential = if artifact.gated { credential } else { None };
    let mut body = source.open(artifact, credential).await.map_err(failed)?;
    let total = body.total.or(artifact.size);

    let guard = TempFileGuard::new(part.clone());
    let mut file = File::create(&part).await?;
    let mut hasher = Sha256::new();
    let mut done: u64 = 0;
    let mut last_reported: u64 = 0;

    sink.emit(ProgressEvent::bytes(service, &artifact.name, 0, total));

    while let Some(chunk) = body.chunks.next().await {
        let chunk = chunk.map_err(failed)?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        done += chunk.len() as u64;

        if done - last_reported >= PROGRESS_STEP {
            sink.emit(ProgressEvent::bytes(service, &artifact.name, done, total));
            last_reported = done;
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(expected) = total {
        if done < expected {
            return Err(failed(format!(
                "connection closed after {} of {} bytes",
                done, expected
            )));
        }
    }

    let actual = hex::encode(hasher.finalize());
    if !digests_match(&artifact.sha256, &actual) {
        return Err(OrchestratorError::ChecksumMismatch {
            service,
            artifact: artifact.name.clone(),
            expected: artifact.sha256.to_ascii_lowercase(),
            actual,
        });
    }

    fs::rename(&part, destination).await?;
    guard.commit();

    sink.emit(ProgressEvent::bytes(service, &artifact.name, done, Some(done)));
    info!(service = %service, artifact = %artifact.name, bytes = done, "artifact verified");

    Ok(actual)
}
