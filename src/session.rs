//! Request-scoped temp-file ownership: unique path allocation, response
//! staging, and cleanup guaranteed on every exit path.
//!
//! One [`ConversionSession`] exists per in-flight request. Every temp path a
//! handler touches is registered with its session, and the session deletes
//! every registered path exactly once: explicitly on the error path, or from
//! the response body's drop guard once the bytes have been handed to the
//! transport. Sessions never share paths; the upload directory namespace is
//! the only shared resource, which is why allocation embeds a per-session
//! UUID token.

use std::{
    fmt,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use metrics::counter;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::warn;
use uuid::Uuid;

/// Errors raised while staging inputs or running a conversion.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("upload could not be saved: {message}")]
    Upload { message: String },
    #[error("{stage} failed: {message}")]
    Collaborator {
        stage: &'static str,
        message: String,
    },
    #[error("unsupported output format `{format}`")]
    UnsupportedFormat { format: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConversionError {
    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload {
            message: message.into(),
        }
    }

    pub fn collaborator(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            stage,
            message: message.into(),
        }
    }

    pub fn unsupported_format(format: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathKind {
    File,
    Directory,
}

/// A temp path whose deletion is the responsibility of exactly one session.
#[derive(Debug, Clone)]
struct OwnedPath {
    path: PathBuf,
    kind: PathKind,
}

/// The output artifact a handler hands back to [`ConversionSession::finalize`].
#[derive(Debug)]
pub struct Staged {
    pub path: PathBuf,
    pub download_name: String,
    pub content_type: String,
}

/// Owns every temp path created for one conversion request.
pub struct ConversionSession {
    token: Uuid,
    root: PathBuf,
    sequence: u32,
    paths: Vec<OwnedPath>,
}

impl fmt::Debug for ConversionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionSession")
            .field("token", &self.token)
            .field("paths", &self.paths.len())
            .finish()
    }
}

impl ConversionSession {
    /// Open a session rooted at the shared upload directory, creating the
    /// directory if necessary.
    pub fn new(root: &Path) -> Result<Self, ConversionError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            token: Uuid::new_v4(),
            root: root.to_path_buf(),
            sequence: 0,
            paths: Vec::new(),
        })
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    /// Produce a path that cannot collide with any other session's paths and
    /// register it as owned. The session token carries cross-request
    /// uniqueness; the sequence number disambiguates repeated names within
    /// one request.
    pub fn allocate(&mut self, suggested_name: &str) -> PathBuf {
        let path = self.build_path(suggested_name);
        self.paths.push(OwnedPath {
            path: path.clone(),
            kind: PathKind::File,
        });
        path
    }

    /// Like [`allocate`](Self::allocate) but creates and owns a directory,
    /// removed recursively at cleanup.
    pub fn allocate_dir(&mut self, suggested_name: &str) -> Result<PathBuf, ConversionError> {
        let path = self.build_path(suggested_name);
        std::fs::create_dir_all(&path)?;
        self.paths.push(OwnedPath {
            path: path.clone(),
            kind: PathKind::Directory,
        });
        Ok(path)
    }

    fn build_path(&mut self, suggested_name: &str) -> PathBuf {
        let sequence = self.sequence;
        self.sequence += 1;
        self.root.join(format!(
            "{}_{:02}_{}",
            self.token,
            sequence,
            sanitize_file_name(suggested_name)
        ))
    }

    /// Stream an upload payload to `path`. The destination must already be
    /// registered with this session; a failed or truncated stream removes the
    /// partial file and fails the request.
    pub async fn save_upload<S, E>(&self, stream: S, path: &Path) -> Result<u64, ConversionError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let mut file = fs::File::create(path).await?;
        let mut total_bytes: u64 = 0;

        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = fs::remove_file(path).await;
                    return Err(ConversionError::upload(err.to_string()));
                }
            };
            total_bytes += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if total_bytes == 0 {
            let _ = fs::remove_file(path).await;
            return Err(ConversionError::upload("uploaded file is empty"));
        }

        Ok(total_bytes)
    }

    /// Build the download response for `staged` and transfer ownership of all
    /// session paths into the response body. The paths are deleted when the
    /// body is dropped, which happens only after the bytes were handed to the
    /// transport or the client went away — never while streaming.
    pub async fn finalize(mut self, staged: Staged) -> Result<Response, ConversionError> {
        let file = match fs::File::open(&staged.path).await {
            Ok(file) => file,
            Err(err) => {
                self.cleanup().await;
                return Err(ConversionError::Io(err));
            }
        };

        let content_type = HeaderValue::from_str(&staged.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
        let disposition =
            HeaderValue::from_str(&format!("attachment; filename=\"{}\"", staged.download_name))
                .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

        let paths = std::mem::take(&mut self.paths);
        let body = Body::from_stream(CleanupStream {
            inner: ReaderStream::new(file),
            _guard: CleanupGuard { paths },
        });

        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::OK;
        response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, disposition);
        Ok(response)
    }

    /// Delete every owned path. Missing paths are success; individual
    /// deletion failures are logged and swallowed.
    pub async fn cleanup(&mut self) {
        let paths = std::mem::take(&mut self.paths);
        remove_owned(paths).await;
    }
}

impl Drop for ConversionSession {
    fn drop(&mut self) {
        if self.paths.is_empty() {
            return;
        }
        // Safety net for handler faults that skipped explicit cleanup.
        let paths = std::mem::take(&mut self.paths);
        warn!(
            target = "torchio::session",
            token = %self.token,
            count = paths.len(),
            "session dropped with live paths, running fallback cleanup"
        );
        schedule_removal(paths);
    }
}

struct CleanupGuard {
    paths: Vec<OwnedPath>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let paths = std::mem::take(&mut self.paths);
        if !paths.is_empty() {
            schedule_removal(paths);
        }
    }
}

/// File stream that carries the session's paths; dropping it (after the last
/// chunk or on client disconnect) triggers cleanup.
struct CleanupStream {
    inner: ReaderStream<fs::File>,
    _guard: CleanupGuard,
}

impl Stream for CleanupStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

fn schedule_removal(paths: Vec<OwnedPath>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                remove_owned(paths).await;
            });
        }
        Err(_) => remove_owned_blocking(&paths),
    }
}

async fn remove_owned(paths: Vec<OwnedPath>) {
    for owned in paths {
        let result = match owned.kind {
            PathKind::File => fs::remove_file(&owned.path).await,
            PathKind::Directory => fs::remove_dir_all(&owned.path).await,
        };
        record_removal(&owned, result);
    }
}

fn remove_owned_blocking(paths: &[OwnedPath]) {
    for owned in paths {
        let result = match owned.kind {
            PathKind::File => std::fs::remove_file(&owned.path),
            PathKind::Directory => std::fs::remove_dir_all(&owned.path),
        };
        record_removal(owned, result);
    }
}

fn record_removal(owned: &OwnedPath, result: std::io::Result<()>) {
    match result {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            counter!("torchio_cleanup_failures_total").increment(1);
            warn!(
                target = "torchio::session",
                path = %owned.path.display(),
                error = %err,
                "failed to delete owned temp path"
            );
        }
    }
}

/// Reduce a client-supplied filename to a safe basename: strip directories,
/// keep a conservative character set, preserve the extension.
pub fn sanitize_file_name(original: &str) -> String {
    let path = Path::new(original);
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("upload");
    let mut base: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    base.truncate(64);
    if base.trim_matches('-').is_empty() {
        base = "upload".to_string();
    }

    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.trim_matches('.').to_ascii_lowercase())
        .filter(|value| !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric()));

    match extension {
        Some(ext) => format!("{base}.{ext}"),
        None => base,
    }
}
