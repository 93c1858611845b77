//! Remote synthesis capability.
//!
//! The coordinator only needs three calls from a TTS backend: submit a job,
//! poll it, and stream the finished audio. Implementations are responsible
//! for bounding every call with a timeout and for mapping failures onto
//! `Transport` / `RateLimited` (transient) or `RemoteRejected` (permanent).

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::request::NormalizedRequest;
use super::Result;

/// Extension used when the result URL does not carry one.
pub const DEFAULT_AUDIO_EXTENSION: &str = "mp3";

/// Streamed audio body.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Opened audio download.
pub struct AudioDownload {
    /// Size announced by the server, if any.
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl AudioDownload {
    pub fn new(body: ByteStream) -> Self {
        Self {
            content_length: None,
            body,
        }
    }

    pub fn with_content_length(mut self, len: Option<u64>) -> Self {
        self.content_length = len;
        self
    }
}

impl fmt::Debug for AudioDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioDownload")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Job identifier assigned by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteJobId(pub String);

impl RemoteJobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Coarse state of a remote job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    InProgress,
    Succeeded,
    Failed,
}

/// Result of one status poll.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStatus {
    pub state: RemoteState,
    /// Completion fraction in `0.0..=1.0`, when the service reports one.
    pub progress: Option<f32>,
    /// Download URL, present once the job succeeded.
    pub result_url: Option<String>,
    /// Service-provided detail, mostly useful on failure.
    pub message: Option<String>,
}

impl RemoteStatus {
    pub fn in_progress(progress: Option<f32>) -> Self {
        Self {
            state: RemoteState::InProgress,
            progress,
            result_url: None,
            message: None,
        }
    }

    pub fn succeeded(result_url: impl Into<String>) -> Self {
        Self {
            state: RemoteState::Succeeded,
            progress: Some(1.0),
            result_url: Some(result_url.into()),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: RemoteState::Failed,
            progress: None,
            result_url: None,
            message: Some(message.into()),
        }
    }
}

/// Backend that performs the actual text-to-speech work.
#[async_trait]
pub trait RemoteSynthesisClient: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Start a synthesis job.
    async fn submit(&self, request: &NormalizedRequest) -> Result<RemoteJobId>;

    /// Query a job. Idempotent.
    async fn poll_status(&self, job: &RemoteJobId) -> Result<RemoteStatus>;

    /// Open a streamed download of a finished job's audio.
    async fn fetch(&self, url: &str) -> Result<AudioDownload>;
}

/// File extension for an artifact downloaded from `url`.
///
/// Takes the suffix of the URL path (query and fragment ignored), falling
/// back to [`DEFAULT_AUDIO_EXTENSION`] when there is none or it looks odd.
pub fn artifact_extension(url: &str) -> String {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| {
            url.split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string()
        });

    Path::new(&path)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_AUDIO_EXTENSION.to_string())
}
