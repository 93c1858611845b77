//! Voice synthesis pipeline
//!
//! Turns a `(text, voice_id, options)` request into a cached audio file:
//!
//! - **Fingerprint**: stable SHA-256 key over the normalized request
//! - **ArtifactStore**: on-disk audio cache with a persisted index,
//!   atomic writes and LRU quota eviction
//! - **RemoteSynthesisClient**: submit / poll / fetch capability of a TTS backend
//! - **JobCoordinator**: one in-flight job per fingerprint, retry with
//!   backoff, progress fan-out to every waiting caller
//! - **Synthesizer**: the facade command handlers talk to
//!
//! # Example
//!
//! ```ignore
//! use vocu_tts::synthesis::{SynthesisRequest, Synthesizer};
//!
//! let synthesizer = Synthesizer::open(&config, client).await?;
//! let artifact = synthesizer
//!     .synthesize(SynthesisRequest::new("hello", "v1"))
//!     .await?;
//! println!("{} ({} bytes)", artifact.file_path.display(), artifact.size_bytes);
//! ```

pub mod client;
pub mod coordinator;
pub mod facade;
pub mod fingerprint;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod progress;
pub mod request;
pub mod retry;
pub mod store;

use std::time::Duration;

use thiserror::Error;

pub use client::{
    artifact_extension, AudioDownload, ByteStream, RemoteJobId, RemoteState, RemoteStatus,
    RemoteSynthesisClient,
};
pub use coordinator::{JobCoordinator, JobHandle, JobLimits, JobStatus};
pub use facade::{PipelineSettings, Synthesizer};
pub use fingerprint::Fingerprint;
pub use progress::{ChannelSink, LogSink, NoopSink, ProgressEvent, ProgressSink};
pub use request::{NormalizedRequest, OptionValue, SynthesisRequest};
pub use retry::RetryPolicy;
pub use store::{ArtifactStore, AudioArtifact};

/// Errors surfaced by the synthesis pipeline.
///
/// `Clone` because a single job outcome is delivered to every caller
/// attached to that job.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthesisError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited by remote service (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("remote service rejected the request: {0}")]
    RemoteRejected(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("synthesis job exceeded its time limit of {limit:?}")]
    Timeout { limit: Duration },

    #[error("internal error: {0}")]
    Internal(String),
}

impl SynthesisError {
    /// Transient failures that the coordinator retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited { .. })
    }

    /// Short, stable name of the error kind for logs and job diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transport(_) => "transport",
            Self::RateLimited { .. } => "rate_limited",
            Self::RemoteRejected(_) => "remote_rejected",
            Self::Io(_) => "io",
            Self::Timeout { .. } => "timeout",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for SynthesisError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for synthesis operations
pub type Result<T> = std::result::Result<T, SynthesisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(SynthesisError::Transport("reset".into()).is_retryable());
        assert!(SynthesisError::RateLimited { retry_after: None }.is_retryable());
        assert!(!SynthesisError::RemoteRejected("bad voice".into()).is_retryable());
        assert!(!SynthesisError::Validation("empty".into()).is_retryable());
        assert!(!SynthesisError::Io("disk full".into()).is_retryable());
        assert!(!SynthesisError::Timeout {
            limit: Duration::from_secs(1)
        }
        .is_retryable());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: SynthesisError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert_eq!(err.kind(), "io");
        assert!(err.to_string().contains("denied"));
    }
}
