//! Progress reporting for synthesis jobs.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::client::RemoteJobId;
use super::fingerprint::Fingerprint;
use super::store::AudioArtifact;
use super::SynthesisError;

/// One observable step of a synthesis job.
///
/// Intermediate events may be coalesced for slow observers; the terminal
/// `Completed` / `Failed` event is always delivered.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Job registered, not yet accepted by the remote service.
    Queued { fingerprint: Fingerprint },
    /// Remote service accepted the job.
    Submitted { remote_job_id: RemoteJobId },
    /// Remote service is still working.
    Progress { fraction: Option<f32> },
    /// Audio is being downloaded; `total` is the announced size, if any.
    Downloading { bytes: u64, total: Option<u64> },
    /// A transient failure is being retried.
    Retrying {
        operation: &'static str,
        attempt: u32,
        delay: Duration,
        error: SynthesisError,
    },
    /// Audio is stored and ready.
    Completed(AudioArtifact),
    /// Job ended without audio.
    Failed(SynthesisError),
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// Receiver of progress events (chat adapter, CLI, test harness).
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn on_event(&self, event: &ProgressEvent) {
        // Receiver gone means nobody is watching any more.
        let _ = self.tx.send(event.clone());
    }
}

/// Writes events to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_event(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Queued { fingerprint } => {
                debug!(fingerprint = %fingerprint.short(), "synthesis queued")
            }
            ProgressEvent::Submitted { remote_job_id } => {
                info!(job_id = %remote_job_id, "synthesis submitted")
            }
            ProgressEvent::Progress { fraction } => match fraction {
                Some(f) => info!(percent = (f * 100.0).round() as u32, "synthesizing"),
                None => debug!("synthesizing"),
            },
            ProgressEvent::Downloading { bytes, total } => {
                debug!(bytes, total, "downloading audio")
            }
            ProgressEvent::Retrying {
                operation,
                attempt,
                delay,
                error,
            } => warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying"
            ),
            ProgressEvent::Completed(artifact) => info!(
                path = %artifact.file_path.display(),
                size_bytes = artifact.size_bytes,
                "synthesis complete"
            ),
            ProgressEvent::Failed(error) => warn!(kind = error.kind(), error = %error, "synthesis failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_closure_sink() {
        let seen = Mutex::new(Vec::new());
        let sink = |event: &ProgressEvent| seen.lock().unwrap().push(event.clone());
        sink.on_event(&ProgressEvent::Progress {
            fraction: Some(0.5),
        });
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ChannelSink::new(tx);
        sink.on_event(&ProgressEvent::Failed(SynthesisError::Validation("x".into())));
        let event = rx.recv().await.unwrap();
        assert!(event.is_terminal());
    }

    #[test]
    fn test_channel_sink_ignores_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        ChannelSink::new(tx).on_event(&ProgressEvent::Progress { fraction: None });
    }
}
