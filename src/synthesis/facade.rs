//! Request facade
//!
//! [`Synthesizer`] is the single entry point command handlers use. It owns
//! the artifact store and the job coordinator; construct one per process
//! and share it.

use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::debug;

use super::client::RemoteSynthesisClient;
use super::coordinator::{JobCoordinator, JobHandle, JobLimits};
use super::fingerprint::Fingerprint;
use super::progress::{ChannelSink, NoopSink, ProgressEvent, ProgressSink};
use super::request::SynthesisRequest;
use super::retry::RetryPolicy;
use super::store::{ArtifactStore, AudioArtifact};
use super::{Result, SynthesisError};
use crate::config::Config;

/// Retry and time bounds for the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSettings {
    pub retry: RetryPolicy,
    pub limits: JobLimits,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.retry.policy(),
            limits: config.timeouts.job_limits(),
        }
    }
}

/// Cached, deduplicated text-to-speech.
#[derive(Clone)]
pub struct Synthesizer {
    store: Arc<ArtifactStore>,
    coordinator: JobCoordinator,
}

impl Synthesizer {
    /// Open the cache directory named by `config` and wire it to `client`.
    pub async fn open(config: &Config, client: Arc<dyn RemoteSynthesisClient>) -> Result<Self> {
        let store = ArtifactStore::open(config.cache_dir(), config.cache.quota_bytes).await?;
        Ok(Self::new(
            Arc::new(store),
            client,
            PipelineSettings::from_config(config),
        ))
    }

    pub fn new(
        store: Arc<ArtifactStore>,
        client: Arc<dyn RemoteSynthesisClient>,
        settings: PipelineSettings,
    ) -> Self {
        let coordinator =
            JobCoordinator::new(client, Arc::clone(&store), settings.retry, settings.limits);
        Self { store, coordinator }
    }

    /// Synthesize `request`, reusing the cache and any job already running
    /// for the same fingerprint.
    pub async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioArtifact> {
        self.synthesize_with_progress(request, &NoopSink).await
    }

    /// Like [`synthesize`](Self::synthesize), reporting progress to `sink`.
    /// The sink's last event is always `Completed` or `Failed`.
    pub async fn synthesize_with_progress(
        &self,
        request: SynthesisRequest,
        sink: &dyn ProgressSink,
    ) -> Result<AudioArtifact> {
        let normalized = match request.normalize() {
            Ok(normalized) => normalized,
            Err(err) => {
                sink.on_event(&ProgressEvent::Failed(err.clone()));
                return Err(err);
            }
        };
        debug!(
            fingerprint = %normalized.fingerprint().short(),
            voice_id = normalized.voice_id(),
            "synthesis requested"
        );
        self.coordinator.run(normalized, sink).await
    }

    /// Progress as a stream ending with `Completed` or `Failed`.
    ///
    /// Dropping the stream stops the reporting, not the job.
    pub fn synthesize_stream(
        &self,
        request: SynthesisRequest,
    ) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        let coordinator = self.coordinator.clone();
        async_stream::stream! {
            let normalized = match request.normalize() {
                Ok(normalized) => normalized,
                Err(err) => {
                    yield ProgressEvent::Failed(err);
                    return;
                }
            };

            let (tx, mut rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                let sink = ChannelSink::new(tx);
                let _ = coordinator.run(normalized, &sink).await;
            });

            while let Some(event) = rx.recv().await {
                let terminal = event.is_terminal();
                yield event;
                if terminal {
                    return;
                }
            }

            yield ProgressEvent::Failed(SynthesisError::Internal(
                "progress stream closed before the job finished".to_string(),
            ));
        }
    }

    /// Evict least-recently-used artifacts until the cache fits its quota.
    pub async fn enforce_quota(&self) -> Result<Vec<Fingerprint>> {
        self.store.enforce_quota().await
    }

    /// Persist buffered cache index updates.
    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn recent_jobs(&self) -> Vec<JobHandle> {
        self.coordinator.recent_jobs()
    }

    pub fn active_jobs(&self) -> Vec<JobHandle> {
        self.coordinator.active_jobs()
    }
}
