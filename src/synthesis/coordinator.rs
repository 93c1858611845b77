//! Job coordinator
//!
//! Owns the in-flight registry: at most one remote job per fingerprint,
//! with every concurrent caller for that fingerprint attached to the same
//! job. Jobs run in their own spawned task so a caller that stops waiting
//! does not cancel the synthesis; the finished artifact lands in the store
//! either way.
//!
//! Job lifecycle:
//!
//! ```text
//! Pending --submit--> Running --poll..--> download + store --> Succeeded
//!    |                   |                      |
//!    +-------------------+----------------------+------------> Failed
//! ```
//!
//! The in-flight entry is released only after the artifact is durably
//! written, and waiters are notified only after the entry is released, so
//! a caller woken by `Completed` always finds the artifact in the store.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::client::{artifact_extension, RemoteJobId, RemoteState, RemoteSynthesisClient};
use super::fingerprint::Fingerprint;
use super::progress::{ProgressEvent, ProgressSink};
use super::request::NormalizedRequest;
use super::retry::{with_retry, RetryNotice, RetryPolicy};
use super::store::{ArtifactStore, AudioArtifact};
use super::{Result, SynthesisError};

/// Terminal job handles kept for diagnostics.
pub const RECENT_JOBS_CAPACITY: usize = 64;

/// Time bounds applied to every job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobLimits {
    /// Bound on each individual remote call (one submit, one poll, one
    /// download including the write to disk).
    pub call_timeout: Duration,
    /// Pause between status polls while the remote job runs.
    pub poll_interval: Duration,
    /// Bound on the whole job, retries and polling included.
    pub max_job_duration: Duration,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(3),
            max_job_duration: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Snapshot of one job's state.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub fingerprint: Fingerprint,
    pub remote_job_id: Option<RemoteJobId>,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Remote calls made for this job, retries included.
    pub attempts: u32,
    pub progress: Option<f32>,
    pub error: Option<SynthesisError>,
}

impl JobHandle {
    fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            remote_job_id: None,
            status: JobStatus::Pending,
            submitted_at: Utc::now(),
            finished_at: None,
            attempts: 0,
            progress: None,
            error: None,
        }
    }
}

struct InFlightJob {
    handle: Mutex<JobHandle>,
    /// Latest event; subscribers see every terminal event, intermediate
    /// ones may be coalesced.
    updates: watch::Sender<ProgressEvent>,
}

impl InFlightJob {
    fn new(fingerprint: Fingerprint) -> Self {
        let (updates, _) = watch::channel(ProgressEvent::Queued {
            fingerprint: fingerprint.clone(),
        });
        Self {
            handle: Mutex::new(JobHandle::new(fingerprint)),
            updates,
        }
    }

    fn publish(&self, event: ProgressEvent) {
        self.updates.send_replace(event);
    }

    fn count_attempt(&self) {
        self.handle.lock().attempts += 1;
    }

    fn on_retry(&self, notice: &RetryNotice) {
        self.publish(ProgressEvent::Retrying {
            operation: notice.operation,
            attempt: notice.attempt,
            delay: notice.delay,
            error: notice.error.clone(),
        });
    }

    fn snapshot(&self) -> JobHandle {
        self.handle.lock().clone()
    }
}

struct Inner {
    client: Arc<dyn RemoteSynthesisClient>,
    store: Arc<ArtifactStore>,
    retry: RetryPolicy,
    limits: JobLimits,
    inflight: Mutex<HashMap<Fingerprint, Arc<InFlightJob>>>,
    recent: Mutex<VecDeque<JobHandle>>,
}

/// Deduplicating runner for synthesis jobs. Cheap to clone.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

enum Admission {
    Cached(AudioArtifact),
    Attached(watch::Receiver<ProgressEvent>),
    Started(Arc<InFlightJob>, watch::Receiver<ProgressEvent>),
}

impl JobCoordinator {
    pub fn new(
        client: Arc<dyn RemoteSynthesisClient>,
        store: Arc<ArtifactStore>,
        retry: RetryPolicy,
        limits: JobLimits,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                store,
                retry,
                limits,
                inflight: Mutex::new(HashMap::new()),
                recent: Mutex::new(VecDeque::with_capacity(RECENT_JOBS_CAPACITY)),
            }),
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.inner.store
    }

    /// Produce the artifact for `request`, starting a remote job only if
    /// neither the store nor a running job can provide it.
    pub async fn run(
        &self,
        request: NormalizedRequest,
        sink: &dyn ProgressSink,
    ) -> Result<AudioArtifact> {
        let fingerprint = request.fingerprint().clone();

        if let Some(artifact) = self.inner.store.lookup(&fingerprint) {
            debug!(fingerprint = %fingerprint.short(), "cache hit");
            sink.on_event(&ProgressEvent::Completed(artifact.clone()));
            return Ok(artifact);
        }

        let admission = {
            let mut inflight = self.inner.inflight.lock();
            if let Some(job) = inflight.get(&fingerprint) {
                Admission::Attached(job.updates.subscribe())
            } else if let Some(artifact) = self.inner.store.lookup(&fingerprint) {
                // Finished between the first lookup and taking the lock.
                Admission::Cached(artifact)
            } else {
                let job = Arc::new(InFlightJob::new(fingerprint.clone()));
                let rx = job.updates.subscribe();
                inflight.insert(fingerprint.clone(), Arc::clone(&job));
                Admission::Started(job, rx)
            }
        };

        let rx = match admission {
            Admission::Cached(artifact) => {
                debug!(fingerprint = %fingerprint.short(), "cache hit");
                sink.on_event(&ProgressEvent::Completed(artifact.clone()));
                return Ok(artifact);
            }
            Admission::Attached(rx) => {
                debug!(fingerprint = %fingerprint.short(), "joining in-flight job");
                rx
            }
            Admission::Started(job, rx) => {
                info!(
                    fingerprint = %fingerprint.short(),
                    client = self.inner.client.name(),
                    "starting synthesis job"
                );
                tokio::spawn(self.clone().drive_job(job, request));
                rx
            }
        };

        await_outcome(rx, sink).await
    }

    /// Handles of jobs currently in flight.
    pub fn active_jobs(&self) -> Vec<JobHandle> {
        self.inner
            .inflight
            .lock()
            .values()
            .map(|job| job.snapshot())
            .collect()
    }

    /// Recently finished jobs, newest last.
    pub fn recent_jobs(&self) -> Vec<JobHandle> {
        self.inner.recent.lock().iter().cloned().collect()
    }

    async fn drive_job(self, job: Arc<InFlightJob>, request: NormalizedRequest) {
        let limit = self.inner.limits.max_job_duration;
        let work = AssertUnwindSafe(self.execute(&job, &request)).catch_unwind();

        let outcome = match tokio::time::timeout(limit, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SynthesisError::Internal(
                "synthesis task panicked".to_string(),
            )),
            Err(_) => Err(SynthesisError::Timeout { limit }),
        };

        let handle = {
            let mut handle = job.handle.lock();
            handle.finished_at = Some(Utc::now());
            match &outcome {
                Ok(_) => {
                    handle.status = JobStatus::Succeeded;
                    handle.progress = Some(1.0);
                }
                Err(e) => {
                    handle.status = JobStatus::Failed;
                    handle.error = Some(e.clone());
                }
            }
            handle.clone()
        };

        match &outcome {
            Ok(artifact) => info!(
                fingerprint = %handle.fingerprint.short(),
                attempts = handle.attempts,
                size_bytes = artifact.size_bytes,
                "synthesis job succeeded"
            ),
            Err(e) => warn!(
                fingerprint = %handle.fingerprint.short(),
                attempts = handle.attempts,
                kind = e.kind(),
                error = %e,
                "synthesis job failed"
            ),
        }

        self.inner.inflight.lock().remove(&handle.fingerprint);
        self.remember(handle);

        job.publish(match outcome {
            Ok(artifact) => ProgressEvent::Completed(artifact),
            Err(e) => ProgressEvent::Failed(e),
        });
    }

    async fn execute(&self, job: &InFlightJob, request: &NormalizedRequest) -> Result<AudioArtifact> {
        let inner = &self.inner;
        let limits = &inner.limits;
        let client = inner.client.as_ref();

        let remote_id = with_retry(
            &inner.retry,
            limits.call_timeout,
            "submit",
            |n| job.on_retry(n),
            move || {
                job.count_attempt();
                client.submit(request)
            },
        )
        .await?;

        {
            let mut handle = job.handle.lock();
            handle.remote_job_id = Some(remote_id.clone());
            handle.status = JobStatus::Running;
        }
        debug!(job_id = %remote_id, "remote job accepted");
        job.publish(ProgressEvent::Submitted {
            remote_job_id: remote_id.clone(),
        });

        let remote_id = &remote_id;

        let result_url = loop {
            let status = with_retry(
                &inner.retry,
                limits.call_timeout,
                "poll",
                |n| job.on_retry(n),
                move || {
                    job.count_attempt();
                    client.poll_status(remote_id)
                },
            )
            .await?;

            match status.state {
                RemoteState::InProgress => {
                    job.handle.lock().progress = status.progress;
                    job.publish(ProgressEvent::Progress {
                        fraction: status.progress,
                    });
                    tokio::time::sleep(limits.poll_interval).await;
                }
                RemoteState::Succeeded => match status.result_url {
                    Some(url) => break url,
                    None => {
                        return Err(SynthesisError::RemoteRejected(
                            "job finished without an audio url".to_string(),
                        ))
                    }
                },
                RemoteState::Failed => {
                    return Err(SynthesisError::RemoteRejected(
                        status
                            .message
                            .unwrap_or_else(|| "remote synthesis failed".to_string()),
                    ))
                }
            }
        };

        let extension = artifact_extension(&result_url);
        let (url, extension) = (result_url.as_str(), extension.as_str());
        let fingerprint = request.fingerprint();
        let store = inner.store.as_ref();
        with_retry(
            &inner.retry,
            limits.call_timeout,
            "download",
            |n| job.on_retry(n),
            move || {
                job.count_attempt();
                async move {
                    let download = client.fetch(url).await?;
                    let total = download.content_length;
                    store
                        .write_with_progress(fingerprint, extension, download.body, &|bytes| {
                            job.publish(ProgressEvent::Downloading { bytes, total })
                        })
                        .await
                }
            },
        )
        .await
    }

    fn remember(&self, handle: JobHandle) {
        let mut recent = self.inner.recent.lock();
        if recent.len() == RECENT_JOBS_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(handle);
    }
}

/// Forward job events to `sink` until a terminal one arrives.
async fn await_outcome(
    mut rx: watch::Receiver<ProgressEvent>,
    sink: &dyn ProgressSink,
) -> Result<AudioArtifact> {
    loop {
        let event = rx.borrow_and_update().clone();
        sink.on_event(&event);
        match event {
            ProgressEvent::Completed(artifact) => return Ok(artifact),
            ProgressEvent::Failed(err) => return Err(err),
            _ => {}
        }

        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return match last {
                ProgressEvent::Completed(artifact) => {
                    sink.on_event(&ProgressEvent::Completed(artifact.clone()));
                    Ok(artifact)
                }
                ProgressEvent::Failed(err) => {
                    sink.on_event(&ProgressEvent::Failed(err.clone()));
                    Err(err)
                }
                _ => Err(SynthesisError::Internal(
                    "synthesis job ended without a result".to_string(),
                )),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::mock::{ScriptedClient, ScriptedPoll};
    use crate::synthesis::progress::NoopSink;
    use crate::synthesis::request::SynthesisRequest;
    use crate::synthesis::{AudioDownload, RemoteStatus};
    use futures_util::StreamExt;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn fast_limits() -> JobLimits {
        JobLimits {
            call_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(1),
            max_job_duration: Duration::from_secs(10),
        }
    }

    async fn coordinator(
        tmp: &TempDir,
        client: Arc<ScriptedClient>,
        retry: RetryPolicy,
        limits: JobLimits,
    ) -> JobCoordinator {
        let store = Arc::new(ArtifactStore::open(tmp.path(), 0).await.unwrap());
        JobCoordinator::new(client, store, retry, limits)
    }

    fn request(text: &str) -> NormalizedRequest {
        SynthesisRequest::new(text, "v1").normalize().unwrap()
    }

    #[tokio::test]
    async fn test_run_reports_progress_and_stores_artifact() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new().with_polls(vec![
            ScriptedPoll::InProgress(Some(0.5)),
            ScriptedPoll::Succeeded,
        ]));
        let coord = coordinator(&tmp, client.clone(), fast_retry(3), fast_limits()).await;

        let events = StdMutex::new(Vec::new());
        let sink = |e: &ProgressEvent| events.lock().unwrap().push(e.clone());
        let artifact = assert_ok!(coord.run(request("hello"), &sink).await);

        assert_eq!(std::fs::read(&artifact.file_path).unwrap(), client.audio());
        let events = events.into_inner().unwrap();
        assert!(matches!(events.last(), Some(ProgressEvent::Completed(_))));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let recent = coord.recent_jobs();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, JobStatus::Succeeded);
        assert_eq!(recent[0].remote_job_id, Some(RemoteJobId::new("job-1")));
        assert!(coord.active_jobs().is_empty());
    }

    /// Scripted backend whose download stalls after the first chunk until
    /// the gate opens.
    struct GatedDownload {
        inner: ScriptedClient,
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl RemoteSynthesisClient for GatedDownload {
        fn name(&self) -> &str {
            "gated"
        }

        async fn submit(&self, request: &NormalizedRequest) -> Result<RemoteJobId> {
            self.inner.submit(request).await
        }

        async fn poll_status(&self, job: &RemoteJobId) -> Result<RemoteStatus> {
            self.inner.poll_status(job).await
        }

        async fn fetch(&self, _url: &str) -> Result<AudioDownload> {
            let gate = self.gate.clone();
            let body = async_stream::stream! {
                yield Ok(bytes::Bytes::from_static(b"ID3-head"));
                gate.notified().await;
                yield Ok(bytes::Bytes::from_static(b"-tail"));
            };
            Ok(AudioDownload::new(body.boxed())
                .with_content_length(Some(13)))
        }
    }

    #[tokio::test]
    async fn test_download_progress_is_published() {
        let tmp = TempDir::new().unwrap();
        let gate = Arc::new(tokio::sync::Notify::new());
        let client = Arc::new(GatedDownload {
            inner: ScriptedClient::new(),
            gate: gate.clone(),
        });
        let store = Arc::new(ArtifactStore::open(tmp.path(), 0).await.unwrap());
        let coord = JobCoordinator::new(client, store, fast_retry(1), fast_limits());

        let events = StdMutex::new(Vec::new());
        let sink = |e: &ProgressEvent| {
            if matches!(e, ProgressEvent::Downloading { .. }) {
                gate.notify_one();
            }
            events.lock().unwrap().push(e.clone());
        };
        let artifact = assert_ok!(coord.run(request("hello"), &sink).await);
        assert_eq!(artifact.size_bytes, 13);

        let events = events.into_inner().unwrap();
        assert!(events.contains(&ProgressEvent::Downloading {
            bytes: 8,
            total: Some(13),
        }));
        assert!(matches!(events.last(), Some(ProgressEvent::Completed(_))));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_remote() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new());
        let coord = coordinator(&tmp, client.clone(), fast_retry(3), fast_limits()).await;

        let first = coord.run(request("hello"), &NoopSink).await.unwrap();
        let second = coord.run(request("hello"), &NoopSink).await.unwrap();

        assert_eq!(first.file_path, second.file_path);
        assert_eq!(client.submit_calls(), 1);
        assert_eq!(client.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_job() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(
            ScriptedClient::new().with_polls(vec![
                ScriptedPoll::InProgress(None),
                ScriptedPoll::InProgress(None),
                ScriptedPoll::Succeeded,
            ]),
        );
        let limits = JobLimits {
            poll_interval: Duration::from_millis(20),
            ..fast_limits()
        };
        let coord = coordinator(&tmp, client.clone(), fast_retry(3), limits).await;

        let runs = (0..5).map(|_| {
            let coord = coord.clone();
            async move { coord.run(request("hello"), &NoopSink).await }
        });
        let results = futures_util::future::join_all(runs).await;

        assert_eq!(client.submit_calls(), 1);
        let paths: Vec<_> = results.into_iter().map(|r| r.unwrap().file_path).collect();
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_distinct_requests_run_independently() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new());
        let coord = coordinator(&tmp, client.clone(), fast_retry(3), fast_limits()).await;

        let (a, b) = tokio::join!(
            coord.run(request("one"), &NoopSink),
            coord.run(request("two"), &NoopSink)
        );
        assert_ne!(a.unwrap().fingerprint, b.unwrap().fingerprint);
        assert_eq!(client.submit_calls(), 2);
    }

    #[tokio::test]
    async fn test_submit_retries_exhausted() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new().failing_submits(
            u32::MAX,
            SynthesisError::Transport("connection refused".into()),
        ));
        let coord = coordinator(&tmp, client.clone(), fast_retry(3), fast_limits()).await;

        let err = assert_err!(coord.run(request("hello"), &NoopSink).await);
        assert_eq!(err, SynthesisError::Transport("connection refused".into()));
        assert_eq!(client.submit_calls(), 3);

        let recent = coord.recent_jobs();
        assert_eq!(recent[0].status, JobStatus::Failed);
        assert_eq!(recent[0].attempts, 3);
        assert_eq!(recent[0].error, Some(err));
    }

    #[tokio::test]
    async fn test_failed_job_is_not_cached() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new().failing_submits(
            1,
            SynthesisError::RemoteRejected("bad voice".into()),
        ));
        let coord = coordinator(&tmp, client.clone(), fast_retry(3), fast_limits()).await;

        assert!(coord.run(request("hello"), &NoopSink).await.is_err());
        // The next call starts a fresh job instead of replaying the failure.
        assert!(coord.run(request("hello"), &NoopSink).await.is_ok());
        assert_eq!(client.submit_calls(), 2);
    }

    #[tokio::test]
    async fn test_remote_failure_is_rejection() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(
            ScriptedClient::new().with_polls(vec![ScriptedPoll::Failed("voice disabled".into())]),
        );
        let coord = coordinator(&tmp, client.clone(), fast_retry(3), fast_limits()).await;

        let err = coord.run(request("hello"), &NoopSink).await.unwrap_err();
        assert_eq!(err, SynthesisError::RemoteRejected("voice disabled".into()));
        assert_eq!(client.fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_submit_is_retried() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(
            ScriptedClient::new()
                .failing_submits(1, SynthesisError::RateLimited { retry_after: None }),
        );
        let coord = coordinator(&tmp, client.clone(), fast_retry(3), fast_limits()).await;

        coord.run(request("hello"), &NoopSink).await.unwrap();
        assert_eq!(client.submit_calls(), 2);
        assert_eq!(coord.recent_jobs()[0].status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_job_duration_limit() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new().with_polls(vec![ScriptedPoll::InProgress(None)]));
        let limits = JobLimits {
            poll_interval: Duration::from_millis(5),
            max_job_duration: Duration::from_millis(60),
            ..fast_limits()
        };
        let coord = coordinator(&tmp, client.clone(), fast_retry(3), limits).await;

        let err = coord.run(request("hello"), &NoopSink).await.unwrap_err();
        assert_eq!(
            err,
            SynthesisError::Timeout {
                limit: Duration::from_millis(60)
            }
        );
        assert!(coord.active_jobs().is_empty());
        assert!(coord.store().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_wait_still_caches() {
        let tmp = TempDir::new().unwrap();
        let client = Arc::new(ScriptedClient::new().with_polls(vec![
            ScriptedPoll::InProgress(None),
            ScriptedPoll::InProgress(None),
            ScriptedPoll::Succeeded,
        ]));
        let limits = JobLimits {
            poll_interval: Duration::from_millis(20),
            ..fast_limits()
        };
        let coord = coordinator(&tmp, client.clone(), fast_retry(3), limits).await;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(5), coord.run(request("hello"), &NoopSink))
                .await;
        assert!(abandoned.is_err());

        let fp = request("hello").fingerprint().clone();
        for _ in 0..200 {
            if coord.store().lookup(&fp).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(coord.store().lookup(&fp).is_some());
        assert_eq!(client.submit_calls(), 1);
    }
}
