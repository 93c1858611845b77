//! Scripted in-memory synthesis backend for tests and offline runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;

use super::client::{AudioDownload, RemoteJobId, RemoteStatus, RemoteSynthesisClient};
use super::request::NormalizedRequest;
use super::{Result, SynthesisError};

const DEFAULT_AUDIO: &[u8] = b"ID3\x04\x00scripted-audio";

/// One scripted answer to `poll_status`.
#[derive(Debug, Clone)]
pub enum ScriptedPoll {
    InProgress(Option<f32>),
    Succeeded,
    /// Reports success but carries no download URL.
    SucceededWithoutUrl,
    Failed(String),
    Error(SynthesisError),
}

/// Failure injected into the next `n` calls of an operation.
#[derive(Debug, Clone)]
struct Injected {
    remaining: u32,
    error: SynthesisError,
}

impl Injected {
    fn take(slot: &Mutex<Option<Injected>>) -> Option<SynthesisError> {
        let mut slot = slot.lock();
        let injected = slot.as_mut()?;
        if injected.remaining == 0 {
            return None;
        }
        injected.remaining -= 1;
        Some(injected.error.clone())
    }
}

/// A [`RemoteSynthesisClient`] driven by a script instead of the network.
///
/// Polls are answered from a queue whose last entry repeats forever.
pub struct ScriptedClient {
    polls: Mutex<VecDeque<ScriptedPoll>>,
    submit_failure: Mutex<Option<Injected>>,
    fetch_failure: Mutex<Option<Injected>>,
    interrupted_fetches: AtomicU32,
    submit_delay: Duration,
    audio: Vec<u8>,
    extension: String,
    submit_calls: AtomicU32,
    poll_calls: AtomicU32,
    fetch_calls: AtomicU32,
    jobs_created: AtomicU32,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedClient {
    /// Succeeds on the first poll with a small mp3 body.
    pub fn new() -> Self {
        Self {
            polls: Mutex::new(VecDeque::from([ScriptedPoll::Succeeded])),
            submit_failure: Mutex::new(None),
            fetch_failure: Mutex::new(None),
            interrupted_fetches: AtomicU32::new(0),
            submit_delay: Duration::ZERO,
            audio: DEFAULT_AUDIO.to_vec(),
            extension: "mp3".to_string(),
            submit_calls: AtomicU32::new(0),
            poll_calls: AtomicU32::new(0),
            fetch_calls: AtomicU32::new(0),
            jobs_created: AtomicU32::new(0),
        }
    }

    pub fn with_polls(self, polls: Vec<ScriptedPoll>) -> Self {
        *self.polls.lock() = polls.into();
        self
    }

    pub fn with_audio(mut self, audio: impl Into<Vec<u8>>, extension: &str) -> Self {
        self.audio = audio.into();
        self.extension = extension.to_string();
        self
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    /// Fail the next `times` submits with `error`.
    pub fn failing_submits(self, times: u32, error: SynthesisError) -> Self {
        *self.submit_failure.lock() = Some(Injected {
            remaining: times,
            error,
        });
        self
    }

    /// Fail the next `times` fetches with `error` before any byte is sent.
    pub fn failing_fetches(self, times: u32, error: SynthesisError) -> Self {
        *self.fetch_failure.lock() = Some(Injected {
            remaining: times,
            error,
        });
        self
    }

    /// Break the body of the next `times` fetches after the first chunk.
    pub fn interrupting_fetches(self, times: u32) -> Self {
        self.interrupted_fetches.store(times, Ordering::SeqCst);
        self
    }

    pub fn audio(&self) -> &[u8] {
        &self.audio
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> u32 {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn next_poll(&self) -> ScriptedPoll {
        let mut polls = self.polls.lock();
        if polls.len() > 1 {
            polls.pop_front().unwrap_or(ScriptedPoll::Succeeded)
        } else {
            polls.front().cloned().unwrap_or(ScriptedPoll::Succeeded)
        }
    }

    fn result_url(&self, job: &RemoteJobId) -> String {
        format!("https://audio.invalid/{job}.{}", self.extension)
    }
}

#[async_trait]
impl RemoteSynthesisClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, _request: &NormalizedRequest) -> Result<RemoteJobId> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        if let Some(err) = Injected::take(&self.submit_failure) {
            return Err(err);
        }
        let n = self.jobs_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RemoteJobId::new(format!("job-{n}")))
    }

    async fn poll_status(&self, job: &RemoteJobId) -> Result<RemoteStatus> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        match self.next_poll() {
            ScriptedPoll::InProgress(progress) => Ok(RemoteStatus::in_progress(progress)),
            ScriptedPoll::Succeeded => Ok(RemoteStatus::succeeded(self.result_url(job))),
            ScriptedPoll::SucceededWithoutUrl => Ok(RemoteStatus {
                result_url: None,
                ..RemoteStatus::succeeded("")
            }),
            ScriptedPoll::Failed(message) => Ok(RemoteStatus::failed(message)),
            ScriptedPoll::Error(err) => Err(err),
        }
    }

    async fn fetch(&self, _url: &str) -> Result<AudioDownload> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = Injected::take(&self.fetch_failure) {
            return Err(err);
        }

        let interrupt = self
            .interrupted_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let (head, tail) = self.audio.split_at(self.audio.len() / 2);
        let mut chunks: Vec<Result<Bytes>> = vec![Ok(Bytes::copy_from_slice(head))];
        if interrupt {
            chunks.push(Err(SynthesisError::Transport(
                "connection reset mid-body".to_string(),
            )));
        } else {
            chunks.push(Ok(Bytes::copy_from_slice(tail)));
        }
        Ok(AudioDownload::new(stream::iter(chunks).boxed())
            .with_content_length(Some(self.audio.len() as u64)))
    }
}
