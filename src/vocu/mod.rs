//! Vocu HTTP client
//!
//! Implements [`RemoteSynthesisClient`] against the Vocu TTS API and exposes
//! the account endpoints (voice list, history) used by the voice catalogue.
//!
//! Failure mapping:
//!
//! | Response                        | Error                         |
//! |---------------------------------|-------------------------------|
//! | connect / timeout / bad body    | `Transport`                   |
//! | HTTP 408, 5xx                   | `Transport`                   |
//! | HTTP 429 or envelope status 429 | `RateLimited` (`Retry-After`) |
//! | other HTTP 4xx                  | `RemoteRejected`              |
//! | envelope status != 200          | `RemoteRejected`              |

pub mod types;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::config::{Config, RequestMode};
use crate::synthesis::{
    AudioDownload, NormalizedRequest, RemoteJobId, RemoteStatus, RemoteSynthesisClient, Result,
    SynthesisError,
};

pub use types::{Envelope, HistoryEntry, Role};
use types::{CreatedJob, Generation, SimpleGeneration};

/// Option key selecting the speaking style.
pub const PROMPT_ID_OPTION: &str = "promptId";

/// Prefix of job ids minted locally for sync-mode requests.
const SYNC_JOB_PREFIX: &str = "sync-";

/// Audio URL of a sync-mode generation awaiting its first poll.
struct SyncResult {
    audio_url: String,
    created: Instant,
}

/// Client for the Vocu API.
pub struct VocuClient {
    /// Carries the bearer token; only used for the API origin.
    http: reqwest::Client,
    /// Same timeouts and proxy, no credentials. Downloads from other hosts.
    download: reqwest::Client,
    /// Always ends with `/` so relative joins keep any path prefix.
    base_url: Url,
    mode: RequestMode,
    default_prompt_id: String,
    /// Audio URLs of sync-mode generations, keyed by local job id.
    sync_results: Mutex<HashMap<String, SyncResult>>,
    /// Unpolled sync results older than this belong to abandoned jobs.
    sync_result_ttl: Duration,
}

impl VocuClient {
    /// Build a client from the `vocu` and `timeouts` config sections.
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config
            .vocu
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                SynthesisError::Validation(
                    "no Vocu API key configured (set vocu.apiKey or VOCU_API_KEY)".to_string(),
                )
            })?;

        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| SynthesisError::Validation("API key contains invalid characters".to_string()))?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = http_builder(config)?
            .default_headers(headers)
            .build()
            .map_err(|e| SynthesisError::Internal(format!("failed to build HTTP client: {e}")))?;
        let download = http_builder(config)?
            .build()
            .map_err(|e| SynthesisError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            download,
            base_url: parse_base_url(&config.vocu.base_url)?,
            mode: config.vocu.request_mode,
            default_prompt_id: config.vocu.default_prompt_id.clone(),
            sync_results: Mutex::new(HashMap::new()),
            sync_result_ttl: config.timeouts.job_limits().max_job_duration,
        })
    }

    pub fn mode(&self) -> RequestMode {
        self.mode
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| SynthesisError::Internal(format!("invalid endpoint {path}: {e}")))
    }

    fn prompt_id<'a>(&'a self, request: &'a NormalizedRequest) -> &'a str {
        request
            .option(PROMPT_ID_OPTION)
            .and_then(|v| v.as_str())
            .filter(|p| !p.is_empty())
            .unwrap_or(self.default_prompt_id.as_str())
    }

    /// Body for `POST /api/tts/generate`.
    fn build_generate_body(&self, request: &NormalizedRequest) -> Value {
        let mut body = json!({
            "contents": [{
                "voiceId": request.voice_id(),
                "text": request.text(),
                "promptId": self.prompt_id(request),
            }],
            "break_clone": true,
            "sharpen": false,
            "temperature": 1,
            "top_k": 1024,
            "top_p": 1,
            "srt": false,
            "seed": -1,
        });
        apply_options(&mut body, request);
        body
    }

    /// Body for `POST /api/tts/simple-generate`.
    fn build_simple_body(&self, request: &NormalizedRequest) -> Value {
        let mut body = json!({
            "voiceId": request.voice_id(),
            "text": request.text(),
            "promptId": self.prompt_id(request),
            "preset": "v2_creative",
            "flash": false,
            "stream": false,
            "srt": false,
            "seed": -1,
        });
        apply_options(&mut body, request);
        body
    }

    /// Send a request and unwrap the response envelope.
    async fn call<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<Envelope<T>> {
        let response = request.send().await.map_err(transport_error)?;
        let response = check_status(response).await?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| SynthesisError::Transport(format!("malformed response body: {e}")))?;
        check_envelope(envelope)
    }

    async fn submit_async(&self, request: &NormalizedRequest) -> Result<RemoteJobId> {
        let url = self.endpoint("api/tts/generate")?;
        let envelope: Envelope<CreatedJob> = self
            .call(self.http.post(url).json(&self.build_generate_body(request)))
            .await?;
        envelope
            .data
            .and_then(|job| job.id)
            .filter(|id| !id.is_empty())
            .map(RemoteJobId::new)
            .ok_or_else(|| SynthesisError::RemoteRejected("response carried no job id".to_string()))
    }

    async fn submit_sync(&self, request: &NormalizedRequest) -> Result<RemoteJobId> {
        let url = self.endpoint("api/tts/simple-generate")?;
        let envelope: Envelope<SimpleGeneration> = self
            .call(self.http.post(url).json(&self.build_simple_body(request)))
            .await?;
        let audio = envelope
            .data
            .and_then(|d| d.audio)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| SynthesisError::RemoteRejected("response carried no audio url".to_string()))?;

        let id = format!("{SYNC_JOB_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let mut results = self.sync_results.lock();
        let ttl = self.sync_result_ttl;
        results.retain(|_, r| r.created.elapsed() < ttl);
        results.insert(
            id.clone(),
            SyncResult {
                audio_url: audio,
                created: Instant::now(),
            },
        );
        Ok(RemoteJobId::new(id))
    }

    /// Voices of the account, market voices included.
    pub async fn list_voices(&self) -> Result<Vec<Role>> {
        let mut url = self.endpoint("api/tts/voice")?;
        url.query_pairs_mut().append_pair("showMarket", "true");
        let envelope: Envelope<Vec<Role>> = self.call(self.http.get(url)).await?;
        Ok(envelope.data.unwrap_or_default())
    }

    /// Add a shared voice to the account. Returns the service's message and
    /// the new voice id.
    pub async fn add_voice(&self, share_id: &str) -> Result<String> {
        let url = self.endpoint("api/voice/byShareId")?;
        let envelope: Envelope<Value> = self
            .call(self.http.post(url).json(&json!({ "shareId": share_id })))
            .await?;
        Ok(format!(
            "{}, voiceId: {}",
            envelope.message.unwrap_or_default(),
            envelope.voice_id.unwrap_or_default()
        ))
    }

    /// Remove a voice from the account. Returns the service's message.
    pub async fn delete_voice(&self, voice_id: &str) -> Result<String> {
        let mut url = self.endpoint("api/tts/voice")?;
        url.path_segments_mut()
            .map_err(|_| SynthesisError::Internal("base URL cannot hold a path".to_string()))?
            .pop_if_empty()
            .push(voice_id);
        let envelope: Envelope<Value> = self.call(self.http.delete(url)).await?;
        Ok(envelope.message.unwrap_or_default())
    }

    /// One page of generation history. Entries missing a voice name, text
    /// or audio URL are skipped.
    pub async fn history(&self, offset: usize, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut url = self.endpoint("api/tts/generate")?;
        url.query_pairs_mut()
            .append_pair("offset", &offset.to_string())
            .append_pair("limit", &limit.to_string())
            .append_pair("stream", "true");
        let envelope: Envelope<Vec<Value>> = self.call(self.http.get(url)).await?;
        let items = envelope
            .data
            .ok_or_else(|| SynthesisError::RemoteRejected("history list is empty".to_string()))?;

        let total = items.len();
        let entries: Vec<HistoryEntry> = items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<Generation>(item).ok())
            .filter_map(|generation| generation.history_entry())
            .collect();
        if entries.len() < total {
            debug!(skipped = total - entries.len(), "skipped malformed history entries");
        }
        Ok(entries)
    }
}

#[async_trait]
impl RemoteSynthesisClient for VocuClient {
    fn name(&self) -> &str {
        "vocu"
    }

    async fn submit(&self, request: &NormalizedRequest) -> Result<RemoteJobId> {
        match self.mode {
            RequestMode::Async => self.submit_async(request).await,
            RequestMode::Sync => self.submit_sync(request).await,
        }
    }

    async fn poll_status(&self, job: &RemoteJobId) -> Result<RemoteStatus> {
        if job.as_str().starts_with(SYNC_JOB_PREFIX) {
            return match self.sync_results.lock().remove(job.as_str()) {
                Some(result) => Ok(RemoteStatus::succeeded(result.audio_url)),
                None => Err(SynthesisError::Internal(format!("unknown sync job {job}"))),
            };
        }

        let mut url = self.endpoint("api/tts/generate")?;
        url.path_segments_mut()
            .map_err(|_| SynthesisError::Internal("base URL cannot hold a path".to_string()))?
            .pop_if_empty()
            .push(job.as_str());
        url.query_pairs_mut().append_pair("stream", "true");

        let envelope: Envelope<Generation> = self.call(self.http.get(url)).await?;
        let generation = envelope
            .data
            .ok_or_else(|| SynthesisError::Transport("poll response carried no data".to_string()))?;

        Ok(match generation.status.as_deref() {
            Some("generated") => match generation.audio_url() {
                Some(audio) => RemoteStatus::succeeded(audio),
                None => RemoteStatus {
                    result_url: None,
                    ..RemoteStatus::succeeded("")
                },
            },
            Some(status @ ("failed" | "error")) => RemoteStatus::failed(
                envelope
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| format!("generation {status}")),
            ),
            _ => RemoteStatus::in_progress(generation.progress_fraction()),
        })
    }

    async fn fetch(&self, url: &str) -> Result<AudioDownload> {
        // Result URLs are normally absolute; relative ones hang off the API.
        let url = self
            .base_url
            .join(url)
            .map_err(|e| SynthesisError::RemoteRejected(format!("invalid audio url {url}: {e}")))?;
        let http = if url.origin() == self.base_url.origin() {
            &self.http
        } else {
            &self.download
        };
        debug!(url = %url, "downloading audio");

        let response = http.get(url).send().await.map_err(transport_error)?;
        let response = check_status(response).await?;
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(transport_error))
            .boxed();
        Ok(AudioDownload::new(body).with_content_length(content_length))
    }
}

/// Builder with the configured timeouts and proxy.
fn http_builder(config: &Config) -> Result<reqwest::ClientBuilder> {
    let builder = reqwest::Client::builder()
        .connect_timeout(config.timeouts.connect_timeout())
        .timeout(config.timeouts.call_timeout());
    Ok(match config.vocu.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(proxy) => builder.proxy(
            reqwest::Proxy::all(proxy)
                .map_err(|e| SynthesisError::Validation(format!("invalid proxy URL: {e}")))?,
        ),
        None => builder.no_proxy(),
    })
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| SynthesisError::Validation(format!("invalid base URL \"{raw}\": {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(SynthesisError::Validation(format!(
            "base URL must use http or https, got \"{}\"",
            url.scheme()
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Request options override top-level body keys; `promptId` is already
/// placed inside the content entry.
fn apply_options(body: &mut Value, request: &NormalizedRequest) {
    let Some(map) = body.as_object_mut() else {
        return;
    };
    for (key, value) in request.options() {
        if key != PROMPT_ID_OPTION {
            map.insert(key.clone(), value.to_json());
        }
    }
}

fn transport_error(err: reqwest::Error) -> SynthesisError {
    if err.is_timeout() {
        SynthesisError::Transport(format!("request timed out: {err}"))
    } else {
        SynthesisError::Transport(err.to_string())
    }
}

/// Map HTTP status codes onto the pipeline's error kinds.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    match status.as_u16() {
        429 => Err(SynthesisError::RateLimited { retry_after }),
        408 => Err(SynthesisError::Transport(format!("{status}: {body}"))),
        s if s >= 500 => Err(SynthesisError::Transport(format!("{status}: {body}"))),
        _ => {
            warn!(status = status.as_u16(), "Vocu rejected request");
            Err(SynthesisError::RemoteRejected(format!("{status}: {body}")))
        }
    }
}

fn check_envelope<T>(envelope: Envelope<T>) -> Result<Envelope<T>> {
    match envelope.status {
        Some(200) => Ok(envelope),
        Some(429) => Err(SynthesisError::RateLimited { retry_after: None }),
        status => Err(SynthesisError::RemoteRejected(format!(
            "status: {}, message: {}",
            status.map_or_else(|| "none".to_string(), |s| s.to_string()),
            envelope.message.as_deref().unwrap_or_default()
        ))),
    }
}
