//! Vocu wire types
//!
//! Every endpoint answers with `{status, message, data}`; only the fields
//! this crate reads are modelled, everything else is ignored.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Response envelope shared by all endpoints.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub status: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    /// Only set by `POST /api/voice/byShareId`.
    #[serde(rename = "voiceId", default)]
    pub voice_id: Option<String>,
}

/// A voice ("role") in the account's voice list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    /// Id to use when generating; differs from `id` for market voices.
    #[serde(rename = "idForGenerate", default)]
    pub id_for_generate: Option<String>,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl Role {
    /// Voice id to pass to the generate endpoints.
    pub fn generate_id(&self) -> &str {
        match self.id_for_generate.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => &self.id,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// `data` of a newly created async job.
#[derive(Debug, Deserialize)]
pub struct CreatedJob {
    #[serde(default)]
    pub id: Option<String>,
}

/// `data` of `POST /api/tts/simple-generate`.
#[derive(Debug, Deserialize)]
pub struct SimpleGeneration {
    #[serde(default)]
    pub audio: Option<String>,
}

/// A generation job as returned by the poll and history endpoints.
#[derive(Debug, Deserialize)]
pub struct Generation {
    #[serde(default)]
    pub status: Option<String>,
    /// Either a fraction or a percentage, depending on the endpoint version.
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub metadata: Option<GenerationMetadata>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerationMetadata {
    #[serde(default)]
    pub contents: Vec<GeneratedContent>,
    #[serde(default)]
    pub voices: Vec<GenerationVoice>,
}

#[derive(Debug, Deserialize)]
pub struct GeneratedContent {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub audio: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenerationVoice {
    #[serde(default)]
    pub name: Option<String>,
}

impl Generation {
    /// Audio URL of the first generated segment.
    pub fn audio_url(&self) -> Option<&str> {
        self.metadata
            .as_ref()?
            .contents
            .first()?
            .audio
            .as_deref()
            .filter(|url| !url.is_empty())
    }

    /// Progress as a fraction in `0.0..=1.0`.
    pub fn progress_fraction(&self) -> Option<f32> {
        let raw = self.progress.filter(|p| p.is_finite())?;
        let fraction = if raw > 1.0 { raw / 100.0 } else { raw };
        Some(fraction.clamp(0.0, 1.0) as f32)
    }

    /// History view of this generation, if it has every field needed.
    pub fn history_entry(&self) -> Option<HistoryEntry> {
        let metadata = self.metadata.as_ref()?;
        let role_name = metadata.voices.first()?.name.clone()?;
        let content = metadata.contents.first()?;
        Some(HistoryEntry {
            role_name,
            text: content.text.clone()?,
            audio: content.audio.clone()?,
        })
    }
}

/// One past generation of the account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub role_name: String,
    pub text: String,
    pub audio: String,
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}\n{}", self.role_name, self.text, self.audio)
    }
}
