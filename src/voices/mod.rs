//! Voice catalogue and generation history
//!
//! Keeps a cached copy of the account's voice list so chat-style commands
//! can address voices by display name or by their position in the list.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::synthesis::SynthesisError;
use crate::vocu::{HistoryEntry, Role, VocuClient};

/// History page size used by the remote API.
pub const HISTORY_PAGE_SIZE: usize = 20;

/// Upper bound on history pages fetched per request.
pub const HISTORY_MAX_PAGES: usize = 5;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("voice not found: {0}")]
    NotFound(String),

    #[error("no voice at position {index} (the list has {len})")]
    InvalidIndex { index: usize, len: usize },

    #[error("generation history is empty")]
    EmptyHistory,

    #[error(transparent)]
    Remote(#[from] SynthesisError),
}

pub type Result<T> = std::result::Result<T, VoiceError>;

/// Account-level voice operations.
#[async_trait]
pub trait VoiceDirectory: Send + Sync {
    async fn list_voices(&self) -> std::result::Result<Vec<Role>, SynthesisError>;

    async fn add_voice(&self, share_id: &str) -> std::result::Result<String, SynthesisError>;

    async fn delete_voice(&self, voice_id: &str) -> std::result::Result<String, SynthesisError>;

    async fn history(
        &self,
        offset: usize,
        limit: usize,
    ) -> std::result::Result<Vec<HistoryEntry>, SynthesisError>;
}

#[async_trait]
impl VoiceDirectory for VocuClient {
    async fn list_voices(&self) -> std::result::Result<Vec<Role>, SynthesisError> {
        VocuClient::list_voices(self).await
    }

    async fn add_voice(&self, share_id: &str) -> std::result::Result<String, SynthesisError> {
        VocuClient::add_voice(self, share_id).await
    }

    async fn delete_voice(&self, voice_id: &str) -> std::result::Result<String, SynthesisError> {
        VocuClient::delete_voice(self, voice_id).await
    }

    async fn history(
        &self,
        offset: usize,
        limit: usize,
    ) -> std::result::Result<Vec<HistoryEntry>, SynthesisError> {
        VocuClient::history(self, offset, limit).await
    }
}

#[async_trait]
impl<T: VoiceDirectory + ?Sized> VoiceDirectory for Arc<T> {
    async fn list_voices(&self) -> std::result::Result<Vec<Role>, SynthesisError> {
        (**self).list_voices().await
    }

    async fn add_voice(&self, share_id: &str) -> std::result::Result<String, SynthesisError> {
        (**self).add_voice(share_id).await
    }

    async fn delete_voice(&self, voice_id: &str) -> std::result::Result<String, SynthesisError> {
        (**self).delete_voice(voice_id).await
    }

    async fn history(
        &self,
        offset: usize,
        limit: usize,
    ) -> std::result::Result<Vec<HistoryEntry>, SynthesisError> {
        (**self).history(offset, limit).await
    }
}

/// Cached voice list on top of a [`VoiceDirectory`].
pub struct RoleCatalog<D> {
    directory: D,
    roles: Vec<Role>,
}

impl<D: VoiceDirectory> RoleCatalog<D> {
    pub fn new(directory: D) -> Self {
        Self {
            directory,
            roles: Vec::new(),
        }
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Reload the voice list.
    pub async fn refresh(&mut self) -> Result<&[Role]> {
        self.roles = self.directory.list_voices().await?;
        info!(count = self.roles.len(), "voice list refreshed");
        Ok(&self.roles)
    }

    /// Voice id to generate with for `name_or_id`: a display name maps to
    /// its generate id, a known voice id passes through.
    pub async fn resolve(&mut self, name_or_id: &str) -> Result<String> {
        let wanted = name_or_id.trim();
        if self.roles.is_empty() {
            self.refresh().await?;
        }

        if let Some(role) = self.roles.iter().find(|r| r.name == wanted) {
            return Ok(role.generate_id().to_string());
        }
        if let Some(role) = self
            .roles
            .iter()
            .find(|r| r.id == wanted || r.id_for_generate.as_deref() == Some(wanted))
        {
            return Ok(role.generate_id().to_string());
        }
        Err(VoiceError::NotFound(wanted.to_string()))
    }

    /// Numbered listing, one `"{n}. {name}"` line per voice.
    pub fn format_listing(&self) -> String {
        self.roles
            .iter()
            .enumerate()
            .map(|(i, role)| format!("{}. {}", i + 1, role))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Add a shared voice and reload the list.
    pub async fn add(&mut self, share_id: &str) -> Result<String> {
        let message = self.directory.add_voice(share_id.trim()).await?;
        self.refresh().await?;
        Ok(message)
    }

    /// Delete the voice at 1-based `index` of the current listing and
    /// reload the list.
    pub async fn delete(&mut self, index: usize) -> Result<String> {
        if self.roles.is_empty() {
            self.refresh().await?;
        }
        let len = self.roles.len();
        let role = index
            .checked_sub(1)
            .and_then(|i| self.roles.get(i))
            .ok_or(VoiceError::InvalidIndex { index, len })?;

        let voice_id = role.id.clone();
        let message = self.directory.delete_voice(&voice_id).await?;
        info!(voice_id = %voice_id, "voice deleted");
        self.refresh().await?;
        Ok(message)
    }
}

/// Fetch up to `size` recent generations, one page of
/// [`HISTORY_PAGE_SIZE`] at a time and at most [`HISTORY_MAX_PAGES`] pages.
/// A failing page ends the listing with what was collected so far.
pub async fn history<D: VoiceDirectory + ?Sized>(
    directory: &D,
    size: usize,
) -> Result<Vec<HistoryEntry>> {
    let pages = (size / HISTORY_PAGE_SIZE).clamp(1, HISTORY_MAX_PAGES);
    let mut entries = Vec::new();

    for page in 0..pages {
        let offset = page * HISTORY_PAGE_SIZE;
        match directory.history(offset, HISTORY_PAGE_SIZE).await {
            Ok(batch) => entries.extend(batch),
            Err(e) => {
                warn!(
                    offset,
                    limit = HISTORY_PAGE_SIZE,
                    error = %e,
                    "failed to fetch history page"
                );
                break;
            }
        }
    }

    if entries.is_empty() {
        return Err(VoiceError::EmptyHistory);
    }
    Ok(entries)
}
