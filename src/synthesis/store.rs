//! Local artifact store
//!
//! Audio files live in a single directory as `<fingerprint>.<ext>`, next to
//! an `index.json` describing them. Writes stream into a `.part` temp file
//! that is renamed into place only after the data is synced, and the index
//! is updated only after the rename. The index is a cache of what is on
//! disk: on open it is reconciled against a directory scan, so a lost or
//! corrupted index costs nothing but the access-time history.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::client::ByteStream;
use super::fingerprint::Fingerprint;
use super::{Result, SynthesisError};

/// Name of the index file inside the cache directory.
pub const INDEX_FILE: &str = "index.json";

/// Suffix of in-progress downloads.
const TEMP_SUFFIX: &str = "part";

const INDEX_VERSION: u32 = 1;

/// A cached synthesis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioArtifact {
    pub fingerprint: Fingerprint,
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
    file_name: String,
    size_bytes: u64,
    created_at: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheIndex {
    version: u32,
    entries: BTreeMap<Fingerprint, IndexEntry>,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// Removes a temp file when dropped unless disarmed.
///
/// Covers error returns and a cancelled write future alike.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove temp file");
                }
            }
        }
    }
}

/// On-disk audio cache keyed by fingerprint.
pub struct ArtifactStore {
    dir: PathBuf,
    /// Size budget in bytes; 0 disables quota enforcement.
    quota_bytes: u64,
    index: RwLock<CacheIndex>,
    /// Set when in-memory access times are newer than `index.json`.
    dirty: AtomicBool,
    persist_lock: tokio::sync::Mutex<()>,
}

impl ArtifactStore {
    /// Open (or create) a store rooted at `dir`, reconciling the index with
    /// the directory contents.
    pub async fn open(dir: impl Into<PathBuf>, quota_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            SynthesisError::Io(format!("failed to create cache dir {}: {e}", dir.display()))
        })?;

        let loaded = load_index(&dir.join(INDEX_FILE)).await;
        let index_was_valid = loaded.is_some();
        let mut index = loaded.unwrap_or_default();

        let on_disk = scan_dir(&dir).await?;
        let changed = reconcile(&mut index, on_disk);

        let store = Self {
            dir,
            quota_bytes,
            index: RwLock::new(index),
            dirty: AtomicBool::new(false),
            persist_lock: tokio::sync::Mutex::new(()),
        };

        if changed || !index_was_valid {
            store.persist_index().await?;
        }

        info!(
            dir = %store.dir.display(),
            artifacts = store.len(),
            total_bytes = store.total_bytes(),
            "artifact store opened"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }

    pub fn len(&self) -> usize {
        self.index.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.index.read().entries.values().map(|e| e.size_bytes).sum()
    }

    /// Look up an artifact in the index, refreshing its access time for LRU
    /// eviction. An entry whose file has vanished is dropped.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<AudioArtifact> {
        let mut index = self.index.write();
        let entry = index.entries.get_mut(fingerprint)?;
        self.dirty.store(true, Ordering::Relaxed);

        if !self.dir.join(&entry.file_name).is_file() {
            warn!(fingerprint = %fingerprint.short(), file = %entry.file_name, "cached file disappeared");
            index.entries.remove(fingerprint);
            return None;
        }

        entry.last_accessed = Utc::now();
        Some(self.artifact(fingerprint, entry))
    }

    /// All indexed artifacts, oldest first.
    pub fn list(&self) -> Vec<AudioArtifact> {
        let index = self.index.read();
        let mut artifacts: Vec<AudioArtifact> = index
            .entries
            .iter()
            .map(|(fp, entry)| self.artifact(fp, entry))
            .collect();
        artifacts.sort_by_key(|a| a.created_at);
        artifacts
    }

    /// Stream `body` into the cache as the artifact for `fingerprint`.
    ///
    /// The artifact becomes visible to [`lookup`](Self::lookup) only once
    /// the file is fully written, synced, and renamed into place. On any
    /// error the temp file is removed and the index is left untouched.
    pub async fn write(
        &self,
        fingerprint: &Fingerprint,
        extension: &str,
        body: ByteStream,
    ) -> Result<AudioArtifact> {
        self.write_with_progress(fingerprint, extension, body, &|_| {})
            .await
    }

    /// [`write`](Self::write), calling `on_bytes` with the running byte
    /// count after each chunk lands in the temp file.
    pub async fn write_with_progress(
        &self,
        fingerprint: &Fingerprint,
        extension: &str,
        mut body: ByteStream,
        on_bytes: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<AudioArtifact> {
        let file_name = format!("{fingerprint}.{extension}");
        let final_path = self.dir.join(&file_name);
        let temp_path = self.dir.join(format!(
            "{file_name}.{}.{TEMP_SUFFIX}",
            uuid::Uuid::new_v4().simple()
        ));

        let mut guard = TempFileGuard::new(temp_path.clone());
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| SynthesisError::Io(format!("failed to create temp file: {e}")))?;

        let mut size_bytes: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| SynthesisError::Io(format!("failed to write audio: {e}")))?;
            size_bytes += chunk.len() as u64;
            on_bytes(size_bytes);
        }

        if size_bytes == 0 {
            return Err(SynthesisError::Transport(
                "remote returned an empty audio body".to_string(),
            ));
        }

        file.flush()
            .await
            .map_err(|e| SynthesisError::Io(format!("failed to flush audio: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| SynthesisError::Io(format!("failed to sync audio: {e}")))?;
        drop(file);

        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| SynthesisError::Io(format!("failed to move audio into place: {e}")))?;
        guard.disarm();

        let now = Utc::now();
        let previous = self.index.write().entries.insert(
            fingerprint.clone(),
            IndexEntry {
                file_name: file_name.clone(),
                size_bytes,
                created_at: now,
                last_accessed: now,
            },
        );

        // Same fingerprint stored earlier under another extension.
        if let Some(previous) = previous.filter(|p| p.file_name != file_name) {
            remove_file_if_exists(&self.dir.join(&previous.file_name)).await?;
        }

        // The file is in place; a failed index write is repaired by the
        // directory scan on next open.
        if let Err(e) = self.persist_index().await {
            warn!(error = %e, "failed to persist cache index");
            self.dirty.store(true, Ordering::Relaxed);
        }

        debug!(fingerprint = %fingerprint.short(), size_bytes, "artifact stored");
        Ok(AudioArtifact {
            fingerprint: fingerprint.clone(),
            file_path: final_path,
            size_bytes,
            created_at: now,
        })
    }

    /// Remove an artifact and its index entry. Returns whether it existed.
    pub async fn evict(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let removed = self.index.write().entries.remove(fingerprint);
        let Some(entry) = removed else {
            return Ok(false);
        };

        remove_file_if_exists(&self.dir.join(&entry.file_name)).await?;
        self.persist_index().await?;
        info!(fingerprint = %fingerprint.short(), size_bytes = entry.size_bytes, "artifact evicted");
        Ok(true)
    }

    /// Evict least-recently-accessed artifacts until the store fits its
    /// quota. Returns the evicted fingerprints in eviction order.
    pub async fn enforce_quota(&self) -> Result<Vec<Fingerprint>> {
        if self.quota_bytes == 0 {
            return Ok(Vec::new());
        }

        let victims: Vec<Fingerprint> = {
            let index = self.index.read();
            let mut total: u64 = index.entries.values().map(|e| e.size_bytes).sum();
            let mut by_access: Vec<(&Fingerprint, &IndexEntry)> = index.entries.iter().collect();
            by_access.sort_by_key(|(_, e)| e.last_accessed);

            let mut victims = Vec::new();
            for (fp, entry) in by_access {
                if total <= self.quota_bytes {
                    break;
                }
                total = total.saturating_sub(entry.size_bytes);
                victims.push(fp.clone());
            }
            victims
        };

        for fp in &victims {
            self.evict(fp).await?;
        }
        Ok(victims)
    }

    /// Persist buffered index changes (access times).
    pub async fn flush(&self) -> Result<()> {
        if self.dirty.load(Ordering::Relaxed) {
            self.persist_index().await?;
        }
        Ok(())
    }

    fn artifact(&self, fingerprint: &Fingerprint, entry: &IndexEntry) -> AudioArtifact {
        AudioArtifact {
            fingerprint: fingerprint.clone(),
            file_path: self.dir.join(&entry.file_name),
            size_bytes: entry.size_bytes,
            created_at: entry.created_at,
        }
    }

    /// Write the index atomically (temp file + rename).
    async fn persist_index(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;

        self.dirty.store(false, Ordering::Relaxed);
        let content = serde_json::to_vec_pretty(&*self.index.read())
            .map_err(|e| SynthesisError::Io(format!("failed to encode cache index: {e}")))?;

        let path = self.dir.join(INDEX_FILE);
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content)
            .await
            .map_err(|e| SynthesisError::Io(format!("failed to write cache index: {e}")))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| SynthesisError::Io(format!("failed to replace cache index: {e}")))?;
        Ok(())
    }
}

/// A valid audio file found by the directory scan.
struct DiskFile {
    file_name: String,
    size_bytes: u64,
    modified: DateTime<Utc>,
}

async fn load_index(path: &Path) -> Option<CacheIndex> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read cache index, rebuilding");
            return None;
        }
    };

    match serde_json::from_slice::<CacheIndex>(&data) {
        Ok(index) if index.version == INDEX_VERSION => Some(index),
        Ok(index) => {
            warn!(version = index.version, "unsupported cache index version, rebuilding");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "corrupt cache index, rebuilding");
            None
        }
    }
}

/// Collect audio files by fingerprint, deleting leftover temp files.
async fn scan_dir(dir: &Path) -> Result<BTreeMap<Fingerprint, DiskFile>> {
    let mut files = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| SynthesisError::Io(format!("failed to scan cache dir: {e}")))?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();

        if name.ends_with(&format!(".{TEMP_SUFFIX}")) || name == format!("{INDEX_FILE}.tmp") {
            debug!(file = %name, "removing leftover temp file");
            remove_file_if_exists(&entry.path()).await?;
            continue;
        }
        if name == INDEX_FILE {
            continue;
        }

        let Some(fp) = name.split('.').next().and_then(Fingerprint::from_hex) else {
            continue;
        };
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }

        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::now()));
        files.insert(
            fp,
            DiskFile {
                file_name: name,
                size_bytes: metadata.len(),
                modified,
            },
        );
    }

    Ok(files)
}

/// Make the index agree with the files on disk. Returns whether it changed.
fn reconcile(index: &mut CacheIndex, mut on_disk: BTreeMap<Fingerprint, DiskFile>) -> bool {
    let mut changed = false;

    index.entries.retain(|fp, entry| match on_disk.get(fp) {
        Some(file) if file.file_name == entry.file_name => {
            if file.size_bytes != entry.size_bytes {
                entry.size_bytes = file.size_bytes;
                changed = true;
            }
            true
        }
        _ => {
            warn!(fingerprint = %fp.short(), file = %entry.file_name, "dropping index entry for missing file");
            changed = true;
            false
        }
    });

    on_disk.retain(|fp, _| !index.entries.contains_key(fp));
    for (fp, file) in on_disk {
        debug!(fingerprint = %fp.short(), file = %file.file_name, "adopting unindexed artifact");
        index.entries.insert(
            fp,
            IndexEntry {
                file_name: file.file_name,
                size_bytes: file.size_bytes,
                created_at: file.modified,
                last_accessed: file.modified,
            },
        );
        changed = true;
    }

    changed
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SynthesisError::Io(format!(
            "failed to remove {}: {e}",
            path.display()
        ))),
    }
}
