//! # Assigner Checkpoints
//!
//! Durable storage for [`AssignerState`], so a restarted job resumes with
//! its split pool, finished-chunk ledger and streaming position intact.
//!
//! | Backend | Persistence | Use |
//! |---------|-------------|-----|
//! | [`FileCheckpointStore`] | JSON file per key, atomic rename | production |
//! | [`MemoryCheckpointStore`] | process memory | tests, embedding |
//!
//! ## Usage
//!
//! ```ignore
//! use tessera_cdc::common::{CheckpointBackend, FileCheckpointStore};
//!
//! let store = FileCheckpointStore::new("/var/lib/tessera/checkpoints").await?;
//! store.save("orders-job", &assigner.checkpoint().await).await?;
//!
//! // After a restart
//! if let Some(state) = store.load("orders-job").await? {
//!     let assigner = SplitAssigner::restore(source, tables, &config, state, stats);
//! }
//! ```

use crate::common::{AssignerState, CdcError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Storage backend for assigner checkpoints.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn save(&self, key: &str, state: &AssignerState) -> Result<()>;
    async fn load(&self, key: &str) -> Result<Option<AssignerState>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;
}

/// Shared checkpoint backend.
pub type SharedCheckpointBackend = Arc<dyn CheckpointBackend>;

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('/') || key.contains('\\') {
        return Err(CdcError::config(format!("Invalid checkpoint key: {key:?}")));
    }
    Ok(())
}

/// Checkpoints stored as one JSON file per key.
///
/// Writes go to a temporary file that is synced and then renamed over the
/// previous checkpoint, so a crash leaves either the old or the new state.
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, AssignerState>>,
    fsync: bool,
}

impl FileCheckpointStore {
    /// Open (or create) a checkpoint directory and load what it holds.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Same as [`new`](Self::new), with control over fsync.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;

        let store = Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        };
        store.load_all().await?;
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    async fn write_atomic(&self, key: &str, state: &AssignerState) -> Result<()> {
        let file_path = self.file_path(key);
        let temp_path = file_path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(state)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&json).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &file_path).await?;
        Ok(())
    }

    async fn read_file(&self, key: &str) -> Result<Option<AssignerState>> {
        let contents = match fs::read(self.file_path(key)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&contents)?))
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await?;
        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read_file(key).await {
                Ok(Some(state)) => {
                    self.cache.write().await.insert(key.to_string(), state);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "Skipping unreadable checkpoint"),
            }
        }
        if loaded > 0 {
            info!(loaded, dir = %self.base_dir.display(), "Loaded checkpoints");
        }
        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.json"))
    }
}

#[async_trait]
impl CheckpointBackend for FileCheckpointStore {
    async fn save(&self, key: &str, state: &AssignerState) -> Result<()> {
        validate_key(key)?;
        self.write_atomic(key, state).await?;
        self.cache
            .write()
            .await
            .insert(key.to_string(), state.clone());
        debug!(
            key,
            phase = %state.phase,
            pending = state.pending_splits.len(),
            finished = state.ledger.len(),
            "Saved checkpoint"
        );
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<AssignerState>> {
        validate_key(key)?;
        if let Some(state) = self.cache.read().await.get(key) {
            return Ok(Some(state.clone()));
        }
        let state = self.read_file(key).await?;
        if let Some(state) = &state {
            self.cache
                .write()
                .await
                .insert(key.to_string(), state.clone());
        }
        Ok(state)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        match fs::remove_file(self.file_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cache.write().await.remove(key);
        info!(key, "Deleted checkpoint");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.cache.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// In-memory checkpoints.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, AssignerState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointBackend for MemoryCheckpointStore {
    async fn save(&self, key: &str, state: &AssignerState) -> Result<()> {
        validate_key(key)?;
        self.checkpoints
            .write()
            .await
            .insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<AssignerState>> {
        Ok(self.checkpoints.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.checkpoints.write().await.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.checkpoints.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
