//! Durable run state, keyed by session/thread id.
//!
//! When a store is configured the runtime writes a [`Checkpoint`] after each
//! step. A later run with the same session id restores the checkpointed
//! slots before seeding its new input, provided the checkpoint belongs to
//! the same workflow.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use stepflow_types::{Checkpoint, Result};
use tokio::sync::RwLock;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The last checkpoint written for `thread_id`, if any.
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// Replace the checkpoint for `thread_id`.
    async fn put(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<()>;
}

/// In-process store; checkpoints live as long as the store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.entries.read().await.get(thread_id).cloned())
    }

    async fn put(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(thread_id.to_string(), checkpoint);
        Ok(())
    }
}

/// One pretty-printed JSON file per thread id under `root`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the checkpoint file for `thread_id`. Characters outside
    /// `[A-Za-z0-9_-]` are replaced with `_`.
    pub fn path_for(&self, thread_id: &str) -> PathBuf {
        let file: String = thread_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{file}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(thread_id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(&path).await?;
        let checkpoint: Checkpoint = serde_json::from_str(&json)?;
        Ok(Some(checkpoint))
    }

    async fn put(&self, thread_id: &str, checkpoint: Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(thread_id);
        let json = serde_json::to_string_pretty(&checkpoint)?;
        tokio::fs::write(&path, json).await?;
        tracing::debug!(path = %path.display(), "Checkpoint saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
