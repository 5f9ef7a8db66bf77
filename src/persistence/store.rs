//! Durable session store.
//!
//! A single JSON document at a stable path, keyed by
//! `external_session_id`. Every update rewrites the whole document
//! atomically: serialise to a temp file in the same directory, fsync,
//! rename over the old file. A process crash therefore leaves either the
//! previous or the next complete document, never a torn one.
//!
//! Concurrent writers are serialised by an in-process mutex; reads happen
//! only at startup, so the document never needs partial locking. Records
//! carry unknown fields through rewrites (see
//! [`PersistedSession::extra`](crate::models::session::PersistedSession)).

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::models::session::PersistedSession;
use crate::{AppError, Result};

/// Atomically persisted mapping of `external_session_id` → session record.
pub struct SessionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SessionStore {
    /// Create a store backed by the document at `path`. The file is created
    /// lazily on the first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all persisted sessions. A missing file is an empty store.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Store`] when the document exists but cannot be
    /// read or parsed.
    pub async fn load_all(&self) -> Result<HashMap<String, PersistedSession>> {
        let path = self.path.clone();
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "session store not found; starting empty");
                return Ok(HashMap::new());
            }
            Err(err) => {
                return Err(AppError::Store(format!(
                    "cannot read {}: {err}",
                    path.display()
                )))
            }
        };

        serde_json::from_slice(&raw)
            .map_err(|err| AppError::Store(format!("cannot parse {}: {err}", path.display())))
    }

    /// Insert or replace one record, bumping its `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Store`] on read or write failure.
    pub async fn upsert(&self, mut record: PersistedSession) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        record.updated_at = Utc::now();

        let mut sessions = self.load_all().await?;
        let key = record.external_session_id.clone();
        sessions.insert(key.clone(), record);
        self.write_atomic(&sessions).await?;

        debug!(external_session_id = key.as_str(), "session persisted");
        Ok(())
    }

    /// Delete one record; removing an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Store`] on read or write failure.
    pub async fn remove(&self, external_session_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut sessions = self.load_all().await?;
        if sessions.remove(external_session_id).is_none() {
            return Ok(());
        }
        self.write_atomic(&sessions).await?;

        info!(external_session_id, "persisted session removed");
        Ok(())
    }

    /// Serialise and atomically replace the document.
    async fn write_atomic(&self, sessions: &HashMap<String, PersistedSession>) -> Result<()> {
        let path = self.path.clone();
        let payload = serde_json::to_vec_pretty(sessions)
            .map_err(|err| AppError::Store(format!("cannot serialise session store: {err}")))?;

        tokio::task::spawn_blocking(move || write_replace(&path, &payload))
            .await
            .map_err(|err| AppError::Store(format!("store writer task failed: {err}")))?
    }
}

/// Blocking write-temp-fsync-rename sequence.
fn write_replace(path: &Path, payload: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|err| AppError::Store(format!("cannot create {}: {err}", parent.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Store(format!("cannot create temp file: {err}")))?;
    tmp.write_all(payload)
        .and_then(|()| tmp.flush())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| AppError::Store(format!("cannot write session store: {err}")))?;

    tmp.persist(path)
        .map_err(|err| AppError::Store(format!("cannot replace {}: {err}", path.display())))?;
    Ok(())
}
