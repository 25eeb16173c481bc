use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

use crate::types::{
    DatasetRecord, EndpointRecord, ModelRecord, PlatformState, Session, Stage, TrainingJobRecord,
};
use crate::{StateError, StateResult};

/// Whole-document JSON store for [`PlatformState`].
///
/// Every mutation goes through the in-memory copy and is followed by a full
/// [`save`](SessionStore::save). Saves write a sibling temp file and rename it
/// over the target so a crash mid-write leaves the previous document intact.
///
/// Callers that read a session, await something, and write it back must hold
/// [`lock_session`](SessionStore::lock_session) for the whole sequence.
pub struct SessionStore {
    path: PathBuf,
    state: RwLock<PlatformState>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    save_lock: Mutex<()>,
}

impl SessionStore {
    /// Load the document at `path`. A missing or empty file yields an empty state.
    pub async fn load(path: impl Into<PathBuf>) -> StateResult<Self> {
        let path = path.into();
        let state = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => PlatformState::default(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No state file at {}, starting empty", path.display());
                PlatformState::default()
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            "Loaded platform state: {} sessions, {} datasets, {} models, {} endpoints",
            state.sessions.len(),
            state.datasets.len(),
            state.models.len(),
            state.endpoints.len()
        );

        Ok(Self {
            path,
            state: RwLock::new(state),
            session_locks: Mutex::new(HashMap::new()),
            save_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize the entire platform state and atomically replace the file on disk.
    ///
    /// The save lock is taken before the state is read, so saves hit the disk in
    /// the order their snapshots were taken.
    pub async fn save(&self) -> StateResult<()> {
        let _guard = self.save_lock.lock().await;

        let bytes = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&*state)?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = self.tmp_path();
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp_path, &self.path).await?;

        tracing::debug!("Saved platform state ({} bytes) to {}", bytes.len(), self.path.display());
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Per-session critical section. Held across read → await → write sequences.
    ///
    /// Locks nobody holds or waits on are dropped from the table on the way in.
    pub async fn lock_session(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.session_locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// The stored session, or a fresh default record if none exists yet.
    pub async fn get(&self, id: &str) -> Session {
        let state = self.state.read().await;
        state
            .sessions
            .get(id)
            .cloned()
            .unwrap_or_else(|| Session::new(id))
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.state.read().await.sessions.contains_key(id)
    }

    /// Write `session` back into the platform state and persist.
    pub async fn put(&self, session: Session) -> StateResult<()> {
        {
            let mut state = self.state.write().await;
            state.sessions.insert(session.id.clone(), session);
        }
        self.save().await
    }

    /// Mutate a session in place (creating it if needed) and persist.
    pub async fn update<F, R>(&self, id: &str, f: F) -> StateResult<R>
    where
        F: FnOnce(&mut Session) -> R,
    {
        let result = {
            let mut state = self.state.write().await;
            let session = state
                .sessions
                .entry(id.to_string())
                .or_insert_with(|| Session::new(id));
            f(session)
        };
        self.save().await?;
        Ok(result)
    }

    /// Reset a session to a fresh initial-state record.
    pub async fn clear(&self, id: &str) -> StateResult<Session> {
        let fresh = Session::new(id);
        self.put(fresh.clone()).await?;
        tracing::info!("Cleared session {}", id);
        Ok(fresh)
    }

    pub async fn sessions_in_stage(&self, stage: Stage) -> Vec<Session> {
        let state = self.state.read().await;
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.stage == stage)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub async fn snapshot(&self) -> PlatformState {
        self.state.read().await.clone()
    }

    // Datasets

    pub async fn insert_dataset(&self, record: DatasetRecord) -> StateResult<()> {
        self.state.write().await.datasets.push(record);
        self.save().await
    }

    pub async fn find_dataset(&self, id: &str) -> Option<DatasetRecord> {
        let state = self.state.read().await;
        state.datasets.iter().find(|d| d.id == id).cloned()
    }

    /// Find by id, falling back to the most recent upload when the reference dangles.
    pub async fn find_dataset_or_latest(&self, id: Option<&str>) -> Option<DatasetRecord> {
        let state = self.state.read().await;
        id.and_then(|id| state.datasets.iter().find(|d| d.id == id))
            .or_else(|| state.datasets.last())
            .cloned()
    }

    // Training jobs

    pub async fn insert_training_job(&self, record: TrainingJobRecord) -> StateResult<()> {
        self.state.write().await.training_jobs.push(record);
        self.save().await
    }

    pub async fn find_training_job(&self, job_name: &str) -> Option<TrainingJobRecord> {
        let state = self.state.read().await;
        state
            .training_jobs
            .iter()
            .find(|j| j.job_name == job_name)
            .cloned()
    }

    // Models

    /// Insert unless a model for the same job handle is already mirrored.
    /// Returns whether the record was inserted.
    pub async fn insert_model_if_absent(&self, record: ModelRecord) -> StateResult<bool> {
        {
            let mut state = self.state.write().await;
            if state
                .models
                .iter()
                .any(|m| m.training_job_name == record.training_job_name)
            {
                return Ok(false);
            }
            state.models.push(record);
        }
        self.save().await?;
        Ok(true)
    }

    pub async fn find_model(&self, id: &str) -> Option<ModelRecord> {
        let state = self.state.read().await;
        state.models.iter().find(|m| m.id == id).cloned()
    }

    pub async fn find_model_by_job(&self, job_name: &str) -> Option<ModelRecord> {
        let state = self.state.read().await;
        state
            .models
            .iter()
            .find(|m| m.training_job_name == job_name)
            .cloned()
    }

    pub async fn find_model_or_latest(&self, id: Option<&str>) -> Option<ModelRecord> {
        let state = self.state.read().await;
        id.and_then(|id| state.models.iter().find(|m| m.id == id))
            .or_else(|| state.models.last())
            .cloned()
    }

    pub async fn has_model_for_job(&self, job_name: &str) -> bool {
        let state = self.state.read().await;
        state.models.iter().any(|m| m.training_job_name == job_name)
    }

    // Endpoints

    pub async fn insert_endpoint(&self, record: EndpointRecord) -> StateResult<()> {
        self.state.write().await.endpoints.push(record);
        self.save().await
    }

    pub async fn find_endpoint(&self, id: &str) -> Option<EndpointRecord> {
        let state = self.state.read().await;
        state.endpoints.iter().find(|e| e.id == id).cloned()
    }

    pub async fn find_endpoint_for_model(&self, model_id: &str) -> Option<EndpointRecord> {
        let state = self.state.read().await;
        state
            .endpoints
            .iter()
            .rev()
            .find(|e| e.model_id == model_id)
            .cloned()
    }

    pub async fn require_session(&self, id: &str) -> StateResult<Session> {
        let state = self.state.read().await;
        state
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("session {}", id)))
    }
}

/// Unconditionally save on a fixed cadence as a safety net against missed explicit saves.
pub fn spawn_autosave(store: Arc<SessionStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = store.save().await {
                tracing::error!("Periodic state save failed: {}", e);
            }
        }
    })
}
