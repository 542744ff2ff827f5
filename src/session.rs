use crate::{error::AppError, format::RequestedKind};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use teloxide::types::UserId;
use tokio::sync::Mutex;
use tracing::warn;

/// Lifecycle of one request. Terminal states are entered exactly once; the
/// active slot is freed on that transition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    Pending,
    Probing,
    Downloading { tier: usize },
    SizeCheck { tier: usize },
    Done,
    Failed { reason: String },
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Failed { .. } | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Pending => f.write_str("queued"),
            TaskState::Probing => f.write_str("probing"),
            TaskState::Downloading { .. } => f.write_str("downloading"),
            TaskState::SizeCheck { .. } => f.write_str("checking size"),
            TaskState::Done => f.write_str("done"),
            TaskState::Failed { reason } => write!(f, "failed: {reason}"),
            TaskState::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ActiveTask {
    pub user: UserId,
    pub url: String,
    pub kind: RequestedKind,
    pub title: Option<String>,
    pub state: TaskState,
    pub tier: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Shared handle to an in-flight task. The cancel flag lives outside the
/// mutex so command handlers can set it without contending with the
/// orchestrator's state updates.
pub struct TaskHandle {
    pub cancel: Arc<AtomicBool>,
    pub inner: Mutex<ActiveTask>,
}

impl TaskHandle {
    pub async fn set_state(&self, state: TaskState) {
        let mut task = self.inner.lock().await;
        if let TaskState::Downloading { tier } = state {
            // A fresh stage restarts at the top rung; within a stage tiers
            // only ever degrade.
            debug_assert!(tier == 0 || tier >= task.tier);
            task.tier = tier;
        }
        task.state = state;
        task.updated_at = Utc::now();
    }

    pub async fn set_title(&self, title: Option<String>) {
        let mut task = self.inner.lock().await;
        if title.is_some() {
            task.title = title;
        }
        task.updated_at = Utc::now();
    }
}

/// Terminal artifact metadata, persisted per user and bounded to the most
/// recent entries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub url: String,
    pub title: String,
    pub kind: RequestedKind,
    pub files: Vec<PathBuf>,
    pub bytes: u64,
    pub completed_at: DateTime<Utc>,
}

/// Process-wide map of user → at most one non-terminal task, plus the
/// persisted download history. Active state is in-memory only; a restart
/// implicitly cancels whatever was running.
#[derive(Clone)]
pub struct SessionRegistry {
    active: Arc<DashMap<UserId, Arc<TaskHandle>>>,
    history: HistoryStore,
}

impl SessionRegistry {
    pub fn new(history: HistoryStore) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            history,
        }
    }

    /// Registers a new task. A second request while one is active is
    /// rejected, never queued.
    pub fn start(
        &self,
        user: UserId,
        url: String,
        kind: RequestedKind,
        title: Option<String>,
    ) -> Result<Arc<TaskHandle>, AppError> {
        match self.active.entry(user) {
            Entry::Occupied(_) => Err(AppError::AlreadyActive),
            Entry::Vacant(slot) => {
                let now = Utc::now();
                let handle = Arc::new(TaskHandle {
                    cancel: Arc::new(AtomicBool::new(false)),
                    inner: Mutex::new(ActiveTask {
                        user,
                        url,
                        kind,
                        title,
                        state: TaskState::Pending,
                        tier: 0,
                        created_at: now,
                        updated_at: now,
                    }),
                });
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Flags the user's active task for cancellation. Returns whether one
    /// was found; the orchestrator observes the flag at its next progress
    /// callback.
    pub fn cancel(&self, user: UserId) -> bool {
        match self.active.get(&user) {
            Some(handle) => {
                handle.cancel.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub async fn status(&self, user: UserId) -> Option<ActiveTask> {
        let handle = self.active.get(&user).map(|entry| entry.clone())?;
        let task = handle.inner.lock().await;
        Some(task.clone())
    }

    pub async fn history(&self, user: UserId) -> Vec<DownloadRecord> {
        self.history.list(user).await
    }

    /// Deletes the user's records and their backing files; other users'
    /// history is untouched. Returns the number of records removed.
    pub async fn clear(&self, user: UserId) -> usize {
        let records = self.history.take(user).await;
        for record in &records {
            for path in &record.files {
                if let Err(err) = tokio::fs::remove_file(path).await {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(event = "clear_remove_failed", path = %path.display(), error = %err);
                    }
                }
            }
        }
        records.len()
    }

    /// Done transition: persists the record and frees the active slot.
    pub async fn complete(&self, handle: &Arc<TaskHandle>, record: DownloadRecord) {
        handle.set_state(TaskState::Done).await;
        let user = handle.inner.lock().await.user;
        self.history.push(user, record).await;
        self.release(user, handle);
    }

    /// Failed/Cancelled transition: frees the active slot, no record.
    pub async fn finish(&self, handle: &Arc<TaskHandle>, state: TaskState) {
        debug_assert!(state.is_terminal());
        handle.set_state(state).await;
        let user = handle.inner.lock().await.user;
        self.release(user, handle);
    }

    /// Backstop that frees the active slot even if the orchestration task
    /// dies without reaching a terminal transition.
    pub fn guard(&self, user: UserId, handle: Arc<TaskHandle>) -> TaskGuard {
        TaskGuard {
            registry: self.clone(),
            user,
            handle,
        }
    }

    fn release(&self, user: UserId, handle: &Arc<TaskHandle>) {
        self.active
            .remove_if(&user, |_, current| Arc::ptr_eq(current, handle));
    }
}

pub struct TaskGuard {
    registry: SessionRegistry,
    user: UserId,
    handle: Arc<TaskHandle>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.registry.release(self.user, &self.handle);
    }
}

/// Per-user download history written through a single JSON document. The
/// mutex gives single-writer discipline; writes go to a temp file first so
/// a crash never leaves a torn store.
#[derive(Clone)]
pub struct HistoryStore {
    path: PathBuf,
    limit: usize,
    inner: Arc<Mutex<HashMap<String, Vec<DownloadRecord>>>>,
}

impl HistoryStore {
    pub async fn load(path: PathBuf, limit: usize) -> Self {
        let map = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    warn!(event = "history_corrupt", path = %path.display(), error = %err);
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                warn!(event = "history_unreadable", path = %path.display(), error = %err);
                HashMap::new()
            }
        };
        Self {
            path,
            limit,
            inner: Arc::new(Mutex::new(map)),
        }
    }

    pub async fn push(&self, user: UserId, record: DownloadRecord) {
        let mut map = self.inner.lock().await;
        let records = map.entry(user.to_string()).or_default();
        records.insert(0, record);
        records.truncate(self.limit);
        self.persist(&map).await;
    }

    pub async fn list(&self, user: UserId) -> Vec<DownloadRecord> {
        let map = self.inner.lock().await;
        map.get(&user.to_string()).cloned().unwrap_or_default()
    }

    pub async fn take(&self, user: UserId) -> Vec<DownloadRecord> {
        let mut map = self.inner.lock().await;
        let records = map.remove(&user.to_string()).unwrap_or_default();
        if !records.is_empty() {
            self.persist(&map).await;
        }
        records
    }

    async fn persist(&self, map: &HashMap<String, Vec<DownloadRecord>>) {
        let result: Result<(), AppError> = async {
            let data = serde_json::to_vec_pretty(map).map_err(AppError::Json)?;
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(AppError::Io)?;
            }
            let tmp = self.path.with_extension("tmp");
            tokio::fs::write(&tmp, data).await.map_err(AppError::Io)?;
            tokio::fs::rename(&tmp, &self.path).await.map_err(AppError::Io)?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            warn!(event = "history_write_failed", path = %self.path.display(), error = %err);
        }
    }
}
