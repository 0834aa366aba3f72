//! Persistence seam for sessions and approval records.
//!
//! The core only needs get/put semantics. [`InMemoryStore`] backs tests and
//! single-process use; [`JsonFileStore`] keeps state in one JSON file so
//! separate processes (e.g. successive CLI invocations) share approvals.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::approval::{ApprovalRecord, ApprovalStatus};
use crate::runtime::Runtime;
use crate::session::ExecutionSession;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("execution store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn get_session(&self, id: &str) -> Result<Option<ExecutionSession>, StoreError>;

    /// Insert or replace.
    async fn put_session(&self, session: ExecutionSession) -> Result<(), StoreError>;

    async fn get_approval(&self, id: &str) -> Result<Option<ApprovalRecord>, StoreError>;

    /// Insert or replace.
    async fn put_approval(&self, record: ApprovalRecord) -> Result<(), StoreError>;

    /// Records for one (session, runtime) pair, oldest first.
    async fn approvals_for(
        &self,
        session_id: &str,
        runtime: Runtime,
    ) -> Result<Vec<ApprovalRecord>, StoreError>;

    /// Every record of a session, oldest first.
    async fn approvals_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ApprovalRecord>, StoreError>;

    async fn pending_approvals(&self) -> Result<Vec<ApprovalRecord>, StoreError>;

    /// Drop a session together with its approval records.
    async fn remove_session(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, ExecutionSession>>,
    approvals: RwLock<HashMap<String, ApprovalRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn collect_approvals(
        &self,
        predicate: impl Fn(&ApprovalRecord) -> bool + Send,
    ) -> Vec<ApprovalRecord> {
        let approvals = self.approvals.read().await;
        sorted_records(approvals.values(), predicate)
    }
}

/// Oldest first, ties broken by id.
fn sorted_records<'a>(
    records: impl Iterator<Item = &'a ApprovalRecord>,
    predicate: impl Fn(&ApprovalRecord) -> bool,
) -> Vec<ApprovalRecord> {
    let mut records: Vec<ApprovalRecord> = records
        .filter(|record| predicate(record))
        .cloned()
        .collect();
    records.sort_by(|a, b| {
        a.requested_at
            .cmp(&b.requested_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    records
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn get_session(&self, id: &str) -> Result<Option<ExecutionSession>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn put_session(&self, session: ExecutionSession) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_approval(&self, id: &str) -> Result<Option<ApprovalRecord>, StoreError> {
        Ok(self.approvals.read().await.get(id).cloned())
    }

    async fn put_approval(&self, record: ApprovalRecord) -> Result<(), StoreError> {
        self.approvals
            .write()
            .await
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn approvals_for(
        &self,
        session_id: &str,
        runtime: Runtime,
    ) -> Result<Vec<ApprovalRecord>, StoreError> {
        Ok(self
            .collect_approvals(|record| {
                record.session_id == session_id && record.runtime == runtime
            })
            .await)
    }

    async fn approvals_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ApprovalRecord>, StoreError> {
        Ok(self
            .collect_approvals(|record| record.session_id == session_id)
            .await)
    }

    async fn pending_approvals(&self) -> Result<Vec<ApprovalRecord>, StoreError> {
        Ok(self
            .collect_approvals(|record| record.status == ApprovalStatus::Pending)
            .await)
    }

    async fn remove_session(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.write().await.remove(id);
        self.approvals
            .write()
            .await
            .retain(|_, record| record.session_id != id);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    sessions: BTreeMap<String, ExecutionSession>,
    #[serde(default)]
    approvals: BTreeMap<String, ApprovalRecord>,
}

/// Whole-file JSON store guarded by an advisory lock on `<path>.lock`.
///
/// Every operation is a locked read (or read-modify-write) of the file,
/// so concurrent processes observe each other's updates. Writes go
/// through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<T, F>(&self, view: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(StoreFile) -> T + Send + 'static,
    {
        let path = self.path.clone();
        run_blocking(move || {
            let _lock = StateLock::acquire(&path, false)?;
            Ok(view(load_state(&path)?))
        })
        .await
    }

    async fn update<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut StoreFile) + Send + 'static,
    {
        let path = self.path.clone();
        run_blocking(move || {
            let _lock = StateLock::acquire(&path, true)?;
            let mut state = load_state(&path)?;
            change(&mut state);
            save_state(&path, &state)
        })
        .await
    }
}

#[async_trait]
impl ExecutionStore for JsonFileStore {
    async fn get_session(&self, id: &str) -> Result<Option<ExecutionSession>, StoreError> {
        let id = id.to_string();
        self.read(move |mut state| state.sessions.remove(&id)).await
    }

    async fn put_session(&self, session: ExecutionSession) -> Result<(), StoreError> {
        self.update(move |state| {
            state.sessions.insert(session.id.clone(), session);
        })
        .await
    }

    async fn get_approval(&self, id: &str) -> Result<Option<ApprovalRecord>, StoreError> {
        let id = id.to_string();
        self.read(move |mut state| state.approvals.remove(&id)).await
    }

    async fn put_approval(&self, record: ApprovalRecord) -> Result<(), StoreError> {
        self.update(move |state| {
            state.approvals.insert(record.id.clone(), record);
        })
        .await
    }

    async fn approvals_for(
        &self,
        session_id: &str,
        runtime: Runtime,
    ) -> Result<Vec<ApprovalRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.read(move |state| {
            sorted_records(state.approvals.values(), |record| {
                record.session_id == session_id && record.runtime == runtime
            })
        })
        .await
    }

    async fn approvals_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ApprovalRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.read(move |state| {
            sorted_records(state.approvals.values(), |record| {
                record.session_id == session_id
            })
        })
        .await
    }

    async fn pending_approvals(&self) -> Result<Vec<ApprovalRecord>, StoreError> {
        self.read(|state| {
            sorted_records(state.approvals.values(), |record| {
                record.status == ApprovalStatus::Pending
            })
        })
        .await
    }

    async fn remove_session(&self, id: &str) -> Result<(), StoreError> {
        let id = id.to_string();
        self.update(move |state| {
            state.sessions.remove(&id);
            state.approvals.retain(|_, record| record.session_id != id);
        })
        .await
    }
}

async fn run_blocking<T, F>(task: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| StoreError::new(format!("store task failed: {err}")))?
}

/// Released when dropped.
struct StateLock(File);

impl StateLock {
    fn acquire(path: &Path, exclusive: bool) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| io_error(parent, &err))?;
        }
        let lock_path = path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|err| io_error(&lock_path, &err))?;
        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|err| io_error(&lock_path, &err))?;
        Ok(Self(file))
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _unlocked: io::Result<()> = FileExt::unlock(&self.0);
    }
}

fn load_state(path: &Path) -> Result<StoreFile, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(StoreFile::default()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
            StoreError::new(format!("corrupt state file {}: {err}", path.display()))
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(StoreFile::default()),
        Err(err) => Err(io_error(path, &err)),
    }
}

fn save_state(path: &Path, state: &StoreFile) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(state)
        .map_err(|err| StoreError::new(format!("failed to encode state: {err}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(|err| io_error(&tmp, &err))?;
    std::fs::rename(&tmp, path).map_err(|err| io_error(path, &err))
}

fn io_error(path: &Path, err: &io::Error) -> StoreError {
    StoreError::new(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_round_trip_replaces_existing() {
        let store = InMemoryStore::new();
        let mut session = ExecutionSession::new("s1", Runtime::Shell, PathBuf::from("/tmp/s1"));
        store.put_session(session.clone()).await.unwrap();

        session.touch();
        store.put_session(session.clone()).await.unwrap();
        assert_eq!(store.get_session("s1").await.unwrap(), Some(session));
        assert_eq!(store.get_session("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn approvals_filter_by_pair_and_status() {
        let store = InMemoryStore::new();
        let shell = ApprovalRecord::pending("s1", Runtime::Shell, "r1");
        let python = ApprovalRecord::pending("s1", Runtime::Python, "r2");
        let mut other = ApprovalRecord::pending("s2", Runtime::Shell, "r3");
        other.status = ApprovalStatus::Approved;

        for record in [shell.clone(), python.clone(), other.clone()] {
            store.put_approval(record).await.unwrap();
        }

        let pair = store.approvals_for("s1", Runtime::Shell).await.unwrap();
        assert_eq!(pair, vec![shell]);
        assert_eq!(store.approvals_for_session("s1").await.unwrap().len(), 2);

        let pending = store.pending_approvals().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|record| record.session_id == "s1"));
    }

    #[tokio::test]
    async fn removing_a_session_drops_its_approvals() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        for id in ["s1", "s2"] {
            let session = ExecutionSession::new(id, Runtime::Shell, dir.path().join(id));
            store.put_session(session).await.unwrap();
            store
                .put_approval(ApprovalRecord::pending(id, Runtime::Shell, "r1"))
                .await
                .unwrap();
        }

        store.remove_session("s1").await.unwrap();
        assert_eq!(store.get_session("s1").await.unwrap(), None);
        assert!(store.approvals_for_session("s1").await.unwrap().is_empty());
        assert!(store.get_session("s2").await.unwrap().is_some());
        assert_eq!(store.pending_approvals().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("execward-state.json");

        let store = JsonFileStore::new(&path);
        let session = ExecutionSession::new("s1", Runtime::Shell, dir.path().join("s1"));
        store.put_session(session.clone()).await.unwrap();
        let pending = ApprovalRecord::pending("s1", Runtime::Shell, "r1");
        store.put_approval(pending.clone()).await.unwrap();

        let reopened = JsonFileStore::new(&path);
        assert_eq!(reopened.get_session("s1").await.unwrap(), Some(session));
        assert_eq!(reopened.pending_approvals().await.unwrap(), vec![pending.clone()]);

        let mut approved = pending;
        approved.status = ApprovalStatus::Approved;
        reopened.put_approval(approved.clone()).await.unwrap();
        assert!(store.pending_approvals().await.unwrap().is_empty());
        assert_eq!(
            store.approvals_for("s1", Runtime::Shell).await.unwrap(),
            vec![approved]
        );
    }

    #[tokio::test]
    async fn missing_or_empty_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStore::new(&path);
        assert_eq!(store.get_session("nope").await.unwrap(), None);

        std::fs::write(&path, b"").unwrap();
        assert!(store.pending_approvals().await.unwrap().is_empty());

        std::fs::write(&path, b"{not json").unwrap();
        assert!(store.get_approval("x").await.is_err());
    }
}
