//! Local filesystem storage implementation.
//!
//! Records live in `state.json`, rewritten atomically on every mutation.
//! Audit entries are appended to `audit.jsonl`, one per line; `state.json`
//! names how many of its bytes are committed, so lines written by a
//! mutation that never reached `state.json` are cut off by the next writer.
//! Snapshot content is archived as immutable `.raw` and `.txt` files and
//! written before the state that references it.
//!
//! Several processes may open the same root. A mutation holds an exclusive
//! lock on `store.lock` and starts from the latest `state.json`. Readers
//! serve the last published view and reload it when `state.json` changes.

use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    ArchivedContent, AuditEntry, AuditEvent, ContentSnapshot, JobExecution, NotificationRecord,
    RecordFilter, RegulatorySource, SourceDefinition,
};

use super::state::filter_audit;
use super::{ChangeCommit, ChangeView, SourceHealth, Store, StoreState};

const STATE_FILE: &str = "state.json";
const AUDIT_FILE: &str = "audit.jsonl";
const LOCK_FILE: &str = "store.lock";

#[derive(Serialize)]
struct StateFileRef<'a> {
    audit_bytes: u64,
    records: &'a StoreState,
}

#[derive(Deserialize)]
struct StateFile {
    audit_bytes: u64,
    records: StoreState,
}

/// Identity of `state.json` as last loaded or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    id: u64,
    modified: SystemTime,
    len: u64,
}

#[cfg(unix)]
fn file_id(meta: &Metadata) -> u64 {
    std::os::unix::fs::MetadataExt::ino(meta)
}

#[cfg(not(unix))]
fn file_id(_meta: &Metadata) -> u64 {
    0
}

/// What readers are served.
struct View {
    records: Arc<StoreState>,
    audit: Vec<AuditEntry>,
    stamp: Option<FileStamp>,
}

/// Writer bookkeeping.
struct Journal {
    /// Committed length of the audit file
    audit_bytes: u64,
}

/// Exclusive hold on the store root, released on drop.
struct RootLock(std::fs::File);

impl Drop for RootLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.0) {
            log::warn!("Failed to release store lock: {}", e);
        }
    }
}

/// Local filesystem storage backend.
pub struct LocalStore {
    root_dir: PathBuf,
    lock_file: std::fs::File,
    journal: Mutex<Journal>,
    view: RwLock<View>,
}

impl LocalStore {
    /// Open the store rooted at `root_dir`, loading existing state.
    pub async fn open(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        tokio::fs::create_dir_all(&root_dir).await?;

        let lock_file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root_dir.join(LOCK_FILE))
            .await?
            .into_std()
            .await;

        let store = Self {
            root_dir,
            lock_file,
            journal: Mutex::new(Journal { audit_bytes: 0 }),
            view: RwLock::new(View {
                records: Arc::default(),
                audit: Vec::new(),
                stamp: None,
            }),
        };
        {
            let mut journal = store.journal.lock().await;
            store.reload(&mut journal).await?;
        }

        let view = store.read_view();
        if view.stamp.is_some() {
            log::info!(
                "Loaded store state from {:?} ({} audit entries)",
                store.root_dir,
                view.audit.len()
            );
        } else {
            log::info!("Starting empty store at {:?}", store.root_dir);
        }
        drop(view);
        Ok(store)
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Read bytes, returning None if file doesn't exist.
    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Read JSON data.
    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn raw_key(content_ref: &str) -> String {
        format!("{content_ref}.raw")
    }

    fn text_key(content_ref: &str) -> String {
        format!("{content_ref}.txt")
    }

    fn read_view(&self) -> RwLockReadGuard<'_, View> {
        self.view.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_view(&self) -> RwLockWriteGuard<'_, View> {
        self.view.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn stamp(&self) -> Result<Option<FileStamp>> {
        match tokio::fs::metadata(self.path(STATE_FILE)).await {
            Ok(meta) => Ok(Some(FileStamp {
                id: file_id(&meta),
                modified: meta.modified()?,
                len: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Wait for the exclusive lock on the store root.
    async fn lock_root(&self) -> Result<RootLock> {
        let file = self.lock_file.try_clone()?;
        let lock = tokio::task::spawn_blocking(move || {
            FileExt::lock_exclusive(&file).map(|()| RootLock(file))
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(lock)
    }

    /// Parse the committed audit lines in `[from, to)`.
    async fn read_audit(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>> {
        if to <= from {
            return Ok(Vec::new());
        }
        let mut file = tokio::fs::File::open(self.path(AUDIT_FILE)).await?;
        file.seek(SeekFrom::Start(from)).await?;
        let mut bytes = vec![0; (to - from) as usize];
        file.read_exact(&mut bytes).await?;

        bytes
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).map_err(AppError::from))
            .collect()
    }

    /// Append entries after the committed length, returning the new length.
    ///
    /// Anything past `committed` is left over from a mutation that never
    /// reached `state.json` and is overwritten.
    async fn append_audit_lines(&self, committed: u64, entries: &[AuditEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(committed);
        }
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path(AUDIT_FILE))
            .await?;
        file.set_len(committed).await?;
        file.seek(SeekFrom::Start(committed)).await?;
        file.write_all(&buf).await?;
        file.sync_data().await?;
        Ok(committed + buf.len() as u64)
    }

    /// Bring the view up to date when `state.json` changed since last seen.
    async fn reload(&self, journal: &mut Journal) -> Result<()> {
        let stamp = self.stamp().await?;
        let seen = self.read_view().stamp;
        if stamp == seen {
            return Ok(());
        }

        let Some(file) = self.read_json::<StateFile>(STATE_FILE).await? else {
            self.write_view().stamp = stamp;
            return Ok(());
        };
        let resume = file.audit_bytes >= journal.audit_bytes;
        let from = if resume { journal.audit_bytes } else { 0 };
        let fresh = self.read_audit(from, file.audit_bytes).await?;
        if !fresh.is_empty() || !resume {
            log::debug!(
                "Reloaded store state from {:?} ({} new audit entries)",
                self.root_dir,
                fresh.len()
            );
        }

        journal.audit_bytes = file.audit_bytes;
        let mut view = self.write_view();
        view.records = Arc::new(file.records);
        if resume {
            view.audit.extend(fresh);
        } else {
            view.audit = fresh;
        }
        view.stamp = stamp;
        Ok(())
    }

    /// Reload if another handle wrote since the view was published.
    async fn sync(&self) -> Result<()> {
        let stamp = self.stamp().await?;
        let seen = self.read_view().stamp;
        if stamp == seen {
            return Ok(());
        }
        let mut journal = self.journal.lock().await;
        self.reload(&mut journal).await
    }

    async fn records(&self) -> Result<Arc<StoreState>> {
        self.sync().await?;
        Ok(Arc::clone(&self.read_view().records))
    }

    /// Apply `op` to a copy of the latest records, persist, then publish.
    ///
    /// Readers keep the previous view until `state.json` is on disk.
    async fn mutate<T>(&self, op: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        self.transact(op, None).await
    }

    async fn transact<T>(
        &self,
        op: impl FnOnce(&mut StoreState) -> Result<T>,
        content: Option<&ArchivedContentRef<'_>>,
    ) -> Result<T> {
        let mut journal = self.journal.lock().await;
        let _root = self.lock_root().await?;
        self.reload(&mut journal).await?;

        let current = Arc::clone(&self.read_view().records);
        let mut next = StoreState::clone(&current);
        let value = op(&mut next)?;
        let fresh = next.take_audit();

        if let Some(content) = content {
            // Content first: a crash in between leaves an unreferenced file
            // rather than a snapshot without content.
            self.write_bytes(&Self::raw_key(content.content_ref), content.raw)
                .await?;
            self.write_bytes(&Self::text_key(content.content_ref), content.text.as_bytes())
                .await?;
        }

        let audit_bytes = self.append_audit_lines(journal.audit_bytes, &fresh).await?;
        let bytes = serde_json::to_vec(&StateFileRef {
            audit_bytes,
            records: &next,
        })?;
        self.write_bytes(STATE_FILE, &bytes).await?;
        let stamp = self.stamp().await?;

        journal.audit_bytes = audit_bytes;
        let mut view = self.write_view();
        view.records = Arc::new(next);
        view.audit.extend(fresh);
        view.stamp = stamp;
        Ok(value)
    }
}

struct ArchivedContentRef<'a> {
    content_ref: &'a str,
    raw: &'a [u8],
    text: &'a str,
}

#[async_trait]
impl Store for LocalStore {
    async fn register_source(&self, def: &SourceDefinition) -> Result<RegulatorySource> {
        self.mutate(|state| Ok(state.register_source(def))).await
    }

    async fn get_source(&self, id: &str) -> Result<Option<RegulatorySource>> {
        Ok(self.records().await?.source(id))
    }

    async fn list_sources(&self) -> Result<Vec<RegulatorySource>> {
        Ok(self.records().await?.sources())
    }

    async fn update_source_health(
        &self,
        id: &str,
        health: SourceHealth,
    ) -> Result<RegulatorySource> {
        self.mutate(|state| state.update_source_health(id, health))
            .await
    }

    async fn latest_snapshot(&self, source_id: &str) -> Result<Option<ContentSnapshot>> {
        Ok(self.records().await?.latest_snapshot(source_id))
    }

    async fn snapshots(&self, source_id: &str) -> Result<Vec<ContentSnapshot>> {
        Ok(self.records().await?.snapshots(source_id))
    }

    async fn load_content(&self, content_ref: &str) -> Result<Option<ArchivedContent>> {
        let raw = self.read_bytes(&Self::raw_key(content_ref)).await?;
        let text = self.read_bytes(&Self::text_key(content_ref)).await?;
        match (raw, text) {
            (Some(raw), Some(text)) => Ok(Some(ArchivedContent {
                raw,
                text: String::from_utf8_lossy(&text).into_owned(),
            })),
            _ => Ok(None),
        }
    }

    async fn commit_change(&self, commit: ChangeCommit) -> Result<()> {
        let content = ArchivedContentRef {
            content_ref: &commit.snapshot.content_ref,
            raw: &commit.content.raw,
            text: &commit.content.text,
        };
        self.transact(|state| state.commit_change(&commit), Some(&content))
            .await?;
        log::info!(
            "Committed snapshot {} of '{}' ({})",
            commit.snapshot.sequence,
            commit.snapshot.source_id,
            commit.change.change_type.as_str()
        );
        Ok(())
    }

    async fn get_change(&self, id: Uuid) -> Result<Option<ChangeView>> {
        Ok(self.records().await?.change(id))
    }

    async fn changes(&self, filter: &RecordFilter) -> Result<Vec<ChangeView>> {
        Ok(self.records().await?.changes(filter))
    }

    async fn open_job(&self, job: &JobExecution) -> Result<()> {
        self.mutate(|state| state.open_job(job)).await
    }

    async fn mark_job_retrying(&self, job_id: Uuid, attempt: u32, error: &str) -> Result<()> {
        self.mutate(|state| state.mark_job_retrying(job_id, attempt, error))
            .await
    }

    async fn finish_job(&self, job: &JobExecution) -> Result<()> {
        self.mutate(|state| state.finish_job(job)).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<JobExecution>> {
        Ok(self.records().await?.job(id))
    }

    async fn jobs(&self, filter: &RecordFilter) -> Result<Vec<JobExecution>> {
        Ok(self.records().await?.jobs(filter))
    }

    async fn create_notification(&self, record: &NotificationRecord) -> Result<bool> {
        self.mutate(|state| state.create_notification(record)).await
    }

    async fn update_notification(&self, record: &NotificationRecord) -> Result<()> {
        self.mutate(|state| state.update_notification(record)).await
    }

    async fn notifications(&self, filter: &RecordFilter) -> Result<Vec<NotificationRecord>> {
        Ok(self.records().await?.notifications(filter))
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<AuditEntry> {
        self.mutate(|state| Ok(state.append_audit(event))).await
    }

    async fn audit_entries(&self, filter: &RecordFilter) -> Result<Vec<AuditEntry>> {
        self.sync().await?;
        Ok(filter_audit(&self.read_view().audit, filter))
    }
}
