//! Log and snapshot storage collaborators.
//!
//! The consensus core only needs append/read/truncate over the log,
//! save/load/list over snapshots and a durable term and vote.
//! `MemoryLogStore`, `LocalSnapshotStore` and `FileMetaStore` are the
//! bundled implementations.
//!
//! # Snapshot layout
//!
//! ```text
//! <root>/
//!   snapshot_00000000000000000042/
//!     __raft_snapshot_meta     bincode SnapshotMetaTable
//!     <state machine files>
//!   temp/                      being written, renamed into place when complete
//! ```
//!
//! Only the newest snapshot is kept.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::file_service::{check_file_name, FileReader, LocalDirReader};
use crate::types::{LogIndex, PeerAddress, SharedEntry, SnapshotMeta, Term};

/// Name of the metadata file stored in every snapshot directory.
pub const SNAPSHOT_META_FILE: &str = "__raft_snapshot_meta";

const SNAPSHOT_DIR_PREFIX: &str = "snapshot_";
const TEMP_DIR: &str = "temp";

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append entries whose indexes continue the log exactly.
    async fn append(&self, entries: &[SharedEntry]) -> Result<()>;

    async fn entry(&self, index: LogIndex) -> Result<Option<SharedEntry>>;

    /// Drop every entry after `last_kept`.
    async fn truncate_suffix(&self, last_kept: LogIndex) -> Result<()>;

    /// Drop every entry before `first_kept`.
    async fn truncate_prefix(&self, first_kept: LogIndex) -> Result<()>;

    /// Drop everything; the next appended entry will be `next_index`.
    async fn reset(&self, next_index: LogIndex) -> Result<()>;

    fn first_index(&self) -> LogIndex;

    /// `first_index() - 1` when empty.
    fn last_index(&self) -> LogIndex;
}

struct MemoryLog {
    first_index: LogIndex,
    entries: VecDeque<SharedEntry>,
    fail_writes: bool,
}

/// Volatile log store.
pub struct MemoryLogStore {
    inner: Mutex<MemoryLog>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryLog {
                first_index: LogIndex(1),
                entries: VecDeque::new(),
                fail_writes: false,
            }),
        }
    }

    /// Make every subsequent write fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    fn check_writable(&self) -> Result<()> {
        if self.fail_writes {
            return Err(RaftError::storage("log store write failed"));
        }
        Ok(())
    }

    fn last_index(&self) -> LogIndex {
        LogIndex(self.first_index.0 + self.entries.len() as u64 - 1)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, entries: &[SharedEntry]) -> Result<()> {
        let mut log = self.inner.lock();
        log.check_writable()?;
        let mut expected = log.last_index().next();
        for entry in entries {
            if entry.id.index != expected {
                return Err(RaftError::storage(format!(
                    "non-contiguous append: expected {}, got {}",
                    expected, entry.id.index
                )));
            }
            expected = expected.next();
        }
        log.entries.extend(entries.iter().cloned());
        Ok(())
    }

    async fn entry(&self, index: LogIndex) -> Result<Option<SharedEntry>> {
        let log = self.inner.lock();
        if index < log.first_index {
            return Ok(None);
        }
        let pos = (index.0 - log.first_index.0) as usize;
        Ok(log.entries.get(pos).cloned())
    }

    async fn truncate_suffix(&self, last_kept: LogIndex) -> Result<()> {
        let mut log = self.inner.lock();
        log.check_writable()?;
        let keep = last_kept.0.saturating_sub(log.first_index.0 - 1) as usize;
        log.entries.truncate(keep);
        Ok(())
    }

    async fn truncate_prefix(&self, first_kept: LogIndex) -> Result<()> {
        let mut log = self.inner.lock();
        log.check_writable()?;
        if first_kept <= log.first_index {
            return Ok(());
        }
        let drop = std::cmp::min(
            (first_kept.0 - log.first_index.0) as usize,
            log.entries.len(),
        );
        log.entries.drain(..drop);
        log.first_index = first_kept;
        Ok(())
    }

    async fn reset(&self, next_index: LogIndex) -> Result<()> {
        let mut log = self.inner.lock();
        log.check_writable()?;
        log.entries.clear();
        log.first_index = next_index;
        Ok(())
    }

    fn first_index(&self) -> LogIndex {
        self.inner.lock().first_index
    }

    fn last_index(&self) -> LogIndex {
        self.inner.lock().last_index()
    }
}

/// Term and vote. Both must survive a restart, or a node could vote twice
/// in one term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<PeerAddress>,
}

/// Durable home of the [`HardState`].
///
/// Saves are synchronous: the node calls `save` under its state lock and
/// only answers the RPC that caused the change once it returned.
pub trait MetaStore: Send + Sync {
    /// The last saved state, or the default when nothing was saved yet.
    fn load(&self) -> Result<HardState>;

    /// Durable once this returns `Ok`.
    fn save(&self, state: &HardState) -> Result<()>;
}

/// Volatile meta store. Shares state across node restarts within one
/// process, the way `MemoryLogStore` does.
#[derive(Default)]
pub struct MemoryMetaStore {
    state: Mutex<HardState>,
    fail_writes: Mutex<bool>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }
}

impl MetaStore for MemoryMetaStore {
    fn load(&self) -> Result<HardState> {
        Ok(*self.state.lock())
    }

    fn save(&self, state: &HardState) -> Result<()> {
        if *self.fail_writes.lock() {
            return Err(RaftError::storage("meta store write failed"));
        }
        *self.state.lock() = *state;
        Ok(())
    }
}

/// Meta store backed by one bincode file, replaced atomically on save.
pub struct FileMetaStore {
    path: PathBuf,
}

impl FileMetaStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetaStore for FileMetaStore {
    fn load(&self) -> Result<HardState> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(bincode::deserialize(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HardState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, state: &HardState) -> Result<()> {
        let temp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&temp)?;
            file.write_all(&bincode::serialize(state)?)?;
            file.sync_all()?;
        }
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

/// One file of state machine snapshot data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub name: String,
    pub data: Bytes,
}

impl SnapshotFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Contents of `__raft_snapshot_meta`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetaTable {
    pub meta: SnapshotMeta,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub meta: SnapshotMeta,
    pub path: PathBuf,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot atomically and make it the latest.
    async fn save(&self, meta: SnapshotMeta, files: Vec<SnapshotFile>) -> Result<SnapshotHandle>;

    async fn load(&self, handle: &SnapshotHandle) -> Result<Vec<SnapshotFile>>;

    /// State machine file names (the meta file is not listed).
    async fn list_files(&self, handle: &SnapshotHandle) -> Result<Vec<String>>;

    fn latest(&self) -> Option<SnapshotHandle>;

    /// Reader serving the snapshot's files, meta table included.
    fn open_reader(&self, handle: &SnapshotHandle) -> Arc<dyn FileReader>;
}

/// Snapshot store on the local file system.
pub struct LocalSnapshotStore {
    root: PathBuf,
    latest: Mutex<Option<SnapshotHandle>>,
    // serializes save() calls
    write_lock: tokio::sync::Mutex<()>,
}

impl LocalSnapshotStore {
    /// Open (creating if needed) and pick up the newest complete snapshot.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;

        let temp = root.join(TEMP_DIR);
        if tokio::fs::metadata(&temp).await.is_ok() {
            tokio::fs::remove_dir_all(&temp).await?;
        }

        let mut newest: Option<(u64, PathBuf)> = None;
        let mut dir = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(index) = name
                .strip_prefix(SNAPSHOT_DIR_PREFIX)
                .and_then(|s| s.parse::<u64>().ok())
            else {
                continue;
            };
            if newest.as_ref().map_or(true, |(i, _)| index > *i) {
                newest = Some((index, entry.path()));
            }
        }

        let latest = match newest {
            Some((_, path)) => {
                let table = read_meta_table(&path).await?;
                tracing::info!(
                    index = %table.meta.last_included.index,
                    path = ?path,
                    "Loaded snapshot"
                );
                Some(SnapshotHandle {
                    meta: table.meta,
                    path,
                })
            }
            None => None,
        };

        Ok(Self {
            root,
            latest: Mutex::new(latest),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot_dir(&self, index: LogIndex) -> PathBuf {
        self.root
            .join(format!("{}{:020}", SNAPSHOT_DIR_PREFIX, index.as_u64()))
    }
}

async fn read_meta_table(dir: &Path) -> Result<SnapshotMetaTable> {
    let raw = tokio::fs::read(dir.join(SNAPSHOT_META_FILE)).await?;
    Ok(bincode::deserialize(&raw)?)
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn save(&self, meta: SnapshotMeta, files: Vec<SnapshotFile>) -> Result<SnapshotHandle> {
        let _guard = self.write_lock.lock().await;

        for file in &files {
            check_file_name(&file.name)?;
            if file.name == SNAPSHOT_META_FILE {
                return Err(RaftError::invalid("reserved snapshot file name"));
            }
        }

        let temp = self.root.join(TEMP_DIR);
        if tokio::fs::metadata(&temp).await.is_ok() {
            tokio::fs::remove_dir_all(&temp).await?;
        }
        tokio::fs::create_dir_all(&temp).await?;

        for file in &files {
            tokio::fs::write(temp.join(&file.name), &file.data).await?;
        }
        let table = SnapshotMetaTable {
            meta: meta.clone(),
            files: files.iter().map(|f| f.name.clone()).collect(),
        };
        tokio::fs::write(temp.join(SNAPSHOT_META_FILE), bincode::serialize(&table)?).await?;

        let target = self.snapshot_dir(meta.last_included.index);
        if tokio::fs::metadata(&target).await.is_ok() {
            tokio::fs::remove_dir_all(&target).await?;
        }
        tokio::fs::rename(&temp, &target).await?;

        let handle = SnapshotHandle {
            meta,
            path: target,
        };
        let previous = self.latest.lock().replace(handle.clone());
        if let Some(prev) = previous {
            if prev.path != handle.path {
                if let Err(e) = tokio::fs::remove_dir_all(&prev.path).await {
                    tracing::warn!(error = %e, path = ?prev.path, "Failed to remove old snapshot");
                }
            }
        }

        tracing::info!(
            index = %handle.meta.last_included.index,
            term = %handle.meta.last_included.term,
            files = table.files.len(),
            "Saved snapshot"
        );
        Ok(handle)
    }

    async fn load(&self, handle: &SnapshotHandle) -> Result<Vec<SnapshotFile>> {
        let table = read_meta_table(&handle.path).await?;
        let mut files = Vec::with_capacity(table.files.len());
        for name in table.files {
            let data = tokio::fs::read(handle.path.join(&name)).await?;
            files.push(SnapshotFile::new(name, data));
        }
        Ok(files)
    }

    async fn list_files(&self, handle: &SnapshotHandle) -> Result<Vec<String>> {
        Ok(read_meta_table(&handle.path).await?.files)
    }

    fn latest(&self) -> Option<SnapshotHandle> {
        self.latest.lock().clone()
    }

    fn open_reader(&self, handle: &SnapshotHandle) -> Arc<dyn FileReader> {
        Arc::new(LocalDirReader::new(handle.path.clone()))
    }
}
