//! Raft log on top of a [`LogStore`].
//!
//! Adds what the protocol needs beyond raw storage:
//! - the last log id, cached so vote handling never touches storage
//! - the snapshot boundary (entries at or below it are gone from storage
//!   but their id is still known)
//! - every configuration entry still in the log, for membership lookups
//! - conflict resolution for entries arriving from a leader

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::storage::LogStore;
use crate::types::*;

struct LogMeta {
    last_log_id: LogId,
    snapshot_id: LogId,
    snapshot_conf: ConfigurationEntry,
    configs: BTreeMap<LogIndex, ConfigurationEntry>,
}

pub struct RaftLog {
    store: Arc<dyn LogStore>,
    meta: RwLock<LogMeta>,
}

impl RaftLog {
    /// Open over `store`, after a snapshot described by `snapshot` (if any).
    ///
    /// `initial_conf` is the membership used when neither the snapshot nor
    /// the log records one.
    pub async fn open(
        store: Arc<dyn LogStore>,
        snapshot: Option<&SnapshotMeta>,
        initial_conf: ConfigurationEntry,
    ) -> Result<Self> {
        let (snapshot_id, snapshot_conf) = match snapshot {
            Some(meta) => (meta.last_included, meta.configuration.clone()),
            None => (LogId::ZERO, initial_conf),
        };

        // Drop whatever the snapshot already covers.
        if snapshot_id.index >= store.first_index() {
            if snapshot_id.index >= store.last_index() {
                store.reset(snapshot_id.index.next()).await?;
            } else {
                store.truncate_prefix(snapshot_id.index.next()).await?;
            }
        }

        let mut configs = BTreeMap::new();
        let mut last_log_id = snapshot_id;
        let mut index = store.first_index();
        while index <= store.last_index() {
            let entry = store
                .entry(index)
                .await?
                .ok_or_else(|| RaftError::storage(format!("missing log entry {}", index)))?;
            if let EntryPayload::Configuration(conf) = &entry.payload {
                configs.insert(index, conf.clone());
            }
            last_log_id = entry.id;
            index = index.next();
        }

        Ok(Self {
            store,
            meta: RwLock::new(LogMeta {
                last_log_id,
                snapshot_id,
                snapshot_conf,
                configs,
            }),
        })
    }

    pub fn last_log_id(&self) -> LogId {
        self.meta.read().last_log_id
    }

    pub fn last_index(&self) -> LogIndex {
        self.meta.read().last_log_id.index
    }

    pub fn snapshot_id(&self) -> LogId {
        self.meta.read().snapshot_id
    }

    /// Term of the entry at `index`. `None` once compacted away or past the
    /// end of the log.
    pub async fn term_at(&self, index: LogIndex) -> Result<Option<Term>> {
        if index == LogIndex::ZERO {
            return Ok(Some(Term::ZERO));
        }
        {
            let meta = self.meta.read();
            if index == meta.snapshot_id.index {
                return Ok(Some(meta.snapshot_id.term));
            }
            if index == meta.last_log_id.index {
                return Ok(Some(meta.last_log_id.term));
            }
            if index < meta.snapshot_id.index || index > meta.last_log_id.index {
                return Ok(None);
            }
        }
        Ok(self.store.entry(index).await?.map(|e| e.id.term))
    }

    pub async fn entry(&self, index: LogIndex) -> Result<Option<SharedEntry>> {
        self.store.entry(index).await
    }

    /// Entries in `[from, to]`, stopping early at `max_count` entries or
    /// once `max_bytes` is reached (at least one entry is always returned
    /// when available).
    pub async fn entries(
        &self,
        from: LogIndex,
        to: LogIndex,
        max_count: usize,
        max_bytes: usize,
    ) -> Result<Vec<SharedEntry>> {
        let mut out = Vec::new();
        let mut bytes = 0;
        let mut index = from;
        while index <= to && out.len() < max_count {
            let Some(entry) = self.store.entry(index).await? else {
                break;
            };
            bytes += entry.size_hint();
            if !out.is_empty() && bytes > max_bytes {
                break;
            }
            out.push(entry);
            index = index.next();
        }
        Ok(out)
    }

    /// Leader-side append: entries continue the log.
    pub async fn append(&self, entries: Vec<SharedEntry>) -> Result<()> {
        let Some(last) = entries.last().map(|e| e.id) else {
            return Ok(());
        };
        self.store.append(&entries).await?;
        let mut meta = self.meta.write();
        for entry in &entries {
            if let EntryPayload::Configuration(conf) = &entry.payload {
                meta.configs.insert(entry.id.index, conf.clone());
            }
        }
        meta.last_log_id = last;
        Ok(())
    }

    /// Follower-side append of entries that follow a matching `prev`.
    ///
    /// Entries already present with the same term are skipped. On the
    /// first term mismatch the local suffix is truncated and the rest of
    /// the batch appended. Entries covered by the snapshot are ignored.
    /// Nothing at or below `committed` may be truncated.
    pub async fn append_from_leader(
        &self,
        entries: Vec<SharedEntry>,
        committed: LogIndex,
    ) -> Result<()> {
        let snapshot_index = self.snapshot_id().index;
        let mut start = entries.len();
        for (pos, entry) in entries.iter().enumerate() {
            if entry.id.index <= snapshot_index {
                continue;
            }
            match self.term_at(entry.id.index).await? {
                Some(term) if term == entry.id.term => continue,
                Some(_) => {
                    if entry.id.index <= committed {
                        return Err(RaftError::Internal {
                            reason: format!(
                                "leader conflicts with committed entry {}",
                                entry.id.index
                            ),
                        });
                    }
                    tracing::debug!(index = %entry.id.index, "Truncating conflicting suffix");
                    self.truncate_suffix(LogIndex(entry.id.index.0 - 1)).await?;
                    start = pos;
                    break;
                }
                None => {
                    start = pos;
                    break;
                }
            }
        }
        if start < entries.len() {
            self.append(entries[start..].to_vec()).await?;
        }
        Ok(())
    }

    async fn truncate_suffix(&self, last_kept: LogIndex) -> Result<()> {
        let last_kept_term = self
            .term_at(last_kept)
            .await?
            .ok_or_else(|| RaftError::storage(format!("cannot truncate after {}", last_kept)))?;
        self.store.truncate_suffix(last_kept).await?;
        let mut meta = self.meta.write();
        meta.configs.split_off(&last_kept.next());
        meta.last_log_id = LogId {
            index: last_kept,
            term: last_kept_term,
        };
        Ok(())
    }

    /// Discard entries up to and including `upto`, which a snapshot now
    /// covers.
    pub async fn compact(&self, upto: LogId, conf: ConfigurationEntry) -> Result<()> {
        if upto.index <= self.snapshot_id().index {
            return Ok(());
        }
        self.store.truncate_prefix(upto.index.next()).await?;
        let mut meta = self.meta.write();
        meta.configs = meta.configs.split_off(&upto.index.next());
        meta.snapshot_id = upto;
        meta.snapshot_conf = conf;
        Ok(())
    }

    /// Align the log with a freshly installed snapshot.
    ///
    /// When the log already holds the snapshot's last entry with the same
    /// term the suffix stays; otherwise the whole log is replaced.
    pub async fn reset_after_snapshot(&self, snapshot: &SnapshotMeta) -> Result<()> {
        let last = snapshot.last_included;
        if self.term_at(last.index).await? == Some(last.term) && last.index > self.snapshot_id().index {
            return self.compact(last, snapshot.configuration.clone()).await;
        }
        self.store.reset(last.index.next()).await?;
        let mut meta = self.meta.write();
        meta.configs.clear();
        meta.last_log_id = last;
        meta.snapshot_id = last;
        meta.snapshot_conf = snapshot.configuration.clone();
        Ok(())
    }

    /// Latest membership in the log, committed or not.
    pub fn current_configuration(&self) -> (LogIndex, ConfigurationEntry) {
        let meta = self.meta.read();
        match meta.configs.iter().next_back() {
            Some((index, conf)) => (*index, conf.clone()),
            None => (meta.snapshot_id.index, meta.snapshot_conf.clone()),
        }
    }

    /// Membership in force at `index`.
    pub fn configuration_at(&self, index: LogIndex) -> ConfigurationEntry {
        let meta = self.meta.read();
        match meta.configs.range(..=index).next_back() {
            Some((_, conf)) => conf.clone(),
            None => meta.snapshot_conf.clone(),
        }
    }
}
