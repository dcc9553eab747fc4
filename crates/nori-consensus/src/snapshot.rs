//! Snapshot creation, transfer and installation.
//!
//! A leader that can no longer feed a follower from its log registers a
//! reader for its latest snapshot with the file service and sends the
//! follower an `InstallSnapshot` naming it as `remote://ip:port/reader_id`.
//! The follower then pulls the meta table and every file it lists through
//! `GetFile`, and swaps its state machine and log over in one step.
//!
//! Follower-side installs are admitted by the snapshot throttle. The slot
//! is held by a [`ThrottleTask`] guard and released on every exit path.

use nori_observe::{obs_count, SnapshotEvt, SnapshotKind, VizEvent};
use std::sync::Arc;

use crate::copier::{CopyOptions, RemoteFileCopier, RemoteUri};
use crate::error::{RaftError, Result};
use crate::file_service::check_file_name;
use crate::state::RaftState;
use crate::storage::{SnapshotFile, SnapshotMetaTable, SNAPSHOT_META_FILE};
use crate::throttle::ThrottleTask;
use crate::types::*;

impl RaftState {
    fn emit_snapshot(&self, kind: SnapshotKind) {
        self.meter.emit(VizEvent::Snapshot(SnapshotEvt {
            group: self.group_hash(),
            kind,
        }));
    }

    /// Capture the state machine at `last_applied` and drop the log prefix
    /// it covers. Returns the meta of the newest snapshot.
    pub(crate) async fn take_snapshot(&self) -> Result<SnapshotMeta> {
        let _snapshot = self.snapshot_lock.lock().await;

        let (meta, files) = {
            let _apply = self.apply_lock.lock().await;
            let applied = {
                let core = self.core.lock();
                self.check_active(&core)?;
                core.last_applied
            };
            let covered = self.log.snapshot_id();
            if applied <= covered.index {
                return Ok(SnapshotMeta {
                    last_included: covered,
                    configuration: self.log.configuration_at(covered.index),
                });
            }
            let term = self
                .log
                .term_at(applied)
                .await?
                .ok_or_else(|| RaftError::storage(format!("applied entry {} not in log", applied)))?;
            let files = self.fsm.snapshot().await?;
            let meta = SnapshotMeta {
                last_included: LogId {
                    index: applied,
                    term,
                },
                configuration: self.log.configuration_at(applied),
            };
            (meta, files)
        };

        let handle = self
            .snapshots
            .save(meta.clone(), files)
            .await
            .map_err(|e| self.fatal_check(e))?;
        {
            let _append = self.append_lock.lock().await;
            self.log
                .compact(meta.last_included, meta.configuration.clone())
                .await
                .map_err(|e| self.fatal_check(e))?;
        }

        tracing::info!(
            group = %self.id.group_id,
            index = %meta.last_included.index,
            term = %meta.last_included.term,
            path = ?handle.path,
            "Snapshot saved, log compacted"
        );
        self.emit_snapshot(SnapshotKind::Saved {
            index: meta.last_included.index.as_u64(),
        });
        Ok(meta)
    }

    /// Hand `peer` over to snapshot installation unless it already is.
    pub(crate) fn start_snapshot_send(self: &Arc<Self>, peer: PeerAddress, term: Term) {
        {
            let mut core = self.core.lock();
            if !core.state.is_leader() || core.current_term != term {
                return;
            }
            let Some(progress) = core.leader.as_mut().and_then(|l| l.progress.get_mut(&peer)) else {
                return;
            };
            if progress.installing {
                return;
            }
            progress.installing = true;
        }
        tokio::spawn(self.clone().send_snapshot(peer, term));
    }

    async fn send_snapshot(self: Arc<Self>, peer: PeerAddress, term: Term) {
        let result = self.install_on(peer, term).await;

        let mut core = self.core.lock();
        if let Ok((_, response)) = &result {
            if response.term > core.current_term {
                self.step_down(&mut core, response.term, "higher term in install response");
                return;
            }
        }
        if !core.state.is_leader() || core.current_term != term {
            return;
        }
        let Some(progress) = core.leader.as_mut().and_then(|l| l.progress.get_mut(&peer)) else {
            return;
        };
        progress.installing = false;
        progress.generation += 1;
        match result {
            Ok((meta, response)) if response.success => {
                let index = meta.last_included.index;
                if index > progress.match_index {
                    progress.match_index = index;
                }
                progress.next_index = progress.match_index.next();
                tracing::info!(group = %self.id.group_id, peer = %peer, index = %index, "Follower installed snapshot");
            }
            Ok(_) => {
                progress.next_index = progress.match_index.next();
                tracing::warn!(group = %self.id.group_id, peer = %peer, "Follower refused snapshot");
            }
            Err(e) => {
                progress.next_index = progress.match_index.next();
                tracing::warn!(group = %self.id.group_id, peer = %peer, error = %e, "Snapshot install failed");
            }
        }
        drop(core);
        // wake the replicator so it resumes from the new position
        self.last_index_tx.send_replace(self.log.last_index());
    }

    async fn install_on(
        &self,
        peer: PeerAddress,
        term: Term,
    ) -> Result<(SnapshotMeta, InstallSnapshotResponse)> {
        let _task = match &self.throttle {
            Some(throttle) => Some(
                ThrottleTask::acquire(throttle, true)
                    .ok_or_else(|| RaftError::busy("snapshot send limit reached"))?,
            ),
            None => None,
        };
        let handle = self
            .snapshots
            .latest()
            .ok_or_else(|| RaftError::storage("log compacted but no snapshot stored"))?;

        let reader_id = self.file_service.add_reader(self.snapshots.open_reader(&handle));
        let uri = RemoteUri {
            addr: self.me().addr,
            reader_id,
        };
        let request = InstallSnapshotRequest {
            group_id: self.id.group_id.clone(),
            server_id: self.me(),
            peer_id: peer,
            term,
            meta: handle.meta.clone(),
            uri: uri.to_string(),
        };
        tracing::info!(
            group = %self.id.group_id,
            peer = %peer,
            index = %handle.meta.last_included.index,
            uri = %uri,
            "Sending snapshot"
        );
        let result = self
            .transport
            .install_snapshot(&peer, request, self.config.install_snapshot_timeout)
            .await;
        self.file_service.remove_reader(reader_id);
        result.map(|response| (handle.meta, response))
    }

    pub async fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let term = {
            let mut core = self.core.lock();
            self.check_active(&core)?;
            if request.term < core.current_term {
                return Ok(InstallSnapshotResponse {
                    term: core.current_term,
                    success: false,
                });
            }
            self.follow(&mut core, request.term, request.server_id, "install snapshot from leader")?;
            core.current_term
        };
        self.timer.reset();

        let index = request.meta.last_included.index;
        if self.already_covered(index) {
            return Ok(InstallSnapshotResponse {
                term,
                success: true,
            });
        }

        let _task = match &self.throttle {
            Some(throttle) => match ThrottleTask::acquire(throttle, false) {
                Some(task) => Some(task),
                None => {
                    tracing::warn!(group = %self.id.group_id, index = %index, "Snapshot install rejected, too many in progress");
                    obs_count!(self.meter, "snapshot_install_rejected", &[], 1);
                    self.emit_snapshot(SnapshotKind::InstallRejectedBusy);
                    return Err(RaftError::busy("too many snapshot installs in progress"));
                }
            },
            None => None,
        };

        let _snapshot = self.snapshot_lock.lock().await;
        if self.already_covered(index) {
            return Ok(InstallSnapshotResponse {
                term,
                success: true,
            });
        }

        let uri: RemoteUri = request.uri.parse()?;
        tracing::info!(group = %self.id.group_id, index = %index, uri = %uri, "Installing snapshot");
        self.emit_snapshot(SnapshotKind::InstallStart {
            index: index.as_u64(),
        });

        let copier = RemoteFileCopier::new(
            uri,
            self.transport.clone(),
            self.throttle.clone(),
            self.clock.clone(),
            self.meter.clone(),
            CopyOptions::from_config(&self.config),
            self.shutdown_tx.subscribe(),
        );
        let raw = copier.copy_to_bytes(SNAPSHOT_META_FILE).await?;
        let table: SnapshotMetaTable = bincode::deserialize(&raw)
            .map_err(|e| RaftError::invalid(format!("bad snapshot meta table: {}", e)))?;
        if table.meta != request.meta {
            return Err(RaftError::invalid(format!(
                "snapshot meta mismatch: offered {}, source holds {}",
                request.meta.last_included, table.meta.last_included
            )));
        }
        let mut files = Vec::with_capacity(table.files.len());
        for name in &table.files {
            check_file_name(name)?;
            files.push(SnapshotFile::new(name.clone(), copier.copy_to_bytes(name).await?));
        }
        let bytes = copier.copied_bytes();

        let meta = table.meta;
        {
            let _append = self.append_lock.lock().await;
            let _apply = self.apply_lock.lock().await;
            self.snapshots
                .save(meta.clone(), files.clone())
                .await
                .map_err(|e| self.fatal_check(e))?;
            if let Err(e) = self.fsm.restore(files).await {
                self.enter_error(&e);
                return Err(e);
            }
            self.log
                .reset_after_snapshot(&meta)
                .await
                .map_err(|e| self.fatal_check(e))?;

            let mut core = self.core.lock();
            self.set_commit_index(&mut core, index);
            if index > core.last_applied {
                core.last_applied = index;
                self.applied_tx.send_replace(index);
            }
        }
        self.last_index_tx.send_replace(self.log.last_index());

        tracing::info!(group = %self.id.group_id, index = %index, bytes, "Snapshot installed");
        obs_count!(self.meter, "snapshot_installed_bytes", &[], bytes);
        self.emit_snapshot(SnapshotKind::Installed {
            index: index.as_u64(),
            bytes,
        });
        Ok(InstallSnapshotResponse {
            term: self.current_term(),
            success: true,
        })
    }

    fn already_covered(&self, index: LogIndex) -> bool {
        let applied = self.core.lock().last_applied;
        index <= std::cmp::max(self.log.snapshot_id().index, applied)
    }
}
