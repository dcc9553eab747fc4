//! Log replication, commit advancement and the apply loop.
//!
//! The leader runs one replicator task per follower. Each keeps up to
//! `max_pipeline_depth` AppendEntries in flight, advancing `next_index`
//! optimistically as it sends. A rejection rewinds `next_index` using the
//! follower's conflict hint and bumps the progress generation so answers
//! to requests sent before the rewind are ignored.
//!
//! Every answer in the leader's term, success or not, proves the follower
//! still accepts this leader. The send time of the newest such answer is
//! kept per follower; the quorum-th newest of those times renews the
//! leader lease.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::{RaftError, Result};
use crate::state::{Core, RaftState};
use crate::types::*;

/// What a response needs to know about the request it answers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InFlight {
    generation: u64,
    prev: LogId,
    count: u64,
    sent_at: Instant,
    epoch: u64,
}

enum NextSend {
    Append(AppendEntriesRequest, InFlight),
    Snapshot,
    Idle,
    Stop,
}

impl RaftState {
    pub(crate) async fn run_replicator(
        self: Arc<Self>,
        peer: PeerAddress,
        term: Term,
        mut stop: watch::Receiver<bool>,
    ) {
        tracing::debug!(group = %self.id.group_id, peer = %peer, term = %term, "Replicator started");
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_index_rx = self.last_index_tx.subscribe();
        let mut inflight = FuturesUnordered::new();
        let depth = self.config.max_pipeline_depth.max(1);
        let mut backoff = false;

        loop {
            while !backoff && inflight.len() < depth {
                match self.prepare_append(peer, term, false).await {
                    Ok(NextSend::Append(request, meta)) => inflight.push(self.send_append(peer, request, meta)),
                    Ok(NextSend::Snapshot) => {
                        self.start_snapshot_send(peer, term);
                        break;
                    }
                    Ok(NextSend::Idle) => break,
                    Ok(NextSend::Stop) => return,
                    Err(e) => {
                        tracing::warn!(group = %self.id.group_id, peer = %peer, error = %e, "Cannot build append request");
                        backoff = true;
                    }
                }
            }

            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    backoff = false;
                    if inflight.is_empty() {
                        match self.prepare_append(peer, term, true).await {
                            Ok(NextSend::Append(request, meta)) => inflight.push(self.send_append(peer, request, meta)),
                            Ok(NextSend::Snapshot) => self.start_snapshot_send(peer, term),
                            Ok(NextSend::Stop) => return,
                            Ok(NextSend::Idle) => {}
                            Err(e) => tracing::warn!(group = %self.id.group_id, peer = %peer, error = %e, "Cannot build heartbeat"),
                        }
                    }
                }
                changed = last_index_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some((meta, result)) = inflight.next(), if !inflight.is_empty() => {
                    match self.on_append_response(peer, term, meta, result).await {
                        Ok(true) => {}
                        Ok(false) => backoff = true,
                        Err(e) => {
                            tracing::warn!(group = %self.id.group_id, peer = %peer, error = %e, "Replication stopped");
                            return;
                        }
                    }
                }
            }
        }
        tracing::debug!(group = %self.id.group_id, peer = %peer, term = %term, "Replicator stopped");
    }

    async fn send_append(
        &self,
        peer: PeerAddress,
        request: AppendEntriesRequest,
        meta: InFlight,
    ) -> (InFlight, Result<AppendEntriesResponse>) {
        let result = self
            .transport
            .append_entries(&peer, request, self.config.rpc_timeout)
            .await;
        (meta, result)
    }

    /// Build the next request for `peer`. A heartbeat is built even when
    /// there is nothing new to send.
    async fn prepare_append(&self, peer: PeerAddress, term: Term, heartbeat: bool) -> Result<NextSend> {
        let (next, generation, commit, epoch, installing) = {
            let core = self.core.lock();
            if !core.state.is_leader() || core.current_term != term {
                return Ok(NextSend::Stop);
            }
            let Some(progress) = core.leader.as_ref().and_then(|l| l.progress.get(&peer)) else {
                return Ok(NextSend::Stop);
            };
            (
                progress.next_index,
                progress.generation,
                core.commit_index,
                core.leader_lease.lease_epoch(),
                progress.installing,
            )
        };

        let sent_at = self.clock.now();
        if installing {
            if !heartbeat {
                return Ok(NextSend::Idle);
            }
            // keepalive while the follower pulls a snapshot; prev 0 always matches
            return Ok(NextSend::Append(
                self.append_request(peer, term, LogId::ZERO, Vec::new(), LogIndex::ZERO),
                InFlight {
                    generation,
                    prev: LogId::ZERO,
                    count: 0,
                    sent_at,
                    epoch,
                },
            ));
        }

        let last = self.log.last_index();
        if !heartbeat && next > last {
            return Ok(NextSend::Idle);
        }
        let prev_index = LogIndex(next.0.saturating_sub(1));
        let Some(prev_term) = self.log.term_at(prev_index).await? else {
            return Ok(NextSend::Snapshot);
        };
        let entries = if next <= last {
            let entries = self
                .log
                .entries(
                    next,
                    last,
                    self.config.max_entries_per_append,
                    self.config.max_bytes_per_append,
                )
                .await?;
            if entries.is_empty() {
                return Ok(NextSend::Snapshot);
            }
            entries
        } else {
            Vec::new()
        };
        let count = entries.len() as u64;

        {
            let mut core = self.core.lock();
            if let Some(progress) = core.leader.as_mut().and_then(|l| l.progress.get_mut(&peer)) {
                if progress.generation == generation && count > 0 {
                    progress.next_index = LogIndex(next.0 + count);
                }
            }
        }

        let prev = LogId {
            index: prev_index,
            term: prev_term,
        };
        Ok(NextSend::Append(
            self.append_request(peer, term, prev, entries, commit),
            InFlight {
                generation,
                prev,
                count,
                sent_at,
                epoch,
            },
        ))
    }

    fn append_request(
        &self,
        peer: PeerAddress,
        term: Term,
        prev_log_id: LogId,
        entries: Vec<SharedEntry>,
        committed_index: LogIndex,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            group_id: self.id.group_id.clone(),
            server_id: self.me(),
            peer_id: peer,
            term,
            prev_log_id,
            entries,
            committed_index,
        }
    }

    /// Returns false when the replicator should wait for the next tick.
    async fn on_append_response(
        &self,
        peer: PeerAddress,
        term: Term,
        meta: InFlight,
        result: Result<AppendEntriesResponse>,
    ) -> Result<bool> {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(group = %self.id.group_id, peer = %peer, error = %e, "AppendEntries failed");
                let mut core = self.core.lock();
                if let Some(progress) = core.leader.as_mut().and_then(|l| l.progress.get_mut(&peer)) {
                    if progress.generation == meta.generation {
                        progress.generation += 1;
                        progress.next_index = progress.match_index.next();
                    }
                }
                return Ok(false);
            }
        };

        let mut advanced = false;
        {
            let mut core = self.core.lock();
            if response.term > core.current_term {
                self.step_down(&mut core, response.term, "higher term in append response");
                return Ok(true);
            }
            if !core.state.is_leader() || core.current_term != term {
                return Ok(true);
            }
            let Some(progress) = core.leader.as_mut().and_then(|l| l.progress.get_mut(&peer)) else {
                return Ok(true);
            };
            if progress.last_ack.map_or(true, |at| meta.sent_at > at) {
                progress.last_ack = Some(meta.sent_at);
            }

            if progress.installing || meta.generation != progress.generation {
                // only the acknowledgement counts
            } else if response.success {
                let matched = LogIndex(meta.prev.index.0 + meta.count);
                if matched > progress.match_index {
                    progress.match_index = matched;
                    advanced = true;
                }
                if progress.next_index <= progress.match_index {
                    progress.next_index = progress.match_index.next();
                }
            } else {
                let hint = response
                    .conflict_index
                    .unwrap_or_else(|| meta.prev.index.prev().unwrap_or(LogIndex::ZERO));
                let rewind = std::cmp::min(hint.next(), meta.prev.index);
                progress.generation += 1;
                progress.next_index = std::cmp::max(progress.match_index.next(), rewind);
                tracing::debug!(
                    group = %self.id.group_id,
                    peer = %peer,
                    prev = %meta.prev,
                    hint = %hint,
                    next = %progress.next_index,
                    "Follower log diverges, backing up"
                );
            }

            self.refresh_lease(&mut core, meta.epoch);
        }

        if advanced {
            self.advance_commit_index(term).await?;
        }
        Ok(true)
    }

    /// Renew the leader lease from the quorum-th newest acknowledgement.
    fn refresh_lease(&self, core: &mut Core, epoch: u64) {
        let now = self.clock.now();
        let me = self.me();
        let (_, conf) = self.log.current_configuration();
        let Some(leader) = core.leader.as_ref() else {
            return;
        };
        let acked = conf.quorum_value(|p| {
            if *p == me {
                Some(now)
            } else {
                leader.progress.get(p).and_then(|pr| pr.last_ack)
            }
        });
        if let Some(Some(at)) = acked {
            core.leader_lease.on_lease_start(epoch, at);
        }
    }

    /// Commit the highest index a quorum holds, provided it belongs to
    /// `term`. Entries of earlier terms commit only indirectly.
    pub(crate) async fn advance_commit_index(&self, term: Term) -> Result<()> {
        let (candidate, commit) = {
            let core = self.core.lock();
            if !core.state.is_leader() || core.current_term != term {
                return Ok(());
            }
            let Some(leader) = core.leader.as_ref() else {
                return Ok(());
            };
            let (_, conf) = self.log.current_configuration();
            let last = self.log.last_index();
            let me = self.me();
            let candidate = conf.quorum_index(|p| {
                if *p == me {
                    last
                } else {
                    leader.progress.get(p).map_or(LogIndex::ZERO, |pr| pr.match_index)
                }
            });
            (candidate, core.commit_index)
        };
        if candidate <= commit {
            return Ok(());
        }
        if self.log.term_at(candidate).await? != Some(term) {
            return Ok(());
        }

        let mut core = self.core.lock();
        if core.state.is_leader() && core.current_term == term {
            tracing::trace!(group = %self.id.group_id, commit = %candidate, "Commit index advanced");
            self.set_commit_index(&mut core, candidate);
        }
        Ok(())
    }

    /// Append entries to the leader's own log. Returns the last index and
    /// the term they were written in.
    ///
    /// `internal` entries (elections, membership) are allowed while a
    /// leadership transfer is in progress; client data is not.
    pub(crate) async fn append_as_leader(
        &self,
        payloads: Vec<EntryPayload>,
        internal: bool,
    ) -> Result<(LogIndex, Term)> {
        let guard = self.append_lock.lock().await;
        let term = {
            let core = self.core.lock();
            self.check_active(&core)?;
            if !core.state.is_leader() {
                return Err(self.not_leader(&core));
            }
            if core.state == NodeState::Transferring && !internal {
                return Err(RaftError::busy("leadership transfer in progress"));
            }
            core.current_term
        };

        let mut index = self.log.last_index();
        let entries: Vec<SharedEntry> = payloads
            .into_iter()
            .map(|payload| {
                index = index.next();
                Arc::new(LogEntry {
                    id: LogId { index, term },
                    payload,
                })
            })
            .collect();
        self.log
            .append(entries)
            .await
            .map_err(|e| self.fatal_check(e))?;
        self.last_index_tx.send_replace(index);
        drop(guard);

        self.advance_commit_index(term).await?;
        Ok((index, term))
    }

    /// One heartbeat round; succeeds once a quorum answered in `term`.
    pub(crate) async fn confirm_leadership(self: &Arc<Self>, term: Term) -> Result<()> {
        let (_, conf) = self.log.current_configuration();
        let mut acks = HashSet::from([self.me()]);

        let mut calls = FuturesUnordered::new();
        for peer in conf.all_peers().into_iter().filter(|p| *p != self.me()) {
            let request = self.append_request(peer, term, LogId::ZERO, Vec::new(), LogIndex::ZERO);
            let state = self.clone();
            calls.push(async move {
                let result = state
                    .transport
                    .append_entries(&peer, request, state.config.rpc_timeout)
                    .await;
                (peer, result)
            });
        }

        while !conf.has_quorum(&acks) {
            let Some((peer, result)) = calls.next().await else {
                return Err(RaftError::Timeout {
                    elapsed_ms: self.config.rpc_timeout.as_millis() as u64,
                });
            };
            match result {
                Ok(response) if response.term > term => {
                    let mut core = self.core.lock();
                    self.step_down(&mut core, response.term, "higher term in read confirmation");
                    return Err(self.not_leader(&core));
                }
                Ok(response) if response.term == term => {
                    acks.insert(peer);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(group = %self.id.group_id, peer = %peer, error = %e, "Read confirmation failed"),
            }
        }

        let core = self.core.lock();
        if core.state.is_leader() && core.current_term == term {
            Ok(())
        } else {
            Err(self.not_leader(&core))
        }
    }

    pub(crate) async fn run_apply_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut commit_rx = self.commit_tx.subscribe();
        loop {
            if let Err(e) = self.apply_committed().await {
                self.enter_error(&e);
                break;
            }
            tokio::select! {
                changed = commit_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Feed committed entries to the state machine in index order.
    pub(crate) async fn apply_committed(&self) -> Result<()> {
        let _guard = self.apply_lock.lock().await;
        loop {
            let (applied, commit) = {
                let core = self.core.lock();
                if !core.state.is_active() {
                    return Ok(());
                }
                (core.last_applied, core.commit_index)
            };
            if applied >= commit {
                return Ok(());
            }

            let batch = self.config.max_entries_per_append.max(1);
            let entries = self
                .log
                .entries(applied.next(), commit, batch, usize::MAX)
                .await?;
            let Some(last) = entries.last().map(|e| e.id.index) else {
                return Err(RaftError::storage(format!(
                    "committed entry {} missing from log",
                    applied.next()
                )));
            };
            self.fsm.apply(&entries).await?;

            let mut core = self.core.lock();
            if last > core.last_applied {
                core.last_applied = last;
                self.applied_tx.send_replace(last);
            }
        }
    }
}
