//! Per-node protocol engine.
//!
//! All term, vote and role changes happen under `core`, a short synchronous
//! lock that is never held across an await. Slow work runs outside it:
//!
//! - log writes serialize on `append_lock`
//! - state machine application serializes on `apply_lock`
//! - snapshot creation and installation serialize on `snapshot_lock`
//!
//! When more than one is needed they are taken in the order
//! `snapshot_lock` → `append_lock` → `apply_lock`.
//!
//! # Out-of-order appends
//!
//! A pipelining leader keeps several AppendEntries in flight and they may
//! arrive in any order. A request whose `prev_log_id` lies past the end of
//! the local log is parked in a small cache and completed once the gap is
//! filled. When the cache is full the request is refused with a hint and
//! the leader retransmits.

use nori_observe::{obs_count, Meter, RaftEvt, RaftKind, VizEvent};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, watch};

use crate::clock::Clock;
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::file_service::FileService;
use crate::lease::{FollowerLease, LeaderLease};
use crate::log::RaftLog;
use crate::state_machine::StateMachine;
use crate::storage::{HardState, MetaStore, SnapshotStore};
use crate::throttle::SnapshotThrottle;
use crate::timer::ElectionTimer;
use crate::transport::RaftTransport;
use crate::types::*;

/// Replication progress of one follower, kept by the leader.
#[derive(Debug, Clone)]
pub(crate) struct Progress {
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    /// Bumped whenever `next_index` is rewound, so responses to requests
    /// sent before the rewind are ignored.
    pub generation: u64,
    /// Send time of the newest request this follower answered in our term.
    pub last_ack: Option<Instant>,
    pub installing: bool,
}

impl Progress {
    pub fn new(next_index: LogIndex) -> Self {
        Self {
            next_index,
            match_index: LogIndex::ZERO,
            generation: 0,
            last_ack: None,
            installing: false,
        }
    }
}

pub(crate) struct LeaderState {
    pub progress: HashMap<PeerAddress, Progress>,
    /// Dropping a sender stops that follower's replicator.
    pub replicators: HashMap<PeerAddress, watch::Sender<bool>>,
}

pub(crate) struct Core {
    pub state: NodeState,
    pub current_term: Term,
    pub voted_for: Option<PeerAddress>,
    pub leader_id: Option<PeerAddress>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub leader_lease: LeaderLease,
    pub follower_lease: FollowerLease,
    pub leader: Option<LeaderState>,
    pub transfer_target: Option<PeerAddress>,
    pub conf_change_in_flight: bool,
}

/// Role as published to waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub term: Term,
    pub state: NodeState,
    pub leader: Option<PeerAddress>,
}

struct PendingAppend {
    seq: u64,
    request: AppendEntriesRequest,
    reply: oneshot::Sender<Result<AppendEntriesResponse>>,
}

#[derive(Default)]
pub(crate) struct OutOfOrderCache {
    next_seq: u64,
    pending: BTreeMap<LogIndex, PendingAppend>,
}

pub(crate) struct RaftState {
    pub id: NodeId,
    pub config: RaftConfig,
    pub core: Mutex<Core>,
    pub log: RaftLog,
    pub meta: Arc<dyn MetaStore>,
    pub append_lock: tokio::sync::Mutex<()>,
    pub apply_lock: tokio::sync::Mutex<()>,
    pub snapshot_lock: tokio::sync::Mutex<()>,
    pub ooo_cache: Mutex<OutOfOrderCache>,
    pub transport: Arc<dyn RaftTransport>,
    pub fsm: Arc<dyn StateMachine>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub file_service: Arc<FileService>,
    pub throttle: Option<Arc<dyn SnapshotThrottle>>,
    pub clock: Arc<dyn Clock>,
    pub meter: Arc<dyn Meter>,
    pub timer: Arc<ElectionTimer>,
    pub commit_tx: watch::Sender<LogIndex>,
    pub applied_tx: watch::Sender<LogIndex>,
    pub last_index_tx: watch::Sender<LogIndex>,
    pub role_tx: watch::Sender<RoleSnapshot>,
    pub shutdown_tx: watch::Sender<bool>,
}

pub(crate) fn hash_u32(value: &impl Hash) -> u32 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish() as u32
}

impl RaftState {
    pub fn me(&self) -> PeerAddress {
        self.id.peer_id
    }

    pub fn group_hash(&self) -> u32 {
        hash_u32(&self.id.group_id)
    }

    pub fn emit(&self, term: Term, kind: RaftKind) {
        self.meter.emit(VizEvent::Raft(RaftEvt {
            group: self.group_hash(),
            term: term.as_u64(),
            kind,
        }));
    }

    pub fn publish_role(&self, core: &Core) {
        self.role_tx.send_replace(RoleSnapshot {
            term: core.current_term,
            state: core.state,
            leader: core.leader_id,
        });
    }

    pub fn check_active(&self, core: &Core) -> Result<()> {
        if core.state.is_active() {
            Ok(())
        } else {
            Err(RaftError::NotActive { state: core.state })
        }
    }

    pub fn not_leader(&self, core: &Core) -> RaftError {
        RaftError::NotLeader {
            leader: core.leader_id,
        }
    }

    /// Revert to FOLLOWER, adopting `term` when it is newer.
    pub fn step_down(&self, core: &mut Core, term: Term, reason: &str) {
        if !core.state.is_active() {
            return;
        }
        let was_leader = core.state.is_leader();
        if term > core.current_term {
            core.current_term = term;
            core.voted_for = None;
            core.leader_id = None;
            if self.save_hard_state(core).is_err() {
                return;
            }
        }
        if was_leader {
            core.leader_lease.on_leader_stop();
            // dropping the stop senders ends every replicator
            core.leader = None;
            core.transfer_target = None;
            core.conf_change_in_flight = false;
            if core.leader_id == Some(self.me()) {
                core.leader_id = None;
            }
            let fsm = self.fsm.clone();
            tokio::spawn(async move { fsm.on_leader_stop().await });
            self.emit(core.current_term, RaftKind::StepDown);
            obs_count!(self.meter, "raft_step_down", &[], 1);
        }
        if core.state != NodeState::Follower {
            tracing::info!(
                group = %self.id.group_id,
                node = %self.me(),
                term = %core.current_term,
                from = %core.state,
                reason,
                "Stepping down to follower"
            );
        }
        core.state = NodeState::Follower;
        self.publish_role(core);
        self.timer.reset();
    }

    /// Persist the current term and vote. A failure moves the node to ERROR.
    pub fn save_hard_state(&self, core: &mut Core) -> Result<()> {
        let hard = HardState {
            term: core.current_term,
            voted_for: core.voted_for,
        };
        self.meta.save(&hard).map_err(|e| {
            self.enter_error_locked(core, &e);
            e
        })
    }

    /// Storage and apply failures are terminal for this node.
    pub fn enter_error(&self, err: &RaftError) {
        let mut core = self.core.lock();
        self.enter_error_locked(&mut core, err);
    }

    fn enter_error_locked(&self, core: &mut Core, err: &RaftError) {
        if !core.state.is_active() {
            return;
        }
        tracing::error!(
            group = %self.id.group_id,
            node = %self.me(),
            term = %core.current_term,
            error = %err,
            "Node entering ERROR state"
        );
        if core.state.is_leader() {
            core.leader_lease.on_leader_stop();
            core.leader = None;
            core.transfer_target = None;
            core.conf_change_in_flight = false;
        }
        core.state = NodeState::Error;
        self.publish_role(core);
        self.emit(core.current_term, RaftKind::Error);
    }

    /// Pass `err` through, moving to ERROR first when it is fatal.
    pub fn fatal_check(&self, err: RaftError) -> RaftError {
        if err.is_fatal() {
            self.enter_error(&err);
        }
        err
    }

    pub fn current_term(&self) -> Term {
        self.core.lock().current_term
    }

    /// Raise the commit index; it never moves backwards.
    pub fn set_commit_index(&self, core: &mut Core, index: LogIndex) {
        if index > core.commit_index {
            core.commit_index = index;
            self.commit_tx.send_replace(index);
        }
    }

    /// Accept `leader`, which sent an RPC at `term >= current_term`: any
    /// other role reverts to FOLLOWER and the follower lease is renewed.
    pub fn follow(&self, core: &mut Core, term: Term, leader: PeerAddress, reason: &str) -> Result<()> {
        if term > core.current_term || core.state != NodeState::Follower {
            self.step_down(core, term, reason);
            self.check_active(core)?;
        }
        if core.leader_id != Some(leader) {
            core.leader_id = Some(leader);
            self.publish_role(core);
        }
        core.follower_lease.renew(leader);
        Ok(())
    }

    pub fn handle_pre_vote(&self, request: &RequestVoteRequest) -> Result<RequestVoteResponse> {
        let core = self.core.lock();
        self.check_active(&core)?;

        let log_ok = request.last_log_id >= self.log.last_log_id();
        // A leader, or a follower that heard from one recently, only helps
        // a candidate that is already ahead in term.
        let lease_allows =
            !core.state.is_leader() && core.follower_lease.votable_time_from_now().is_zero();
        let ahead = request.term > core.current_term.next();
        let granted = request.term > core.current_term && log_ok && (lease_allows || ahead);

        tracing::debug!(
            group = %self.id.group_id,
            candidate = %request.server_id,
            term = %request.term,
            granted,
            log_ok,
            lease_allows,
            "Pre-vote"
        );
        if granted {
            obs_count!(self.meter, "raft_pre_votes_granted", &[], 1);
        }

        Ok(RequestVoteResponse {
            term: core.current_term,
            granted,
            rejected_by_lease: log_ok && !lease_allows && !ahead,
        })
    }

    pub fn handle_request_vote(&self, request: &RequestVoteRequest) -> Result<RequestVoteResponse> {
        let mut core = self.core.lock();
        self.check_active(&core)?;

        if request.term < core.current_term {
            return Ok(RequestVoteResponse {
                term: core.current_term,
                granted: false,
                rejected_by_lease: false,
            });
        }
        if request.term == core.current_term
            && core.state == NodeState::Follower
            && !core.follower_lease.votable_time_from_now().is_zero()
            && core.voted_for != Some(request.server_id)
        {
            tracing::debug!(
                group = %self.id.group_id,
                candidate = %request.server_id,
                term = %request.term,
                "Vote rejected by follower lease"
            );
            return Ok(RequestVoteResponse {
                term: core.current_term,
                granted: false,
                rejected_by_lease: true,
            });
        }
        if request.term > core.current_term {
            self.step_down(&mut core, request.term, "vote request with higher term");
            self.check_active(&core)?;
        }

        let log_ok = request.last_log_id >= self.log.last_log_id();
        let free = core.voted_for.map_or(true, |v| v == request.server_id);
        let granted = log_ok && free;
        if granted {
            if core.voted_for != Some(request.server_id) {
                core.voted_for = Some(request.server_id);
                self.save_hard_state(&mut core)?;
            }
            self.timer.reset();
            obs_count!(self.meter, "raft_votes_granted", &[], 1);
            self.emit(
                core.current_term,
                RaftKind::VoteGranted {
                    from: hash_u32(&self.me()),
                },
            );
        }
        tracing::debug!(
            group = %self.id.group_id,
            candidate = %request.server_id,
            term = %core.current_term,
            granted,
            log_ok,
            "Vote"
        );

        Ok(RequestVoteResponse {
            term: core.current_term,
            granted,
            rejected_by_lease: false,
        })
    }

    pub fn handle_timeout_now(&self, request: &TimeoutNowRequest) -> Result<TimeoutNowResponse> {
        let mut core = self.core.lock();
        self.check_active(&core)?;

        if request.term < core.current_term {
            return Ok(TimeoutNowResponse {
                term: core.current_term,
                success: false,
            });
        }
        if request.term > core.current_term {
            self.step_down(&mut core, request.term, "timeout-now with higher term");
            self.check_active(&core)?;
        }
        if core.state != NodeState::Follower {
            return Ok(TimeoutNowResponse {
                term: core.current_term,
                success: false,
            });
        }

        tracing::info!(
            group = %self.id.group_id,
            from = %request.server_id,
            term = %core.current_term,
            "Leader handing over, starting election now"
        );
        core.follower_lease.expire();
        self.timer.trigger_now();
        Ok(TimeoutNowResponse {
            term: core.current_term,
            success: true,
        })
    }

    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let guard = self.append_lock.lock().await;

        let parked = if request.prev_log_id.index > self.log.last_index() && !request.entries.is_empty() {
            // a newer term is adopted before the request waits for its gap
            {
                let mut core = self.core.lock();
                self.check_active(&core)?;
                if request.term >= core.current_term {
                    self.follow(&mut core, request.term, request.server_id, "append entries from leader")?;
                }
            }
            self.timer.reset();
            self.park(request)
        } else {
            Err(request)
        };
        let (key, seq, waiter) = match parked {
            Ok(parked) => parked,
            Err(request) => {
                let response = self.append_locked(request, false).await;
                if matches!(&response, Ok(r) if r.success) {
                    self.drain_parked().await;
                }
                return response;
            }
        };
        drop(guard);

        match tokio::time::timeout(self.config.rpc_timeout, waiter).await {
            Ok(Ok(response)) => response,
            _ => {
                let mut cache = self.ooo_cache.lock();
                if cache.pending.get(&key).map_or(false, |p| p.seq == seq) {
                    cache.pending.remove(&key);
                }
                drop(cache);
                Ok(AppendEntriesResponse {
                    term: self.current_term(),
                    success: false,
                    conflict_index: Some(self.log.last_index()),
                    last_log_index: self.log.last_index(),
                })
            }
        }
    }

    /// Queue a request that arrived ahead of a gap. Hands the request back
    /// when it cannot be parked.
    #[allow(clippy::type_complexity)]
    fn park(
        &self,
        request: AppendEntriesRequest,
    ) -> std::result::Result<
        (LogIndex, u64, oneshot::Receiver<Result<AppendEntriesResponse>>),
        AppendEntriesRequest,
    > {
        let current_term = self.current_term();
        let mut cache = self.ooo_cache.lock();
        cache.pending.retain(|_, p| p.request.term >= current_term);
        let key = request.prev_log_id.index;
        if request.term < current_term
            || (cache.pending.len() >= self.config.max_out_of_order_cache
                && !cache.pending.contains_key(&key))
        {
            return Err(request);
        }
        let (reply, waiter) = oneshot::channel();
        cache.next_seq += 1;
        let seq = cache.next_seq;
        tracing::debug!(
            group = %self.id.group_id,
            prev = %key,
            last = %self.log.last_index(),
            "Parking out-of-order append"
        );
        // a retransmission for the same slot replaces the older request
        cache.pending.insert(
            key,
            PendingAppend {
                seq,
                request,
                reply,
            },
        );
        Ok((key, seq, waiter))
    }

    /// Complete parked requests that now follow the log. Caller holds
    /// `append_lock`.
    async fn drain_parked(&self) {
        loop {
            let next = {
                let mut cache = self.ooo_cache.lock();
                let last = self.log.last_index();
                match cache.pending.keys().next().copied() {
                    Some(key) if key <= last => cache.pending.remove(&key),
                    _ => None,
                }
            };
            let Some(pending) = next else {
                return;
            };
            let response = self.append_locked(pending.request, true).await;
            let _ = pending.reply.send(response);
        }
    }

    /// AppendEntries body. Caller holds `append_lock`.
    async fn append_locked(
        &self,
        request: AppendEntriesRequest,
        from_cache: bool,
    ) -> Result<AppendEntriesResponse> {
        let (term, commit) = {
            let mut core = self.core.lock();
            self.check_active(&core)?;
            if request.term < core.current_term {
                obs_count!(self.meter, "raft_append_rejected", &[], 1);
                return Ok(AppendEntriesResponse {
                    term: core.current_term,
                    success: false,
                    conflict_index: None,
                    last_log_index: self.log.last_index(),
                });
            }
            self.follow(&mut core, request.term, request.server_id, "append entries from leader")?;
            (core.current_term, core.commit_index)
        };
        if !from_cache {
            self.timer.reset();
        }

        let prev = request.prev_log_id;
        let last = self.log.last_index();
        if prev.index > last {
            obs_count!(self.meter, "raft_append_rejected", &[], 1);
            return Ok(AppendEntriesResponse {
                term,
                success: false,
                conflict_index: Some(last),
                last_log_index: last,
            });
        }

        let snapshot_index = self.log.snapshot_id().index;
        if prev.index > snapshot_index {
            let local = self.log.term_at(prev.index).await?;
            if local != Some(prev.term) {
                let hint = self.conflict_hint(prev.index, local).await?;
                tracing::debug!(
                    group = %self.id.group_id,
                    prev = %prev,
                    local_term = ?local,
                    hint = %hint,
                    "Append rejected on log mismatch"
                );
                obs_count!(self.meter, "raft_append_rejected", &[], 1);
                return Ok(AppendEntriesResponse {
                    term,
                    success: false,
                    conflict_index: Some(hint),
                    last_log_index: self.log.last_index(),
                });
            }
        }

        let count = request.entries.len() as u64;
        if count > 0 {
            self.log
                .append_from_leader(request.entries, commit)
                .await
                .map_err(|e| self.fatal_check(e))?;
            self.last_index_tx.send_replace(self.log.last_index());
        }

        let last_new = LogIndex(prev.index.0 + count);
        {
            let mut core = self.core.lock();
            if core.current_term == term {
                let target = std::cmp::min(request.committed_index, last_new);
                self.set_commit_index(&mut core, target);
            }
        }

        Ok(AppendEntriesResponse {
            term,
            success: true,
            conflict_index: None,
            last_log_index: self.log.last_index(),
        })
    }

    /// Last index that may still match the leader: just before the first
    /// local entry of the conflicting term.
    async fn conflict_hint(&self, index: LogIndex, local_term: Option<Term>) -> Result<LogIndex> {
        let floor = self.log.snapshot_id().index;
        let mut hint = LogIndex(index.0 - 1);
        if let Some(term) = local_term {
            while hint > floor && self.log.term_at(hint).await? == Some(term) {
                hint = LogIndex(hint.0 - 1);
            }
        }
        Ok(hint)
    }
}
