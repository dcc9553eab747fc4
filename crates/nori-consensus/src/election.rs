//! Leader election.
//!
//! A follower whose election timer fired first checks its follower lease:
//! while the last leader may still be alive it does nothing. Otherwise it
//! becomes CANDIDATE and runs a pre-vote round at `term + 1` without
//! touching its term. Only a pre-vote quorum leads to the real vote, which
//! increments the term. A `TimeoutNow` from the leader skips both the lease
//! check and the pre-vote.

use futures::stream::{FuturesUnordered, StreamExt};
use nori_observe::{obs_count, RaftKind};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::state::{hash_u32, LeaderState, Progress, RaftState};
use crate::timer::ElectionTrigger;
use crate::types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    Won { term: Term, votes: usize },
    /// Higher term seen, or the node left the candidate role meanwhile.
    Lost { current_term: Term },
    /// Not enough votes.
    NoQuorum,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    PreVote,
    Vote,
}

impl RaftState {
    pub(crate) async fn run_election_loop(
        self: Arc<Self>,
        mut triggers: mpsc::Receiver<ElectionTrigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                trigger = triggers.recv() => {
                    let Some(trigger) = trigger else { break };
                    match self.run_election(trigger).await {
                        Ok(outcome) => tracing::trace!(group = %self.id.group_id, ?outcome, "Election finished"),
                        Err(e) => tracing::warn!(group = %self.id.group_id, error = %e, "Election failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    pub(crate) async fn run_election(self: &Arc<Self>, trigger: ElectionTrigger) -> Result<ElectionOutcome> {
        let term = {
            let mut core = self.core.lock();
            if core.state != NodeState::Follower {
                return Ok(ElectionOutcome::Skipped);
            }
            let (_, conf) = self.log.current_configuration();
            if !conf.peers.contains(&self.me()) || self.me().is_witness() {
                return Ok(ElectionOutcome::Skipped);
            }
            if trigger == ElectionTrigger::Timeout && !core.follower_lease.expired() {
                tracing::trace!(group = %self.id.group_id, "Leader lease still held, not campaigning");
                return Ok(ElectionOutcome::Skipped);
            }
            core.state = NodeState::Candidate;
            core.leader_id = None;
            self.publish_role(&core);
            core.current_term
        };

        if trigger == ElectionTrigger::Timeout {
            match self.collect_votes(Round::PreVote, term).await? {
                ElectionOutcome::Won { .. } => {}
                outcome => {
                    self.abandon_candidacy(term);
                    return Ok(outcome);
                }
            }
        }

        let term = {
            let mut core = self.core.lock();
            if core.state != NodeState::Candidate || core.current_term != term {
                return Ok(ElectionOutcome::Lost {
                    current_term: core.current_term,
                });
            }
            core.current_term = term.next();
            core.voted_for = Some(self.me());
            self.save_hard_state(&mut core)?;
            self.publish_role(&core);
            core.current_term
        };
        self.timer.reset();
        tracing::info!(group = %self.id.group_id, node = %self.me(), term = %term, ?trigger, "Starting election");

        let outcome = self.collect_votes(Round::Vote, term).await?;
        match outcome {
            ElectionOutcome::Won { .. } => self.become_leader(term).await?,
            _ => self.abandon_candidacy(term),
        }
        Ok(outcome)
    }

    fn abandon_candidacy(&self, term: Term) {
        let mut core = self.core.lock();
        if core.state == NodeState::Candidate && core.current_term == term {
            core.state = NodeState::Follower;
            self.publish_role(&core);
        }
    }

    /// One round of (pre-)vote requests. `term` is the candidate's term
    /// for a real vote and its current term for a pre-vote.
    async fn collect_votes(self: &Arc<Self>, round: Round, term: Term) -> Result<ElectionOutcome> {
        let (_, conf) = self.log.current_configuration();
        let last_log_id = self.log.last_log_id();
        let request_term = match round {
            Round::PreVote => term.next(),
            Round::Vote => term,
        };

        let mut votes = HashSet::from([self.me()]);
        if conf.has_quorum(&votes) {
            return Ok(ElectionOutcome::Won { term, votes: 1 });
        }

        let mut calls = FuturesUnordered::new();
        for peer in conf.all_peers().into_iter().filter(|p| *p != self.me()) {
            let request = RequestVoteRequest {
                group_id: self.id.group_id.clone(),
                server_id: self.me(),
                peer_id: peer,
                term: request_term,
                last_log_id,
            };
            let state = self.clone();
            calls.push(async move {
                let deadline = state.config.rpc_timeout;
                let result = match round {
                    Round::PreVote => state.transport.pre_vote(&peer, request, deadline).await,
                    Round::Vote => state.transport.request_vote(&peer, request, deadline).await,
                };
                (peer, result)
            });
            if round == Round::Vote {
                self.emit(term, RaftKind::VoteReq { from: hash_u32(&self.me()) });
            }
        }

        while let Some((peer, result)) = calls.next().await {
            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(group = %self.id.group_id, peer = %peer, ?round, error = %e, "Vote request failed");
                    continue;
                }
            };
            {
                let mut core = self.core.lock();
                if response.term > core.current_term {
                    self.step_down(&mut core, response.term, "higher term in vote response");
                    return Ok(ElectionOutcome::Lost {
                        current_term: core.current_term,
                    });
                }
                if core.state != NodeState::Candidate || core.current_term != term {
                    return Ok(ElectionOutcome::Lost {
                        current_term: core.current_term,
                    });
                }
            }
            if response.granted {
                votes.insert(peer);
                if conf.has_quorum(&votes) {
                    return Ok(ElectionOutcome::Won {
                        term,
                        votes: votes.len(),
                    });
                }
            }
        }

        tracing::debug!(group = %self.id.group_id, term = %term, ?round, votes = votes.len(), "No quorum");
        Ok(ElectionOutcome::NoQuorum)
    }

    pub(crate) async fn become_leader(self: &Arc<Self>, term: Term) -> Result<()> {
        {
            let mut core = self.core.lock();
            if core.state != NodeState::Candidate || core.current_term != term {
                return Ok(());
            }
            core.state = NodeState::Leader;
            core.leader_id = Some(self.me());
            core.leader_lease.on_leader_start(term);
            core.follower_lease.reset();
            core.leader = Some(LeaderState {
                progress: Default::default(),
                replicators: Default::default(),
            });
            self.publish_role(&core);
        }
        tracing::info!(group = %self.id.group_id, node = %self.me(), term = %term, "Became leader");
        self.emit(term, RaftKind::LeaderElected { node: hash_u32(&self.me()) });
        obs_count!(self.meter, "raft_elections_won", &[], 1);

        // Commit an entry of our own term right away; it also carries the
        // current membership so followers converge on it.
        let (_, conf) = self.log.current_configuration();
        self.sync_replicators(term, &conf);
        self.append_as_leader(vec![EntryPayload::Configuration(conf)], true)
            .await?;
        self.fsm.on_leader_start(term).await;
        Ok(())
    }

    /// Start replicators for every peer in `conf` and stop the rest.
    pub(crate) fn sync_replicators(self: &Arc<Self>, term: Term, conf: &ConfigurationEntry) {
        let next = self.log.last_index().next();
        let mut core = self.core.lock();
        if !core.state.is_leader() || core.current_term != term {
            return;
        }
        let Some(leader) = core.leader.as_mut() else {
            return;
        };
        let wanted: HashSet<PeerAddress> = conf
            .all_peers()
            .into_iter()
            .filter(|p| *p != self.id.peer_id)
            .collect();

        leader.replicators.retain(|peer, _| wanted.contains(peer));
        leader.progress.retain(|peer, _| wanted.contains(peer));
        for peer in wanted {
            if leader.replicators.contains_key(&peer) {
                continue;
            }
            leader.progress.insert(peer, Progress::new(next));
            let (stop_tx, stop_rx) = watch::channel(false);
            leader.replicators.insert(peer, stop_tx);
            tokio::spawn(self.clone().run_replicator(peer, term, stop_rx));
        }
    }
}
