//! Leader and follower leases.
//!
//! The leader lease lets a leader answer linearizable reads locally while a
//! quorum acknowledged it recently. The follower lease is the mirror image:
//! a follower that heard from a live leader recently refuses to help a
//! competing candidate, which keeps a flapping peer from disrupting a
//! healthy group.
//!
//! ```text
//! on_leader_start(term)          epoch += 1, last_active = None  -> NOT_READY
//! quorum ack (epoch, t)          last_active = t                  -> VALID
//! now >= t + lease_timeout                                        -> SUSPECT
//! on_leader_stop()                                                -> EXPIRED
//! ```
//!
//! A confirmation carries the epoch it was issued under. Confirmations from
//! an older epoch are discarded, so a delayed ack from a previous reign can
//! never revive a lease.

use crate::clock::Clock;
use crate::types::{PeerAddress, Term};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lease state as seen by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Leases are turned off in the configuration.
    Disabled,
    /// Not leader.
    Expired,
    /// Leader, but no quorum acknowledgement yet in this term.
    NotReady,
    /// Reads can be served locally.
    Valid,
    /// Still leader, but the window elapsed: confirm with a quorum first.
    Suspect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseInfo {
    pub state: LeaseState,
    pub term: Term,
    pub lease_epoch: u64,
}

pub struct LeaderLease {
    enabled: bool,
    lease_epoch: u64,
    term: Term,
    last_active: Option<Instant>,
    lease_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl LeaderLease {
    pub fn new(enabled: bool, lease_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            enabled,
            lease_epoch: 0,
            term: Term::ZERO,
            last_active: None,
            lease_timeout,
            clock,
        }
    }

    /// Must run exactly once per won election, before client traffic.
    pub fn on_leader_start(&mut self, term: Term) {
        self.lease_epoch += 1;
        self.term = term;
        self.last_active = None;
    }

    pub fn on_leader_stop(&mut self) {
        self.term = Term::ZERO;
        self.last_active = None;
    }

    /// Record a quorum acknowledgement observed at `last_active`.
    ///
    /// Returns false (and changes nothing) when `expect_epoch` is stale.
    pub fn on_lease_start(&mut self, expect_epoch: u64, last_active: Instant) -> bool {
        if !self.enabled || self.term == Term::ZERO || expect_epoch != self.lease_epoch {
            return false;
        }
        if self.last_active.map_or(true, |prev| last_active > prev) {
            self.last_active = Some(last_active);
        }
        true
    }

    pub fn lease_epoch(&self) -> u64 {
        self.lease_epoch
    }

    pub fn get_lease_info(&self) -> LeaseInfo {
        let state = if !self.enabled {
            LeaseState::Disabled
        } else if self.term == Term::ZERO {
            LeaseState::Expired
        } else {
            match self.last_active {
                None => LeaseState::NotReady,
                Some(ts) if self.clock.now() < ts + self.lease_timeout => LeaseState::Valid,
                Some(_) => LeaseState::Suspect,
            }
        };
        LeaseInfo {
            state,
            term: self.term,
            lease_epoch: self.lease_epoch,
        }
    }
}

pub struct FollowerLease {
    enabled: bool,
    last_leader: Option<PeerAddress>,
    last_leader_timestamp: Option<Instant>,
    election_timeout: Duration,
    max_clock_drift: Duration,
    clock: Arc<dyn Clock>,
}

impl FollowerLease {
    pub fn new(
        enabled: bool,
        election_timeout: Duration,
        max_clock_drift: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            enabled,
            last_leader: None,
            last_leader_timestamp: None,
            election_timeout,
            max_clock_drift,
            clock,
        }
    }

    /// Valid heartbeat from the current leader.
    pub fn renew(&mut self, leader: PeerAddress) {
        self.last_leader = Some(leader);
        self.last_leader_timestamp = Some(self.clock.now());
    }

    /// Zero when a vote may be granted now.
    pub fn votable_time_from_now(&self) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        match self.last_leader_timestamp {
            None => Duration::ZERO,
            Some(ts) => {
                let votable_at = ts + self.election_timeout + self.max_clock_drift;
                votable_at.saturating_duration_since(self.clock.now())
            }
        }
    }

    pub fn expired(&self) -> bool {
        self.votable_time_from_now().is_zero()
    }

    /// Forget the leader entirely (new leadership observed).
    pub fn reset(&mut self) {
        self.last_leader = None;
        self.last_leader_timestamp = None;
    }

    /// Keep the leader but make the lease votable immediately.
    pub fn expire(&mut self) {
        self.last_leader_timestamp = None;
    }

    pub fn last_leader(&self) -> Option<PeerAddress> {
        self.last_leader
    }
}
