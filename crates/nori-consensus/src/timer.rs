//! Election timer.
//!
//! Fires after a randomized election timeout unless reset first. Resets
//! come from heartbeats and granted votes. A `TimeoutNow` from a leader
//! that is handing over goes through the same channel, so the election
//! loop has one place to listen.

use crate::config::RaftConfig;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;

/// Why an election should start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionTrigger {
    /// No leader contact within the election timeout.
    Timeout,
    /// The leader asked this node to take over. Skips pre-vote and the
    /// follower lease check.
    TimeoutNow,
}

pub struct ElectionTimer {
    config: RaftConfig,
    reset_notify: Notify,
    shutdown_notify: Notify,
    trigger_tx: mpsc::Sender<ElectionTrigger>,
}

impl ElectionTimer {
    pub fn new(config: RaftConfig, trigger_tx: mpsc::Sender<ElectionTrigger>) -> Self {
        Self {
            config,
            reset_notify: Notify::new(),
            shutdown_notify: Notify::new(),
            trigger_tx,
        }
    }

    /// Restart the countdown with a fresh random timeout.
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    /// Ask for an immediate election.
    pub fn trigger_now(&self) {
        // A full channel already holds a pending trigger.
        let _ = self.trigger_tx.try_send(ElectionTrigger::TimeoutNow);
    }

    /// Timer loop; spawn as a background task.
    pub async fn run(self: Arc<Self>) {
        loop {
            let timeout = self.config.random_election_timeout();
            tokio::select! {
                _ = sleep(timeout) => {
                    match self.trigger_tx.try_send(ElectionTrigger::Timeout) {
                        Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                _ = self.reset_notify.notified() => continue,
                _ = self.shutdown_notify.notified() => break,
            }
        }
    }
}
