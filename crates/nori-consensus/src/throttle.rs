//! Snapshot install throttling.
//!
//! One throttle is shared by every follower installing a snapshot onto the
//! same disk. It bounds two things: bytes per second pulled through the
//! copier, and the number of installs running at once. Leaders serving
//! snapshot reads are never counted.
//!
//! Throughput is handed out in `check_cycle` slices per second. Every slice
//! starts on a boundary aligned to the throttle's creation time, so the
//! bytes granted inside one slice never exceed `limit / check_cycle`.

use crate::clock::Clock;
use crate::config::ThrottleConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait SnapshotThrottle: Send + Sync {
    /// Bytes the caller may transfer now. May be less than requested, or 0.
    fn throttled_by_throughput(&self, bytes: u64) -> u64;

    /// Admit one more install task. Leaders always succeed.
    fn add_one_more_task(&self, is_leader: bool) -> bool;

    fn finish_one_task(&self, is_leader: bool);

    /// Give back budget that was acquired `elapsed` ago but never used.
    /// Ignored when the budget came from an earlier cycle.
    fn return_unused_throughput(&self, acquired: u64, consumed: u64, elapsed: Duration);

    /// How long a caller that was granted 0 bytes should wait.
    fn retry_interval(&self) -> Duration;
}

struct ThrottleInner {
    cur_throughput_bytes: u64,
    last_check: Instant,
    task_num: u32,
}

pub struct ThroughputSnapshotThrottle {
    limit_per_cycle: u64,
    cycle: Duration,
    max_tasks: u32,
    base: Instant,
    clock: Arc<dyn Clock>,
    inner: Mutex<ThrottleInner>,
}

impl ThroughputSnapshotThrottle {
    pub fn new(
        throughput_bytes_per_sec: u64,
        min_throughput_bytes_per_sec: u64,
        check_cycle: u32,
        max_tasks: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let check_cycle = check_cycle.max(1);
        let limit = throughput_bytes_per_sec.max(min_throughput_bytes_per_sec);
        let base = clock.now();
        Self {
            limit_per_cycle: limit / check_cycle as u64,
            cycle: Duration::from_secs(1) / check_cycle,
            max_tasks,
            base,
            clock,
            inner: Mutex::new(ThrottleInner {
                cur_throughput_bytes: 0,
                last_check: base,
                task_num: 0,
            }),
        }
    }

    pub fn from_config(config: &ThrottleConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.throughput_bytes_per_sec,
            config.min_throughput_bytes_per_sec,
            config.check_cycle,
            config.max_install_snapshot_tasks,
            clock,
        )
    }

    /// `None` when throttling is switched off.
    pub fn build(config: &ThrottleConfig, clock: Arc<dyn Clock>) -> Option<Arc<dyn SnapshotThrottle>> {
        if !config.enabled {
            return None;
        }
        Some(Arc::new(Self::from_config(config, clock)))
    }

    pub fn limit_per_cycle(&self) -> u64 {
        self.limit_per_cycle
    }

    pub fn task_num(&self) -> u32 {
        self.inner.lock().task_num
    }

    /// Start of the cycle containing `now`.
    fn align(&self, now: Instant) -> Instant {
        let since = now.saturating_duration_since(self.base).as_nanos();
        let cycle = self.cycle.as_nanos().max(1);
        let aligned = since - since % cycle;
        self.base + Duration::from_nanos(aligned as u64)
    }
}

impl SnapshotThrottle for ThroughputSnapshotThrottle {
    fn throttled_by_throughput(&self, bytes: u64) -> u64 {
        let now = self.clock.now();
        let limit_per_cycle = self.limit_per_cycle;
        let mut inner = self.inner.lock();
        let in_current_cycle = now.saturating_duration_since(inner.last_check) < self.cycle;

        if inner.cur_throughput_bytes.saturating_add(bytes) > limit_per_cycle {
            if in_current_cycle {
                // Use up what is left of this cycle.
                let available = limit_per_cycle.saturating_sub(inner.cur_throughput_bytes);
                inner.cur_throughput_bytes = limit_per_cycle;
                available
            } else {
                let available = bytes.min(limit_per_cycle);
                inner.cur_throughput_bytes = available;
                inner.last_check = self.align(now);
                available
            }
        } else {
            if !in_current_cycle {
                inner.cur_throughput_bytes = 0;
                inner.last_check = self.align(now);
            }
            inner.cur_throughput_bytes += bytes;
            bytes
        }
    }

    fn add_one_more_task(&self, is_leader: bool) -> bool {
        if is_leader {
            return true;
        }
        let mut inner = self.inner.lock();
        if inner.task_num >= self.max_tasks {
            tracing::warn!(
                tasks = inner.task_num,
                max = self.max_tasks,
                "Too many concurrent snapshot installs"
            );
            return false;
        }
        inner.task_num += 1;
        true
    }

    fn finish_one_task(&self, is_leader: bool) {
        if is_leader {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.task_num == 0 {
            tracing::error!("finish_one_task called with no task running");
            return;
        }
        inner.task_num -= 1;
    }

    fn return_unused_throughput(&self, acquired: u64, consumed: u64, elapsed: Duration) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let acquired_at = match now.checked_sub(elapsed) {
            Some(t) => t,
            None => return,
        };
        if acquired_at < inner.last_check {
            // acquired in an earlier cycle
            return;
        }
        let unused = acquired.saturating_sub(consumed);
        inner.cur_throughput_bytes = inner.cur_throughput_bytes.saturating_sub(unused);
    }

    fn retry_interval(&self) -> Duration {
        self.cycle + Duration::from_millis(1)
    }
}

/// One admitted install task. The slot is released when the guard drops,
/// whichever way the install ends.
pub struct ThrottleTask {
    throttle: Arc<dyn SnapshotThrottle>,
    is_leader: bool,
}

impl ThrottleTask {
    pub fn acquire(throttle: &Arc<dyn SnapshotThrottle>, is_leader: bool) -> Option<Self> {
        if !throttle.add_one_more_task(is_leader) {
            return None;
        }
        Some(Self {
            throttle: throttle.clone(),
            is_leader,
        })
    }
}

impl Drop for ThrottleTask {
    fn drop(&mut self) {
        self.throttle.finish_one_task(self.is_leader);
    }
}
