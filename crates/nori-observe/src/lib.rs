//! nori-observe: vendor-neutral observability ABI for the consensus core.
//!
//! Core crates depend only on these traits and event types. Backends
//! (Prometheus, OTLP, a live visualiser) live elsewhere and implement `Meter`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: VizEvent);
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
struct NoopH;
impl Histogram for NoopH {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, _e: VizEvent) {}
}

/// In-process meter that keeps counter totals and every emitted event.
///
/// Meant for tests and debugging tools that want to assert on what a node
/// reported without standing up a metrics backend.
#[derive(Clone, Default)]
pub struct MemoryMeter {
    counters: Arc<Mutex<HashMap<&'static str, u64>>>,
    gauges: Arc<Mutex<HashMap<&'static str, i64>>>,
    events: Arc<Mutex<Vec<VizEvent>>>,
}

impl MemoryMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total of all increments recorded under `name` (labels are folded).
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<i64> {
        self.gauges.lock().ok().and_then(|g| g.get(name).copied())
    }

    pub fn events(&self) -> Vec<VizEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

struct MemC {
    name: &'static str,
    counters: Arc<Mutex<HashMap<&'static str, u64>>>,
}
impl Counter for MemC {
    fn inc(&self, v: u64) {
        if let Ok(mut c) = self.counters.lock() {
            *c.entry(self.name).or_insert(0) += v;
        }
    }
}
struct MemG {
    name: &'static str,
    gauges: Arc<Mutex<HashMap<&'static str, i64>>>,
}
impl Gauge for MemG {
    fn set(&self, v: i64) {
        if let Ok(mut g) = self.gauges.lock() {
            g.insert(self.name, v);
        }
    }
}

impl Meter for MemoryMeter {
    fn counter(
        &self,
        name: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(MemC {
            name,
            counters: self.counters.clone(),
        })
    }
    fn gauge(
        &self,
        name: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(MemG {
            name,
            gauges: self.gauges.clone(),
        })
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, e: VizEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(e);
        }
    }
}

/// Typed events for live visualization (payloads never included).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum VizEvent {
    Raft(RaftEvt),
    Snapshot(SnapshotEvt),
}

#[derive(Clone, Debug)]
pub struct RaftEvt {
    /// Hash of the consensus group id.
    pub group: u32,
    pub term: u64,
    pub kind: RaftKind,
}
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RaftKind {
    VoteReq { from: u32 },
    VoteGranted { from: u32 },
    LeaderElected { node: u32 },
    StepDown,
    TransferLeadership { to: u32 },
    ConfigurationChanged { voters: usize },
    Error,
}

#[derive(Clone, Debug)]
pub struct SnapshotEvt {
    pub group: u32,
    pub kind: SnapshotKind,
}
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SnapshotKind {
    Saved { index: u64 },
    InstallStart { index: u64 },
    Installed { index: u64, bytes: u64 },
    InstallRejectedBusy,
    ChunkThrottled,
}

/// Macros (simple versions). Can be feature-gated if desired.
#[macro_export]
macro_rules! obs_count {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.counter($name, $labels).inc($v as u64);
    }};
}
#[macro_export]
macro_rules! obs_gauge {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.gauge($name, $labels).set($v as i64);
    }};
}
#[macro_export]
macro_rules! obs_hist {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.histo($name, &[], $labels).observe($v as f64);
    }};
}
