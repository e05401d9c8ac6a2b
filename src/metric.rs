//! Named timers: [`MetricName`] identifies one, [`Metric`] is the
//! process-wide, thread-local-backed timer state, [`TraceMetric`] is its
//! per-trace aggregate, and [`Snapshot`] is an immutable copy for
//! serialization.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

/// Identity of a named timer, registered once per plugin advice point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricName {
    display_name: String,
}

impl MetricName {
    /// Intern a metric name, creating a new identity the first time a name
    /// is seen in this process.
    pub fn new(display_name: impl Into<String>) -> MetricName {
        MetricName {
            display_name: display_name.into(),
        }
    }

    /// The name shown in aggregated metric output.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }
}

/// Process-wide registry of [`Metric`]s keyed by advice identity (the
/// metric's display name). Populated lazily and never removed during the
/// process lifetime, since a plugin expects its metric handle to stay
/// valid for as long as the process runs.
static REGISTRY: Lazy<DashMap<String, Arc<Metric>>> = Lazy::new(DashMap::new);

/// Look up (or create) the process-wide [`Metric`] for `name`. Plugins call
/// this once per advice point and reuse the returned handle.
pub fn metric(name: &MetricName) -> Arc<Metric> {
    if let Some(existing) = REGISTRY.get(name.display_name()) {
        return existing.clone();
    }
    REGISTRY
        .entry(name.display_name().to_string())
        .or_insert_with(|| Arc::new(Metric::new(name.clone())))
        .clone()
}

/// Process-wide timer state for one [`MetricName`]. Holds one
/// [`TraceMetric`] per thread that has started this metric, so a single
/// `Metric` is reused across traces on the same thread until that thread's
/// trace resets it.
#[derive(Debug)]
pub struct Metric {
    name: MetricName,
    per_thread: DashMap<ThreadId, Arc<TraceMetric>>,
}

impl Metric {
    fn new(name: MetricName) -> Self {
        Metric {
            name,
            per_thread: DashMap::new(),
        }
    }

    /// This metric's identity.
    pub fn name(&self) -> &MetricName {
        &self.name
    }

    /// Start (or re-enter) this metric's timer on the calling thread,
    /// returning that thread's [`TraceMetric`]. Re-entrant: nested calls on
    /// the same thread increment a depth counter without restarting the
    /// clock.
    pub fn start_internal(&self, tick: u64) -> Arc<TraceMetric> {
        let tid = std::thread::current().id();
        let trace_metric = self
            .per_thread
            .entry(tid)
            .or_insert_with(|| Arc::new(TraceMetric::new(self.name.clone())))
            .clone();
        trace_metric.start(tick);
        trace_metric
    }

    /// Clear this thread's [`TraceMetric`], called by the trace thread when
    /// its trace completes so the next trace on this thread starts fresh.
    pub fn reset_thread_local(&self) {
        let tid = std::thread::current().id();
        self.per_thread.remove(&tid);
    }
}

/// Aggregated per-metric timing within one trace: total/min/max/count plus
/// re-entrant timer state.
///
/// Writes happen only on the owning trace thread; reads (via [`snapshot`])
/// may happen concurrently from any thread serializing a snapshot, so every
/// field is an atomic and a `Snapshot` packages them into one immutable
/// read rather than letting a reader observe a torn mix of old and new
/// values across fields.
///
/// [`snapshot`]: TraceMetric::snapshot
#[derive(Debug)]
pub struct TraceMetric {
    name: MetricName,
    total: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    count: AtomicU64,
    self_nesting_level: AtomicU32,
    current_start_tick: AtomicU64,
    first_start_seen: AtomicBool,
}

impl TraceMetric {
    fn new(name: MetricName) -> Self {
        TraceMetric {
            name,
            total: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            count: AtomicU64::new(0),
            self_nesting_level: AtomicU32::new(0),
            current_start_tick: AtomicU64::new(0),
            first_start_seen: AtomicBool::new(false),
        }
    }

    /// Start (outermost) or re-enter (nested) this timer.
    fn start(&self, tick: u64) {
        let previous = self.self_nesting_level.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            self.current_start_tick.store(tick, Ordering::SeqCst);
        }
    }

    /// Stop one level of nesting; the outermost stop records a duration.
    pub fn stop(&self, end_tick: u64) {
        let previous = self.self_nesting_level.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 {
            let start = self.current_start_tick.load(Ordering::SeqCst);
            let duration = end_tick.saturating_sub(start);
            self.total.fetch_add(duration, Ordering::SeqCst);
            self.count.fetch_add(1, Ordering::SeqCst);
            self.min.fetch_min(duration, Ordering::SeqCst);
            self.max.fetch_max(duration, Ordering::SeqCst);
        }
    }

    /// True until [`firstStartSeen`](TraceMetric::first_start_seen) is
    /// first called.
    pub fn is_first_start(&self) -> bool {
        !self.first_start_seen.load(Ordering::SeqCst)
    }

    /// Clear the first-start flag, returning whether this call observed it
    /// still set (i.e. this was in fact the first start).
    pub fn first_start_seen(&self) -> bool {
        !self.first_start_seen.swap(true, Ordering::SeqCst)
    }

    /// Current re-entrant depth; `0` outside of any active start/stop pair.
    pub fn self_nesting_level(&self) -> u32 {
        self.self_nesting_level.load(Ordering::SeqCst)
    }

    /// Package the current aggregate state into an immutable [`Snapshot`].
    pub fn snapshot(&self) -> Snapshot {
        let count = self.count.load(Ordering::SeqCst);
        Snapshot {
            name: self.name.display_name().to_string(),
            total: self.total.load(Ordering::SeqCst),
            min: if count == 0 {
                0
            } else {
                self.min.load(Ordering::SeqCst)
            },
            max: self.max.load(Ordering::SeqCst),
            count,
        }
    }
}

/// Immutable total/min/max/count for one metric within one trace, ready for
/// serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub name: String,
    pub total: u64,
    pub min: u64,
    pub max: u64,
    pub count: u64,
}

/// Sort metric snapshots by total descending, then by name ascending so
/// equal-total metrics still come out in a deterministic order.
pub fn sort_snapshots(snapshots: &mut [Snapshot]) {
    snapshots.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_timer_only_records_outermost_duration() {
        let tm = TraceMetric::new(MetricName::new("M"));
        tm.start(100); // depth 1
        tm.start(150); // depth 2, does not restart the clock
        tm.stop(200); // depth 1
        assert_eq!(tm.self_nesting_level(), 1);
        tm.stop(300); // depth 0, records 300 - 100 = 200
        assert_eq!(tm.self_nesting_level(), 0);
        let snap = tm.snapshot();
        assert_eq!(snap.total, 200);
        assert_eq!(snap.count, 1);
        assert_eq!(snap.min, 200);
        assert_eq!(snap.max, 200);
    }

    #[test]
    fn first_start_flag_clears_exactly_once() {
        let tm = TraceMetric::new(MetricName::new("M"));
        assert!(tm.is_first_start());
        assert!(tm.first_start_seen());
        assert!(!tm.is_first_start());
        assert!(!tm.first_start_seen());
    }

    #[test]
    fn min_max_track_across_multiple_starts() {
        let tm = TraceMetric::new(MetricName::new("M"));
        tm.start(0);
        tm.stop(50);
        tm.start(100);
        tm.stop(110);
        let snap = tm.snapshot();
        assert_eq!(snap.count, 2);
        assert_eq!(snap.total, 60);
        assert_eq!(snap.min, 10);
        assert_eq!(snap.max, 50);
    }

    #[test]
    fn metric_registry_reuses_same_metric_by_name() {
        let a = metric(&MetricName::new("unique-test-metric-x"));
        let b = metric(&MetricName::new("unique-test-metric-x"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn reset_thread_local_starts_a_fresh_trace_metric() {
        let m = Metric::new(MetricName::new("reset-test"));
        let first = m.start_internal(0);
        first.stop(10);
        m.reset_thread_local();
        let second = m.start_internal(0);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.snapshot().count, 0);
    }

    #[test]
    fn sort_snapshots_breaks_ties_by_name() {
        let mut snaps = vec![
            Snapshot {
                name: "b".into(),
                total: 10,
                min: 1,
                max: 1,
                count: 1,
            },
            Snapshot {
                name: "a".into(),
                total: 10,
                min: 1,
                max: 1,
                count: 1,
            },
            Snapshot {
                name: "c".into(),
                total: 20,
                min: 1,
                max: 1,
                count: 1,
            },
        ];
        sort_snapshots(&mut snaps);
        let names: Vec<_> = snaps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
    }
}
