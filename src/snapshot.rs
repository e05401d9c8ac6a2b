//! Immutable point-in-time view of a trace, built against a chosen capture
//! instant without halting the trace thread.

use crate::metric::Snapshot as MetricSnapshot;
use crate::trace::{Trace, TraceAttribute};

/// A trace's state as of `capture_tick`, ready for serialization.
///
/// `duration`/`completed` are normalized to `capture_tick` rather than read
/// straight off the trace: a still-running trace gets a coherent,
/// monotonically-growing duration without any lock on the writer.
#[derive(Debug, Clone)]
pub struct TraceSnapshot {
    pub id: String,
    pub start_wall_ms: u64,
    pub stuck: bool,
    pub error: bool,
    pub duration_ticks: u64,
    pub completed: bool,
    pub description: String,
    pub username: Option<String>,
    pub attributes: Vec<TraceAttribute>,
    pub metrics: Vec<MetricSnapshot>,
    pub capture_tick: u64,
    pub start_tick: u64,
    pub include_detail: bool,
}

impl TraceSnapshot {
    /// Build a snapshot of `trace` as of `capture_tick`.
    pub fn from(trace: &Trace, capture_tick: u64, include_detail: bool) -> TraceSnapshot {
        let end_tick = trace.end_tick();
        let (duration_ticks, completed) = if trace.is_completed() && end_tick <= capture_tick {
            (end_tick - trace.start_tick(), true)
        } else {
            (capture_tick.saturating_sub(trace.start_tick()), false)
        };

        let description = trace
            .root_span()
            .root()
            .map(|root| root.message_supplier().get().text().to_string())
            .unwrap_or_default();

        let mut metrics = trace.metric_snapshots();
        crate::metric::sort_snapshots(&mut metrics);

        TraceSnapshot {
            id: trace.id().to_string(),
            start_wall_ms: trace.start_wall_ms(),
            stuck: trace.is_stuck() && !completed,
            error: trace.is_error(),
            duration_ticks,
            completed,
            description,
            username: trace.username(),
            attributes: trace.attributes(),
            metrics,
            capture_tick,
            start_tick: trace.start_tick(),
            include_detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, FixedTicker};
    use crate::message::text;
    use crate::metric::{metric, MetricName};

    fn trace_with(ticker: &FixedTicker) -> Trace {
        let clock = FixedClock::new(1_700_000_000_000);
        let m = metric(&MetricName::new("snapshot-test-metric"));
        Trace::new(&clock, ticker, text("root"), m, None)
    }

    #[test]
    fn just_started_trace_snapshot_at_start_tick() {
        let ticker = FixedTicker::new(1000);
        let trace = trace_with(&ticker);
        let snap = TraceSnapshot::from(&trace, 1000, true);
        assert_eq!(snap.duration_ticks, 0);
        assert!(!snap.completed);
    }

    #[test]
    fn live_snapshot_normalizes_duration_to_capture_tick() {
        let ticker = FixedTicker::new(1000);
        let trace = trace_with(&ticker);
        let snap = TraceSnapshot::from(&trace, 1250, true);
        assert!(!snap.completed);
        assert_eq!(snap.duration_ticks, 250);
    }

    #[test]
    fn completed_trace_snapshot_is_stable_across_later_capture_ticks() {
        let ticker = FixedTicker::new(1000);
        let trace = trace_with(&ticker);
        let root = trace.root_span().root().unwrap();
        trace.pop_span(&root, 1400, false);

        let first = TraceSnapshot::from(&trace, 1400, false);
        let later = TraceSnapshot::from(&trace, 9_000, false);
        assert_eq!(first.duration_ticks, later.duration_ticks);
        assert_eq!(first.completed, later.completed);
        assert!(first.completed);
    }

    #[test]
    fn stuck_is_suppressed_once_completed() {
        let ticker = FixedTicker::new(1000);
        let trace = trace_with(&ticker);
        trace.set_stuck();
        let root = trace.root_span().root().unwrap();
        trace.pop_span(&root, 1100, false);
        let snap = TraceSnapshot::from(&trace, 1100, false);
        assert!(!snap.stuck);
    }

    #[test]
    fn trace_started_and_completed_at_tick_zero_is_not_reported_as_still_running() {
        let ticker = FixedTicker::new(0);
        let trace = trace_with(&ticker);
        let root = trace.root_span().root().unwrap();
        trace.pop_span(&root, 0, false);
        let snap = TraceSnapshot::from(&trace, 0, false);
        assert!(snap.completed);
        assert_eq!(snap.duration_ticks, 0);
    }
}
