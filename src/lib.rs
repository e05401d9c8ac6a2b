//! In-process core of an application-performance tracing agent.
//!
//! This crate builds and serializes the live trace object, its merged
//! stack-tree profiler, and the byte-level snapshot encoder. It does not
//! instrument anything itself: a plugin layer (out of scope here) calls
//! into the [`AgentFacade`] trait on every span boundary, and a scheduler
//! (also out of scope) periodically samples stacks via [`trace::StackCapture`]
//! and serializes [`snapshot::TraceSnapshot`]s via [`byte_stream::ByteStream`].
//!
//! See the per-module docs for the pieces: [`clock`] for tick/wall-time
//! sources, [`metric`] for named timers, [`span`] and [`root_span`] for the
//! span tree, [`stack_tree`] for the profiler, [`trace`] for the aggregate
//! object, [`snapshot`] and [`byte_stream`] for serialization, and
//! [`config`]/[`error`] for the ambient configuration and error surfaces.

pub mod byte_stream;
pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod metric;
pub mod root_span;
pub mod snapshot;
pub mod span;
pub mod stack_tree;
pub mod trace;

use clock::{Clock, SystemClock, SystemTicker, Ticker};
use config::SharedConfigSource;
use dashmap::DashMap;
use message::SharedMessageSupplier;
use metric::{MetricName, TraceMetric};
use std::cell::RefCell;
use std::sync::Arc;
use std::thread::ThreadId;
use trace::Trace;

/// Default soft span cap, matching the production default shipped by
/// comparable tracing agents.
pub const DEFAULT_MAX_SPANS: usize = 2000;

thread_local! {
    static CURRENT_TRACE: RefCell<Option<Arc<Trace>>> = const { RefCell::new(None) };
}

/// A span handle returned by the plugin-facing start methods.
///
/// `Dummy` is returned once a trace's soft span cap is reached: it still
/// drives its metric timer so aggregate timings stay correct, but never
/// touches the span tree.
pub enum SpanHandle {
    Real { trace: Arc<Trace>, span: Arc<span::Span> },
    Dummy { trace_metric: Option<Arc<TraceMetric>> },
}

impl SpanHandle {
    /// True if this handle is a non-recording dummy.
    pub fn is_dummy(&self) -> bool {
        matches!(self, SpanHandle::Dummy { .. })
    }
}

/// The plugin-facing API: every method a bytecode-weaving or middleware
/// integration calls into at a span boundary.
pub trait AgentFacade: Send + Sync {
    /// Begin a top-level trace if none is active on the calling thread;
    /// otherwise behaves exactly like [`start_span`](AgentFacade::start_span).
    fn start_trace(&self, message: SharedMessageSupplier, metric_name: &MetricName) -> SpanHandle;

    /// Alias for [`start_trace`](AgentFacade::start_trace); the source
    /// distinguishes foreground/background only at the UI layer, which is
    /// out of scope for this core.
    fn start_background_trace(
        &self,
        message: SharedMessageSupplier,
        metric_name: &MetricName,
    ) -> SpanHandle;

    /// Push a span under the current trace. Returns a dummy once the soft
    /// span cap is reached.
    fn start_span(&self, message: SharedMessageSupplier, metric_name: &MetricName) -> SpanHandle;

    /// A zero-duration leaf under the current trace, subject to the soft
    /// cap.
    fn add_span(&self, message: SharedMessageSupplier);

    /// A zero-duration error leaf; bypasses the soft cap up to the hard
    /// ceiling and does not set the trace-level error latch by itself.
    fn add_error_span(&self, message: SharedMessageSupplier);

    /// Timer-only, re-entrant start against the current trace (or a
    /// trace-less thread-local timer if no trace is active).
    fn start_metric_timer(&self, metric_name: &MetricName) -> Arc<TraceMetric>;

    /// End a handle returned by one of the `start_*` methods.
    fn end_span(&self, handle: SpanHandle, error: bool);

    /// Set the current trace's user id.
    fn set_user_id(&self, id: String);

    /// Replace-on-duplicate attribute write on the current trace.
    fn set_trace_attribute(&self, name: String, value: Option<String>);

    fn get_string(&self, name: &str) -> String;
    fn get_bool(&self, name: &str) -> bool;
    fn get_double(&self, name: &str) -> Option<f64>;
    fn register_config_listener(&self, listener: Box<dyn Fn() + Send + Sync>);
}

/// Reference [`AgentFacade`] implementation: owns the thread-local "current
/// trace" slot and a registry of traces still open on other threads, so a
/// snapshot-serializing reader thread has somewhere to get an [`Arc<Trace>`]
/// from without coordinating with the trace thread.
pub struct Agent {
    clock: Box<dyn Clock>,
    ticker: Box<dyn Ticker>,
    config: SharedConfigSource,
    max_spans: usize,
    active_traces: DashMap<ThreadId, Arc<Trace>>,
}

impl Agent {
    /// Build an agent with the system clock/ticker and the given soft span
    /// cap; the hard ceiling is always `max_spans * 2`.
    pub fn new(max_spans: usize, config: SharedConfigSource) -> Self {
        Agent {
            clock: Box::new(SystemClock::new()),
            ticker: Box::new(SystemTicker::new()),
            config,
            max_spans,
            active_traces: DashMap::new(),
        }
    }

    /// Build an agent against injected clock/ticker, for deterministic
    /// tests.
    pub fn with_clock_and_ticker(
        clock: Box<dyn Clock>,
        ticker: Box<dyn Ticker>,
        max_spans: usize,
        config: SharedConfigSource,
    ) -> Self {
        Agent {
            clock,
            ticker,
            config,
            max_spans,
            active_traces: DashMap::new(),
        }
    }

    fn hard_cap(&self) -> usize {
        self.max_spans * 2
    }

    /// Traces still open on any thread, for a reader to snapshot. A
    /// trace disappears from this list the tick its root span pops.
    pub fn active_traces(&self) -> Vec<Arc<Trace>> {
        self.active_traces.iter().map(|e| e.value().clone()).collect()
    }

    fn current_trace(&self) -> Option<Arc<Trace>> {
        CURRENT_TRACE.with(|cell| cell.borrow().clone())
    }

    fn begin_new_trace(&self, message: SharedMessageSupplier, metric_name: &MetricName) -> SpanHandle {
        let metric = metric::metric(metric_name);
        let trace = Arc::new(Trace::new(
            self.clock.as_ref(),
            self.ticker.as_ref(),
            message,
            metric,
            None,
        ));
        self.active_traces.insert(std::thread::current().id(), trace.clone());
        CURRENT_TRACE.with(|cell| *cell.borrow_mut() = Some(trace.clone()));
        let root = trace
            .root_span()
            .root()
            .expect("Trace::new always pushes a root span");
        SpanHandle::Real { trace, span: root }
    }

    fn complete_if_done(&self, trace: &Arc<Trace>, completed: bool) {
        if !completed {
            return;
        }
        trace.reset_thread_local_metrics();
        self.active_traces.remove(&std::thread::current().id());
        CURRENT_TRACE.with(|cell| {
            let is_this_one = cell
                .borrow()
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, trace));
            if is_this_one {
                *cell.borrow_mut() = None;
            }
        });
    }
}

impl AgentFacade for Agent {
    fn start_trace(&self, message: SharedMessageSupplier, metric_name: &MetricName) -> SpanHandle {
        match self.current_trace() {
            None => self.begin_new_trace(message, metric_name),
            Some(_) => self.start_span(message, metric_name),
        }
    }

    fn start_background_trace(
        &self,
        message: SharedMessageSupplier,
        metric_name: &MetricName,
    ) -> SpanHandle {
        self.start_trace(message, metric_name)
    }

    fn start_span(&self, message: SharedMessageSupplier, metric_name: &MetricName) -> SpanHandle {
        let metric = metric::metric(metric_name);
        match self.current_trace() {
            None => {
                log::warn!("startSpan called with no active trace; starting a top-level trace");
                self.begin_new_trace(message, metric_name)
            }
            Some(trace) => {
                if trace.root_span().len() < self.max_spans {
                    let tick = self.ticker.read();
                    let span = trace.push_span(tick, &metric, message);
                    SpanHandle::Real { trace, span }
                } else {
                    let tick = self.ticker.read();
                    let trace_metric = trace.start_trace_metric(tick, &metric);
                    SpanHandle::Dummy { trace_metric: Some(trace_metric) }
                }
            }
        }
    }

    fn add_span(&self, message: SharedMessageSupplier) {
        let Some(trace) = self.current_trace() else {
            log::warn!("addSpan called with no active trace");
            return;
        };
        if trace.root_span().len() < self.max_spans {
            let tick = self.ticker.read();
            trace.add_span(tick, message, false);
        }
    }

    fn add_error_span(&self, message: SharedMessageSupplier) {
        let Some(trace) = self.current_trace() else {
            log::warn!("addErrorSpan called with no active trace");
            return;
        };
        if trace.root_span().len() < self.hard_cap() {
            let tick = self.ticker.read();
            trace.add_error_span(tick, message);
        }
    }

    fn start_metric_timer(&self, metric_name: &MetricName) -> Arc<TraceMetric> {
        let metric = metric::metric(metric_name);
        let tick = self.ticker.read();
        match self.current_trace() {
            Some(trace) => trace.start_trace_metric(tick, &metric),
            None => metric.start_internal(tick),
        }
    }

    fn end_span(&self, handle: SpanHandle, error: bool) {
        let tick = self.ticker.read();
        match handle {
            SpanHandle::Real { trace, span } => {
                let completed = trace.pop_span(&span, tick, error);
                self.complete_if_done(&trace, completed);
            }
            SpanHandle::Dummy { trace_metric } => {
                if let Some(trace_metric) = trace_metric {
                    trace_metric.stop(tick);
                }
            }
        }
    }

    fn set_user_id(&self, id: String) {
        match self.current_trace() {
            Some(trace) => trace.set_username_supplier(Arc::new(move || id.clone())),
            None => log::warn!("setUserId called with no active trace"),
        }
    }

    fn set_trace_attribute(&self, name: String, value: Option<String>) {
        match self.current_trace() {
            Some(trace) => trace.put_attribute(name, value),
            None => log::warn!("setTraceAttribute called with no active trace"),
        }
    }

    fn get_string(&self, name: &str) -> String {
        self.config.get_string(name)
    }

    fn get_bool(&self, name: &str) -> bool {
        self.config.get_bool(name)
    }

    fn get_double(&self, name: &str) -> Option<f64> {
        self.config.get_double(name)
    }

    fn register_config_listener(&self, listener: Box<dyn Fn() + Send + Sync>) {
        self.config.register_listener(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clock::{FixedClock, FixedTicker};
    use config::NoopConfigSource;
    use message::text;

    fn agent(max_spans: usize) -> Agent {
        Agent::with_clock_and_ticker(
            Box::new(FixedClock::new(1_700_000_000_000)),
            Box::new(FixedTicker::new(1000)),
            max_spans,
            Arc::new(NoopConfigSource),
        )
    }

    #[test]
    fn start_trace_then_start_span_builds_a_nested_tree() {
        let agent = agent(10);
        let root = agent.start_trace(text("root"), &MetricName::new("M"));
        let child = agent.start_span(text("child"), &MetricName::new("N"));
        assert!(!child.is_dummy());
        agent.end_span(child, false);
        agent.end_span(root, false);
        assert!(agent.active_traces().is_empty());
    }

    #[test]
    fn soft_cap_returns_dummy_and_hard_cap_drops_error_spans() {
        let agent = agent(2);
        let root = agent.start_trace(text("root"), &MetricName::new("cap-test"));
        // root already counts as span 0; one more fits under the cap of 2.
        let ok = agent.start_span(text("a"), &MetricName::new("cap-test"));
        assert!(!ok.is_dummy());
        let dummy = agent.start_span(text("b"), &MetricName::new("cap-test"));
        assert!(dummy.is_dummy());
        agent.end_span(dummy, false);

        // root + "a" already occupy 2 of the 4 hard-cap slots.
        agent.add_error_span(text("error span 1, fits under hard cap"));
        agent.add_error_span(text("error span 2, fits under hard cap"));
        agent.add_error_span(text("error span 3, dropped past hard cap"));
        if let SpanHandle::Real { trace, .. } = &ok {
            assert_eq!(trace.root_span().len(), 4, "third error span must be dropped");
        }

        agent.end_span(ok, false);
        agent.end_span(root, false);
    }

    #[test]
    fn completing_the_root_span_clears_the_current_trace_slot() {
        let agent = agent(10);
        let root = agent.start_trace(text("root"), &MetricName::new("complete-test"));
        assert_eq!(agent.active_traces().len(), 1);
        agent.end_span(root, false);
        assert!(agent.active_traces().is_empty());
        // a fresh start_trace must begin a new trace, not nest into the old one
        let next = agent.start_trace(text("root-2"), &MetricName::new("complete-test"));
        match &next {
            SpanHandle::Real { span, .. } => assert_eq!(span.level(), 0),
            SpanHandle::Dummy { .. } => panic!("expected a real root span"),
        }
        agent.end_span(next, false);
    }

    #[test]
    fn set_user_id_and_attribute_without_a_trace_are_absorbed() {
        let agent = agent(10);
        agent.set_user_id("alice".into());
        agent.set_trace_attribute("route".into(), Some("/a".into()));
    }

    #[test]
    fn config_reads_delegate_to_the_installed_source() {
        let source = Arc::new(config::InMemoryConfigSource::new());
        source.set_bool("enabled", true);
        let agent = Agent::with_clock_and_ticker(
            Box::new(FixedClock::new(0)),
            Box::new(FixedTicker::new(0)),
            10,
            source,
        );
        assert!(agent.get_bool("enabled"));
    }
}
