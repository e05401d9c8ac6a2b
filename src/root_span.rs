//! Owns a trace's span tree: the append-only creation-order list and the
//! stack of currently open spans.

use crate::message::SharedMessageSupplier;
use crate::metric::TraceMetric;
use crate::span::Span;
use std::sync::{Arc, Mutex, RwLock};

/// The trace's span tree and live span stack.
///
/// `spans` is append-only: a reader observing length `N` sees spans
/// `0..N-1` fully constructed. `open_stack` is touched only by the trace
/// thread, so a `Mutex` here is never contended; `spans` is guarded by an
/// `RwLock` so the (rare, single-writer) push is a short critical section
/// and concurrent readers never block each other.
#[derive(Debug)]
pub struct RootSpan {
    trace_start_tick: u64,
    spans: RwLock<Vec<Arc<Span>>>,
    open_stack: Mutex<Vec<Arc<Span>>>,
}

impl RootSpan {
    pub(crate) fn new(trace_start_tick: u64) -> Self {
        RootSpan {
            trace_start_tick,
            spans: RwLock::new(Vec::new()),
            open_stack: Mutex::new(Vec::new()),
        }
    }

    /// Push a new span under the current top-of-stack (or as the root, if
    /// the stack is empty).
    pub fn push_span(
        &self,
        start_tick: u64,
        message_supplier: SharedMessageSupplier,
        trace_metric: Option<Arc<TraceMetric>>,
    ) -> Arc<Span> {
        let mut stack = self.open_stack.lock().unwrap();
        let parent = stack.last().cloned();
        let parent_index = parent.as_ref().map(|p| p.index());
        let level = parent.as_ref().map_or(0, |p| p.level() + 1);

        let mut spans = self.spans.write().unwrap();
        let index = spans.len();
        let span = Arc::new(Span::new(
            index,
            parent_index,
            level,
            start_tick,
            self.trace_start_tick,
            message_supplier,
            trace_metric,
        ));
        spans.push(span.clone());
        drop(spans);

        stack.push(span.clone());
        span
    }

    /// Insert a zero-duration leaf under the current top-of-stack without
    /// touching the stack itself; used for discrete events.
    pub fn add_span(
        &self,
        tick: u64,
        message_supplier: SharedMessageSupplier,
        error: bool,
    ) -> Arc<Span> {
        let stack = self.open_stack.lock().unwrap();
        let parent = stack.last().cloned();
        let parent_index = parent.as_ref().map(|p| p.index());
        let level = parent.as_ref().map_or(0, |p| p.level() + 1);
        drop(stack);

        let mut spans = self.spans.write().unwrap();
        let index = spans.len();
        let span = Arc::new(Span::new(
            index,
            parent_index,
            level,
            tick,
            self.trace_start_tick,
            message_supplier,
            None,
        ));
        span.end(tick, error);
        spans.push(span.clone());
        span
    }

    /// Pop spans until `span` is removed from the open-span stack.
    ///
    /// A caller missing its own pop must not keep the trace permanently
    /// open, so pops are defensive: if `span` is not the top of the stack,
    /// everything above it is unwound first. Every unwound span is ended at
    /// `end_tick`; only `span` itself receives the caller-supplied `error`
    /// flag.
    ///
    /// Returns `true` if the stack became empty, meaning the trace is now
    /// complete.
    pub fn pop_span(&self, span: &Arc<Span>, end_tick: u64, error: bool) -> bool {
        let mut stack = self.open_stack.lock().unwrap();
        while let Some(top) = stack.pop() {
            let is_target = Arc::ptr_eq(&top, span);
            top.end(end_tick, is_target && error);
            if is_target {
                break;
            }
        }
        stack.is_empty()
    }

    /// Spans in creation order. Safe to call while the writer is still
    /// appending: the returned vector is a point-in-time snapshot of a
    /// strictly growing sequence.
    pub fn spans(&self) -> Vec<Arc<Span>> {
        self.spans.read().unwrap().clone()
    }

    /// Number of spans created so far.
    pub fn len(&self) -> usize {
        self.spans.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The root span (index 0), once at least one span has been pushed.
    pub fn root(&self) -> Option<Arc<Span>> {
        self.spans.read().unwrap().first().cloned()
    }

    /// True once the open-span stack has emptied after at least one push,
    /// i.e. every `push_span` has a matching `pop_span`.
    pub fn is_completed(&self) -> bool {
        !self.is_empty() && self.open_stack.lock().unwrap().is_empty()
    }
}
