//! One node of a trace's span tree.

use crate::message::SharedMessageSupplier;
use crate::metric::TraceMetric;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// A single stack frame, matching the `class#method(file:line)` granularity
/// the merged-stack-tree's metric-marker regex needs to operate on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackFrame {
    pub class_name: String,
    pub method_name: String,
    pub file_name: Option<String>,
    pub line_number: Option<u32>,
}

impl StackFrame {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        StackFrame {
            class_name: class_name.into(),
            method_name: method_name.into(),
            file_name: None,
            line_number: None,
        }
    }

    pub fn with_location(
        class_name: impl Into<String>,
        method_name: impl Into<String>,
        file_name: impl Into<String>,
        line_number: u32,
    ) -> Self {
        StackFrame {
            class_name: class_name.into(),
            method_name: method_name.into(),
            file_name: Some(file_name.into()),
            line_number: Some(line_number),
        }
    }
}

/// A time-bounded node in a trace's span tree.
///
/// Every field is fixed at construction except `end_tick` and `error`,
/// which are written exactly once by the owning trace thread and may
/// be read concurrently by any number of snapshotting threads; both use
/// atomics for that reason.
pub struct Span {
    index: usize,
    parent_index: Option<usize>,
    level: u32,
    start_tick: u64,
    offset: u64,
    end_tick: AtomicU64,
    ended: AtomicBool,
    error: AtomicBool,
    message_supplier: SharedMessageSupplier,
    stack_trace: OnceLock<Vec<StackFrame>>,
    trace_metric: Option<Arc<TraceMetric>>,
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("index", &self.index)
            .field("parent_index", &self.parent_index)
            .field("level", &self.level)
            .field("start_tick", &self.start_tick)
            .field("offset", &self.offset)
            .field("end_tick", &self.end_tick)
            .field("ended", &self.ended)
            .field("error", &self.error)
            .field("message_supplier", &self.message_supplier.get())
            .field("stack_trace", &self.stack_trace)
            .field("trace_metric", &self.trace_metric)
            .finish()
    }
}

impl Span {
    pub(crate) fn new(
        index: usize,
        parent_index: Option<usize>,
        level: u32,
        start_tick: u64,
        trace_start_tick: u64,
        message_supplier: SharedMessageSupplier,
        trace_metric: Option<Arc<TraceMetric>>,
    ) -> Self {
        Span {
            index,
            parent_index,
            level,
            start_tick,
            offset: start_tick.saturating_sub(trace_start_tick),
            end_tick: AtomicU64::new(0),
            ended: AtomicBool::new(false),
            error: AtomicBool::new(false),
            message_supplier,
            stack_trace: OnceLock::new(),
            trace_metric,
        }
    }

    /// Position of this span in the trace's creation-order list; `0` for
    /// the root span.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Index of the parent span, or `None` for the root.
    pub fn parent_index(&self) -> Option<usize> {
        self.parent_index
    }

    /// Depth in the span tree; `0` for the root.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// The tick this span started at.
    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }

    /// `start_tick - trace.start_tick`.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Meaningless while [`is_active`](Span::is_active) is true: a span can
    /// legitimately end at tick `0`, so this is not itself a sentinel.
    pub fn end_tick(&self) -> u64 {
        self.end_tick.load(Ordering::SeqCst)
    }

    /// True until [`end`](Span::end) is called.
    pub fn is_active(&self) -> bool {
        !self.ended.load(Ordering::SeqCst)
    }

    /// True if this span, or an event nested under it, was marked as an
    /// error.
    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    pub fn message_supplier(&self) -> &SharedMessageSupplier {
        &self.message_supplier
    }

    /// Stack frames captured when this span was ended over the
    /// configured "end with stack trace" threshold, oldest frame first.
    pub fn stack_trace(&self) -> Option<&[StackFrame]> {
        self.stack_trace.get().map(Vec::as_slice)
    }

    /// The [`TraceMetric`] this span's duration was recorded against, if
    /// any (free-floating spans created via `addSpan` have none).
    pub fn trace_metric(&self) -> Option<&Arc<TraceMetric>> {
        self.trace_metric.as_ref()
    }

    /// End this span. Idempotent past the first call: `end_tick` is
    /// written once and then immutable, guarded by `ended` rather than by
    /// treating `0` as a not-yet-set marker.
    pub(crate) fn end(&self, end_tick: u64, error: bool) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            self.end_tick.store(end_tick, Ordering::SeqCst);
        }
        if error {
            self.error.store(true, Ordering::SeqCst);
        }
    }

    /// Attach a stack trace captured at end time. A no-op if one was
    /// already attached.
    pub(crate) fn set_stack_trace(&self, frames: Vec<StackFrame>) {
        let _ = self.stack_trace.set(frames);
    }
}
