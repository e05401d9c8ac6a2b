//! The aggregate object binding span tree, metrics, profiling, and
//! attributes for one top-level unit of work.

use crate::clock::{Clock, Ticker};
use crate::message::SharedMessageSupplier;
use crate::metric::{Metric, TraceMetric};
use crate::root_span::RootSpan;
use crate::span::{Span, StackFrame};
use crate::stack_tree::MergedStackTree;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Deferred username producer, evaluated only when a snapshot is taken so a
/// plugin can look up the current user lazily instead of on every span.
pub type UsernameSupplier = Arc<dyn Fn() -> String + Send + Sync>;

/// Caps `Trace::capture_stack_trace`'s depth. An unbounded capture would let
/// a single pathological call stack grow the merged tree without limit, so
/// this crate picks an explicit bound instead.
pub const MAX_CAPTURED_STACK_DEPTH: usize = 4096;

/// External collaborator: produces a snapshot of the owning thread's
/// current call stack. Implemented by the profiling layer; the core only
/// calls through this trait from `Trace::capture_stack_trace`.
pub trait StackCapture: Send + Sync {
    /// Capture up to `max_depth` frames, oldest (call-tree root) first,
    /// plus the thread's current state label if available.
    fn capture(&self, max_depth: usize) -> Option<(Vec<StackFrame>, Option<String>)>;
}

/// External collaborator: a cancellable handle to scheduled work (stack
/// sampler or stuck-trace marker). Cancellation must be idempotent.
pub trait CancelHandle: Send + Sync {
    fn cancel(&self);
}

/// Immutable (name, value) pair; `value` is `None` to represent a
/// present-but-null attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceAttribute {
    pub name: String,
    pub value: Option<String>,
}

/// Trace id: start wall-time plus a random suffix, enough entropy to make
/// ids unique within a process without coordination.
fn generate_trace_id(start_wall_ms: u64) -> String {
    let suffix: u64 = rand::random();
    format!("{:x}-{:x}", start_wall_ms, suffix)
}

/// The live trace object: a span tree plus per-metric counters, built by
/// exactly one trace thread and safely observable by any number of
/// concurrent reader threads.
pub struct Trace {
    id: String,
    start_wall_ms: u64,
    start_tick: u64,
    root_span: RootSpan,
    stack_tree: MergedStackTree,
    error: AtomicBool,
    stuck: AtomicBool,
    username: RwLock<Option<UsernameSupplier>>,
    attributes: Mutex<Vec<TraceAttribute>>,
    participating_metrics: Mutex<Vec<(Arc<Metric>, Arc<TraceMetric>)>>,
    thread_ref: Mutex<Option<Weak<dyn StackCapture>>>,
    stack_sampler_handle: Mutex<Option<Arc<dyn CancelHandle>>>,
    stuck_marker_handle: Mutex<Option<Arc<dyn CancelHandle>>>,
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("id", &self.id)
            .field("start_wall_ms", &self.start_wall_ms)
            .field("start_tick", &self.start_tick)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Trace {
    /// Start a new trace. Called by the trace thread on the first
    /// `pushSpan` of a top-level unit of work.
    pub fn new(
        clock: &dyn Clock,
        ticker: &dyn Ticker,
        root_message: SharedMessageSupplier,
        root_metric: Arc<Metric>,
        thread_ref: Option<Weak<dyn StackCapture>>,
    ) -> Self {
        let start_tick = ticker.read();
        let start_wall_ms = clock.now_millis();
        let root_trace_metric = root_metric.start_internal(start_tick);
        root_trace_metric.first_start_seen();

        let root_span = RootSpan::new(start_tick);
        root_span.push_span(start_tick, root_message, Some(root_trace_metric.clone()));

        Trace {
            id: generate_trace_id(start_wall_ms),
            start_wall_ms,
            start_tick,
            root_span,
            stack_tree: MergedStackTree::new(),
            error: AtomicBool::new(false),
            stuck: AtomicBool::new(false),
            username: RwLock::new(None),
            attributes: Mutex::new(Vec::new()),
            participating_metrics: Mutex::new(vec![(root_metric, root_trace_metric)]),
            thread_ref: Mutex::new(thread_ref),
            stack_sampler_handle: Mutex::new(None),
            stuck_marker_handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_wall_ms(&self) -> u64 {
        self.start_wall_ms
    }

    pub fn start_tick(&self) -> u64 {
        self.start_tick
    }

    /// Meaningless while the root span is still open; check
    /// [`is_completed`](Trace::is_completed) first.
    pub fn end_tick(&self) -> u64 {
        self.root_span.root().map_or(0, |root| root.end_tick())
    }

    pub fn is_completed(&self) -> bool {
        self.root_span.is_completed()
    }

    pub fn is_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck.load(Ordering::SeqCst)
    }

    /// Atomically set the stuck flag, returning its previous value.
    /// Idempotent: calling this again after it returns `true` keeps
    /// returning `true`.
    pub fn set_stuck(&self) -> bool {
        self.stuck.swap(true, Ordering::SeqCst)
    }

    pub fn root_span(&self) -> &RootSpan {
        &self.root_span
    }

    pub fn merged_stack_tree(&self) -> &MergedStackTree {
        &self.stack_tree
    }

    pub fn set_username_supplier(&self, supplier: UsernameSupplier) {
        *self.username.write().unwrap() = Some(supplier);
    }

    pub fn username(&self) -> Option<String> {
        self.username.read().unwrap().as_ref().map(|f| f())
    }

    /// Replace-on-duplicate, preserving the position of first insertion.
    pub fn put_attribute(&self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        let mut attrs = self.attributes.lock().unwrap();
        if let Some(existing) = attrs.iter_mut().find(|a| a.name == name) {
            existing.value = value;
        } else {
            attrs.push(TraceAttribute { name, value });
        }
    }

    /// An immutable snapshot copy of the attribute list, in insertion
    /// order.
    pub fn attributes(&self) -> Vec<TraceAttribute> {
        self.attributes.lock().unwrap().clone()
    }

    fn maybe_register(&self, metric: &Arc<Metric>, trace_metric: &Arc<TraceMetric>) {
        if trace_metric.is_first_start() {
            trace_metric.first_start_seen();
            self.participating_metrics
                .lock()
                .unwrap()
                .push((metric.clone(), trace_metric.clone()));
        }
    }

    /// Start the metric and push a span for it.
    pub fn push_span(
        &self,
        tick: u64,
        metric: &Arc<Metric>,
        message: SharedMessageSupplier,
    ) -> Arc<Span> {
        let trace_metric = metric.start_internal(tick);
        self.maybe_register(metric, &trace_metric);
        self.root_span.push_span(tick, message, Some(trace_metric))
    }

    /// Zero-duration span. Setting `error` latches the trace-level error
    /// flag; see [`add_error_span`](Trace::add_error_span) for the
    /// plugin-facing variant that does not.
    pub fn add_span(&self, tick: u64, message: SharedMessageSupplier, error: bool) -> Arc<Span> {
        if error {
            self.error.store(true, Ordering::SeqCst);
        }
        self.root_span.add_span(tick, message, error)
    }

    /// Zero-duration error span that marks only the span, not the trace:
    /// the trace-level error latch is left untouched.
    pub fn add_error_span(&self, tick: u64, message: SharedMessageSupplier) -> Arc<Span> {
        self.root_span.add_span(tick, message, true)
    }

    /// Timer-only start: same metric-registration bookkeeping as
    /// `push_span`, with no span created.
    pub fn start_trace_metric(&self, tick: u64, metric: &Arc<Metric>) -> Arc<TraceMetric> {
        let trace_metric = metric.start_internal(tick);
        self.maybe_register(metric, &trace_metric);
        trace_metric
    }

    /// Pop `span`. Stops its metric timer if it has one, and if the
    /// open-span stack empties, the trace is now complete and any
    /// scheduled stack-sampler/stuck-marker handles are cancelled.
    pub fn pop_span(&self, span: &Arc<Span>, tick: u64, error: bool) -> bool {
        let completed = self.root_span.pop_span(span, tick, error);
        if let Some(trace_metric) = span.trace_metric() {
            trace_metric.stop(tick);
        }
        if completed {
            self.cancel_scheduled_handles();
        }
        completed
    }

    /// Sample the owning thread's current stack via the weak reference
    /// installed at construction, and merge it into the merged stack tree.
    /// A no-op if the thread has been collected.
    pub fn capture_stack_trace(&self) {
        let weak = match self.thread_ref.lock().unwrap().clone() {
            Some(weak) => weak,
            None => return,
        };
        let Some(strong) = weak.upgrade() else {
            return;
        };
        if let Some((frames, state)) = strong.capture(MAX_CAPTURED_STACK_DEPTH) {
            self.stack_tree.add_stack_trace(&frames, state);
        }
    }

    /// Trace-thread only: clear each participating metric's thread-local
    /// state so the next trace on this thread starts fresh.
    pub fn reset_thread_local_metrics(&self) {
        for (metric, _) in self.participating_metrics.lock().unwrap().drain(..) {
            metric.reset_thread_local();
        }
    }

    /// Immutable snapshots of every metric that participated in this
    /// trace, unsorted (callers sort before serializing).
    pub fn metric_snapshots(&self) -> Vec<crate::metric::Snapshot> {
        self.participating_metrics
            .lock()
            .unwrap()
            .iter()
            .map(|(_, tm)| tm.snapshot())
            .collect()
    }

    /// Install the stack-sampler cancellation handle. If the trace has
    /// already completed, cancels it immediately (best-effort, idempotent).
    pub fn set_stack_sampler_handle(&self, handle: Arc<dyn CancelHandle>) {
        *self.stack_sampler_handle.lock().unwrap() = Some(handle);
        if self.is_completed() {
            self.cancel_scheduled_handles();
        }
    }

    /// Install the stuck-trace marker cancellation handle; same
    /// completed-already handling as `set_stack_sampler_handle`.
    pub fn set_stuck_marker_handle(&self, handle: Arc<dyn CancelHandle>) {
        *self.stuck_marker_handle.lock().unwrap() = Some(handle);
        if self.is_completed() {
            self.cancel_scheduled_handles();
        }
    }

    fn cancel_scheduled_handles(&self) {
        if let Some(handle) = self.stack_sampler_handle.lock().unwrap().take() {
            handle.cancel();
        }
        if let Some(handle) = self.stuck_marker_handle.lock().unwrap().take() {
            handle.cancel();
        }
    }
}
