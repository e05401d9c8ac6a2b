//! Chunked, lazy JSON encoder for a [`TraceSnapshot`].
//!
//! Each [`ByteStream::next_chunk`] call does a bounded amount of work and
//! returns at least one byte until the document is finished; concatenating
//! every returned chunk yields the full JSON document. The merged-stack-tree
//! section in particular is emitted from an explicit work list of sentinel
//! tokens instead of recursion, so an arbitrarily deep tree never grows the
//! call stack.

use crate::error::Result;
use crate::metric::Snapshot as MetricSnapshot;
use crate::snapshot::TraceSnapshot;
use crate::span::{Span, StackFrame};
use crate::stack_tree::{self, Node};
use crate::trace::TraceAttribute;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

/// Target chunk size. Chunks may be smaller only on the final flush.
pub const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug)]
enum TreeToken {
    Node(Arc<Node>),
    Comma,
    EndArray,
    PopMetricName,
    EndObject,
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Header,
    Spans,
    SpansEnd,
    StackTraces,
    MergedTree,
    Closing,
    Done,
}

/// Lazily serializes a [`TraceSnapshot`] (plus, when it was built with
/// `include_detail`, the owning trace's spans and merged stack tree) into
/// ~8 KiB chunks.
pub struct ByteStream {
    buffer: Vec<u8>,
    phase: Phase,
    snapshot: TraceSnapshot,
    spans: Vec<Arc<Span>>,
    span_cursor: usize,
    spans_emitted_any: bool,
    stack_hashes: Vec<(String, Vec<StackFrame>)>,
    seen_hashes: HashSet<String>,
    stack_hash_cursor: usize,
    merged_root: Option<Arc<Node>>,
    tree_stack: Vec<TreeToken>,
    active_metric_names: Vec<String>,
    tree_started: bool,
}

impl ByteStream {
    /// Build a byte stream for `snapshot`. `spans` and `merged_root` are
    /// ignored unless `snapshot.include_detail` is set.
    pub fn new(snapshot: TraceSnapshot, spans: Vec<Arc<Span>>, merged_root: Option<Arc<Node>>) -> Self {
        ByteStream {
            buffer: Vec::with_capacity(CHUNK_SIZE),
            phase: Phase::Header,
            snapshot,
            spans,
            span_cursor: 0,
            spans_emitted_any: false,
            stack_hashes: Vec::new(),
            seen_hashes: HashSet::new(),
            stack_hash_cursor: 0,
            merged_root,
            tree_stack: Vec::new(),
            active_metric_names: Vec::new(),
            tree_started: false,
        }
    }

    /// Pull the next chunk. Returns `None` once the document is complete;
    /// concatenating every `Some` chunk reproduces the whole document.
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        while self.buffer.len() < CHUNK_SIZE && self.phase != Phase::Done {
            self.step();
        }
        if self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }

    /// Drain every chunk and concatenate them, for callers that don't need
    /// the lazy contract (tests, small snapshots).
    pub fn collect_to_vec(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Drain every chunk into `writer` as it becomes available, never
    /// holding more than one chunk in memory at a time. The only place this
    /// crate surfaces an error to the caller.
    pub fn write_all_to(mut self, writer: &mut impl Write) -> Result<()> {
        while let Some(chunk) = self.next_chunk() {
            writer.write_all(&chunk)?;
        }
        Ok(())
    }

    fn step(&mut self) {
        match self.phase {
            Phase::Header => self.emit_header(),
            Phase::Spans => self.emit_next_span(),
            Phase::SpansEnd => self.emit_spans_end(),
            Phase::StackTraces => self.emit_stack_traces(),
            Phase::MergedTree => self.emit_tree_step(),
            Phase::Closing => self.emit_closing(),
            Phase::Done => {}
        }
    }

    fn emit_header(&mut self) {
        let buf = &mut self.buffer;
        buf.push(b'{');
        write_field_str(buf, "id", &self.snapshot.id, false);
        write_field_raw(buf, "start", &self.snapshot.start_wall_ms.to_string());
        write_field_raw(buf, "stuck", bool_str(self.snapshot.stuck));
        write_field_raw(buf, "error", bool_str(self.snapshot.error));
        write_field_raw(buf, "duration", &self.snapshot.duration_ticks.to_string());
        write_field_raw(buf, "completed", bool_str(self.snapshot.completed));
        write_field_str(buf, "description", &self.snapshot.description, true);
        if let Some(username) = &self.snapshot.username {
            write_field_str(buf, "username", username, true);
        }
        if !self.snapshot.attributes.is_empty() {
            write_attributes(buf, &self.snapshot.attributes);
        }
        if !self.snapshot.metrics.is_empty() {
            write_metrics(buf, &self.snapshot.metrics);
        }

        if self.snapshot.include_detail && !self.spans.is_empty() {
            buf.extend_from_slice(b",\"spans\":[");
            self.phase = Phase::Spans;
        } else {
            self.phase = Phase::StackTraces;
        }
    }

    fn emit_next_span(&mut self) {
        if self.span_cursor >= self.spans.len() {
            self.phase = Phase::SpansEnd;
            return;
        }
        let span = self.spans[self.span_cursor].clone();
        self.span_cursor += 1;

        // "in the future" relative to the capture instant: omit entirely.
        if span.start_tick() > self.snapshot.capture_tick {
            return;
        }

        let buf = &mut self.buffer;
        if self.spans_emitted_any {
            buf.push(b',');
        }
        self.spans_emitted_any = true;

        let (duration, active) = if !span.is_active() && span.end_tick() <= self.snapshot.capture_tick {
            (span.end_tick() - span.start_tick(), false)
        } else {
            (self.snapshot.capture_tick.saturating_sub(span.start_tick()), true)
        };

        buf.push(b'{');
        write_field_raw(buf, "offset", &span.offset().to_string());
        write_field_raw(buf, "duration", &duration.to_string());
        write_field_raw(buf, "index", &span.index().to_string());
        let parent = span
            .parent_index()
            .map(|i| i as i64)
            .unwrap_or(-1)
            .to_string();
        write_field_raw(buf, "parentIndex", &parent);
        write_field_raw(buf, "level", &span.level().to_string());
        let message = span.message_supplier().get();
        write_field_str(buf, "description", message.text(), true);
        if span.is_error() {
            write_field_raw(buf, "error", "true");
        }
        if !message.context().is_empty() {
            buf.extend_from_slice(b",\"contextMap\":{");
            for (i, (k, v)) in message.context().iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_json_string(buf, k);
                buf.push(b':');
                write_json_string(buf, v);
            }
            buf.push(b'}');
        }
        if active {
            write_field_raw(buf, "active", "true");
        }
        if let Some(frames) = span.stack_trace() {
            let hash = hash_frames(frames);
            if self.seen_hashes.insert(hash.clone()) {
                self.stack_hashes.push((hash.clone(), frames.to_vec()));
            }
            write_field_str(buf, "stackTraceHash", &hash, true);
        }
        buf.push(b'}');
    }

    fn emit_spans_end(&mut self) {
        self.buffer.push(b']');
        self.phase = Phase::StackTraces;
    }

    fn emit_stack_traces(&mut self) {
        if !self.snapshot.include_detail || self.stack_hashes.is_empty() {
            self.phase = Phase::MergedTree;
            return;
        }
        if self.stack_hash_cursor == 0 {
            self.buffer.extend_from_slice(b",\"stackTraces\":{");
        }
        if self.stack_hash_cursor >= self.stack_hashes.len() {
            self.buffer.push(b'}');
            self.phase = Phase::MergedTree;
            return;
        }
        let (hash, frames) = &self.stack_hashes[self.stack_hash_cursor];
        if self.stack_hash_cursor > 0 {
            self.buffer.push(b',');
        }
        write_json_string(&mut self.buffer, hash);
        self.buffer.push(b':');
        write_frames_array(&mut self.buffer, frames);
        self.stack_hash_cursor += 1;
    }

    fn emit_tree_step(&mut self) {
        if !self.snapshot.include_detail || self.merged_root.is_none() {
            self.phase = Phase::Closing;
            return;
        }
        if !self.tree_started {
            self.buffer.extend_from_slice(b",\"mergedStackTree\":");
            self.tree_stack.push(TreeToken::Node(self.merged_root.clone().unwrap()));
            self.tree_started = true;
            return;
        }
        match self.tree_stack.pop() {
            None => self.phase = Phase::Closing,
            Some(token) => self.apply_tree_token(token),
        }
    }

    fn apply_tree_token(&mut self, token: TreeToken) {
        match token {
            TreeToken::Comma => self.buffer.push(b','),
            TreeToken::EndArray => self.buffer.push(b']'),
            TreeToken::EndObject => self.buffer.push(b'}'),
            TreeToken::PopMetricName => {
                self.active_metric_names.pop();
            }
            TreeToken::Node(node) => self.emit_tree_node(node),
        }
    }

    fn emit_tree_node(&mut self, node: Arc<Node>) {
        let buf = &mut self.buffer;
        buf.push(b'{');
        let label = match node.frame() {
            Some(frame) => format_frame(frame),
            None => "<multiple root nodes>".to_string(),
        };
        write_field_str(buf, "stackTraceElement", &label, false);
        write_field_raw(buf, "sampleCount", &node.sample_count().to_string());

        let marker = node
            .frame()
            .and_then(|f| stack_tree::metric_marker_name(&f.method_name));
        let mut pushed_marker = false;
        if let Some(name) = &marker {
            if self.active_metric_names.last() != Some(name) {
                self.active_metric_names.push(name.clone());
                pushed_marker = true;
            }
        }

        let children = node.children();
        if children.is_empty() {
            if let Some(state) = node.leaf_thread_state() {
                write_field_str(buf, "leafThreadState", &state, true);
            }
            if !self.active_metric_names.is_empty() {
                buf.extend_from_slice(b",\"metricNames\":[");
                for (i, name) in self.active_metric_names.iter().enumerate() {
                    if i > 0 {
                        buf.push(b',');
                    }
                    write_json_string(buf, name);
                }
                buf.push(b']');
            }
        }

        // `closing` lists sentinel tokens in the order they must be applied
        // once this node's children are exhausted: the childNodes array (if
        // any) closes before this node's own object does, and the metric
        // name marker (if any) pops last, after both.
        let mut closing = Vec::new();
        if !children.is_empty() {
            closing.push(TreeToken::EndArray);
        }
        closing.push(TreeToken::EndObject);
        if pushed_marker {
            closing.push(TreeToken::PopMetricName);
        }

        if !children.is_empty() {
            self.buffer.extend_from_slice(b",\"childNodes\":[");
            let mut sequence = Vec::with_capacity(children.len() * 2);
            for (i, child) in children.into_iter().enumerate() {
                if i > 0 {
                    sequence.push(TreeToken::Comma);
                }
                sequence.push(TreeToken::Node(child));
            }
            for token in closing.into_iter().rev() {
                self.tree_stack.push(token);
            }
            for token in sequence.into_iter().rev() {
                self.tree_stack.push(token);
            }
        } else {
            for token in closing.into_iter().rev() {
                self.tree_stack.push(token);
            }
        }
    }

    fn emit_closing(&mut self) {
        self.buffer.push(b'}');
        self.phase = Phase::Done;
    }
}

fn bool_str(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

fn write_json_string(buf: &mut Vec<u8>, s: &str) {
    // delegate escaping to serde_json rather than hand-rolling it.
    let escaped = serde_json::to_string(s).expect("string serialization cannot fail");
    buf.extend_from_slice(escaped.as_bytes());
}

fn write_field_raw(buf: &mut Vec<u8>, name: &str, raw: &str) {
    buf.push(b',');
    write_json_string(buf, name);
    buf.push(b':');
    buf.extend_from_slice(raw.as_bytes());
}

fn write_field_str(buf: &mut Vec<u8>, name: &str, value: &str, leading_comma: bool) {
    if leading_comma {
        buf.push(b',');
    }
    write_json_string(buf, name);
    buf.push(b':');
    write_json_string(buf, value);
}

fn write_attributes(buf: &mut Vec<u8>, attrs: &[TraceAttribute]) {
    buf.extend_from_slice(b",\"attributes\":[");
    for (i, attr) in attrs.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        buf.push(b'{');
        write_json_string(buf, "name");
        buf.push(b':');
        write_json_string(buf, &attr.name);
        buf.extend_from_slice(b",\"value\":");
        match &attr.value {
            Some(v) => write_json_string(buf, v),
            None => buf.extend_from_slice(b"null"),
        }
        buf.push(b'}');
    }
    buf.push(b']');
}

fn write_metrics(buf: &mut Vec<u8>, metrics: &[MetricSnapshot]) {
    buf.extend_from_slice(b",\"metrics\":[");
    for (i, m) in metrics.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        buf.push(b'{');
        write_json_string(buf, "name");
        buf.push(b':');
        write_json_string(buf, &m.name);
        buf.extend_from_slice(b",\"total\":");
        buf.extend_from_slice(m.total.to_string().as_bytes());
        buf.extend_from_slice(b",\"min\":");
        buf.extend_from_slice(m.min.to_string().as_bytes());
        buf.extend_from_slice(b",\"max\":");
        buf.extend_from_slice(m.max.to_string().as_bytes());
        buf.extend_from_slice(b",\"count\":");
        buf.extend_from_slice(m.count.to_string().as_bytes());
        buf.push(b'}');
    }
    buf.push(b']');
}

fn format_frame(frame: &StackFrame) -> String {
    match (&frame.file_name, frame.line_number) {
        (Some(file), Some(line)) => format!(
            "{}.{}({}:{})",
            frame.class_name, frame.method_name, file, line
        ),
        _ => format!("{}.{}", frame.class_name, frame.method_name),
    }
}

fn write_frames_array(buf: &mut Vec<u8>, frames: &[StackFrame]) {
    buf.push(b'[');
    for (i, frame) in frames.iter().enumerate() {
        if i > 0 {
            buf.push(b',');
        }
        write_json_string(buf, &format_frame(frame));
    }
    buf.push(b']');
}

fn hash_frames(frames: &[StackFrame]) -> String {
    let mut hasher = Sha1::new();
    for frame in frames {
        hasher.update(format_frame(frame).as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
