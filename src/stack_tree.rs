//! A concurrently-readable prefix tree of sampled stack frames, weighted by
//! sample count.

use crate::span::StackFrame;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Matches frames synthesized by the bytecode weaver for a metric timer
/// advice, e.g. `...$informant$metric$http$client$request$1` encodes the
/// metric name `http client request`.
static METRIC_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.*\$informant\$metric\$(.*)\$[0-9]+$").unwrap());

/// If `method_name` is a metric-marker frame, return the metric name it
/// encodes (`$` decoded back to a space).
pub fn metric_marker_name(method_name: &str) -> Option<String> {
    METRIC_MARKER
        .captures(method_name)
        .map(|caps| caps[1].replace('$', " "))
}

/// One node of the merged stack tree: either a real captured frame, or (for
/// the tree's root only) a synthetic fan-out node used when samples
/// disagree on their topmost frame.
#[derive(Debug)]
pub struct Node {
    frame: Option<StackFrame>,
    sample_count: AtomicU64,
    children: RwLock<Vec<Arc<Node>>>,
    leaf_thread_state: RwLock<Option<String>>,
}

impl Node {
    fn leaf_chain_node(frame: Option<StackFrame>, thread_state: Option<String>) -> Arc<Node> {
        Arc::new(Node {
            frame,
            sample_count: AtomicU64::new(1),
            children: RwLock::new(Vec::new()),
            leaf_thread_state: RwLock::new(thread_state),
        })
    }

    /// This node's frame, or `None` for the synthetic multi-root node.
    pub fn frame(&self) -> Option<&StackFrame> {
        self.frame.as_ref()
    }

    /// Number of samples that passed through this node.
    pub fn sample_count(&self) -> u64 {
        self.sample_count.load(Ordering::SeqCst)
    }

    /// Child nodes, in the order they were first added, so a traversal
    /// over them is a stable pre-order walk.
    pub fn children(&self) -> Vec<Arc<Node>> {
        self.children.read().unwrap().clone()
    }

    /// The thread's state the last time this node was the bottom frame of
    /// a sample, if it ever was.
    pub fn leaf_thread_state(&self) -> Option<String> {
        self.leaf_thread_state.read().unwrap().clone()
    }

    fn record_leaf_thread_state(&self, thread_state: Option<String>) {
        if thread_state.is_some() {
            *self.leaf_thread_state.write().unwrap() = thread_state;
        }
    }
}

/// Build a fresh root-to-leaf chain for `frames`, each node starting at
/// sample count 1. `frames` must be non-empty.
fn build_chain(frames: &[StackFrame], thread_state: Option<String>) -> Arc<Node> {
    let (leaf_frame, ancestors) = frames.split_last().expect("frames is non-empty");
    let mut node = Node::leaf_chain_node(Some(leaf_frame.clone()), thread_state);
    for frame in ancestors.iter().rev() {
        node = Arc::new(Node {
            frame: Some(frame.clone()),
            sample_count: AtomicU64::new(1),
            children: RwLock::new(vec![node]),
            leaf_thread_state: RwLock::new(None),
        });
    }
    node
}

/// Descend from `node` along `remaining`, merging into a matching child at
/// each level or grafting a fresh chain where none matches.
fn merge_children(node: &Arc<Node>, remaining: &[StackFrame], thread_state: Option<String>) {
    let Some((next, rest)) = remaining.split_first() else {
        node.record_leaf_thread_state(thread_state);
        return;
    };

    let mut children = node.children.write().unwrap();
    if let Some(existing) = children.iter().find(|c| c.frame.as_ref() == Some(next)) {
        let existing = existing.clone();
        drop(children);
        existing.sample_count.fetch_add(1, Ordering::SeqCst);
        merge_children(&existing, rest, thread_state);
    } else {
        children.push(build_chain(remaining, thread_state));
    }
}

/// A merged, weighted prefix tree of sampled call stacks for one trace's
/// owning thread.
///
/// Writes happen on the external sampling thread, one sample at a time;
/// reads happen from any number of snapshotting threads. New children are
/// pushed (and so visible) before the incremented sample count is
/// observed, because both happen under the same write-lock critical
/// section a reader's read-lock cannot interleave with.
#[derive(Debug, Default)]
pub struct MergedStackTree {
    root: RwLock<Option<Arc<Node>>>,
}

impl MergedStackTree {
    pub fn new() -> Self {
        MergedStackTree {
            root: RwLock::new(None),
        }
    }

    /// Merge one sampled stack into the tree. `frames` must be ordered
    /// oldest-first (the call tree's root frame at index 0), the inverse
    /// of how most platforms report a raw stack dump.
    pub fn add_stack_trace(&self, frames: &[StackFrame], thread_state: Option<String>) {
        if frames.is_empty() {
            return;
        }
        let mut root = self.root.write().unwrap();
        match root.as_ref() {
            None => {
                *root = Some(build_chain(frames, thread_state));
            }
            Some(existing) if existing.frame.is_none() => {
                // already a synthetic multi-root fan-out
                existing.sample_count.fetch_add(1, Ordering::SeqCst);
                merge_children(existing, frames, thread_state);
            }
            Some(existing) if existing.frame.as_ref() == Some(&frames[0]) => {
                existing.sample_count.fetch_add(1, Ordering::SeqCst);
                merge_children(existing, &frames[1..], thread_state);
            }
            Some(existing) => {
                let total = existing.sample_count.load(Ordering::SeqCst) + 1;
                let sibling = build_chain(frames, thread_state);
                *root = Some(Arc::new(Node {
                    frame: None,
                    sample_count: AtomicU64::new(total),
                    children: RwLock::new(vec![existing.clone(), sibling]),
                    leaf_thread_state: RwLock::new(None),
                }));
            }
        }
    }

    /// The tree's root node, once at least one sample has been merged in.
    pub fn root(&self) -> Option<Arc<Node>> {
        self.root.read().unwrap().clone()
    }

    /// Total samples merged so far.
    pub fn total_samples(&self) -> u64 {
        self.root().map_or(0, |n| n.sample_count())
    }
}
