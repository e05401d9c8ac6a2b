//! The six end-to-end scenarios, exercised against the public API the way
//! a plugin and a reader thread would actually use it: build a trace with
//! [`Agent`], take a [`TraceSnapshot`], and check the bytes a reader would
//! actually see.

use traceagent_core::clock::{FixedClock, FixedTicker};
use traceagent_core::config::NoopConfigSource;
use traceagent_core::message::text;
use traceagent_core::metric::MetricName;
use traceagent_core::snapshot::TraceSnapshot;
use traceagent_core::{Agent, AgentFacade, SpanHandle};
use std::sync::Arc;

fn agent() -> Agent {
    Agent::with_clock_and_ticker(
        Box::new(FixedClock::new(1_700_000_000_000)),
        Box::new(FixedTicker::new(0)),
        2000,
        Arc::new(NoopConfigSource),
    )
}

fn parse(bytes: Vec<u8>) -> serde_json::Value {
    serde_json::from_slice(&bytes).expect("snapshot bytes must be valid JSON")
}

#[test]
fn scenario_1_single_span_trace() {
    let agent = agent();
    let root = agent.start_trace(text("root"), &MetricName::new("M"));
    let trace = match &root {
        SpanHandle::Real { trace, .. } => trace.clone(),
        SpanHandle::Dummy { .. } => panic!("expected a real root span"),
    };
    agent.end_span(root, false);

    let snapshot = TraceSnapshot::from(&trace, 0, true);
    assert_eq!(snapshot.duration_ticks, 0);
    assert!(snapshot.completed);

    let spans = trace.root_span().spans();
    let json = parse(
        traceagent_core::byte_stream::ByteStream::new(snapshot, spans, None).collect_to_vec(),
    );
    let spans_json = json["spans"].as_array().unwrap();
    assert_eq!(spans_json.len(), 1);
    assert_eq!(spans_json[0]["index"], 0);
    assert_eq!(spans_json[0]["parentIndex"], -1);
    assert_eq!(spans_json[0]["level"], 0);
    assert_eq!(spans_json[0]["offset"], 0);
    assert_eq!(spans_json[0]["duration"], 0);
    assert_eq!(spans_json[0]["description"], "root");
    let metrics_json = json["metrics"].as_array().unwrap();
    assert_eq!(metrics_json[0]["name"], "M");
    assert_eq!(metrics_json[0]["total"], 0);
    assert_eq!(metrics_json[0]["min"], 0);
    assert_eq!(metrics_json[0]["max"], 0);
    assert_eq!(metrics_json[0]["count"], 1);
}

#[test]
fn scenario_2_nested_spans() {
    // The agent owns its ticker privately, so this scenario drives the
    // lower-level Trace API directly to control ticks precisely, exactly
    // as scenario 2 specifies them.
    use traceagent_core::metric::metric;
    use traceagent_core::trace::Trace;

    let clock = FixedClock::new(0);
    let ticker = FixedTicker::new(1000);
    let m = metric(&MetricName::new("scenario-2-metric"));
    let trace = Trace::new(&clock, &ticker, text("A"), m.clone(), None);
    let a = trace.root_span().root().unwrap();
    let b = trace.push_span(1100, &m, text("B"));
    trace.pop_span(&b, 1300, false);
    trace.pop_span(&a, 1400, false);

    let snapshot = TraceSnapshot::from(&trace, 1500, true);
    let spans = trace.root_span().spans();
    let json = parse(
        traceagent_core::byte_stream::ByteStream::new(snapshot, spans, None).collect_to_vec(),
    );
    let spans_json = json["spans"].as_array().unwrap();
    assert_eq!(spans_json.len(), 2);
    assert_eq!(spans_json[0]["offset"], 0);
    assert_eq!(spans_json[0]["duration"], 400);
    assert_eq!(spans_json[0]["level"], 0);
    assert_eq!(spans_json[1]["offset"], 100);
    assert_eq!(spans_json[1]["duration"], 200);
    assert_eq!(spans_json[1]["level"], 1);
}

#[test]
fn scenario_3_live_snapshot() {
    use traceagent_core::metric::metric;
    use traceagent_core::trace::Trace;

    let clock = FixedClock::new(0);
    let ticker = FixedTicker::new(1000);
    let m = metric(&MetricName::new("scenario-3-metric"));
    let trace = Trace::new(&clock, &ticker, text("A"), m, None);

    let snapshot = TraceSnapshot::from(&trace, 1250, true);
    assert!(!snapshot.completed);
    assert_eq!(snapshot.duration_ticks, 250);

    let spans = trace.root_span().spans();
    let json = parse(
        traceagent_core::byte_stream::ByteStream::new(snapshot, spans, None).collect_to_vec(),
    );
    assert_eq!(json["completed"], false);
    assert_eq!(json["duration"], 250);
    let spans_json = json["spans"].as_array().unwrap();
    assert_eq!(spans_json[0]["active"], true);
    assert_eq!(spans_json[0]["duration"], 250);
}

#[test]
fn scenario_4_metric_reentry() {
    use traceagent_core::metric::metric;
    use traceagent_core::trace::Trace;

    let clock = FixedClock::new(0);
    let ticker = FixedTicker::new(100);
    let m = metric(&MetricName::new("scenario-4-metric"));
    let trace = Trace::new(&clock, &ticker, text("root"), m.clone(), None);
    let tm = trace.start_trace_metric(100, &m);
    trace.start_trace_metric(150, &m);
    tm.stop(200);
    tm.stop(300);
    let snapshot = tm.snapshot();
    assert_eq!(snapshot.total, 200);
    assert_eq!(snapshot.count, 1);
    assert_eq!(snapshot.min, 200);
    assert_eq!(snapshot.max, 200);
}

#[test]
fn scenario_5_merged_stack_tree() {
    use traceagent_core::span::StackFrame;
    use traceagent_core::stack_tree::MergedStackTree;

    let f = |name: &str| StackFrame::new("C", name);
    let tree = MergedStackTree::new();
    tree.add_stack_trace(&[f("f"), f("g"), f("h")], Some("RUNNABLE".into()));
    tree.add_stack_trace(&[f("f"), f("g"), f("h")], Some("RUNNABLE".into()));
    tree.add_stack_trace(&[f("f"), f("g"), f("k")], Some("WAITING".into()));

    let root = tree.root().unwrap();
    assert_eq!(root.frame().unwrap().method_name, "f");
    assert_eq!(root.sample_count(), 3);
    let g = &root.children()[0];
    assert_eq!(g.sample_count(), 3);
    let leaves = g.children();
    let h = leaves.iter().find(|n| n.frame().unwrap().method_name == "h").unwrap();
    let k = leaves.iter().find(|n| n.frame().unwrap().method_name == "k").unwrap();
    assert_eq!(h.sample_count(), 2);
    assert_eq!(k.sample_count(), 1);
}

#[test]
fn scenario_6_attribute_replacement() {
    let agent = agent();
    let root = agent.start_trace(text("root"), &MetricName::new("scenario-6"));
    agent.set_trace_attribute("user".into(), Some("alice".into()));
    agent.set_trace_attribute("route".into(), Some("/a".into()));
    agent.set_trace_attribute("user".into(), Some("bob".into()));

    if let SpanHandle::Real { trace, .. } = &root {
        let attrs = trace.attributes();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].name, "user");
        assert_eq!(attrs[0].value, Some("bob".to_string()));
        assert_eq!(attrs[1].name, "route");
    } else {
        panic!("expected a real root span");
    }
    agent.end_span(root, false);
}
