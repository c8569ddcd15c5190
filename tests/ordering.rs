//! Ordering Integration Tests
//!
//! Tests that parents observe child completions in call order, and how child
//! errors are delivered and recovered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use oprelay::{
    ChildFactory, ChildResult, ChildResults, FactoryMap, OpContext, Operation, Payload,
    RelayError, RelayHandle, RunContext, State,
};
use oprelay::core::{ChildRef, LifecycleListener};
use oprelay::{LifecycleEvent, LifecycleKind};

/// Sleeps for `ms`, then returns `label`
struct Sleeper;

#[async_trait]
impl Operation for Sleeper {
    fn type_name(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, state: &State, _cx: &OpContext) -> anyhow::Result<Payload> {
        let ms = state.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(state.get("label").cloned().unwrap_or(Value::Null))
    }
}

/// Sleeps for `ms`, then fails
struct Failer;

#[async_trait]
impl Operation for Failer {
    fn type_name(&self) -> &str {
        "fail"
    }

    async fn execute(&self, state: &State, _cx: &OpContext) -> anyhow::Result<Payload> {
        let ms = state.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        anyhow::bail!("lookup failed")
    }
}

/// Records delivery order and the errors it was asked about
#[derive(Clone, Default)]
struct Collector {
    recover: bool,
    delivered: Arc<Mutex<Vec<Value>>>,
    errors: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Operation for Collector {
    fn type_name(&self) -> &str {
        "collector"
    }

    fn children(&self) -> FactoryMap {
        FactoryMap::new()
            .with("sleep", ChildFactory::spawn(|| Sleeper))
            .with("fail", ChildFactory::spawn(|| Failer))
    }

    async fn execute(&self, _state: &State, _cx: &OpContext) -> anyhow::Result<Payload> {
        Ok(json!("own"))
    }

    fn on_child_done(&self, results: &mut ChildResults, child: ChildResult) -> anyhow::Result<()> {
        self.delivered.lock().unwrap().push(child.payload.clone());
        results.push(child);
        Ok(())
    }

    fn on_child_error(&self, child: &ChildRef, _error: &RelayError) -> bool {
        self.errors.lock().unwrap().push(child.type_name.clone());
        self.recover
    }

    fn finish(&self, _own: Payload, children: ChildResults) -> anyhow::Result<Payload> {
        Ok(Value::Array(children.into_iter().map(|c| c.payload).collect()))
    }
}

fn args(label: &str, ms: u64) -> State {
    let mut state = State::new();
    state.insert("label".into(), json!(label));
    state.insert("ms".into(), json!(ms));
    state
}

#[tokio::test]
async fn test_slow_child_delivered_before_fast_child() {
    let collector = Collector::default();
    let delivered = collector.delivered.clone();
    let ctx = RunContext::default();

    let root = RelayHandle::root(collector, State::new(), &ctx).unwrap();
    root.call("sleep", args("B", 50)).unwrap();
    root.call("sleep", args("C", 5)).unwrap();

    let payload = root.await.unwrap();
    assert_eq!(payload, json!(["B", "C"]));
    assert_eq!(*delivered.lock().unwrap(), vec![json!("B"), json!("C")]);
}

#[tokio::test]
async fn test_many_children_complete_in_reverse() {
    let collector = Collector::default();
    let delivered = collector.delivered.clone();
    let ctx = RunContext::default();

    let root = RelayHandle::root(collector, State::new(), &ctx).unwrap();
    for i in 0..20u64 {
        root.call("sleep", args(&format!("c{}", i), (20 - i) * 2)).unwrap();
    }

    let payload = root.await.unwrap();
    let expected: Vec<Value> = (0..20).map(|i| json!(format!("c{}", i))).collect();
    assert_eq!(payload, Value::Array(expected.clone()));
    assert_eq!(*delivered.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_zero_children_settles_with_own_payload() {
    let ctx = RunContext::default();
    let root = RelayHandle::root(Collector::default(), State::new(), &ctx).unwrap();

    assert_eq!(root.await.unwrap(), json!([]));
}

#[tokio::test]
async fn test_parent_never_settles_before_children() {
    let ctx = RunContext::default();
    let root = RelayHandle::root(Collector::default(), State::new(), &ctx).unwrap();
    let child = root.call("sleep", args("slow", 60)).unwrap();

    tokio::time::sleep(Duration::from_millis(15)).await;
    assert!(root.outcome().is_none());
    assert!(child.outcome().is_none());

    root.wait().await.unwrap();
    assert_eq!(child.outcome().unwrap().unwrap(), json!("slow"));
}

#[tokio::test]
async fn test_unrecoverable_error_aborts_without_waiting() {
    let collector = Collector::default();
    let delivered = collector.delivered.clone();
    let errors = collector.errors.clone();
    let ctx = RunContext::default();

    let started = Instant::now();
    let root = RelayHandle::root(collector, State::new(), &ctx).unwrap();
    root.call("fail", args("B", 10)).unwrap();
    let c = root.call("sleep", args("C", 500)).unwrap();

    let err = root.await.unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(400));
    assert!(matches!(err, RelayError::Execution { ref operation, .. } if operation == "fail"));
    assert!(ctx.is_aborted());

    assert_eq!(*errors.lock().unwrap(), vec!["fail"]);
    assert!(delivered.lock().unwrap().is_empty());

    let c_outcome = c.wait().await.unwrap_err();
    assert!(matches!(c_outcome, RelayError::Aborted { .. }));
}

#[tokio::test]
async fn test_aborted_operations_emit_one_terminal_event() {
    let log = Arc::new(Mutex::new(Vec::<LifecycleEvent>::new()));
    let sink = log.clone();
    let listener: Arc<dyn LifecycleListener> = Arc::new(move |event: &LifecycleEvent| {
        sink.lock().unwrap().push(event.clone());
    });
    let ctx = RunContext::builder().listener(listener).build();

    let root = RelayHandle::root(Collector::default(), State::new(), &ctx).unwrap();
    let b = root.call("fail", args("B", 5)).unwrap();
    let c = root.call("sleep", args("C", 500)).unwrap();

    assert!(root.wait().await.is_err());
    assert!(b.wait().await.is_err());
    assert!(c.wait().await.is_err());

    let log = log.lock().unwrap();
    let mut terminal: HashMap<_, usize> = HashMap::new();
    for event in log.iter() {
        match event.kind {
            LifecycleKind::Called { .. } => {
                terminal.entry(event.operation).or_default();
            }
            LifecycleKind::Done { .. } | LifecycleKind::Error { .. } => {
                *terminal.entry(event.operation).or_default() += 1;
            }
            _ => {}
        }
    }
    assert_eq!(terminal.len(), 3);
    assert!(terminal.values().all(|count| *count == 1));

    // The aborted sleeper reports an error rather than going silent
    assert!(log.iter().any(|e| e.operation == c.id()
        && matches!(e.kind, LifecycleKind::Error { ref message, .. } if message.starts_with("Run aborted"))));
}

#[tokio::test]
async fn test_recovered_error_still_delivers_later_children() {
    let collector = Collector {
        recover: true,
        ..Default::default()
    };
    let delivered = collector.delivered.clone();
    let errors = collector.errors.clone();
    let ctx = RunContext::default();

    let root = RelayHandle::root(collector, State::new(), &ctx).unwrap();
    root.call("sleep", args("A", 60)).unwrap();
    let b = root.call("fail", args("B", 5)).unwrap();
    root.call("sleep", args("C", 10)).unwrap();

    // B's error is handled as soon as it happens, ahead of the pending A
    let b_err = b.wait().await.unwrap_err();
    assert!(matches!(b_err, RelayError::Execution { .. }));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*errors.lock().unwrap(), vec!["fail"]);
    assert!(delivered.lock().unwrap().is_empty());

    let payload = root.await.unwrap();
    assert_eq!(payload, json!(["A", "C"]));
    assert_eq!(*delivered.lock().unwrap(), vec![json!("A"), json!("C")]);
    assert!(!ctx.is_aborted());
}
