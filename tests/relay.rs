//! Relay Handle Integration Tests
//!
//! Tests for chained calls, leaf delegation, terminal calls and spawning
//! children from inside an executing operation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use oprelay::adapters::FatalHook;
use oprelay::{
    ChildFactory, ChildResults, FactoryMap, OpContext, Operation, Payload, RelayError,
    RelayHandle, RunContext, State,
};

/// Leaf that echoes its `value` argument
struct Item;

#[async_trait]
impl Operation for Item {
    fn type_name(&self) -> &str {
        "item"
    }

    fn is_leaf(&self) -> bool {
        true
    }

    async fn execute(&self, state: &State, _cx: &OpContext) -> anyhow::Result<Payload> {
        Ok(state.get("value").cloned().unwrap_or(Value::Null))
    }
}

/// Non-leaf that lists its children's payloads under its own name
struct Group;

fn group_calls() -> FactoryMap {
    FactoryMap::new()
        .with("item", ChildFactory::spawn(|| Item))
        .with("group", ChildFactory::spawn(|| Group))
        .with("finish", ChildFactory::terminal(|_, _| Ok(())))
}

#[async_trait]
impl Operation for Group {
    fn type_name(&self) -> &str {
        "group"
    }

    fn children(&self) -> FactoryMap {
        group_calls()
    }

    async fn execute(&self, state: &State, _cx: &OpContext) -> anyhow::Result<Payload> {
        Ok(state.get("name").cloned().unwrap_or(json!("group")))
    }

    fn finish(&self, own: Payload, children: ChildResults) -> anyhow::Result<Payload> {
        let items: Vec<Payload> = children.into_iter().map(|c| c.payload).collect();
        Ok(json!({ "name": own, "items": items }))
    }
}

/// Spawns two items from inside execute and waits for the first one
struct Spawner;

#[async_trait]
impl Operation for Spawner {
    fn type_name(&self) -> &str {
        "spawner"
    }

    fn children(&self) -> FactoryMap {
        group_calls()
    }

    async fn execute(&self, _state: &State, cx: &OpContext) -> anyhow::Result<Payload> {
        let first = cx.call("item", value(1))?;
        cx.spawn(Arc::new(Item), value(2))?;

        let seen = first.wait().await?;
        Ok(json!({ "first": seen }))
    }

    fn finish(&self, own: Payload, children: ChildResults) -> anyhow::Result<Payload> {
        let items: Vec<Payload> = children.into_iter().map(|c| c.payload).collect();
        Ok(json!({ "own": own, "items": items }))
    }
}

struct CountingHook(AtomicUsize);

impl FatalHook for CountingHook {
    fn on_fatal(&self, _error: &RelayError) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn value(v: i64) -> State {
    let mut state = State::new();
    state.insert("value".into(), json!(v));
    state
}

fn named(name: &str) -> State {
    let mut state = State::new();
    state.insert("name".into(), json!(name));
    state
}

#[tokio::test]
async fn test_calls_on_leaf_go_to_its_parent() {
    let ctx = RunContext::default();
    let root = RelayHandle::root(Group, named("root"), &ctx).unwrap();

    let end = root
        .call("item", value(1))
        .unwrap()
        .call("item", value(2))
        .unwrap()
        .call("item", value(3))
        .unwrap()
        .call("finish", State::new())
        .unwrap();

    assert!(end.is_root());
    assert_eq!(end.id(), root.id());

    let payload = end.done().await.unwrap();
    assert_eq!(payload, json!({ "name": "root", "items": [1, 2, 3] }));
}

#[tokio::test]
async fn test_calls_on_non_leaf_nest() {
    let ctx = RunContext::default();
    let root = RelayHandle::root(Group, named("root"), &ctx).unwrap();

    let inner = root.call("group", named("inner")).unwrap();
    inner.call("item", value(1)).unwrap().call("item", value(2)).unwrap();
    root.call("item", value(3)).unwrap();

    let payload = root.await.unwrap();
    assert_eq!(
        payload,
        json!({
            "name": "root",
            "items": [{ "name": "inner", "items": [1, 2] }, 3]
        })
    );
    assert_eq!(
        inner.wait().await.unwrap(),
        json!({ "name": "inner", "items": [1, 2] })
    );
}

#[tokio::test]
async fn test_done_awaits_root_from_any_handle() {
    let ctx = RunContext::default();
    let root = RelayHandle::root(Group, named("root"), &ctx).unwrap();
    let leaf = root.call("item", value(7)).unwrap();

    // Several handles may wait on the same outcome
    let again = leaf.clone();
    assert_eq!(again.wait().await.unwrap(), json!(7));
    assert_eq!(leaf.wait().await.unwrap(), json!(7));

    let payload = leaf.done().await.unwrap();
    assert_eq!(payload["items"], json!([7]));
}

#[tokio::test]
async fn test_second_root_is_rejected() {
    let ctx = RunContext::default();
    let root = RelayHandle::root(Group, State::new(), &ctx).unwrap();

    let err = RelayHandle::root(Group, State::new(), &ctx).unwrap_err();
    assert!(matches!(err, RelayError::RootExists));
    assert!(root.await.is_ok());
}

#[tokio::test]
async fn test_unknown_call_names_the_delegated_parent() {
    let ctx = RunContext::default();
    let root = RelayHandle::root(Group, State::new(), &ctx).unwrap();
    let leaf = root.call("item", value(1)).unwrap();

    let calls: Vec<&str> = leaf.calls().collect();
    assert_eq!(calls, vec!["finish", "group", "item"]);

    let err = leaf.call("record", State::new()).unwrap_err();
    match err {
        RelayError::UnknownCall { operation, name } => {
            assert_eq!(operation, "group");
            assert_eq!(name, "record");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(root.await.is_ok());
}

#[tokio::test]
async fn test_children_spawned_during_execute() {
    let ctx = RunContext::default();
    let root = RelayHandle::root(Spawner, State::new(), &ctx).unwrap();

    let payload = root.await.unwrap();
    assert_eq!(
        payload,
        json!({ "own": { "first": 1 }, "items": [1, 2] })
    );
}

#[tokio::test]
async fn test_call_after_settle_is_a_protocol_violation() {
    let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
    let ctx = RunContext::builder().fatal_hook(hook.clone()).build();
    let root = RelayHandle::root(Group, State::new(), &ctx).unwrap();
    let leaf = root.call("item", value(1)).unwrap();

    root.wait().await.unwrap();

    let err = leaf.call("item", value(2)).unwrap_err();
    assert!(matches!(err, RelayError::ProtocolViolation { .. }));
    assert!(err.is_always_fatal());
    assert_eq!(hook.0.load(Ordering::SeqCst), 1);
}
