//! Chainable handles over running operations.
//!
//! A handle exposes the calls its operation declares through a `FactoryMap`.
//! Calls on a leaf's handle go to the leaf's parent, so
//! `root.call("record")?.call("field")?.call("field")?` builds two sibling
//! fields under one record. Each handle can also be awaited for its own
//! outcome.

use std::collections::BTreeMap;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tracing::debug;

use crate::domain::{OperationId, RelayError, State};

use super::context::RunContext;
use super::operation::{self, Operation, Outcome, Scope, Started};

/// Builds a fresh child operation
pub type SpawnFn = Arc<dyn Fn() -> Arc<dyn Operation> + Send + Sync>;

/// Runs a side effect; the call then resolves to the root handle
pub type TerminalFn = Arc<dyn Fn(&RunContext, &State) -> anyhow::Result<()> + Send + Sync>;

/// One exposed call
#[derive(Clone)]
pub enum ChildFactory {
    Spawn(SpawnFn),
    Terminal(TerminalFn),
}

impl ChildFactory {
    pub fn spawn<F, O>(make: F) -> Self
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: Operation,
    {
        Self::Spawn(Arc::new(move || Arc::new(make()) as Arc<dyn Operation>))
    }

    pub fn terminal<F>(action: F) -> Self
    where
        F: Fn(&RunContext, &State) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Terminal(Arc::new(action))
    }
}

impl fmt::Debug for ChildFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(_) => f.write_str("ChildFactory::Spawn"),
            Self::Terminal(_) => f.write_str("ChildFactory::Terminal"),
        }
    }
}

/// Calls exposed by an operation, keyed by name
#[derive(Debug, Clone, Default)]
pub struct FactoryMap {
    entries: BTreeMap<String, ChildFactory>,
}

impl FactoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, factory: ChildFactory) -> Self {
        self.insert(name, factory);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, factory: ChildFactory) {
        self.entries.insert(name.into(), factory);
    }

    pub fn get(&self, name: &str) -> Option<&ChildFactory> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the run context remembers about its root
#[derive(Clone)]
pub(crate) struct RootSlot {
    id: OperationId,
    type_name: String,
    outcome: watch::Receiver<Option<Outcome>>,
    scope: Arc<Scope>,
}

/// Handle to one running operation
#[derive(Clone)]
pub struct RelayHandle {
    id: OperationId,
    type_name: String,
    outcome: watch::Receiver<Option<Outcome>>,
    scope: Arc<Scope>,
    ctx: RunContext,
    is_root: bool,
}

impl RelayHandle {
    /// Start the root operation of a run. A context holds at most one root.
    ///
    /// Must be called inside a current-thread runtime: calls chained before
    /// the caller's next `.await` rely on no operation advancing in between.
    pub fn root<O: Operation>(op: O, args: State, ctx: &RunContext) -> Result<Self, RelayError> {
        Self::root_arc(Arc::new(op), args, ctx)
    }

    pub fn root_arc(
        op: Arc<dyn Operation>,
        args: State,
        ctx: &RunContext,
    ) -> Result<Self, RelayError> {
        ensure_current_thread()?;
        let slot = ctx.claim_root(|| {
            let Started {
                id,
                type_name,
                outcome,
                scope,
            } = operation::start(op, args, None, ctx, true)?;
            Ok(RootSlot {
                id,
                type_name,
                outcome,
                scope,
            })
        })?;
        debug!(root = %slot.id, type_name = %slot.type_name, "Root started");
        Ok(Self::from_root(slot, ctx))
    }

    fn from_root(slot: RootSlot, ctx: &RunContext) -> Self {
        Self {
            id: slot.id,
            type_name: slot.type_name,
            outcome: slot.outcome,
            scope: slot.scope,
            ctx: ctx.clone(),
            is_root: true,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Names of the calls available on this handle
    pub fn calls(&self) -> impl Iterator<Item = &str> {
        self.scope.factories.names()
    }

    /// Invoke an exposed call. Leaf handles delegate to their parent.
    pub fn call(&self, name: &str, args: State) -> Result<RelayHandle, RelayError> {
        dispatch(&self.scope, &self.ctx, name, args)
    }

    /// Spawn an operation outside the declared calls, as a child of this scope
    pub fn spawn<O: Operation>(&self, op: O, args: State) -> Result<RelayHandle, RelayError> {
        spawn_child(&self.scope, Arc::new(op), args, &self.ctx)
    }

    /// This operation's outcome, once settled
    pub async fn wait(&self) -> Outcome {
        wait_outcome(self.outcome.clone()).await
    }

    /// Settled outcome without waiting
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome.borrow().clone()
    }

    /// The root's outcome, whichever handle of the chain this is
    pub async fn done(self) -> Outcome {
        match self.ctx.root_slot() {
            Some(root) => wait_outcome(root.outcome).await,
            None => wait_outcome(self.outcome).await,
        }
    }
}

impl fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHandle")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("is_root", &self.is_root)
            .finish()
    }
}

impl IntoFuture for RelayHandle {
    type Output = Outcome;
    type IntoFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(wait_outcome(self.outcome))
    }
}

fn ensure_current_thread() -> Result<(), RelayError> {
    let handle = Handle::try_current()
        .map_err(|_| RelayError::UnsupportedRuntime("no runtime".to_string()))?;
    match handle.runtime_flavor() {
        RuntimeFlavor::CurrentThread => Ok(()),
        other => Err(RelayError::UnsupportedRuntime(format!("{:?}", other))),
    }
}

pub(crate) fn dispatch(
    scope: &Arc<Scope>,
    ctx: &RunContext,
    name: &str,
    args: State,
) -> Result<RelayHandle, RelayError> {
    let factory = scope
        .factories
        .get(name)
        .ok_or_else(|| RelayError::UnknownCall {
            operation: scope.link.type_name.clone(),
            name: name.to_string(),
        })?;

    match factory {
        ChildFactory::Spawn(make) => spawn_child(scope, make(), args, ctx),
        ChildFactory::Terminal(action) => {
            action(ctx, &args).map_err(|e| RelayError::execution(&scope.link.type_name, e))?;
            let root = ctx.root_slot().ok_or_else(|| {
                RelayError::protocol(&scope.link.type_name, format!("'{}' called without a root", name))
            })?;
            Ok(RelayHandle::from_root(root, ctx))
        }
    }
}

pub(crate) fn spawn_child(
    scope: &Arc<Scope>,
    op: Arc<dyn Operation>,
    args: State,
    ctx: &RunContext,
) -> Result<RelayHandle, RelayError> {
    let started = operation::start(op, args, Some(scope), ctx, false).map_err(|err| {
        if err.is_always_fatal() {
            ctx.abort(err.clone());
        }
        err
    })?;

    Ok(RelayHandle {
        id: started.id,
        type_name: started.type_name,
        outcome: started.outcome,
        scope: started.scope,
        ctx: ctx.clone(),
        is_root: false,
    })
}

async fn wait_outcome(mut outcome: watch::Receiver<Option<Outcome>>) -> Outcome {
    loop {
        let current = outcome.borrow_and_update().clone();
        if let Some(settled) = current {
            return settled;
        }
        if outcome.changed().await.is_err() {
            let last = outcome.borrow().clone();
            return last.unwrap_or_else(|| {
                Err(RelayError::protocol("relay", "operation dropped before settling"))
            });
        }
    }
}
