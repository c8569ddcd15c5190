//! Operations and the lifecycle engine that runs them.
//!
//! Each operation runs in its own task through a fixed sequence:
//! called → pre-run hook → prompts (interactive only) → readiness →
//! execute → wait for children → done | error.
//!
//! Children report to their parent through the parent's inbox channel. The
//! parent's engine feeds those events through a `CompletionSequencer`, so
//! its `on_child_done` handler sees payloads in call order no matter when
//! each child actually finished.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::adapters::PromptPlan;
use crate::domain::{
    LifecycleEvent, LifecycleKind, Mode, OperationId, Payload, Reason, RelayError, State,
};

use super::context::RunContext;
use super::registry::{Owner, RegisterOptions};
use super::relay::{self, FactoryMap, RelayHandle};
use super::sequencer::{CompletionSequencer, Delivery, SequenceError};

/// Settled result of one operation
pub type Outcome = Result<Payload, RelayError>;

/// Result of an operation's readiness check
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Ready,
    NotReady(Reason),
}

impl Readiness {
    pub fn not_ready(reason: impl Into<Reason>) -> Self {
        Self::NotReady(reason.into())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Child identity passed to a parent's error handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    pub id: OperationId,
    pub type_name: String,
}

/// A child's payload, delivered in call order
#[derive(Debug, Clone, PartialEq)]
pub struct ChildResult {
    pub child: OperationId,
    pub type_name: String,
    pub payload: Payload,
}

/// Child payloads collected by a parent so far
pub type ChildResults = Vec<ChildResult>;

/// A unit of orchestrated work.
///
/// The engine owns the operation's `State`; implementations stay `&self` so
/// handlers can run while `execute` is still in flight.
#[async_trait]
pub trait Operation: Send + Sync + 'static {
    /// Identity used in logs, events and as the default reference prefix
    fn type_name(&self) -> &str;

    /// Leaf operations never parent; calls chained on them go to their parent
    fn is_leaf(&self) -> bool {
        false
    }

    /// Chainable calls exposed on this operation's handle
    fn children(&self) -> FactoryMap {
        FactoryMap::new()
    }

    /// Runs before prompting
    async fn before_run(&self, _state: &mut State, _cx: &OpContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Prompt batches to drain in interactive mode
    fn prompts(&self) -> Option<Box<dyn PromptPlan>> {
        None
    }

    fn ready(&self, _state: &State) -> Readiness {
        Readiness::Ready
    }

    async fn execute(&self, state: &State, cx: &OpContext) -> anyhow::Result<Payload>;

    async fn execute_interactive(&self, state: &State, cx: &OpContext) -> anyhow::Result<Payload> {
        self.execute(state, cx).await
    }

    /// Called once per successful child, in call order
    fn on_child_done(&self, results: &mut ChildResults, child: ChildResult) -> anyhow::Result<()> {
        results.push(child);
        Ok(())
    }

    /// Called as soon as a child fails. Return `true` if the run can continue.
    fn on_child_error(&self, _child: &ChildRef, _error: &RelayError) -> bool {
        false
    }

    /// Combine the execute payload with the delivered child payloads
    fn finish(&self, own: Payload, _children: ChildResults) -> anyhow::Result<Payload> {
        Ok(own)
    }
}

/// What an operation sees of the run while it executes
#[derive(Clone)]
pub struct OpContext {
    id: OperationId,
    type_name: String,
    run: RunContext,
    scope: Arc<Scope>,
}

impl OpContext {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn run(&self) -> &RunContext {
        &self.run
    }

    pub fn mode(&self) -> Mode {
        self.run.mode()
    }

    /// Invoke one of the exposed calls from inside this operation
    pub fn call(&self, name: &str, args: State) -> Result<RelayHandle, RelayError> {
        relay::dispatch(&self.scope, &self.run, name, args)
    }

    /// Spawn an arbitrary operation as a child
    pub fn spawn(&self, op: Arc<dyn Operation>, args: State) -> Result<RelayHandle, RelayError> {
        relay::spawn_child(&self.scope, op, args, &self.run)
    }

    /// Generated reference filled with this operation's payload when it is done
    pub fn register(
        &self,
        prefix: Option<&str>,
        replacing: Option<&str>,
    ) -> Result<String, RelayError> {
        let mut options = RegisterOptions::prefix(prefix.unwrap_or(&self.type_name));
        if let Some(old) = replacing {
            options = options.replacing(old);
        }
        Ok(self
            .run
            .registry()
            .register(Owner::Operation(self.id), options)?)
    }

    /// Custom reference filled with this operation's payload when it is done
    pub fn register_custom(&self, key: &str, replacing: Option<&str>) -> Result<String, RelayError> {
        Ok(self
            .run
            .registry()
            .register_custom(Owner::Operation(self.id), key, replacing)?)
    }
}

/// Messages from children to their parent's engine
#[derive(Debug)]
pub(crate) enum ChildEvent {
    Called { child: OperationId, type_name: String },
    Done { child: OperationId, payload: Payload },
    Failed { child: OperationId, error: RelayError },
    Lost { child: OperationId },
}

/// Parent side of the call protocol
pub(crate) struct NodeLink {
    pub(crate) id: OperationId,
    pub(crate) type_name: String,
    tx: mpsc::UnboundedSender<ChildEvent>,
    sealed: Mutex<bool>,
}

impl NodeLink {
    fn lock_sealed(&self) -> MutexGuard<'_, bool> {
        self.sealed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise `called` for a new child; fails once this operation has settled.
    fn announce(&self, child: OperationId, type_name: &str) -> Result<(), RelayError> {
        let sealed = self.lock_sealed();
        if *sealed {
            return Err(RelayError::protocol(
                &self.type_name,
                format!("'{}' called after {} settled", type_name, self.type_name),
            ));
        }
        self.tx
            .send(ChildEvent::Called {
                child,
                type_name: type_name.to_string(),
            })
            .map_err(|_| {
                RelayError::protocol(
                    &self.type_name,
                    format!("'{}' called after {} stopped", type_name, self.type_name),
                )
            })
    }

    /// Next queued event, or seal the link if there is none
    fn seal_or_next(&self, inbox: &mut mpsc::UnboundedReceiver<ChildEvent>) -> Option<ChildEvent> {
        let mut sealed = self.lock_sealed();
        match inbox.try_recv() {
            Ok(event) => Some(event),
            Err(_) => {
                *sealed = true;
                None
            }
        }
    }

    fn seal(&self) {
        *self.lock_sealed() = true;
    }
}

/// Where chained calls land: an operation and its exposed calls
pub(crate) struct Scope {
    pub(crate) link: Arc<NodeLink>,
    pub(crate) factories: Arc<FactoryMap>,
}

/// Child side of the call protocol; reports `lost` if dropped silently
struct ParentReporter {
    parent: Arc<NodeLink>,
    child: OperationId,
    reported: bool,
}

impl ParentReporter {
    fn done(mut self, payload: Payload) {
        let child = self.child;
        self.send(ChildEvent::Done { child, payload });
    }

    fn failed(mut self, error: RelayError) {
        let child = self.child;
        self.send(ChildEvent::Failed { child, error });
    }

    /// The run is being torn down; nobody is listening
    fn dismiss(mut self) {
        self.reported = true;
    }

    fn send(&mut self, event: ChildEvent) {
        self.reported = true;
        if self.parent.tx.send(event).is_err() {
            debug!(parent = %self.parent.type_name, "Parent stopped before child reported");
        }
    }
}

impl Drop for ParentReporter {
    fn drop(&mut self) {
        if !self.reported {
            let _ = self.parent.tx.send(ChildEvent::Lost { child: self.child });
        }
    }
}

/// A started operation, as seen by the handle that wraps it
pub(crate) struct Started {
    pub(crate) id: OperationId,
    pub(crate) type_name: String,
    pub(crate) outcome: watch::Receiver<Option<Outcome>>,
    /// Scope for calls chained on this operation (its parent's for leaves)
    pub(crate) scope: Arc<Scope>,
}

/// Raise `called` to the parent and spawn the rest of the lifecycle.
///
/// `called` is raised synchronously so call order equals invocation order.
pub(crate) fn start(
    op: Arc<dyn Operation>,
    args: State,
    parent: Option<&Arc<Scope>>,
    run: &RunContext,
    is_root: bool,
) -> Result<Started, RelayError> {
    let id = OperationId::new();
    let type_name = op.type_name().to_string();

    let reporter = match parent {
        Some(scope) => {
            scope.link.announce(id, &type_name)?;
            Some(ParentReporter {
                parent: scope.link.clone(),
                child: id,
                reported: false,
            })
        }
        None => None,
    };
    run.emit(LifecycleEvent::new(
        id,
        &type_name,
        LifecycleKind::Called {
            parent: parent.map(|scope| scope.link.id),
        },
    ));

    let (tx, inbox) = mpsc::unbounded_channel();
    let own = Arc::new(Scope {
        link: Arc::new(NodeLink {
            id,
            type_name: type_name.clone(),
            tx,
            sealed: Mutex::new(false),
        }),
        factories: Arc::new(op.children()),
    });
    let scope = match parent {
        Some(parent) if op.is_leaf() => parent.clone(),
        _ => own.clone(),
    };

    let (outcome_tx, outcome) = watch::channel(None);
    let engine = Engine {
        op,
        cx: OpContext {
            id,
            type_name: type_name.clone(),
            run: run.clone(),
            scope: scope.clone(),
        },
        link: own.link.clone(),
        inbox,
        parent: reporter,
        outcome: outcome_tx,
        is_root,
    };

    let span = info_span!("operation", operation = %id, type_name = %type_name);
    run.operation_started();
    tokio::spawn(engine.run(args).instrument(span));

    Ok(Started {
        id,
        type_name,
        outcome,
        scope,
    })
}

struct Engine {
    op: Arc<dyn Operation>,
    cx: OpContext,
    link: Arc<NodeLink>,
    inbox: mpsc::UnboundedReceiver<ChildEvent>,
    parent: Option<ParentReporter>,
    outcome: watch::Sender<Option<Outcome>>,
    is_root: bool,
}

enum Halt {
    Done(Payload),
    Failed(RelayError),
    Aborted(RelayError),
}

impl Engine {
    async fn run(self, args: State) {
        let Engine {
            op,
            cx,
            link,
            mut inbox,
            parent,
            outcome,
            is_root,
        } = self;
        let run = cx.run.clone();
        let mut children = ChildTracker::new(op.clone(), run.clone(), cx.type_name.clone());

        let halt = tokio::select! {
            biased;
            cause = run.aborted() => Halt::Aborted(cause),
            result = lifecycle(op.as_ref(), &cx, &link, &mut inbox, &mut children, args, is_root) => {
                match result {
                    Ok(payload) => Halt::Done(payload),
                    Err(err) => Halt::Failed(err),
                }
            }
        };
        link.seal();

        let name = cx.type_name.as_str();
        match halt {
            Halt::Done(payload) => {
                // Own future first, then listeners, then the parent
                outcome.send_replace(Some(Ok(payload.clone())));
                info!(children = children.sequencer.called_count(), "Operation done");
                run.emit(LifecycleEvent::new(
                    cx.id,
                    name,
                    LifecycleKind::Done {
                        payload: payload.clone(),
                    },
                ));
                if let Some(parent) = parent {
                    parent.done(payload);
                }
            }
            Halt::Failed(err) => {
                run.report_error(name, &err);
                outcome.send_replace(Some(Err(err.clone())));
                run.emit(LifecycleEvent::error(cx.id, name, &err));
                match parent {
                    Some(parent) if !err.is_always_fatal() && !run.is_aborted() => {
                        parent.failed(err)
                    }
                    Some(parent) => {
                        parent.dismiss();
                        run.abort(err);
                    }
                    None => run.abort(err),
                }
            }
            Halt::Aborted(cause) => {
                debug!("Operation stopped by abort");
                let settled = if is_root {
                    cause
                } else {
                    RelayError::Aborted {
                        cause: Box::new(cause),
                    }
                };
                outcome.send_replace(Some(Err(settled.clone())));
                run.emit(LifecycleEvent::error(cx.id, name, &settled));
                if let Some(parent) = parent {
                    parent.dismiss();
                }
            }
        }

        if run.operation_settled() {
            run.teardown();
        }
    }
}

async fn lifecycle(
    op: &dyn Operation,
    cx: &OpContext,
    link: &NodeLink,
    inbox: &mut mpsc::UnboundedReceiver<ChildEvent>,
    children: &mut ChildTracker,
    mut state: State,
    is_root: bool,
) -> Result<Payload, RelayError> {
    let run = &cx.run;
    let name = cx.type_name.as_str();
    let failed = |err: anyhow::Error| RelayError::execution(name, err);

    serviced(op.before_run(&mut state, cx), inbox, children)
        .await?
        .map_err(failed)?;

    let interactive = run.mode().is_interactive();
    if interactive {
        if let Some(mut plan) = op.prompts() {
            let mut batch_no = 0;
            while let Some(batch) = plan.next_batch(&state) {
                if batch.is_empty() {
                    continue;
                }
                run.emit(LifecycleEvent::new(
                    cx.id,
                    name,
                    LifecycleKind::Prompting {
                        batch: batch_no,
                        prompts: batch.iter().map(|p| p.name.clone()).collect(),
                    },
                ));

                let answers = serviced(run.prompter().ask(&batch), inbox, children)
                    .await?
                    .map_err(failed)?;
                debug!(batch = batch_no, answers = answers.len(), "Merged prompt answers");
                state.extend(answers);
                batch_no += 1;
            }
        }
    }

    if let Readiness::NotReady(reason) = op.ready(&state) {
        return Err(RelayError::Validation {
            operation: name.to_string(),
            reason,
        });
    }
    run.emit(LifecycleEvent::new(cx.id, name, LifecycleKind::Ready));

    run.emit(LifecycleEvent::new(
        cx.id,
        name,
        LifecycleKind::Executing { interactive },
    ));
    let own = if interactive {
        serviced(op.execute_interactive(&state, cx), inbox, children).await?
    } else {
        serviced(op.execute(&state, cx), inbox, children).await?
    }
    .map_err(failed)?;

    // Every called child must report before this operation may settle
    loop {
        if !children.sequencer.is_settled() {
            match inbox.recv().await {
                Some(event) => children.handle(event)?,
                None => return Err(RelayError::protocol(name, "child channel closed")),
            }
            continue;
        }
        match link.seal_or_next(inbox) {
            Some(event) => children.handle(event)?,
            None => break,
        }
    }
    children.verify()?;

    let payload = op.finish(own, children.take_results()).map_err(failed)?;
    if is_root {
        run.sink().submit(&payload).await.map_err(failed)?;
    }
    Ok(payload)
}

/// Drive `fut` while handling child events as they arrive
async fn serviced<F: Future>(
    fut: F,
    inbox: &mut mpsc::UnboundedReceiver<ChildEvent>,
    children: &mut ChildTracker,
) -> Result<F::Output, RelayError> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;
            output = &mut fut => return Ok(output),
            Some(event) = inbox.recv() => children.handle(event)?,
        }
    }
}

/// Parent-side handling of child events
struct ChildTracker {
    op: Arc<dyn Operation>,
    run: RunContext,
    type_name: String,
    sequencer: CompletionSequencer,
    results: ChildResults,
}

impl ChildTracker {
    fn new(op: Arc<dyn Operation>, run: RunContext, type_name: String) -> Self {
        Self {
            op,
            run,
            type_name,
            sequencer: CompletionSequencer::new(),
            results: ChildResults::new(),
        }
    }

    fn violation(&self, err: SequenceError) -> RelayError {
        RelayError::protocol(&self.type_name, err.to_string())
    }

    fn handle(&mut self, event: ChildEvent) -> Result<(), RelayError> {
        match event {
            ChildEvent::Called { child, type_name } => {
                let position = self
                    .sequencer
                    .called(child, type_name)
                    .map_err(|e| self.violation(e))?;
                debug!(%child, position, "Child called");
                Ok(())
            }
            ChildEvent::Done { child, payload } => {
                let released = self
                    .sequencer
                    .complete(child, payload)
                    .map_err(|e| self.violation(e))?;
                self.deliver(released)
            }
            ChildEvent::Failed { child, error } => {
                let released = self.sequencer.fail(child).map_err(|e| self.violation(e))?;
                let child_ref = ChildRef {
                    id: child,
                    type_name: self
                        .sequencer
                        .type_name_of(child)
                        .unwrap_or_default()
                        .to_string(),
                };

                if !self.op.on_child_error(&child_ref, &error) {
                    warn!(%child, child_type = %child_ref.type_name, error = %error, "Child error is unrecoverable");
                    self.run.abort(error.clone());
                    return Err(error);
                }

                info!(%child, child_type = %child_ref.type_name, "Recovered from child error");
                self.deliver(released)
            }
            ChildEvent::Lost { child } => Err(RelayError::protocol(
                &self.type_name,
                format!("child {} stopped without reporting done or error", child),
            )),
        }
    }

    fn deliver(&mut self, released: Vec<Delivery>) -> Result<(), RelayError> {
        for delivery in released {
            debug!(child = %delivery.child, index = delivery.index, "Delivering child payload");
            self.op
                .on_child_done(
                    &mut self.results,
                    ChildResult {
                        child: delivery.child,
                        type_name: delivery.type_name,
                        payload: delivery.payload,
                    },
                )
                .map_err(|e| RelayError::execution(&self.type_name, e))?;
        }
        Ok(())
    }

    /// Called and terminal counts must match before settling
    fn verify(&self) -> Result<(), RelayError> {
        let called = self.sequencer.called_count();
        let terminal = self.sequencer.terminal_count();
        if called != terminal {
            return Err(RelayError::protocol(
                &self.type_name,
                format!("{} children called but {} reported", called, terminal),
            ));
        }
        Ok(())
    }

    fn take_results(&mut self) -> ChildResults {
        std::mem::take(&mut self.results)
    }
}
