//! Run context shared by every operation in one tree.
//!
//! Holds what would otherwise be process-wide state: the reference registry,
//! the connection accessor, the collaborators, lifecycle listeners and the
//! abort signal. One context belongs to exactly one root handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::adapters::{
    Connection, ConnectionProvider, FatalHook, LogFatal, NullSink, PromptProvider, ReportSink,
    ScriptedPrompter, StderrChannel, UserChannel,
};
use crate::config::RelayConfig;
use crate::domain::{LifecycleEvent, Mode, RelayError};

use super::registry::ReferenceRegistry;
use super::relay::RootSlot;

/// Observer of lifecycle events; called synchronously, in emission order
pub trait LifecycleListener: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

impl<F> LifecycleListener for F
where
    F: Fn(&LifecycleEvent) + Send + Sync,
{
    fn on_event(&self, event: &LifecycleEvent) {
        self(event)
    }
}

/// Cheaply clonable handle to the state of one run
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    mode: Mode,
    show_errors: bool,
    registry: Arc<ReferenceRegistry>,
    connection: Arc<ConnectionProvider>,
    prompter: Arc<dyn PromptProvider>,
    sink: Arc<dyn ReportSink>,
    fatal: Arc<dyn FatalHook>,
    user: Arc<dyn UserChannel>,
    listeners: RwLock<Vec<Arc<dyn LifecycleListener>>>,
    abort: watch::Sender<Option<RelayError>>,
    root: Mutex<Option<RootSlot>>,
    /// Operations started but not yet settled
    live: AtomicUsize,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RunContext {
    pub fn builder() -> RunContextBuilder {
        RunContextBuilder::default()
    }

    /// Context configured from resolved settings, with default collaborators
    pub fn from_config(config: &RelayConfig) -> RunContextBuilder {
        RunContextBuilder::default()
            .mode(config.mode)
            .show_errors(config.show_errors)
            .registry(ReferenceRegistry::with_default_prefix(&config.default_prefix))
            .connection(config.connection.clone())
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn registry(&self) -> &Arc<ReferenceRegistry> {
        &self.inner.registry
    }

    pub fn connection(&self) -> &ConnectionProvider {
        &self.inner.connection
    }

    pub fn prompter(&self) -> &dyn PromptProvider {
        self.inner.prompter.as_ref()
    }

    pub fn sink(&self) -> &dyn ReportSink {
        self.inner.sink.as_ref()
    }

    pub fn add_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Deliver an event to the registry, then to every listener
    pub(crate) fn emit(&self, event: LifecycleEvent) {
        self.inner.registry.on_event(&event);

        let listeners = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_event(&event);
        }
    }

    /// Log an error; errors flagged for display also go to the user channel in interactive mode.
    pub(crate) fn report_error(&self, operation: &str, err: &RelayError) {
        error!(operation, error = %err, "Operation failed");

        if self.inner.mode.is_interactive() && self.inner.show_errors && err.display_to_user() {
            self.inner.user.show(&err.to_string());
        }
    }

    /// Mark the run as aborted by an unrecoverable error.
    ///
    /// Only the first call has any effect; it invokes the fatal hook.
    pub(crate) fn abort(&self, err: RelayError) {
        let first = self.inner.abort.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(err.clone());
                true
            } else {
                false
            }
        });

        if first {
            warn!(error = %err, "Run aborted");
            self.inner.fatal.on_fatal(&err);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.abort.borrow().is_some()
    }

    /// Resolves with the fatal error once the run is aborted
    pub(crate) async fn aborted(&self) -> RelayError {
        let mut rx = self.inner.abort.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(err) = current {
                return err;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Start the root under the slot lock so a context never gets two roots
    pub(crate) fn claim_root(
        &self,
        start: impl FnOnce() -> Result<RootSlot, RelayError>,
    ) -> Result<RootSlot, RelayError> {
        let mut root = self.inner.root.lock().unwrap_or_else(PoisonError::into_inner);
        if root.is_some() {
            return Err(RelayError::RootExists);
        }
        let slot = start()?;
        *root = Some(slot.clone());
        Ok(slot)
    }

    pub(crate) fn root_slot(&self) -> Option<RootSlot> {
        self.inner
            .root
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn operation_started(&self) {
        self.inner.live.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true for the last operation of the run to settle
    pub(crate) fn operation_settled(&self) -> bool {
        self.inner.live.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Drop listeners once every operation has settled so nothing outlives the run
    pub(crate) fn teardown(&self) {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        debug!(listeners = listeners.len(), "Tearing down run context");
        listeners.clear();
    }
}

/// Builder for `RunContext`
pub struct RunContextBuilder {
    mode: Mode,
    show_errors: bool,
    registry: ReferenceRegistry,
    connection: Option<Connection>,
    prompter: Arc<dyn PromptProvider>,
    sink: Arc<dyn ReportSink>,
    fatal: Arc<dyn FatalHook>,
    user: Arc<dyn UserChannel>,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl Default for RunContextBuilder {
    fn default() -> Self {
        Self {
            mode: Mode::Library,
            show_errors: true,
            registry: ReferenceRegistry::new(),
            connection: None,
            prompter: Arc::new(ScriptedPrompter::new()),
            sink: Arc::new(NullSink),
            fatal: Arc::new(LogFatal),
            user: Arc::new(StderrChannel),
            listeners: Vec::new(),
        }
    }
}

impl RunContextBuilder {
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn show_errors(mut self, show: bool) -> Self {
        self.show_errors = show;
        self
    }

    pub fn registry(mut self, registry: ReferenceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn connection(mut self, connection: Option<Connection>) -> Self {
        self.connection = connection;
        self
    }

    pub fn prompter(mut self, prompter: Arc<dyn PromptProvider>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn fatal_hook(mut self, hook: Arc<dyn FatalHook>) -> Self {
        self.fatal = hook;
        self
    }

    pub fn user_channel(mut self, channel: Arc<dyn UserChannel>) -> Self {
        self.user = channel;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> RunContext {
        let (abort, _) = watch::channel(None);
        RunContext {
            inner: Arc::new(ContextInner {
                mode: self.mode,
                show_errors: self.show_errors,
                registry: Arc::new(self.registry),
                connection: Arc::new(ConnectionProvider::new(self.connection)),
                prompter: self.prompter,
                sink: self.sink,
                fatal: self.fatal,
                user: self.user,
                listeners: RwLock::new(self.listeners),
                abort,
                root: Mutex::new(None),
                live: AtomicUsize::new(0),
            }),
        }
    }
}
