//! The background execution collaborator seam.
//!
//! The worker runtime does not know what runs inside a worker thread; it
//! drives an [`Agent`] produced by the creating context's [`AgentFactory`].
//! The agent sees the outside world only through its [`AgentScope`]: the
//! captured options and a FIFO path back to the handle's owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::error::WorkerResult;
use crate::options::WorkerOptions;
use crate::serialize::{self, SerializedMessage, Transferable};
use crate::value::Value;
use crate::worker::{self, Notification, WorkerShared};

/// Why an agent could not be created for a script locator.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("script not found: {0}")]
    ScriptNotFound(String),
    #[error("{0}")]
    Boot(String),
}

/// The code that runs inside a worker thread.
///
/// Calls arrive on the worker's own thread, one at a time, in channel order.
pub trait Agent: Send {
    /// Runs once after the thread starts, before any message is delivered.
    fn boot(&mut self, _scope: &mut AgentScope) {}

    /// Handles one message from the owner.
    fn handle_message(&mut self, data: Value, scope: &mut AgentScope);

    /// Runs once when the thread is shutting down, terminate or self-exit.
    fn shutdown(&mut self, _scope: &mut AgentScope) {}
}

/// Produces agents from script locators. `create` runs synchronously on the
/// constructing thread; failure aborts worker construction.
pub trait AgentFactory: Send + Sync {
    fn create(&self, locator: &str, options: &WorkerOptions) -> Result<Box<dyn Agent>, AgentError>;
}

/// Worker-side view of the worker: options snapshot plus the path back to
/// the owner. Handed to every [`Agent`] call.
pub struct AgentScope {
    shared: Arc<WorkerShared>,
    options: WorkerOptions,
    closed: bool,
}

impl AgentScope {
    pub(crate) fn new(shared: Arc<WorkerShared>, options: WorkerOptions) -> Self {
        Self {
            shared,
            options,
            closed: false,
        }
    }

    /// Serialize and enqueue a message for the owner, FIFO.
    pub fn post_message(&self, value: &Value) -> WorkerResult<()> {
        self.post_message_with_transfer(value, Vec::new())
    }

    pub fn post_message_with_transfer(
        &self,
        value: &Value,
        transfer: Vec<Transferable>,
    ) -> WorkerResult<()> {
        let msg = serialize::serialize(value, &transfer)?;
        self.shared.notify(Notification::Message(msg));
        Ok(())
    }

    /// Enqueue an already-encoded snapshot. The owner side deserializes it;
    /// a payload it cannot decode surfaces there as a `messageerror` event.
    pub fn post_raw(&self, msg: SerializedMessage) {
        self.shared.notify(Notification::Message(msg));
    }

    /// Report an uncaught error; delivered to the owner's `error` slot.
    pub fn raise(&self, message: impl Into<String>) {
        self.shared.notify(Notification::Error(message.into()));
    }

    /// The initial payload captured at construction, deserialized fresh on
    /// each call (clones never alias the owner's data).
    pub fn worker_data(&self) -> WorkerResult<Option<Value>> {
        self.options
            .worker_data
            .as_ref()
            .map(serialize::deserialize)
            .transpose()
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn smol(&self) -> bool {
        self.options.smol
    }

    pub fn env(&self) -> Option<&[(String, String)]> {
        self.options.env.as_deref()
    }

    pub fn argv(&self) -> Option<&[String]> {
        self.options.argv.as_deref()
    }

    pub fn exec_argv(&self) -> Option<&[String]> {
        self.options.exec_argv.as_deref()
    }

    pub fn thread_id(&self) -> u32 {
        self.shared.client_identifier() - 1
    }

    /// Request self-exit; the thread winds down after the current call.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }
}

/// The creating context: agent factory, inherited environment snapshot and
/// teardown state. Constructing a worker from a stopped context fails.
pub struct ExecutionContext {
    factory: Arc<dyn AgentFactory>,
    env: Option<Vec<(String, String)>>,
    stopped: AtomicBool,
    spawned: Mutex<Vec<u32>>,
}

impl ExecutionContext {
    pub fn new(factory: Arc<dyn AgentFactory>) -> Self {
        Self {
            factory,
            env: None,
            stopped: AtomicBool::new(false),
            spawned: Mutex::new(Vec::new()),
        }
    }

    /// Use an explicit environment snapshot for workers that don't override it.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = Some(env);
        self
    }

    /// Inherit the hosting process environment.
    pub fn with_process_env(mut self) -> Self {
        self.env = Some(std::env::vars().collect());
        self
    }

    pub fn inherited_env(&self) -> Option<&[(String, String)]> {
        self.env.as_deref()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Tear the context down: no further workers can be created and every
    /// worker this context spawned is asked to terminate.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<u32> = std::mem::take(&mut *self.spawned.lock().unwrap());
        log::debug!("context shutdown, terminating {} worker(s)", ids.len());
        for id in ids {
            worker::shutdown_worker(id);
        }
    }

    pub(crate) fn factory(&self) -> &Arc<dyn AgentFactory> {
        &self.factory
    }

    pub(crate) fn note_spawn(&self, client_identifier: u32) {
        self.spawned.lock().unwrap().push(client_identifier);
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("stopped", &self.is_stopped())
            .field("env_entries", &self.env.as_ref().map(Vec::len))
            .finish()
    }
}
