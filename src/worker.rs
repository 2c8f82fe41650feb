//! Worker handle: lifecycle state machine, messaging and process liveness.
//!
//! A [`Worker`] is the caller-side proxy for one background execution unit.
//! Construction captures an immutable options snapshot, asks the context's
//! agent factory for the thread's agent, and spawns the thread. Messages are
//! serialized synchronously on the caller's thread and delivered FIFO;
//! notifications flow back through `poll_events`.
//!
//! A process-wide registry keyed by client identifier holds every live
//! worker. The registry entry is the reachability root: a worker with
//! pending activity stays registered (and its state alive) until its thread
//! has fully exited, regardless of whether the owner still holds the handle.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::agent::{Agent, AgentScope, ExecutionContext};
use crate::channel;
use crate::error::{WorkerError, WorkerResult};
use crate::events::{EventHandlers, WorkerEvent};
use crate::options::{self, WorkerOptions};
use crate::serialize::{self, SerializedMessage, Transferable};
use crate::value::Value;

/// The main thread occupies client identifier 1; workers allocate from 2.
pub const MAIN_THREAD_CLIENT_IDENTIFIER: u32 = 1;

/// Global client-identifier counter.
static WORKER_COUNTER: AtomicU32 = AtomicU32::new(MAIN_THREAD_CLIENT_IDENTIFIER + 1);

/// Global worker storage; entries live until the thread has exited.
static WORKERS: Mutex<Option<HashMap<u32, Arc<WorkerShared>>>> = Mutex::new(None);

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for WorkerState {
    fn from(v: u8) -> Self {
        match v {
            0 => WorkerState::Starting,
            1 => WorkerState::Running,
            2 => WorkerState::Closing,
            _ => WorkerState::Closed,
        }
    }
}

/// Owner-to-thread signals.
enum ThreadSignal {
    Message(SerializedMessage),
    Terminate,
}

/// Thread-to-owner notifications, drained by `Worker::poll_events`.
pub(crate) enum Notification {
    Message(SerializedMessage),
    MessageError(String),
    Error(String),
    Close(i32),
}

/// State shared between the handle, the worker thread and the registry.
pub(crate) struct WorkerShared {
    client_identifier: u32,
    name: String,
    state: AtomicU32,
    keep_alive: AtomicBool,
    inbox: Mutex<VecDeque<ThreadSignal>>,
    inbox_cv: Condvar,
    outbox: Mutex<VecDeque<Notification>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerShared {
    fn new(client_identifier: u32, name: String, keep_alive: bool) -> Arc<Self> {
        Arc::new(Self {
            client_identifier,
            name,
            state: AtomicU32::new(WorkerState::Starting as u32),
            keep_alive: AtomicBool::new(keep_alive),
            inbox: Mutex::new(VecDeque::with_capacity(64)),
            inbox_cv: Condvar::new(),
            outbox: Mutex::new(VecDeque::with_capacity(64)),
            thread: Mutex::new(None),
        })
    }

    pub(crate) fn client_identifier(&self) -> u32 {
        self.client_identifier
    }

    fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::SeqCst) as u8)
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u32, Ordering::SeqCst);
    }

    fn signal(&self, signal: ThreadSignal) {
        self.inbox.lock().unwrap().push_back(signal);
        self.inbox_cv.notify_one();
    }

    /// Take pending signals, waiting up to `timeout` if none are queued.
    fn drain_signals(&self, timeout: Duration) -> Vec<ThreadSignal> {
        let mut inbox = self.inbox.lock().unwrap();
        if inbox.is_empty() {
            let (guard, _) = self.inbox_cv.wait_timeout(inbox, timeout).unwrap();
            inbox = guard;
        }
        inbox.drain(..).collect()
    }

    pub(crate) fn notify(&self, notification: Notification) {
        self.outbox.lock().unwrap().push_back(notification);
    }

    fn take_notifications(&self) -> Vec<Notification> {
        self.outbox.lock().unwrap().drain(..).collect()
    }

    /// Idempotent termination request; the thread winds down asynchronously.
    fn request_terminate(&self) {
        if self.state.load(Ordering::SeqCst) >= WorkerState::Closing as u32 {
            return;
        }
        self.set_state(WorkerState::Closing);
        self.signal(ThreadSignal::Terminate);
    }
}

fn register_worker(shared: Arc<WorkerShared>) {
    let mut workers = WORKERS.lock().unwrap();
    workers
        .get_or_insert_with(HashMap::new)
        .insert(shared.client_identifier, shared.clone());
}

fn unregister_worker(client_identifier: u32) {
    let mut workers = WORKERS.lock().unwrap();
    if let Some(map) = workers.as_mut() {
        map.remove(&client_identifier);
    }
}

fn worker_shared(client_identifier: u32) -> Option<Arc<WorkerShared>> {
    let workers = WORKERS.lock().ok()?;
    workers.as_ref()?.get(&client_identifier).cloned()
}

/// Context-teardown path: ask the worker to stop and wait for its thread.
/// Must not be called from the worker's own thread.
pub(crate) fn shutdown_worker(client_identifier: u32) {
    if let Some(shared) = worker_shared(client_identifier) {
        shared.request_terminate();
        let join = shared.thread.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

fn worker_is_active(shared: &WorkerShared) -> bool {
    matches!(shared.state(), WorkerState::Starting | WorkerState::Running)
        && shared.keep_alive.load(Ordering::SeqCst)
}

/// True while any worker is reffed and still running or starting. An idle
/// process must not exit while this holds.
pub fn has_active_workers() -> bool {
    let Ok(workers) = WORKERS.lock() else {
        return false;
    };
    let Some(map) = workers.as_ref() else {
        return false;
    };
    map.values().any(|shared| worker_is_active(shared))
}

/// Scoped form of [`has_active_workers`] restricted to the given client
/// identifiers, for accounting one context's spawn set in isolation.
/// Identifiers whose workers have fully exited count as inactive.
pub fn has_active_workers_among(client_identifiers: &[u32]) -> bool {
    let Ok(workers) = WORKERS.lock() else {
        return false;
    };
    let Some(map) = workers.as_ref() else {
        return false;
    };
    client_identifiers
        .iter()
        .filter_map(|id| map.get(id))
        .any(|shared| worker_is_active(shared))
}

/// Whether an otherwise-idle process is eligible to exit: no reffed live
/// workers and no undelivered channel messages.
pub fn idle_exit_allowed() -> bool {
    !has_active_workers() && !channel::has_pending_port_messages()
}

/// Options bag for `post_message_with_options`.
#[derive(Default)]
pub struct PostMessageOptions {
    pub transfer: Vec<Transferable>,
}

impl PostMessageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transfer(transfer: Vec<Transferable>) -> Self {
        Self { transfer }
    }

    /// Read an options bag out of a dynamic value. Only the `transfer` key
    /// is recognized; a non-array `transfer` is ignored.
    pub fn from_value(value: &Value) -> WorkerResult<Self> {
        let transfer = match value.get("transfer").and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .map(options::transferable_from_value)
                .collect::<WorkerResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(Self { transfer })
    }
}

/// Caller-side proxy for one background execution unit.
pub struct Worker {
    shared: Arc<WorkerShared>,
    handlers: EventHandlers,
}

impl Worker {
    /// Create a worker: capture options, start the agent, spawn the thread.
    ///
    /// Fails with `Argument` on an empty locator, `ContextUnavailable` on a
    /// stopped context, `Serialization`/`Transfer` if `workerData` cannot be
    /// snapshotted, and `ThreadStart` if the agent or thread cannot start.
    pub fn new(
        ctx: &ExecutionContext,
        locator: &str,
        options: Option<&Value>,
    ) -> WorkerResult<Self> {
        if locator.is_empty() {
            return Err(WorkerError::Argument("script locator"));
        }
        if ctx.is_stopped() {
            return Err(WorkerError::ContextUnavailable);
        }

        let opts = WorkerOptions::capture(options, ctx.inherited_env())?;

        let agent = ctx.factory().create(locator, &opts).map_err(|e| {
            log::warn!("agent creation failed for {locator:?}: {e}");
            WorkerError::ThreadStart
        })?;

        let client_identifier = WORKER_COUNTER.fetch_add(1, Ordering::SeqCst);
        let shared = WorkerShared::new(client_identifier, opts.name.clone(), opts.keep_alive);

        register_worker(shared.clone());
        ctx.note_spawn(client_identifier);

        let thread_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", client_identifier - 1))
            .spawn(move || run_worker(thread_shared, agent, opts));
        let join = match spawned {
            Ok(join) => join,
            Err(e) => {
                log::warn!("thread spawn failed for {locator:?}: {e}");
                unregister_worker(client_identifier);
                return Err(WorkerError::ThreadStart);
            }
        };
        *shared.thread.lock().unwrap() = Some(join);

        log::debug!(
            "started worker {} (thread id {})",
            client_identifier,
            client_identifier - 1
        );
        Ok(Self {
            shared,
            handlers: EventHandlers::new(),
        })
    }

    /// Stable collaborator-assigned identifier; the main thread holds 1.
    pub fn client_identifier(&self) -> u32 {
        self.shared.client_identifier
    }

    /// Displayed thread id: client identifier minus the main thread's slot.
    pub fn thread_id(&self) -> u32 {
        self.shared.client_identifier - 1
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// True while the underlying thread has not fully exited. A stopped
    /// worker never reports pending activity.
    pub fn has_pending_activity(&self) -> bool {
        self.shared.state() != WorkerState::Closed
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state() == WorkerState::Closed
    }

    /// Serialize and enqueue a message with no transfers.
    pub fn post_message(&self, message: &Value) -> WorkerResult<()> {
        self.post_message_with_transfer(message, Vec::new())
    }

    /// Serialize and enqueue a message, moving the listed resources.
    ///
    /// Serialization happens synchronously and its errors propagate;
    /// delivery is asynchronous, FIFO, with no acknowledgment. Posting to a
    /// worker that is closing or stopped drops the message.
    pub fn post_message_with_transfer(
        &self,
        message: &Value,
        transfer: Vec<Transferable>,
    ) -> WorkerResult<()> {
        let msg = serialize::serialize(message, &transfer)?;
        if self.shared.state.load(Ordering::SeqCst) >= WorkerState::Closing as u32 {
            log::debug!(
                "dropping message to stopped worker {}",
                self.client_identifier()
            );
            return Ok(());
        }
        self.shared.signal(ThreadSignal::Message(msg));
        Ok(())
    }

    pub fn post_message_with_options(
        &self,
        message: &Value,
        options: PostMessageOptions,
    ) -> WorkerResult<()> {
        self.post_message_with_transfer(message, options.transfer)
    }

    /// Dynamic-call shim reproducing the overload resolution of the original
    /// binding. One argument: options form with an empty transfer. Two: an
    /// undefined/null second argument means options form; an iterable means
    /// transfer-list form; any other object means options form; everything
    /// else is a type error.
    pub fn post_message_compat(&self, args: &[Value]) -> WorkerResult<()> {
        let Some(message) = args.first() else {
            return Err(WorkerError::Argument("message"));
        };
        match args.get(1) {
            None | Some(Value::Undefined) | Some(Value::Null) => self.post_message(message),
            Some(Value::Array(items)) => {
                let transfer = items
                    .iter()
                    .map(options::transferable_from_value)
                    .collect::<WorkerResult<Vec<_>>>()?;
                self.post_message_with_transfer(message, transfer)
            }
            Some(bag @ Value::Map(_)) => {
                self.post_message_with_options(message, PostMessageOptions::from_value(bag)?)
            }
            // Any other object is treated as an options bag with no
            // recognized keys, hence an empty transfer.
            Some(Value::Bytes(_)) | Some(Value::Port(_)) => self.post_message(message),
            Some(_) => Err(WorkerError::Type(
                "second argument must be an options object or a transfer list".into(),
            )),
        }
    }

    /// Request asynchronous shutdown. Idempotent; never an error. Pending
    /// activity clears once the thread has actually exited.
    pub fn terminate(&self) {
        self.shared.request_terminate();
    }

    /// Make this worker keep the process alive while it has pending activity.
    pub fn worker_ref(&self) {
        self.shared.keep_alive.store(true, Ordering::SeqCst);
    }

    /// Stop this worker from keeping the process alive by itself.
    pub fn worker_unref(&self) {
        self.shared.keep_alive.store(false, Ordering::SeqCst);
    }

    pub fn keep_alive(&self) -> bool {
        self.shared.keep_alive.load(Ordering::SeqCst)
    }

    pub fn handlers(&self) -> &EventHandlers {
        &self.handlers
    }

    pub fn set_on_message(&self, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.handlers.message.set(handler);
    }

    pub fn set_on_messageerror(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.handlers.messageerror.set(handler);
    }

    pub fn set_on_error(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.handlers.error.set(handler);
    }

    /// Drain pending notifications in arrival order and invoke the matching
    /// handler slots. Returns the number of events dispatched.
    pub fn poll_events(&self) -> usize {
        let mut dispatched = 0;
        for notification in self.shared.take_notifications() {
            let event = match notification {
                Notification::Message(msg) => match serialize::deserialize(&msg) {
                    Ok(value) => WorkerEvent::Message(value),
                    Err(e) => {
                        log::warn!(
                            "worker {}: undeliverable payload: {e}",
                            self.client_identifier()
                        );
                        WorkerEvent::MessageError(e.to_string())
                    }
                },
                Notification::MessageError(detail) => WorkerEvent::MessageError(detail),
                Notification::Error(detail) => WorkerEvent::Error(detail),
                Notification::Close(code) => {
                    log::debug!("worker {} closed with code {code}", self.client_identifier());
                    continue;
                }
            };
            dispatched += 1;
            match event {
                WorkerEvent::Message(value) => self.handlers.message.invoke(value),
                WorkerEvent::MessageError(detail) => self.handlers.messageerror.invoke(detail),
                WorkerEvent::Error(detail) => self.handlers.error.invoke(detail),
            }
        }
        dispatched
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("client_identifier", &self.client_identifier())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("keep_alive", &self.keep_alive())
            .finish()
    }
}

/// Worker thread body: boot the agent, pump signals until terminate or
/// self-exit, then publish the close notification and leave the registry.
fn run_worker(shared: Arc<WorkerShared>, mut agent: Box<dyn Agent>, options: WorkerOptions) {
    let mut scope = AgentScope::new(shared.clone(), options);
    // A terminate() racing the spawn may already have moved us to Closing.
    let _ = shared.state.compare_exchange(
        WorkerState::Starting as u32,
        WorkerState::Running as u32,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );

    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        drive_agent(&shared, agent.as_mut(), &mut scope)
    }));
    let code = match outcome {
        Ok(code) => code,
        Err(_) => {
            log::warn!("worker {} agent panicked", shared.client_identifier());
            shared.notify(Notification::Error("worker agent panicked".into()));
            1
        }
    };

    shared.set_state(WorkerState::Closed);
    shared.notify(Notification::Close(code));
    unregister_worker(shared.client_identifier());
    log::debug!(
        "worker {} exited with code {code}",
        shared.client_identifier()
    );
}

fn drive_agent(shared: &WorkerShared, agent: &mut dyn Agent, scope: &mut AgentScope) -> i32 {
    agent.boot(scope);
    let mut code = 0;
    'main: while !scope.is_closed() {
        if shared.state() == WorkerState::Closing {
            code = 1;
            break;
        }
        for signal in shared.drain_signals(Duration::from_millis(10)) {
            match signal {
                ThreadSignal::Terminate => {
                    code = 1;
                    break 'main;
                }
                ThreadSignal::Message(msg) => match serialize::deserialize(&msg) {
                    Ok(value) => agent.handle_message(value, scope),
                    Err(e) => {
                        log::warn!(
                            "worker {}: undeliverable payload: {e}",
                            shared.client_identifier()
                        );
                        shared.notify(Notification::MessageError(e.to_string()));
                    }
                },
            }
            if scope.is_closed() {
                break 'main;
            }
        }
    }
    agent.shutdown(scope);
    code
}
