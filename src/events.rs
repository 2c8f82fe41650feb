//! Event surface: notification kinds and single-slot assignable handlers.
//!
//! Three handler slots exist per worker: `message`, `messageerror`, `error`.
//! Assigning replaces the previous handler; reading before any assignment
//! yields none. Dispatch order is FIFO per channel (see `Worker::poll_events`).

use std::sync::{Arc, Mutex};

use crate::value::Value;

/// A notification delivered from a worker thread to the handle's owner.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A message arrived from the thread.
    Message(Value),
    /// A received payload failed to deserialize.
    MessageError(String),
    /// An uncaught error occurred in the thread.
    Error(String),
}

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// One assignable handler slot.
pub struct HandlerSlot<T> {
    cell: Mutex<Option<Handler<T>>>,
}

impl<T> HandlerSlot<T> {
    pub fn new() -> Self {
        Self {
            cell: Mutex::new(None),
        }
    }

    /// Install a handler, replacing any previous one.
    pub fn set(&self, handler: impl Fn(T) + Send + Sync + 'static) {
        *self.cell.lock().unwrap() = Some(Arc::new(handler));
    }

    pub fn clear(&self) {
        *self.cell.lock().unwrap() = None;
    }

    pub fn get(&self) -> Option<Handler<T>> {
        self.cell.lock().unwrap().clone()
    }

    pub fn is_set(&self) -> bool {
        self.cell.lock().unwrap().is_some()
    }

    /// Invoke the current handler, if any. The slot lock is not held during
    /// the call, so handlers may reassign slots.
    pub(crate) fn invoke(&self, arg: T) {
        if let Some(handler) = self.get() {
            handler(arg);
        }
    }
}

impl<T> Default for HandlerSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for HandlerSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HandlerSlot(set: {})", self.is_set())
    }
}

/// The three per-worker handler slots.
#[derive(Debug, Default)]
pub struct EventHandlers {
    pub message: HandlerSlot<Value>,
    pub messageerror: HandlerSlot<String>,
    pub error: HandlerSlot<String>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }
}
