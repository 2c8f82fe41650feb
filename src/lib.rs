//! Sidewinder - worker thread lifecycle and structured-clone messaging
//!
//! Sidewinder provides the caller-side half of a Worker API:
//! - `Worker`: handle with postMessage / terminate / ref / unref / threadId
//! - Deep-clone serialization with exclusive ownership transfer
//! - `MessageChannel` / `MessagePort` transferable endpoints
//! - `message` / `messageerror` / `error` handler slots with FIFO dispatch
//! - Keep-alive accounting for process idle-exit decisions
//!
//! What runs inside a worker thread is pluggable: the creating
//! [`ExecutionContext`] carries an [`AgentFactory`] that turns a script
//! locator into the thread's [`Agent`].

pub mod agent;
pub mod channel;
pub mod error;
pub mod events;
pub mod options;
pub mod serialize;
pub mod value;
pub mod worker;

// Re-export commonly used types
pub use agent::{Agent, AgentError, AgentFactory, AgentScope, ExecutionContext};
pub use channel::{MessageChannel, MessagePort, has_pending_port_messages};
pub use error::{WorkerError, WorkerResult};
pub use events::{EventHandlers, HandlerSlot, WorkerEvent};
pub use options::WorkerOptions;
pub use serialize::{SerializedMessage, SharedBuffer, Transferable, deserialize, serialize};
pub use value::Value;
pub use worker::{
    MAIN_THREAD_CLIENT_IDENTIFIER, PostMessageOptions, Worker, WorkerState, has_active_workers,
    has_active_workers_among, idle_exit_allowed,
};
