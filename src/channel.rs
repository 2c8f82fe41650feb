//! MessageChannel / MessagePort: paired FIFO endpoints usable across threads.
//!
//! Endpoint state lives in a process-wide registry keyed by port id; a
//! [`MessagePort`] is a light handle onto that state, so handles can be
//! cloned, sent to worker threads, and listed in transfer lists.
//!
//! Transferring a port re-homes its state under a fresh id and permanently
//! invalidates the sender's handle; pending messages follow the new id.
//!
//! Registry entries are reclaimed: a transfer retires the old id, and
//! closing both ends of a pair removes both entries. Handles keep their own
//! reference to the endpoint state, so a retired handle still answers
//! `is_closed`/`is_transferred` truthfully.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{WorkerError, WorkerResult};
use crate::serialize::{self, SerializedMessage, Transferable};
use crate::value::Value;

/// Global port id counter.
static PORT_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Global port storage.
static PORTS: Mutex<Option<HashMap<u32, Arc<PortState>>>> = Mutex::new(None);

struct PortState {
    /// Id of the paired endpoint. Rewritten when the peer is transferred.
    peer: AtomicU32,
    inbox: Mutex<VecDeque<SerializedMessage>>,
    open: AtomicBool,
    transferred: AtomicBool,
}

impl PortState {
    fn new(peer: u32) -> Arc<Self> {
        Arc::new(Self {
            peer: AtomicU32::new(peer),
            inbox: Mutex::new(VecDeque::with_capacity(16)),
            open: AtomicBool::new(true),
            transferred: AtomicBool::new(false),
        })
    }
}

fn register_port(id: u32, state: Arc<PortState>) {
    let mut ports = PORTS.lock().unwrap();
    ports.get_or_insert_with(HashMap::new).insert(id, state);
}

fn unregister_port(id: u32) {
    let mut ports = PORTS.lock().unwrap();
    if let Some(map) = ports.as_mut() {
        map.remove(&id);
    }
}

fn port_state(id: u32) -> Option<Arc<PortState>> {
    let ports = PORTS.lock().ok()?;
    ports.as_ref()?.get(&id).cloned()
}

/// One end of a message channel.
#[derive(Clone)]
pub struct MessagePort {
    id: u32,
    state: Arc<PortState>,
}

impl MessagePort {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        !self.state.open.load(Ordering::SeqCst)
    }

    /// True once this handle's endpoint was handed to another owner.
    pub fn is_transferred(&self) -> bool {
        self.state.transferred.load(Ordering::SeqCst)
    }

    /// Serialize and enqueue a message on the peer endpoint, FIFO.
    ///
    /// Sending on a closed port, or to a closed peer, drops the message.
    /// Sending on a transferred handle is an error.
    pub fn post_message(&self, value: &Value, transfer: Vec<Transferable>) -> WorkerResult<()> {
        if self.state.transferred.load(Ordering::SeqCst) {
            return Err(WorkerError::Transfer(
                "port has already been transferred".into(),
            ));
        }
        if !self.state.open.load(Ordering::SeqCst) {
            log::debug!("dropping message posted on closed port {}", self.id);
            return Ok(());
        }

        // Serialization (and transfer detachment) happens even if the peer
        // is gone; transfer is a sender-side effect.
        let msg = serialize::serialize(value, &transfer)?;

        let peer_id = self.state.peer.load(Ordering::SeqCst);
        if let Some(peer) = port_state(peer_id) {
            if peer.open.load(Ordering::SeqCst) {
                peer.inbox.lock().unwrap().push_back(msg);
            }
        }
        Ok(())
    }

    /// Take all pending messages, in arrival order.
    pub fn receive(&self) -> Vec<SerializedMessage> {
        if self.state.transferred.load(Ordering::SeqCst) {
            return Vec::new();
        }
        let mut inbox = self.state.inbox.lock().unwrap();
        inbox.drain(..).collect()
    }

    /// Close this endpoint. Idempotent. Once both ends of a pair are closed
    /// their registry entries are removed.
    pub fn close(&self) {
        self.state.open.store(false, Ordering::SeqCst);
        let peer_id = self.state.peer.load(Ordering::SeqCst);
        let peer_closed = port_state(peer_id).is_none_or(|p| !p.open.load(Ordering::SeqCst));
        if peer_closed {
            unregister_port(self.id);
            unregister_port(peer_id);
        }
    }
}

impl std::fmt::Debug for MessagePort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePort")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A pair of connected ports.
pub struct MessageChannel {
    pub port1: MessagePort,
    pub port2: MessagePort,
}

impl MessageChannel {
    pub fn new() -> Self {
        let id1 = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let id2 = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
        let state1 = PortState::new(id2);
        let state2 = PortState::new(id1);
        register_port(id1, state1.clone());
        register_port(id2, state2.clone());
        Self {
            port1: MessagePort {
                id: id1,
                state: state1,
            },
            port2: MessagePort {
                id: id2,
                state: state2,
            },
        }
    }
}

impl Default for MessageChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-home a port under a fresh id for the receiving side and invalidate the
/// sender's endpoint. Pending messages move to the new id; the old id leaves
/// the registry.
pub(crate) fn transfer_port(port: &MessagePort) -> WorkerResult<u32> {
    let old = &port.state;
    if old.transferred.swap(true, Ordering::SeqCst) {
        return Err(WorkerError::Transfer(
            "port has already been transferred".into(),
        ));
    }
    if !old.open.load(Ordering::SeqCst) {
        return Err(WorkerError::Transfer("port is closed".into()));
    }

    let new_id = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
    let peer_id = old.peer.load(Ordering::SeqCst);
    let fresh = PortState::new(peer_id);
    {
        let mut old_inbox = old.inbox.lock().unwrap();
        let mut new_inbox = fresh.inbox.lock().unwrap();
        new_inbox.extend(old_inbox.drain(..));
    }
    register_port(new_id, fresh);

    // Point the peer at the re-homed endpoint, then retire the old one.
    if let Some(peer) = port_state(peer_id) {
        peer.peer.store(new_id, Ordering::SeqCst);
    }
    old.open.store(false, Ordering::SeqCst);
    unregister_port(port.id);

    Ok(new_id)
}

/// Handle for a port id received in a message. An id the registry does not
/// know (a stale snapshot) yields a dead endpoint rather than an error.
pub(crate) fn attach_port(id: u32) -> MessagePort {
    let state = port_state(id).unwrap_or_else(|| {
        let orphan = PortState::new(0);
        orphan.open.store(false, Ordering::SeqCst);
        orphan
    });
    MessagePort { id, state }
}

/// True if any live endpoint has undelivered messages. Feeds the process
/// idle-exit check alongside worker activity.
pub fn has_pending_port_messages() -> bool {
    let Ok(ports) = PORTS.lock() else {
        return false;
    };
    let Some(map) = ports.as_ref() else {
        return false;
    };
    map.values().any(|state| {
        state.open.load(Ordering::SeqCst)
            && !state.transferred.load(Ordering::SeqCst)
            && !state.inbox.lock().unwrap().is_empty()
    })
}
