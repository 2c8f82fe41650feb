//! Deep-clone serialization with ownership transfer.
//!
//! A message is snapshotted on the sender's thread into a
//! [`SerializedMessage`]: a JSON byte payload plus the resources moved out of
//! the sender by the transfer list. Byte buffers not listed for transfer are
//! copied (base64-embedded); listed buffers are detached from the sender.
//! Channel endpoints can only cross the boundary via the transfer list.
//!
//! Transfer is exclusive: after a successful call the sender's references to
//! listed resources are unusable. Validation runs before any detachment, so
//! a failed call leaves every resource intact.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde_json::{Map as JsonMap, Value as Json, json};
use std::sync::{Arc, Mutex};

use crate::channel::{self, MessagePort};
use crate::error::{WorkerError, WorkerResult};
use crate::value::Value;

/// A detachable byte buffer. Cloning the handle shares the same storage;
/// transferring it moves the bytes out and leaves every handle detached.
#[derive(Clone)]
pub struct SharedBuffer {
    cell: Arc<Mutex<Option<Vec<u8>>>>,
}

impl SharedBuffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            cell: Arc::new(Mutex::new(Some(bytes))),
        }
    }

    /// True once the bytes have been transferred away.
    pub fn is_detached(&self) -> bool {
        self.cell.lock().unwrap().is_none()
    }

    /// Copy of the contents. Fails on a detached buffer.
    pub fn to_vec(&self) -> WorkerResult<Vec<u8>> {
        self.cell
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| WorkerError::Transfer("buffer has been detached".into()))
    }

    pub fn len(&self) -> WorkerResult<usize> {
        Ok(self.to_vec()?.len())
    }

    pub fn is_empty(&self) -> WorkerResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Move the bytes out, detaching all handles.
    pub(crate) fn detach(&self) -> Option<Vec<u8>> {
        self.cell.lock().unwrap().take()
    }

    pub(crate) fn same_storage(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.cell.lock().unwrap() {
            Some(bytes) => write!(f, "SharedBuffer({} bytes)", bytes.len()),
            None => write!(f, "SharedBuffer(detached)"),
        }
    }
}

/// A resource whose ownership can be handed to the receiver.
#[derive(Debug, Clone)]
pub enum Transferable {
    Buffer(SharedBuffer),
    Port(MessagePort),
}

/// Transport-safe snapshot of a value graph plus transferred resources.
#[derive(Debug, Clone)]
pub struct SerializedMessage {
    /// JSON-encoded payload; buffer/port placeholders index into the lists below.
    pub data: Vec<u8>,
    /// Byte contents moved out of transferred buffers, in transfer-list order.
    pub buffers: Vec<Vec<u8>>,
    /// Endpoint ids for transferred ports, in transfer-list order.
    pub ports: Vec<u32>,
}

impl SerializedMessage {
    /// A raw snapshot from already-encoded bytes. Used by worker-side code
    /// that produces payloads without going through a `Value`.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            buffers: Vec::new(),
            ports: Vec::new(),
        }
    }
}

/// Deep-clone `value` into a transport snapshot, moving the listed resources.
pub fn serialize(value: &Value, transfer: &[Transferable]) -> WorkerResult<SerializedMessage> {
    validate_transfer_list(transfer)?;

    let json = encode(value, transfer)?;
    let data = serde_json::to_vec(&json)
        .map_err(|e| WorkerError::Serialization(format!("encoding failed: {e}")))?;

    // Nothing has been mutated yet; now commit the ownership handoff.
    let mut buffers = Vec::new();
    let mut ports = Vec::new();
    for entry in transfer {
        match entry {
            Transferable::Buffer(buf) => {
                let bytes = buf
                    .detach()
                    .ok_or_else(|| WorkerError::Transfer("buffer has been detached".into()))?;
                buffers.push(bytes);
            }
            Transferable::Port(port) => {
                ports.push(channel::transfer_port(port)?);
            }
        }
    }

    Ok(SerializedMessage {
        data,
        buffers,
        ports,
    })
}

/// Rehydrate a snapshot on the receiving side.
pub fn deserialize(msg: &SerializedMessage) -> WorkerResult<Value> {
    let json: Json = serde_json::from_slice(&msg.data)
        .map_err(|e| WorkerError::Serialization(format!("malformed payload: {e}")))?;
    decode(&json, msg)
}

fn validate_transfer_list(transfer: &[Transferable]) -> WorkerResult<()> {
    for (i, entry) in transfer.iter().enumerate() {
        for prior in &transfer[..i] {
            let duplicate = match (entry, prior) {
                (Transferable::Buffer(a), Transferable::Buffer(b)) => a.same_storage(b),
                (Transferable::Port(a), Transferable::Port(b)) => a.id() == b.id(),
                _ => false,
            };
            if duplicate {
                return Err(WorkerError::Transfer(
                    "duplicate entry in transfer list".into(),
                ));
            }
        }
        match entry {
            Transferable::Buffer(buf) => {
                if buf.is_detached() {
                    return Err(WorkerError::Transfer("buffer has been detached".into()));
                }
            }
            Transferable::Port(port) => {
                if port.is_transferred() {
                    return Err(WorkerError::Transfer(
                        "port has already been transferred".into(),
                    ));
                }
                if port.is_closed() {
                    return Err(WorkerError::Transfer("port is closed".into()));
                }
            }
        }
    }
    Ok(())
}

fn transferred_buffer_index(buf: &SharedBuffer, transfer: &[Transferable]) -> Option<usize> {
    transfer
        .iter()
        .filter_map(|t| match t {
            Transferable::Buffer(b) => Some(b),
            _ => None,
        })
        .position(|b| b.same_storage(buf))
}

fn transferred_port_index(port: &MessagePort, transfer: &[Transferable]) -> Option<usize> {
    transfer
        .iter()
        .filter_map(|t| match t {
            Transferable::Port(p) => Some(p),
            _ => None,
        })
        .position(|p| p.id() == port.id())
}

fn encode(value: &Value, transfer: &[Transferable]) -> WorkerResult<Json> {
    Ok(match value {
        Value::Undefined => json!({ "$undefined": true }),
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Number(n) => match serde_json::Number::from_f64(*n) {
            Some(num) => Json::Number(num),
            // NaN and infinities have no JSON representation.
            None => json!({ "$number": crate::value::Value::Number(*n).to_display_string() }),
        },
        Value::String(s) => Json::String(s.clone()),
        Value::Bytes(buf) => match transferred_buffer_index(buf, transfer) {
            Some(idx) => json!({ "$buffer": idx }),
            None => {
                let bytes = buf.to_vec().map_err(|_| {
                    WorkerError::Serialization("cannot clone a detached buffer".into())
                })?;
                json!({ "$bytes": BASE64_STANDARD.encode(bytes) })
            }
        },
        Value::Array(items) => Json::Array(
            items
                .iter()
                .map(|v| encode(v, transfer))
                .collect::<WorkerResult<Vec<_>>>()?,
        ),
        Value::Map(entries) => {
            let mut pairs = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                pairs.push(Json::Array(vec![
                    Json::String(k.clone()),
                    encode(v, transfer)?,
                ]));
            }
            json!({ "$map": pairs })
        }
        Value::Port(port) => match transferred_port_index(port, transfer) {
            Some(idx) => json!({ "$port": idx }),
            None => {
                return Err(WorkerError::Serialization(
                    "MessagePort was not listed in the transfer list".into(),
                ));
            }
        },
    })
}

fn decode(json: &Json, msg: &SerializedMessage) -> WorkerResult<Value> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => Value::Number(
            n.as_f64()
                .ok_or_else(|| WorkerError::Serialization("unrepresentable number".into()))?,
        ),
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| decode(v, msg))
                .collect::<WorkerResult<Vec<_>>>()?,
        ),
        Json::Object(obj) => decode_placeholder(obj, msg)?,
    })
}

fn decode_placeholder(obj: &JsonMap<String, Json>, msg: &SerializedMessage) -> WorkerResult<Value> {
    if obj.contains_key("$undefined") {
        return Ok(Value::Undefined);
    }
    if let Some(Json::String(repr)) = obj.get("$number") {
        let n = match repr.as_str() {
            "NaN" => f64::NAN,
            "Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            other => other
                .parse()
                .map_err(|_| WorkerError::Serialization(format!("bad number repr: {other}")))?,
        };
        return Ok(Value::Number(n));
    }
    if let Some(Json::String(b64)) = obj.get("$bytes") {
        let bytes = BASE64_STANDARD
            .decode(b64)
            .map_err(|e| WorkerError::Serialization(format!("bad embedded bytes: {e}")))?;
        return Ok(Value::bytes(bytes));
    }
    if let Some(idx) = obj.get("$buffer").and_then(Json::as_u64) {
        let bytes = msg
            .buffers
            .get(idx as usize)
            .ok_or_else(|| WorkerError::Serialization("buffer index out of range".into()))?;
        return Ok(Value::bytes(bytes.clone()));
    }
    if let Some(idx) = obj.get("$port").and_then(Json::as_u64) {
        let id = msg
            .ports
            .get(idx as usize)
            .ok_or_else(|| WorkerError::Serialization("port index out of range".into()))?;
        return Ok(Value::Port(channel::attach_port(*id)));
    }
    if let Some(Json::Array(pairs)) = obj.get("$map") {
        let mut entries = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match pair.as_array().map(Vec::as_slice) {
                Some([Json::String(k), v]) => entries.push((k.clone(), decode(v, msg)?)),
                _ => return Err(WorkerError::Serialization("malformed map entry".into())),
            }
        }
        return Ok(Value::Map(entries));
    }
    Err(WorkerError::Serialization(
        "unrecognized payload object".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MessageChannel;

    fn roundtrip(v: &Value) -> Value {
        let msg = serialize(v, &[]).unwrap();
        deserialize(&msg).unwrap()
    }

    #[test]
    fn roundtrip_primitives() {
        assert_eq!(roundtrip(&Value::Undefined), Value::Undefined);
        assert_eq!(roundtrip(&Value::Null), Value::Null);
        assert_eq!(roundtrip(&Value::from(true)), Value::from(true));
        assert_eq!(roundtrip(&Value::from(1.25)), Value::from(1.25));
        assert_eq!(roundtrip(&Value::from("hi")), Value::from("hi"));
    }

    #[test]
    fn roundtrip_non_finite_numbers() {
        assert!(matches!(
            roundtrip(&Value::Number(f64::NAN)),
            Value::Number(n) if n.is_nan()
        ));
        assert_eq!(
            roundtrip(&Value::Number(f64::INFINITY)),
            Value::Number(f64::INFINITY)
        );
    }

    #[test]
    fn roundtrip_nested_structures() {
        let v = Value::map(vec![
            ("list".into(), Value::Array(vec![Value::from(1), Value::Null])),
            (
                "inner".into(),
                Value::map(vec![("s".into(), Value::from("x"))]),
            ),
        ]);
        assert_eq!(roundtrip(&v), v);
    }

    #[test]
    fn unlisted_buffer_is_copied_sender_keeps_access() {
        let buf = SharedBuffer::new(vec![1, 2, 3]);
        let v = Value::Bytes(buf.clone());
        let out = roundtrip(&v);
        assert_eq!(out, Value::bytes(vec![1, 2, 3]));
        assert!(!buf.is_detached());
        assert_eq!(buf.to_vec().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn listed_buffer_is_moved_sender_detached() {
        let buf = SharedBuffer::new(vec![7, 8]);
        let v = Value::Bytes(buf.clone());
        let msg = serialize(&v, &[Transferable::Buffer(buf.clone())]).unwrap();
        assert!(buf.is_detached());
        assert!(buf.to_vec().is_err());
        assert_eq!(deserialize(&msg).unwrap(), Value::bytes(vec![7, 8]));
    }

    #[test]
    fn transfer_list_entry_need_not_appear_in_graph() {
        let buf = SharedBuffer::new(vec![5]);
        let msg = serialize(&Value::Null, &[Transferable::Buffer(buf.clone())]).unwrap();
        assert!(buf.is_detached());
        assert_eq!(msg.buffers, vec![vec![5]]);
    }

    #[test]
    fn duplicate_transfer_entry_rejected_without_detaching() {
        let buf = SharedBuffer::new(vec![1]);
        let err = serialize(
            &Value::Null,
            &[
                Transferable::Buffer(buf.clone()),
                Transferable::Buffer(buf.clone()),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, WorkerError::Transfer(_)));
        assert!(!buf.is_detached());
    }

    #[test]
    fn detached_buffer_in_transfer_list_rejected() {
        let buf = SharedBuffer::new(vec![1]);
        buf.detach();
        let err = serialize(&Value::Null, &[Transferable::Buffer(buf)]).unwrap_err();
        assert!(matches!(err, WorkerError::Transfer(_)));
    }

    #[test]
    fn port_requires_transfer_listing() {
        let channel = MessageChannel::new();
        let err = serialize(&Value::Port(channel.port1.clone()), &[]).unwrap_err();
        assert!(matches!(err, WorkerError::Serialization(_)));
        // Nothing was transferred; the port is still usable.
        assert!(!channel.port1.is_transferred());
    }

    #[test]
    fn malformed_payload_fails_to_deserialize() {
        let msg = SerializedMessage::from_bytes(b"not json".to_vec());
        assert!(matches!(
            deserialize(&msg),
            Err(WorkerError::Serialization(_))
        ));
    }

    #[test]
    fn out_of_range_placeholder_rejected() {
        let msg = SerializedMessage::from_bytes(br#"{"$buffer": 3}"#.to_vec());
        assert!(matches!(
            deserialize(&msg),
            Err(WorkerError::Serialization(_))
        ));
    }
}
