//! Worker option capture.
//!
//! Options arrive as a dynamic bag (a [`Value::Map`]) and are snapshotted
//! into an immutable [`WorkerOptions`] at construction time. Capture is
//! deliberately permissive: unrecognized keys are ignored and malformed
//! values for `env`, `argv` and `execArgv` are silently skipped rather than
//! rejected, matching the binding this models.

use crate::error::WorkerResult;
use crate::serialize::{self, SerializedMessage, Transferable};
use crate::value::Value;

/// Immutable configuration snapshot captured when a worker is created.
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Cosmetic label; no uniqueness constraint.
    pub name: String,
    /// Requests a reduced-footprint execution mode.
    pub smol: bool,
    /// Initial keep-alive flag; `ref: false` clears it.
    pub keep_alive: bool,
    /// Initial payload, serialized at construction with its transfer list.
    pub worker_data: Option<SerializedMessage>,
    /// Isolated env snapshot; `None` means "nothing to inherit".
    pub env: Option<Vec<(String, String)>>,
    pub argv: Option<Vec<String>>,
    pub exec_argv: Option<Vec<String>>,
}

impl WorkerOptions {
    /// Defaults: reffed, no name, env inherited from the creating context.
    pub fn new() -> Self {
        Self {
            keep_alive: true,
            ..Default::default()
        }
    }

    /// Capture a snapshot from a dynamic options bag.
    ///
    /// `inherited_env` is the creating context's environment snapshot, used
    /// when the bag has no usable `env` entry. Serialization of
    /// `workerData`/`data` happens here and its failure aborts construction.
    pub fn capture(
        raw: Option<&Value>,
        inherited_env: Option<&[(String, String)]>,
    ) -> WorkerResult<Self> {
        let mut opts = WorkerOptions::new();
        opts.env = inherited_env.map(|e| e.to_vec());

        // A non-map options argument is ignored wholesale.
        let Some(bag) = raw.filter(|v| v.as_map().is_some()) else {
            return Ok(opts);
        };

        // Only a string name is honored; anything else keeps the default.
        if let Some(name) = bag.get("name").and_then(Value::as_str) {
            opts.name = name.to_string();
        }
        if let Some(smol) = bag.get("smol") {
            opts.smol = smol.as_bool().unwrap_or(false);
        }
        if let Some(r) = bag.get("ref") {
            opts.keep_alive = r.truthy();
        }

        // `workerData` wins over `data` when both are present.
        let data = bag
            .get("workerData")
            .filter(|v| !v.is_undefined())
            .or_else(|| bag.get("data").filter(|v| !v.is_undefined()));
        if let Some(data) = data {
            let transfer = capture_transfer_list(bag.get("transferList"))?;
            opts.worker_data = Some(serialize::serialize(data, &transfer)?);
        }

        if let Some(entries) = bag.get("env").and_then(Value::as_map) {
            opts.env = Some(capture_env(entries));
        }
        if let Some(items) = bag.get("argv").and_then(Value::as_array) {
            opts.argv = Some(items.iter().map(Value::to_display_string).collect());
        }
        if let Some(items) = bag.get("execArgv").and_then(Value::as_array) {
            opts.exec_argv = Some(items.iter().map(Value::to_display_string).collect());
        }

        Ok(opts)
    }
}

/// Ordered capture with last-write-wins on duplicate keys. Keys and values
/// are copied, so no aliasing with the source bag survives.
fn capture_env(entries: &[(String, Value)]) -> Vec<(String, String)> {
    let mut captured: Vec<(String, String)> = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let coerced = value.to_display_string();
        match captured.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = coerced,
            None => captured.push((key.clone(), coerced)),
        }
    }
    captured
}

fn capture_transfer_list(raw: Option<&Value>) -> WorkerResult<Vec<Transferable>> {
    let Some(items) = raw.and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    items.iter().map(transferable_from_value).collect()
}

/// A transfer-list element must itself be a transferable resource.
pub(crate) fn transferable_from_value(value: &Value) -> WorkerResult<Transferable> {
    match value {
        Value::Bytes(buf) => Ok(Transferable::Buffer(buf.clone())),
        Value::Port(port) => Ok(Transferable::Port(port.clone())),
        other => Err(crate::error::WorkerError::Transfer(format!(
            "value is not transferable: {}",
            other.to_display_string()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::serialize::{SharedBuffer, deserialize};

    #[test]
    fn defaults_without_options() {
        let opts = WorkerOptions::capture(None, None).unwrap();
        assert!(opts.keep_alive);
        assert!(!opts.smol);
        assert_eq!(opts.name, "");
        assert!(opts.worker_data.is_none());
        assert!(opts.env.is_none());
        assert!(opts.argv.is_none());
    }

    #[test]
    fn ref_false_clears_keep_alive() {
        let bag = Value::map(vec![("ref".into(), Value::from(false))]);
        let opts = WorkerOptions::capture(Some(&bag), None).unwrap();
        assert!(!opts.keep_alive);

        let bag = Value::map(vec![("ref".into(), Value::from(true))]);
        assert!(WorkerOptions::capture(Some(&bag), None).unwrap().keep_alive);
    }

    #[test]
    fn non_string_name_is_ignored() {
        let bag = Value::map(vec![("name".into(), Value::from(7))]);
        let opts = WorkerOptions::capture(Some(&bag), None).unwrap();
        assert_eq!(opts.name, "");

        let bag = Value::map(vec![("name".into(), Value::from("pool-3"))]);
        let opts = WorkerOptions::capture(Some(&bag), None).unwrap();
        assert_eq!(opts.name, "pool-3");
    }

    #[test]
    fn worker_data_wins_over_data() {
        let bag = Value::map(vec![
            ("data".into(), Value::from("second")),
            ("workerData".into(), Value::from("first")),
        ]);
        let opts = WorkerOptions::capture(Some(&bag), None).unwrap();
        let data = deserialize(opts.worker_data.as_ref().unwrap()).unwrap();
        assert_eq!(data, Value::from("first"));
    }

    #[test]
    fn transfer_list_detaches_at_capture_time() {
        let buf = SharedBuffer::new(vec![1, 2]);
        let bag = Value::map(vec![
            ("workerData".into(), Value::Bytes(buf.clone())),
            (
                "transferList".into(),
                Value::Array(vec![Value::Bytes(buf.clone())]),
            ),
        ]);
        let opts = WorkerOptions::capture(Some(&bag), None).unwrap();
        assert!(buf.is_detached());
        let data = deserialize(opts.worker_data.as_ref().unwrap()).unwrap();
        assert_eq!(data, Value::bytes(vec![1, 2]));
    }

    #[test]
    fn non_transferable_in_transfer_list_aborts() {
        let bag = Value::map(vec![
            ("workerData".into(), Value::Null),
            ("transferList".into(), Value::Array(vec![Value::from(5)])),
        ]);
        assert!(matches!(
            WorkerOptions::capture(Some(&bag), None),
            Err(WorkerError::Transfer(_))
        ));
    }

    #[test]
    fn env_capture_is_ordered_isolated_and_last_wins() {
        let bag = Value::map(vec![(
            "env".into(),
            Value::map(vec![
                ("A".into(), Value::from(1)),
                ("B".into(), Value::from("b")),
                ("A".into(), Value::from("override")),
            ]),
        )]);
        let opts = WorkerOptions::capture(Some(&bag), Some(&[("X".into(), "x".into())])).unwrap();
        assert_eq!(
            opts.env.unwrap(),
            vec![
                ("A".to_string(), "override".to_string()),
                ("B".to_string(), "b".to_string()),
            ]
        );
    }

    #[test]
    fn env_defaults_to_inherited_snapshot() {
        let inherited = [("HOME".to_string(), "/tmp".to_string())];
        let bag = Value::map(vec![]);
        let opts = WorkerOptions::capture(Some(&bag), Some(&inherited)).unwrap();
        assert_eq!(opts.env.unwrap(), inherited.to_vec());
    }

    #[test]
    fn malformed_argv_is_silently_ignored() {
        let bag = Value::map(vec![
            ("argv".into(), Value::from("not an array")),
            ("execArgv".into(), Value::Array(vec![Value::from(2)])),
            ("env".into(), Value::from(42)),
        ]);
        let opts = WorkerOptions::capture(Some(&bag), None).unwrap();
        assert!(opts.argv.is_none());
        assert_eq!(opts.exec_argv.unwrap(), vec!["2".to_string()]);
        assert!(opts.env.is_none());
    }
}
