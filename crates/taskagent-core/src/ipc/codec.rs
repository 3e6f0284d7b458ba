//! NDJSON encoding and tolerant decoding.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::types::{Inbound, PARENT_MESSAGE_ACTIONS, ParentMessage, WORKER_MESSAGE_KINDS, WorkerMessage};
use crate::error::{Error, Result};

/// Serialize a message as a single line (without the trailing newline).
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Decode one line written by a worker.
pub fn decode_worker_line(line: &str) -> Result<Inbound<WorkerMessage>> {
    decode(line, "type", WORKER_MESSAGE_KINDS)
}

/// Decode one line written by the parent.
pub fn decode_parent_line(line: &str) -> Result<Inbound<ParentMessage>> {
    decode(line, "action", PARENT_MESSAGE_ACTIONS)
}

fn decode<T: DeserializeOwned>(line: &str, tag: &str, known: &[&str]) -> Result<Inbound<T>> {
    let raw: Value = serde_json::from_str(line)?;
    let kind = raw
        .get(tag)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Ipc(format!("Missing '{tag}' field")))?
        .to_string();

    if !known.contains(&kind.as_str()) {
        return Ok(Inbound::Unknown { kind, payload: raw });
    }

    serde_json::from_value(raw)
        .map(Inbound::Known)
        .map_err(|e| Error::Ipc(format!("Malformed '{kind}' message: {e}")))
}
