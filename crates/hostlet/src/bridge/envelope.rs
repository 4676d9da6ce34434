//! Envelope codec: channel-tagged frames over a flat serialization.
//!
//! One frame is a JSON array of nodes. Node 0 is the root; every string
//! and every container gets its own node, and container slots hold either
//! inline scalars or string references (`"3"`) into the node table. The
//! format survives shared subtrees and reference cycles produced by the
//! runner's task graphs, which plain JSON cannot express.
//!
//! Pure functions, no I/O. Identical input produces identical bytes.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Message channel carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Lifecycle request/response traffic between pool and worker.
    Control,
    /// The outer runner's task-update traffic, forwarded verbatim.
    Rpc,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Rpc => "rpc",
        }
    }

    fn from_wire(name: &str) -> Result<Self, EnvelopeError> {
        match name {
            "control" => Ok(Self::Control),
            "rpc" => Ok(Self::Rpc),
            other => Err(EnvelopeError::UnknownChannel(other.to_string())),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub channel: Channel,
    pub payload: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),
}

/// Inbound frame shapes the decoder accepts.
///
/// `Chunks` covers transports that deliver one logical frame in several
/// pieces; the pieces are concatenated in order before parsing.
#[derive(Debug, Clone)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
    Chunks(Vec<RawFrame>),
}

impl RawFrame {
    fn collect_bytes(self, out: &mut Vec<u8>) {
        match self {
            Self::Text(text) => out.extend_from_slice(text.as_bytes()),
            Self::Binary(bytes) => out.extend_from_slice(&bytes),
            Self::Chunks(chunks) => {
                for chunk in chunks {
                    chunk.collect_bytes(out);
                }
            }
        }
    }

    fn into_text(self) -> Result<String, EnvelopeError> {
        if let Self::Text(text) = self {
            return Ok(text);
        }
        let mut bytes = Vec::new();
        self.collect_bytes(&mut bytes);
        String::from_utf8(bytes)
            .map_err(|_| EnvelopeError::InvalidEnvelope("frame is not valid utf-8".to_string()))
    }
}

impl From<String> for RawFrame {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for RawFrame {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for RawFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&[u8]> for RawFrame {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

/// Serialize a payload onto `channel` as one utf-8 text frame.
pub fn encode(channel: Channel, payload: &Value) -> String {
    let mut root = Map::new();
    root.insert(
        "channel".to_string(),
        Value::String(channel.as_str().to_string()),
    );
    root.insert("payload".to_string(), payload.clone());
    stringify(&Value::Object(root))
}

/// Parse one frame back into an [`Envelope`].
pub fn decode(raw: impl Into<RawFrame>) -> Result<Envelope, EnvelopeError> {
    let text = raw.into().into_text()?;
    let value = parse(&text)?;
    let Value::Object(mut map) = value else {
        return Err(EnvelopeError::InvalidEnvelope(
            "frame root is not an object".to_string(),
        ));
    };
    let channel = match map.remove("channel") {
        Some(Value::String(name)) => Channel::from_wire(&name)?,
        Some(_) => {
            return Err(EnvelopeError::InvalidEnvelope(
                "`channel` is not a string".to_string(),
            ));
        }
        None => {
            return Err(EnvelopeError::InvalidEnvelope(
                "missing `channel` key".to_string(),
            ));
        }
    };
    let payload = map
        .remove("payload")
        .ok_or_else(|| EnvelopeError::InvalidEnvelope("missing `payload` key".to_string()))?;
    Ok(Envelope { channel, payload })
}

/// Structural guard: a control request carries `id` and `action`.
pub fn is_control_request(payload: &Value) -> bool {
    matches!(payload.get("id"), Some(Value::String(_))) && payload.get("action").is_some()
}

/// Structural guard: a control response carries `id` and `success`.
pub fn is_control_response(payload: &Value) -> bool {
    matches!(payload.get("id"), Some(Value::String(_)))
        && matches!(payload.get("success"), Some(Value::Bool(_)))
}

// ============================================================================
// Flat serialization (reference-numbered node table)
// ============================================================================

fn stringify(value: &Value) -> String {
    let mut nodes: Vec<Value> = Vec::new();
    let mut strings: HashMap<String, usize> = HashMap::new();
    index_of(value, &mut nodes, &mut strings);
    serde_json::to_string(&Value::Array(nodes)).expect("a Value serializes infallibly")
}

fn index_of(value: &Value, nodes: &mut Vec<Value>, strings: &mut HashMap<String, usize>) -> usize {
    match value {
        Value::String(s) => {
            if let Some(&idx) = strings.get(s) {
                return idx;
            }
            nodes.push(Value::String(s.clone()));
            let idx = nodes.len() - 1;
            strings.insert(s.clone(), idx);
            idx
        }
        Value::Array(items) => {
            nodes.push(Value::Null);
            let idx = nodes.len() - 1;
            let wire: Vec<Value> = items
                .iter()
                .map(|item| wire_slot(item, nodes, strings))
                .collect();
            nodes[idx] = Value::Array(wire);
            idx
        }
        Value::Object(map) => {
            nodes.push(Value::Null);
            let idx = nodes.len() - 1;
            let mut wire = Map::new();
            for (key, item) in map {
                wire.insert(key.clone(), wire_slot(item, nodes, strings));
            }
            nodes[idx] = Value::Object(wire);
            idx
        }
        scalar => {
            nodes.push(scalar.clone());
            nodes.len() - 1
        }
    }
}

fn wire_slot(value: &Value, nodes: &mut Vec<Value>, strings: &mut HashMap<String, usize>) -> Value {
    match value {
        Value::String(_) | Value::Array(_) | Value::Object(_) => {
            Value::String(index_of(value, nodes, strings).to_string())
        }
        scalar => scalar.clone(),
    }
}

fn parse(text: &str) -> Result<Value, EnvelopeError> {
    let nodes: Vec<Value> = serde_json::from_str(text)
        .map_err(|e| EnvelopeError::InvalidEnvelope(format!("not a flat node table: {e}")))?;
    if nodes.is_empty() {
        return Err(EnvelopeError::InvalidEnvelope(
            "empty node table".to_string(),
        ));
    }
    let mut in_progress = vec![false; nodes.len()];
    resolve(0, &nodes, &mut in_progress)
}

fn resolve(idx: usize, nodes: &[Value], in_progress: &mut [bool]) -> Result<Value, EnvelopeError> {
    match &nodes[idx] {
        // A string node is the string itself; references only occur in slots.
        Value::String(s) => Ok(Value::String(s.clone())),
        Value::Array(items) => {
            if in_progress[idx] {
                // Back-edge of a reference cycle; a Value tree cannot hold it.
                return Ok(Value::Null);
            }
            in_progress[idx] = true;
            let out = items
                .iter()
                .map(|slot| resolve_slot(slot, nodes, in_progress))
                .collect::<Result<Vec<_>, _>>()?;
            in_progress[idx] = false;
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            if in_progress[idx] {
                return Ok(Value::Null);
            }
            in_progress[idx] = true;
            let mut out = Map::new();
            for (key, slot) in map {
                out.insert(key.clone(), resolve_slot(slot, nodes, in_progress)?);
            }
            in_progress[idx] = false;
            Ok(Value::Object(out))
        }
        scalar => Ok(scalar.clone()),
    }
}

fn resolve_slot(
    slot: &Value,
    nodes: &[Value],
    in_progress: &mut [bool],
) -> Result<Value, EnvelopeError> {
    match slot {
        Value::String(reference) => {
            let idx: usize = reference.parse().map_err(|_| {
                EnvelopeError::InvalidEnvelope(format!("bad node reference `{reference}`"))
            })?;
            if idx >= nodes.len() {
                return Err(EnvelopeError::InvalidEnvelope(format!(
                    "node reference {idx} out of range"
                )));
            }
            resolve(idx, nodes, in_progress)
        }
        Value::Array(_) | Value::Object(_) => Err(EnvelopeError::InvalidEnvelope(
            "nested container in node slot".to_string(),
        )),
        scalar => Ok(scalar.clone()),
    }
}
