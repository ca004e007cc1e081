//! Wire codec for mesh frames.
//!
//! Every WebSocket text frame carries exactly one JSON value. Control
//! commands use the envelope
//!
//! ```text
//! {"__command__": "<name>", "__value__": <payload>}
//! ```
//!
//! with `__value__` omitted when the command carries no payload. Any other
//! JSON value is an application message and is passed through untouched.

use crate::NodeConfig;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Envelope key holding the command name.
pub const COMMAND_KEY: &str = "__command__";
/// Envelope key holding the command payload.
pub const VALUE_KEY: &str = "__value__";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Command name must be a string")]
    InvalidCommandName,
    #[error("Command '{command}' is missing its payload")]
    MissingPayload { command: &'static str },
    #[error("Command '{command}' has an invalid payload: {source}")]
    InvalidPayload {
        command: &'static str,
        source: serde_json::Error,
    },
}

/// A control command, keyed by name with a per-command payload schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Introduction sent on a freshly opened connection.
    Node(NodeConfig),
    /// Known peers of the responder, minus the requester.
    NodeResponse(Vec<NodeConfig>),
    /// Convergence announcement carrying the sender's current config.
    Ready(NodeConfig),
    ReadyResponse,
    JoinRoom(String),
    LeaveRoom(String),
    /// Any command name this node does not understand.
    Unrecognized { name: String, value: Option<Value> },
}

impl Command {
    pub const NODE: &'static str = "node";
    pub const NODE_RESPONSE: &'static str = "node_response";
    pub const READY: &'static str = "ready";
    pub const READY_RESPONSE: &'static str = "ready_response";
    pub const JOIN_ROOM: &'static str = "join_room";
    pub const LEAVE_ROOM: &'static str = "leave_room";

    /// Wire name of this command.
    pub fn name(&self) -> &str {
        match self {
            Command::Node(_) => Self::NODE,
            Command::NodeResponse(_) => Self::NODE_RESPONSE,
            Command::Ready(_) => Self::READY,
            Command::ReadyResponse => Self::READY_RESPONSE,
            Command::JoinRoom(_) => Self::JOIN_ROOM,
            Command::LeaveRoom(_) => Self::LEAVE_ROOM,
            Command::Unrecognized { name, .. } => name,
        }
    }

    fn payload(&self) -> Option<Value> {
        match self {
            Command::Node(config) | Command::Ready(config) => to_value(config),
            Command::NodeResponse(peers) => to_value(peers),
            Command::ReadyResponse => None,
            Command::JoinRoom(room) | Command::LeaveRoom(room) => Some(Value::String(room.clone())),
            Command::Unrecognized { value, .. } => value.clone(),
        }
    }

    /// Build the JSON envelope for this command.
    pub fn to_envelope(&self) -> Value {
        let mut map = Map::new();
        map.insert(COMMAND_KEY.to_string(), Value::String(self.name().to_string()));
        if let Some(value) = self.payload() {
            map.insert(VALUE_KEY.to_string(), value);
        }
        Value::Object(map)
    }

    /// Validate the payload for `name` and build the typed command.
    fn from_parts(name: &str, value: Option<Value>) -> Result<Self, CodecError> {
        let command = match name {
            Self::NODE => Command::Node(payload(Self::NODE, value)?),
            Self::NODE_RESPONSE => Command::NodeResponse(payload(Self::NODE_RESPONSE, value)?),
            Self::READY => Command::Ready(payload(Self::READY, value)?),
            Self::READY_RESPONSE => Command::ReadyResponse,
            Self::JOIN_ROOM => Command::JoinRoom(payload(Self::JOIN_ROOM, value)?),
            Self::LEAVE_ROOM => Command::LeaveRoom(payload(Self::LEAVE_ROOM, value)?),
            other => Command::Unrecognized {
                name: other.to_string(),
                value,
            },
        };
        Ok(command)
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_envelope().serialize(s)
    }
}

fn to_value<T: Serialize>(value: &T) -> Option<Value> {
    // Plain structs and strings always map to JSON.
    serde_json::to_value(value).ok()
}

fn payload<T: serde::de::DeserializeOwned>(
    command: &'static str,
    value: Option<Value>,
) -> Result<T, CodecError> {
    let value = value.ok_or(CodecError::MissingPayload { command })?;
    serde_json::from_value(value).map_err(|source| CodecError::InvalidPayload { command, source })
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Command(Command),
    /// Application payload, delivered as-is.
    Message(Value),
}

impl Frame {
    /// Serialize to the textual wire form.
    pub fn encode(&self) -> String {
        match self {
            Frame::Command(command) => command.to_envelope().to_string(),
            Frame::Message(value) => value.to_string(),
        }
    }

    /// Parse a textual frame.
    ///
    /// An object with a non-empty string `__command__` is a command. Absent
    /// or falsy names (`null`, `false`, `0`, `""`) leave the object as an
    /// application message, key included. Any other name is invalid.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_str(text)?;

        let Value::Object(mut map) = value else {
            return Ok(Frame::Message(value));
        };

        let name = match map.get(COMMAND_KEY) {
            Some(Value::String(name)) if !name.is_empty() => Some(name.clone()),
            Some(name) if !is_falsy(name) => return Err(CodecError::InvalidCommandName),
            _ => None,
        };
        let Some(name) = name else {
            return Ok(Frame::Message(Value::Object(map)));
        };

        let value = map.remove(VALUE_KEY);
        Command::from_parts(&name, value).map(Frame::Command)
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Array(_) | Value::Object(_) => false,
    }
}

impl From<Command> for Frame {
    fn from(command: Command) -> Self {
        Frame::Command(command)
    }
}

impl From<Value> for Frame {
    fn from(value: Value) -> Self {
        Frame::Message(value)
    }
}

/// Topic of the confirmation sent to a socket that just joined a room.
pub const JOINED_ROOM_TOPIC: &str = "joined room";

/// Confirmation sent to a socket that just joined a room.
///
/// Wire format: `{"topic":"joined room","room":"<name>"}`
pub fn room_joined(room: &str) -> Frame {
    Frame::Message(serde_json::json!({ "topic": JOINED_ROOM_TOPIC, "room": room }))
}
