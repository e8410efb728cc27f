//! Typed messages exchanged with the engine, one JSON object per line.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const MESSAGE_KIND_FIELD: &str = "m";
pub const MESSAGE_UID_FIELD: &str = "uid";

/// Closed set of message kinds understood on either side of the pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ready,
    Busy,
    Progress,
    Response,
    Error,
    Stopped,
    Log,
    Command,
    Query,
    Terminate,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        MessageKind::Ready,
        MessageKind::Busy,
        MessageKind::Progress,
        MessageKind::Response,
        MessageKind::Error,
        MessageKind::Stopped,
        MessageKind::Log,
        MessageKind::Command,
        MessageKind::Query,
        MessageKind::Terminate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "rdy",
            Self::Busy => "bsy",
            Self::Progress => "prg",
            Self::Response => "res",
            Self::Error => "err",
            Self::Stopped => "stp",
            Self::Log => "log",
            Self::Command => "cmd",
            Self::Query => "query",
            Self::Terminate => "term",
        }
    }

    pub fn from_wire(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == tag)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_ok() -> bool {
    true
}

/// Message payload keyed by the `m` marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "m")]
pub enum MessageBody {
    /// Engine is idle. `rc` is 0 for success, 1 for error, 2 for interrupted.
    #[serde(rename = "rdy")]
    Ready {
        #[serde(default)]
        rc: i32,
    },
    #[serde(rename = "bsy")]
    Busy {
        #[serde(default)]
        cmd: String,
        #[serde(default, rename = "int")]
        interruptible: bool,
    },
    #[serde(rename = "prg")]
    Progress {
        #[serde(default, rename = "i")]
        current: i64,
        #[serde(default, rename = "n")]
        total: i64,
        #[serde(default, rename = "t")]
        task: String,
        #[serde(default, rename = "d", skip_serializing_if = "Option::is_none")]
        data: Option<Vec<f64>>,
    },
    #[serde(rename = "res")]
    Response {
        #[serde(default, rename = "cmd")]
        command: String,
        #[serde(default)]
        exec_ms: f64,
        #[serde(default = "default_ok")]
        ok: bool,
        #[serde(default, rename = "r")]
        result: Value,
    },
    #[serde(rename = "err")]
    Error {
        #[serde(rename = "msg")]
        message: String,
        #[serde(default, rename = "cmd", skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    /// Sent by the engine after an interrupted command, and by the controller
    /// (with `reason`) to request the interrupt.
    #[serde(rename = "stp")]
    Stopped {
        #[serde(default, rename = "cmd", skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec_ms: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(rename = "log")]
    Log {
        #[serde(default)]
        level: String,
        #[serde(rename = "msg")]
        message: String,
    },
    #[serde(rename = "cmd")]
    Command {
        #[serde(rename = "c")]
        name: String,
        #[serde(default, rename = "p")]
        params: Map<String, Value>,
    },
    #[serde(rename = "query")]
    Query {
        #[serde(rename = "q")]
        query: String,
    },
    #[serde(rename = "term")]
    Terminate {},
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub uid: Option<String>,
    pub body: MessageBody,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub current: i64,
    pub total: i64,
    pub task: String,
    pub data: Vec<f64>,
}

impl ProgressUpdate {
    /// Raw `current / total` percentage. Consumers clamp it for display.
    pub fn percentage(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        self.current as f64 / self.total as f64 * 100.0
    }

    pub fn description(&self) -> String {
        let task = match self.task.as_str() {
            "sim" => "Simulating",
            "cal" | "opt" => "Optimising",
            "" => "Working",
            other => other,
        };
        format!("{task}: {} of {}", self.current, self.total)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("line is empty")]
    Empty,
    #[error("malformed json: {0}")]
    Malformed(String),
    #[error("message is missing the 'm' kind marker")]
    MissingKind,
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),
    #[error("invalid '{kind}' message: {reason}")]
    InvalidFields { kind: String, reason: String },
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Self { uid: None, body }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn kind(&self) -> MessageKind {
        match &self.body {
            MessageBody::Ready { .. } => MessageKind::Ready,
            MessageBody::Busy { .. } => MessageKind::Busy,
            MessageBody::Progress { .. } => MessageKind::Progress,
            MessageBody::Response { .. } => MessageKind::Response,
            MessageBody::Error { .. } => MessageKind::Error,
            MessageBody::Stopped { .. } => MessageKind::Stopped,
            MessageBody::Log { .. } => MessageKind::Log,
            MessageBody::Command { .. } => MessageKind::Command,
            MessageBody::Query { .. } => MessageKind::Query,
            MessageBody::Terminate {} => MessageKind::Terminate,
        }
    }

    pub fn command_name(&self) -> Option<&str> {
        let name = match &self.body {
            MessageBody::Busy { cmd, .. } => Some(cmd.as_str()),
            MessageBody::Response { command, .. } => Some(command.as_str()),
            MessageBody::Error { command, .. } | MessageBody::Stopped { command, .. } => {
                command.as_deref()
            }
            MessageBody::Command { name, .. } => Some(name.as_str()),
            _ => None,
        };
        name.filter(|name| !name.is_empty())
    }

    pub fn is_success(&self) -> bool {
        match &self.body {
            MessageBody::Ready { rc } => *rc == 0,
            MessageBody::Response { ok, .. } => *ok,
            MessageBody::Error { .. } | MessageBody::Stopped { .. } => false,
            _ => true,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match &self.body {
            MessageBody::Response { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Whether this is a response to `command` (successful or not).
    pub fn is_response_to(&self, command: &str) -> bool {
        matches!(self.kind(), MessageKind::Response | MessageKind::Error)
            && self.command_name() == Some(command)
    }

    pub fn progress(&self) -> Option<ProgressUpdate> {
        match &self.body {
            MessageBody::Progress {
                current,
                total,
                task,
                data,
            } => Some(ProgressUpdate {
                current: *current,
                total: *total,
                task: task.clone(),
                data: data.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(&self.body)?;
        if let (Some(uid), Value::Object(object)) = (self.uid.as_ref(), &mut value) {
            object.insert(MESSAGE_UID_FIELD.to_string(), Value::String(uid.clone()));
        }
        Ok(value.to_string())
    }
}

/// Decodes one line of engine output.
///
/// The kind marker is checked before the fields so that unknown kinds are
/// reported as such rather than as a generic deserialization failure.
pub fn decode_line(line: &str) -> Result<Message, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|error| DecodeError::Malformed(error.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(DecodeError::Malformed(
            "expected a JSON object".to_string(),
        ));
    };
    let kind = match object.get(MESSAGE_KIND_FIELD) {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(DecodeError::MissingKind),
    };
    if MessageKind::from_wire(kind.as_str()).is_none() {
        return Err(DecodeError::UnknownKind(kind));
    }
    let uid = match object.remove(MESSAGE_UID_FIELD) {
        Some(Value::String(uid)) if !uid.trim().is_empty() => Some(uid),
        _ => None,
    };
    let body = serde_json::from_value::<MessageBody>(Value::Object(object)).map_err(|error| {
        DecodeError::InvalidFields {
            kind,
            reason: error.to_string(),
        }
    })?;
    Ok(Message { uid, body })
}
