//! Outbound command encoding and builders for the commands the controller drives.

use serde_json::{json, Map, Value};

use crate::message::MessageKind;

pub const LOAD_MODEL_STRING_COMMAND: &str = "load_model_string";
pub const RUN_SIMULATION_COMMAND: &str = "run_simulation";
pub const GET_RESULT_COMMAND: &str = "get_result";
pub const GET_OPTIMISABLE_PARAMS_COMMAND: &str = "get_optimisable_params";
pub const RUN_OPTIMISATION_COMMAND: &str = "run_optimisation";
pub const ECHO_COMMAND: &str = "echo";
pub const GET_VERSION_COMMAND: &str = "get_version";
pub const DEFAULT_RESULT_FORMAT: &str = "csv";

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub name: String,
    pub params: Map<String, Value>,
}

impl CommandRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn encode(&self) -> String {
        encode_command(self.name.as_str(), &self.params)
    }
}

/// Encodes `{"m":"cmd","c":<name>,"p":{...}}` without a trailing newline.
pub fn encode_command(name: &str, params: &Map<String, Value>) -> String {
    json!({
        "m": MessageKind::Command.as_str(),
        "c": name,
        "p": params,
    })
    .to_string()
}

/// Asks a busy engine to interrupt the running command.
pub fn encode_stop(reason: &str) -> String {
    json!({ "m": MessageKind::Stopped.as_str(), "reason": reason }).to_string()
}

pub fn encode_query(query: &str) -> String {
    json!({ "m": MessageKind::Query.as_str(), "q": query }).to_string()
}

pub fn encode_terminate() -> String {
    json!({ "m": MessageKind::Terminate.as_str() }).to_string()
}

pub fn load_model_string(model_ini: &str) -> CommandRequest {
    CommandRequest::new(LOAD_MODEL_STRING_COMMAND).with_param("model_ini", model_ini)
}

pub fn run_simulation() -> CommandRequest {
    CommandRequest::new(RUN_SIMULATION_COMMAND)
}

pub fn get_result(series_name: &str, format: &str) -> CommandRequest {
    CommandRequest::new(GET_RESULT_COMMAND)
        .with_param("series_name", series_name)
        .with_param("format", format)
}

pub fn get_optimisable_params() -> CommandRequest {
    CommandRequest::new(GET_OPTIMISABLE_PARAMS_COMMAND)
}

pub fn run_optimisation(config: &str) -> CommandRequest {
    CommandRequest::new(RUN_OPTIMISATION_COMMAND).with_param("config", config)
}

pub fn echo(text: &str) -> CommandRequest {
    CommandRequest::new(ECHO_COMMAND).with_param("string", text)
}

pub fn get_version() -> CommandRequest {
    CommandRequest::new(GET_VERSION_COMMAND)
}
