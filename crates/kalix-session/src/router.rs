use kalix_protocol::{Message, MessageKind, GET_RESULT_COMMAND};

/// Why an engine instance stopped serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceClosure {
    Terminated,
    Failed,
    Removed,
    /// The session announced a different engine instance id.
    Replaced,
}

/// Receives data-fetch responses and instance lifecycle notices.
///
/// Called from session reader threads after the session lock is released.
pub trait ResultRouter: Send + Sync {
    fn route_result(&self, session_key: &str, engine_instance_id: &str, message: &Message);
    fn instance_closed(&self, session_key: &str, engine_instance_id: &str, closure: InstanceClosure);
}

/// Whether `message` ends a `get_result` fetch: a result, an error or an
/// interrupt acknowledgement.
pub fn is_fetch_response(message: &Message) -> bool {
    matches!(
        message.kind(),
        MessageKind::Response | MessageKind::Error | MessageKind::Stopped
    ) && message.command_name() == Some(GET_RESULT_COMMAND)
}
