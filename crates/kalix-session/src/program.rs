//! Seam between a session and the workflow program attached to it.

use std::sync::{Arc, Mutex};

use kalix_protocol::{CommandRequest, Message};

use crate::error::SessionError;
use crate::session::{Dispatch, SessionState};

/// Workflow interpreter driven by one session's inbound messages.
///
/// The session calls into the program from its reader thread without holding
/// its own lock, so implementations may send follow-up commands through their
/// [`CommandSink`].
pub trait SessionProgram: Send {
    fn name(&self) -> &'static str;

    /// Returns `false` when the message was not relevant to the workflow.
    fn handle_message(&mut self, message: &Message) -> bool;

    /// The session entered ERROR or TERMINATED.
    fn session_ended(&mut self, state: SessionState, reason: &str);

    fn is_finished(&self) -> bool;

    fn state_description(&self) -> String;
}

pub type ProgramHandle = Arc<Mutex<dyn SessionProgram>>;

/// Send capability handed to programs. It does not own the session.
pub trait CommandSink: Send + Sync {
    fn session_key(&self) -> &str;

    fn send_command(&self, command: &CommandRequest) -> Result<Dispatch, SessionError>;
}
