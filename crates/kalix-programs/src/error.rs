use kalix_session::{SessionError, SessionState};
use thiserror::Error;

use crate::workflow::ProgramPhase;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("{program} program already started (phase: {phase})")]
    AlreadyStarted {
        program: &'static str,
        phase: ProgramPhase,
    },
    #[error("failed to send {command}: {source}")]
    Dispatch {
        command: String,
        #[source]
        source: SessionError,
    },
    #[error("engine reported failure: {0}")]
    Engine(String),
    #[error("session ended in {state}: {reason}")]
    SessionEnded { state: SessionState, reason: String },
    #[error("unexpected {command} result: {reason}")]
    InvalidResult { command: String, reason: String },
}
