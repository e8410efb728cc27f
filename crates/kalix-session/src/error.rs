use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("engine executable not found: {0}")]
    EngineNotFound(String),
    #[error("failed to launch engine '{path}': {reason}")]
    SpawnFailed { path: String, reason: String },
    #[error("session '{key}' did not announce readiness within {timeout_ms}ms")]
    StartupTimeout { key: String, timeout_ms: u64 },
    #[error("session '{key}' failed before announcing readiness: {reason}")]
    StartupFailed { key: String, reason: String },
    #[error("session '{0}' was not found")]
    SessionNotFound(String),
    #[error("session key '{0}' is already in use")]
    KeyInUse(String),
    #[error("session '{key}' is not active (state: {state})")]
    SessionNotActive { key: String, state: SessionState },
    #[error("write to session '{key}' failed: {reason}")]
    WriteFailed { key: String, reason: String },
    #[error("session '{key}' cannot be removed while {state}")]
    RemoveWhileActive { key: String, state: SessionState },
    #[error("session '{key}' has no interruptible command running")]
    NotInterruptible { key: String },
}

impl SessionError {
    /// Launch failures are fatal to the session and never retried.
    pub fn is_launch_failure(&self) -> bool {
        matches!(
            self,
            Self::EngineNotFound(_)
                | Self::SpawnFailed { .. }
                | Self::StartupTimeout { .. }
                | Self::StartupFailed { .. }
        )
    }
}
