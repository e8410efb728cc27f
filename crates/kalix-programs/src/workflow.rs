//! State shared by every workflow program: phase tracking, progress
//! publication and the session send capability.

use std::sync::Arc;

use kalix_protocol::{CommandRequest, Message, MessageBody, ProgressUpdate};
use kalix_session::{CommandSink, SessionState};
use tokio::sync::watch;

use crate::error::ProgramError;

/// Wrapper prefixes the engine puts in front of the actual failure text.
const ENGINE_ERROR_PREFIXES: [&str; 3] = [
    "Command execution error: ",
    "Configuration failed: ",
    "Simulation error: ",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramPhase {
    Starting,
    Loading,
    FetchingParams,
    Running,
    Optimising,
    Done,
    Error,
}

impl ProgramPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Loading => "LOADING",
            Self::FetchingParams => "FETCHING_PARAMS",
            Self::Running => "RUNNING",
            Self::Optimising => "OPTIMISING",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Starting => "Starting",
            Self::Loading => "Loading Model",
            Self::FetchingParams => "Fetching Parameters",
            Self::Running => "Running Simulation",
            Self::Optimising => "Optimising",
            Self::Done => "Completed",
            Self::Error => "Failed",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl std::fmt::Display for ProgramPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest progress of a program, as published to UI indicators.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramStatus {
    pub phase: ProgramPhase,
    /// Clamped to `0.0..=100.0`.
    pub percentage: f64,
    pub description: String,
}

impl ProgramStatus {
    fn initial() -> Self {
        Self {
            phase: ProgramPhase::Starting,
            percentage: 0.0,
            description: ProgramPhase::Starting.label().to_string(),
        }
    }
}

pub(crate) struct Workflow {
    program: &'static str,
    sink: Arc<dyn CommandSink>,
    phase: ProgramPhase,
    history: Vec<ProgramPhase>,
    failure: Option<ProgramError>,
    status: watch::Sender<ProgramStatus>,
    /// Command this program sent last and has not seen `rdy` for.
    awaiting: Option<String>,
    /// The engine is inside the cycle of `awaiting`: its `bsy`, `res`, `err`
    /// or `stp` has arrived and the closing `rdy` has not.
    cycle_open: bool,
}

impl Workflow {
    pub(crate) fn new(program: &'static str, sink: Arc<dyn CommandSink>) -> Self {
        let (status, _) = watch::channel(ProgramStatus::initial());
        Self {
            program,
            sink,
            phase: ProgramPhase::Starting,
            history: vec![ProgramPhase::Starting],
            failure: None,
            status,
            awaiting: None,
            cycle_open: false,
        }
    }

    pub(crate) fn program(&self) -> &'static str {
        self.program
    }

    pub(crate) fn session_key(&self) -> &str {
        self.sink.session_key()
    }

    pub(crate) fn phase(&self) -> ProgramPhase {
        self.phase
    }

    pub(crate) fn history(&self) -> &[ProgramPhase] {
        &self.history
    }

    pub(crate) fn failure(&self) -> Option<&ProgramError> {
        self.failure.as_ref()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ProgramStatus> {
        self.status.subscribe()
    }

    pub(crate) fn ensure_not_started(&self) -> Result<(), ProgramError> {
        if self.phase == ProgramPhase::Starting {
            Ok(())
        } else {
            Err(ProgramError::AlreadyStarted {
                program: self.program,
                phase: self.phase,
            })
        }
    }

    pub(crate) fn advance(&mut self, phase: ProgramPhase) {
        if self.phase == phase || self.phase.is_finished() {
            return;
        }
        tracing::info!(
            session_key = self.sink.session_key(),
            program = self.program,
            from = %self.phase,
            to = %phase,
            "program phase changed"
        );
        self.phase = phase;
        self.history.push(phase);
        let percentage = if phase == ProgramPhase::Done { 100.0 } else { 0.0 };
        self.status.send_replace(ProgramStatus {
            phase,
            percentage,
            description: phase.label().to_string(),
        });
    }

    /// Moves to ERROR. Later failures keep the first reason.
    pub(crate) fn fail(&mut self, error: ProgramError) {
        if self.phase.is_finished() {
            return;
        }
        tracing::warn!(
            session_key = self.sink.session_key(),
            program = self.program,
            phase = %self.phase,
            %error,
            "program failed"
        );
        let percentage = self.status.borrow().percentage;
        self.failure = Some(error.clone());
        self.phase = ProgramPhase::Error;
        self.history.push(ProgramPhase::Error);
        self.status.send_replace(ProgramStatus {
            phase: ProgramPhase::Error,
            percentage,
            description: error.to_string(),
        });
    }

    /// Sends `command`, failing the program when the session refuses it.
    pub(crate) fn send(&mut self, command: CommandRequest) -> Result<(), ProgramError> {
        match self.sink.send_command(&command) {
            Ok(dispatch) => {
                self.awaiting = Some(command.name.clone());
                self.cycle_open = false;
                tracing::debug!(
                    session_key = self.sink.session_key(),
                    program = self.program,
                    command = %command.name,
                    ?dispatch,
                    "program sent command"
                );
                Ok(())
            }
            Err(source) => {
                let error = ProgramError::Dispatch {
                    command: command.name.clone(),
                    source,
                };
                self.fail(error.clone());
                Err(error)
            }
        }
    }

    /// Whether `message` belongs to the cycle of this program's own command.
    ///
    /// Other collaborators (the request broker) share the session, so their
    /// commands can run between the program's. Messages naming another
    /// command, unnamed messages outside the program's cycle and any `rdy`
    /// not preceded by the program's own command are not claimed.
    pub(crate) fn claim(&mut self, message: &Message) -> bool {
        match (&message.body, message.command_name()) {
            (MessageBody::Ready { .. }, _) => {
                let own = self.cycle_open;
                self.cycle_open = false;
                if own {
                    self.awaiting = None;
                }
                own
            }
            (_, Some(name)) => {
                self.cycle_open = self.awaiting.as_deref() == Some(name);
                self.cycle_open
            }
            (_, None) => self.cycle_open,
        }
    }

    pub(crate) fn publish_progress(&mut self, progress: &ProgressUpdate) {
        if self.phase.is_finished() {
            return;
        }
        self.status.send_replace(ProgramStatus {
            phase: self.phase,
            percentage: progress.percentage().clamp(0.0, 100.0),
            description: progress.description(),
        });
    }

    pub(crate) fn session_ended(&mut self, state: SessionState, reason: &str) {
        self.fail(ProgramError::SessionEnded {
            state,
            reason: reason.to_string(),
        });
    }

    pub(crate) fn describe(&self) -> String {
        let status = self.status.borrow();
        match self.phase {
            ProgramPhase::Running | ProgramPhase::Optimising if status.percentage > 0.0 => {
                format!("{} ({:.0}%)", self.phase.label(), status.percentage)
            }
            ProgramPhase::Error => format!("{}: {}", self.phase.label(), status.description),
            phase => phase.label().to_string(),
        }
    }
}

/// Strips the engine's wrapper prefixes, repeatedly, from `text`.
pub fn clean_engine_error(text: &str) -> String {
    let mut cleaned = text;
    loop {
        let stripped = ENGINE_ERROR_PREFIXES
            .iter()
            .find_map(|prefix| cleaned.strip_prefix(prefix));
        match stripped {
            Some(rest) => cleaned = rest,
            None => break,
        }
    }
    if cleaned.trim().is_empty() {
        text.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Failure text carried by an `err` message or a `res` with `ok: false`.
pub(crate) fn engine_failure(message: &Message) -> ProgramError {
    let raw = match &message.body {
        MessageBody::Error { message, .. } => message.clone(),
        MessageBody::Response { result, .. } => result
            .get("error")
            .map(|error| match error.get("message").and_then(|text| text.as_str()) {
                Some(text) => text.to_string(),
                None => error
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            })
            .unwrap_or_else(|| "engine reported failure without details".to_string()),
        MessageBody::Ready { rc } => format!("engine returned status {rc}"),
        _ => "unknown error".to_string(),
    };
    ProgramError::Engine(clean_engine_error(&raw))
}
