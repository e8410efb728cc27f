//! Lifecycle state machine over one engine conversation.

use std::collections::VecDeque;
use std::io;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kalix_protocol::{
    decode_line, encode_stop, encode_terminate, CommandRequest, Message, MessageBody,
};

use crate::conversation::{
    describe_exit, ConversationListener, LaunchSpec, ProcessConversation, ShutdownOutcome,
};
use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent};
use crate::program::{CommandSink, ProgramHandle};
use crate::router::{is_fetch_response, InstanceClosure, ResultRouter};
use crate::sync_utils::lock_or_recover;
use crate::transcript::{TranscriptEntry, TranscriptStream};

const EXIT_REAP_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Starting,
    Running,
    Ready,
    Error,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Ready => "READY",
            Self::Error => "ERROR",
            Self::Terminated => "TERMINATED",
        }
    }

    /// Accepts commands.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Ready)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Terminated)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Error)
                | (Running, Ready)
                | (Running, Error)
                | (Ready, Running)
                | (Ready, Error)
                | (Starting | Running | Ready | Error, Terminated)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a command handed to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Written,
    /// Held until the engine finishes the command it is running.
    Queued { position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyCommand {
    pub command: String,
    pub interruptible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub session_key: String,
    pub engine_instance_id: Option<String>,
    pub state: SessionState,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub queued_commands: usize,
    pub busy: Option<BusyCommand>,
    pub program: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    pub session_key: String,
    pub graceful: bool,
    pub exit_code: Option<i32>,
    pub dropped_commands: usize,
    pub already_terminated: bool,
}

#[derive(Debug)]
pub(crate) enum StartupOutcome {
    Ready,
    Failed(String),
}

/// State shared by every session of one registry.
#[derive(Default)]
pub(crate) struct SessionHooks {
    pub(crate) events: EventBus,
    router: RwLock<Option<Arc<dyn ResultRouter>>>,
}

impl SessionHooks {
    pub(crate) fn router(&self) -> Option<Arc<dyn ResultRouter>> {
        match self.router.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_router(&self, router: Arc<dyn ResultRouter>) {
        match self.router.write() {
            Ok(mut guard) => *guard = Some(router),
            Err(poisoned) => *poisoned.into_inner() = Some(router),
        }
    }
}

struct SessionInner {
    state: SessionState,
    engine_instance_id: Option<String>,
    program: Option<ProgramHandle>,
    outbound: VecDeque<QueuedCommand>,
    busy: Option<BusyCommand>,
    /// The running command was sent for the result router.
    routed_cycle: bool,
    terminating: bool,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    startup: Option<SyncSender<StartupOutcome>>,
    program_notice: Option<(SessionState, String)>,
}

struct QueuedCommand {
    line: String,
    routed: bool,
}

pub(crate) struct SessionShared {
    key: String,
    conversation: ProcessConversation,
    inner: Mutex<SessionInner>,
    hooks: Arc<SessionHooks>,
}

/// Work collected under the session lock and run after it is released.
#[derive(Default)]
struct Deferred {
    closed_instances: Vec<(String, InstanceClosure)>,
    program_notice: Option<(ProgramHandle, SessionState, String)>,
}

/// Cloneable handle to one engine session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.shared.key)
            .field("state", &self.state())
            .field("pid", &self.shared.conversation.pid())
            .finish()
    }
}

impl Session {
    pub(crate) fn launch(
        key: &str,
        spec: &LaunchSpec,
        hooks: Arc<SessionHooks>,
    ) -> Result<(Self, Receiver<StartupOutcome>), SessionError> {
        let (conversation, output) = ProcessConversation::spawn(key, spec)?;
        let (startup_sender, startup_receiver) = sync_channel(1);
        let now = Utc::now();
        let pid = conversation.pid();
        let shared = Arc::new(SessionShared {
            key: key.to_string(),
            conversation,
            inner: Mutex::new(SessionInner {
                state: SessionState::Starting,
                engine_instance_id: None,
                program: None,
                outbound: VecDeque::new(),
                busy: None,
                routed_cycle: false,
                terminating: false,
                started_at: now,
                last_activity_at: now,
                startup: Some(startup_sender),
                program_notice: None,
            }),
            hooks,
        });
        shared.hooks.events.publish(SessionEvent::transition(
            key,
            None,
            SessionState::Starting,
            format!("engine process started (pid {pid})"),
        ));
        let listener: Arc<dyn ConversationListener> = shared.clone();
        shared.conversation.attach(output, Arc::downgrade(&listener));
        Ok((Self { shared }, startup_receiver))
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn state(&self) -> SessionState {
        lock_or_recover(&self.shared.inner).state
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn engine_instance_id(&self) -> Option<String> {
        lock_or_recover(&self.shared.inner).engine_instance_id.clone()
    }

    pub fn pid(&self) -> u32 {
        self.shared.conversation.pid()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (mut snapshot, program) = {
            let inner = lock_or_recover(&self.shared.inner);
            (
                SessionSnapshot {
                    session_key: self.shared.key.clone(),
                    engine_instance_id: inner.engine_instance_id.clone(),
                    state: inner.state,
                    pid: self.shared.conversation.pid(),
                    started_at: inner.started_at,
                    last_activity_at: inner.last_activity_at,
                    queued_commands: inner.outbound.len(),
                    busy: inner.busy.clone(),
                    program: None,
                },
                inner.program.clone(),
            )
        };
        // A program busy handling a message is reported without a description.
        snapshot.program = program.and_then(|program| {
            program
                .try_lock()
                .ok()
                .map(|program| format!("{}: {}", program.name(), program.state_description()))
        });
        snapshot
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.shared.conversation.transcript()
    }

    pub fn send_command(&self, command: &CommandRequest) -> Result<Dispatch, SessionError> {
        self.shared.send_line(command.encode().as_str(), false)
    }

    /// Sends `command` on behalf of the result router: its `res`, `err` and
    /// `stp` are routed there instead of to the attached program.
    pub fn send_routed_command(&self, command: &CommandRequest) -> Result<Dispatch, SessionError> {
        self.shared.send_line(command.encode().as_str(), true)
    }

    /// Sends a pre-encoded command line through the outbound gate.
    pub fn send_line(&self, line: &str) -> Result<Dispatch, SessionError> {
        self.shared.send_line(line, false)
    }

    /// Asks the engine to stop the running command. Bypasses the outbound gate.
    pub fn interrupt(&self, reason: &str) -> Result<(), SessionError> {
        let inner = lock_or_recover(&self.shared.inner);
        let interruptible = inner.state == SessionState::Running
            && inner.busy.as_ref().is_some_and(|busy| busy.interruptible);
        if !interruptible {
            return Err(SessionError::NotInterruptible {
                key: self.shared.key.clone(),
            });
        }
        self.shared
            .conversation
            .write_line(encode_stop(reason).as_str())
            .map_err(|error| SessionError::WriteFailed {
                key: self.shared.key.clone(),
                reason: error.to_string(),
            })
    }

    /// Attaches `program`, detaching and returning any previous one.
    pub fn set_active_program(
        &self,
        program: ProgramHandle,
    ) -> Result<Option<ProgramHandle>, SessionError> {
        let mut inner = lock_or_recover(&self.shared.inner);
        if inner.state.is_terminal() {
            return Err(SessionError::SessionNotActive {
                key: self.shared.key.clone(),
                state: inner.state,
            });
        }
        tracing::debug!(session_key = %self.shared.key, "attached session program");
        Ok(inner.program.replace(program))
    }

    pub fn active_program(&self) -> Option<ProgramHandle> {
        lock_or_recover(&self.shared.inner).program.clone()
    }

    pub fn detach_program(&self) -> Option<ProgramHandle> {
        lock_or_recover(&self.shared.inner).program.take()
    }

    /// Send capability for programs; holds the session weakly.
    pub fn link(&self) -> Arc<dyn CommandSink> {
        Arc::new(SessionLink {
            session_key: self.shared.key.clone(),
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Graceful shutdown, escalating to a kill once `grace` elapses. Always
    /// ends in TERMINATED.
    #[tracing::instrument(skip(self), fields(session_key = %self.shared.key))]
    pub fn terminate(&self, grace: Duration) -> TerminationReport {
        let shared = &self.shared;
        let dropped_commands = {
            let mut inner = lock_or_recover(&shared.inner);
            if inner.state == SessionState::Terminated {
                return TerminationReport {
                    session_key: shared.key.clone(),
                    graceful: true,
                    exit_code: None,
                    dropped_commands: 0,
                    already_terminated: true,
                };
            }
            inner.terminating = true;
            let dropped = inner.outbound.len();
            inner.outbound.clear();
            dropped
        };

        let outcome = shared
            .conversation
            .shutdown(encode_terminate().as_str(), grace);
        let mut deferred = Deferred::default();
        {
            let mut inner = lock_or_recover(&shared.inner);
            inner.busy = None;
            inner.routed_cycle = false;
            if let Some(startup) = inner.startup.take() {
                let _ = startup.try_send(StartupOutcome::Failed(
                    "session terminated during startup".to_string(),
                ));
            }
            let message = match outcome {
                ShutdownOutcome::Graceful(_) => "engine shut down gracefully",
                ShutdownOutcome::Forced(_) => "engine killed after grace period",
                ShutdownOutcome::AlreadyExited => "engine had already exited",
            };
            shared.transition(&mut inner, &mut deferred, SessionState::Terminated, message);
            shared.conversation.clear_transcript();
            deferred.program_notice = take_program_notice(&mut inner);
        }
        shared.run_deferred(deferred);

        TerminationReport {
            session_key: shared.key.clone(),
            graceful: outcome.is_graceful(),
            exit_code: outcome.exit_code(),
            dropped_commands,
            already_terminated: false,
        }
    }

    /// Kills a session still waiting for readiness. Returns `false` if it
    /// left STARTING in the meantime.
    pub(crate) fn abort_startup(&self, timeout_ms: u64) -> bool {
        let shared = &self.shared;
        let mut deferred = Deferred::default();
        {
            let mut inner = lock_or_recover(&shared.inner);
            if inner.state != SessionState::Starting {
                return false;
            }
            inner.startup.take();
            shared.conversation.kill();
            shared.transition(
                &mut inner,
                &mut deferred,
                SessionState::Error,
                format!("engine did not announce readiness within {timeout_ms}ms"),
            );
            deferred.program_notice = take_program_notice(&mut inner);
        }
        shared.run_deferred(deferred);
        true
    }

    /// Stops a process that outlived its session.
    pub(crate) fn release(&self) {
        if self.shared.conversation.is_alive() {
            tracing::debug!(session_key = %self.shared.key, "killing engine of released session");
        }
        self.shared.conversation.kill();
    }
}

impl SessionShared {
    fn send_line(&self, line: &str, routed: bool) -> Result<Dispatch, SessionError> {
        let mut deferred = Deferred::default();
        let result = {
            let mut inner = lock_or_recover(&self.inner);
            if !inner.state.is_active() || inner.terminating {
                return Err(SessionError::SessionNotActive {
                    key: self.key.clone(),
                    state: inner.state,
                });
            }
            if inner.state == SessionState::Running {
                inner.outbound.push_back(QueuedCommand {
                    line: line.to_string(),
                    routed,
                });
                let position = inner.outbound.len();
                tracing::debug!(session_key = %self.key, position, "engine busy; command queued");
                Ok(Dispatch::Queued { position })
            } else {
                self.dispatch(&mut inner, &mut deferred, line, routed)
                    .map(|()| Dispatch::Written)
            }
        };
        // The caller may be a program holding its own lock, so its end-of-session
        // notice stays pending for the reader thread.
        self.run_deferred(deferred);
        result
    }

    fn dispatch(
        &self,
        inner: &mut SessionInner,
        deferred: &mut Deferred,
        line: &str,
        routed: bool,
    ) -> Result<(), SessionError> {
        let label = command_label(line);
        match self.conversation.write_line(line) {
            Ok(()) => {
                inner.last_activity_at = Utc::now();
                inner.routed_cycle = routed;
                tracing::debug!(session_key = %self.key, command = %label, "dispatched command");
                self.transition(
                    inner,
                    deferred,
                    SessionState::Running,
                    format!("executing {label}"),
                );
                Ok(())
            }
            Err(error) => {
                tracing::error!(session_key = %self.key, command = %label, %error, "failed to write command");
                if error.kind() == io::ErrorKind::BrokenPipe {
                    inner.outbound.clear();
                    self.transition(
                        inner,
                        deferred,
                        SessionState::Error,
                        format!("engine input closed: {error}"),
                    );
                }
                Err(SessionError::WriteFailed {
                    key: self.key.clone(),
                    reason: error.to_string(),
                })
            }
        }
    }

    /// Applies a transition if the table allows it and publishes the event
    /// while still holding the session lock, keeping per-session order.
    fn transition(
        &self,
        inner: &mut SessionInner,
        deferred: &mut Deferred,
        next: SessionState,
        message: impl Into<String>,
    ) -> bool {
        let current = inner.state;
        let message = message.into();
        if !current.can_transition_to(next) {
            tracing::debug!(
                session_key = %self.key,
                from = %current,
                to = %next,
                "ignoring transition"
            );
            return false;
        }
        inner.state = next;
        self.conversation
            .record_system(format!("{current} -> {next}: {message}").as_str());
        tracing::info!(
            session_key = %self.key,
            from = %current,
            to = %next,
            %message,
            "session state changed"
        );
        if next.is_terminal() {
            if inner.program.is_some() {
                inner.program_notice = Some((next, message.clone()));
            }
            if let Some(instance_id) = inner.engine_instance_id.clone() {
                let closure = if next == SessionState::Terminated {
                    InstanceClosure::Terminated
                } else {
                    InstanceClosure::Failed
                };
                deferred.closed_instances.push((instance_id, closure));
            }
        }
        self.hooks.events.publish(SessionEvent::transition(
            &self.key,
            Some(current),
            next,
            message,
        ));
        true
    }

    fn run_deferred(&self, deferred: Deferred) {
        if let Some((program, state, reason)) = deferred.program_notice {
            lock_or_recover(&program).session_ended(state, reason.as_str());
        }
        if deferred.closed_instances.is_empty() {
            return;
        }
        let Some(router) = self.hooks.router() else {
            return;
        };
        for (instance_id, closure) in deferred.closed_instances {
            router.instance_closed(&self.key, instance_id.as_str(), closure);
        }
    }

    fn handle_stdout_line(&self, line: &str) {
        let message = match decode_line(line) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(session_key = %self.key, %error, line, "discarding undecodable engine line");
                return;
            }
        };
        tracing::debug!(session_key = %self.key, kind = %message.kind(), "engine message");

        let router = self.hooks.router();
        let mut deferred = Deferred::default();
        let mut fetch_route: Option<(Arc<dyn ResultRouter>, Option<String>)> = None;
        let mut program = None;
        {
            let mut inner = lock_or_recover(&self.inner);
            if inner.state == SessionState::Terminated {
                return;
            }
            inner.last_activity_at = Utc::now();
            let routed = inner.routed_cycle;
            if let Some(uid) = message.uid.as_deref() {
                self.observe_instance_id(&mut inner, &mut deferred, uid);
            }
            match &message.body {
                MessageBody::Ready { rc } => self.complete_cycle(&mut inner, &mut deferred, *rc),
                MessageBody::Busy { cmd, interruptible } => {
                    inner.busy = Some(BusyCommand {
                        command: cmd.clone(),
                        interruptible: *interruptible,
                    });
                }
                MessageBody::Log { level, message } => log_engine_line(&self.key, level, message),
                _ => {}
            }
            match router {
                Some(router) if routed && is_fetch_response(&message) => {
                    fetch_route = Some((router, inner.engine_instance_id.clone()));
                }
                _ => program = inner.program.clone(),
            }
            deferred.program_notice = take_program_notice(&mut inner);
        }

        if let Some((router, instance_id)) = fetch_route {
            match instance_id {
                Some(instance_id) => router.route_result(&self.key, instance_id.as_str(), &message),
                None => tracing::warn!(
                    session_key = %self.key,
                    "dropping fetch response received before the engine announced its id"
                ),
            }
        }
        if let Some(program) = program {
            lock_or_recover(&program).handle_message(&message);
        }
        self.run_deferred(deferred);
    }

    fn observe_instance_id(&self, inner: &mut SessionInner, deferred: &mut Deferred, uid: &str) {
        match inner.engine_instance_id.as_deref() {
            Some(current) if current == uid => {}
            Some(current) => {
                tracing::info!(
                    session_key = %self.key,
                    previous = current,
                    uid,
                    "engine instance id changed"
                );
                deferred
                    .closed_instances
                    .push((current.to_string(), InstanceClosure::Replaced));
                inner.engine_instance_id = Some(uid.to_string());
            }
            None => {
                tracing::debug!(session_key = %self.key, uid, "captured engine instance id");
                inner.engine_instance_id = Some(uid.to_string());
            }
        }
    }

    /// `rdy` closes the current command cycle and reopens the outbound gate.
    fn complete_cycle(&self, inner: &mut SessionInner, deferred: &mut Deferred, rc: i32) {
        inner.busy = None;
        inner.routed_cycle = false;
        match inner.state {
            SessionState::Starting => {
                self.transition(
                    inner,
                    deferred,
                    SessionState::Running,
                    "engine announced readiness",
                );
                let instance = inner
                    .engine_instance_id
                    .clone()
                    .unwrap_or_else(|| "without id".to_string());
                self.transition(
                    inner,
                    deferred,
                    SessionState::Ready,
                    format!("engine {instance} ready"),
                );
                if let Some(startup) = inner.startup.take() {
                    let _ = startup.try_send(StartupOutcome::Ready);
                }
            }
            SessionState::Running => {
                let outcome = match rc {
                    0 => "command completed",
                    2 => "command interrupted",
                    _ => "command failed",
                };
                self.transition(inner, deferred, SessionState::Ready, outcome);
            }
            _ => {}
        }
        while inner.state == SessionState::Ready && !inner.terminating {
            let Some(queued) = inner.outbound.pop_front() else {
                break;
            };
            if self
                .dispatch(inner, deferred, queued.line.as_str(), queued.routed)
                .is_ok()
            {
                break;
            }
        }
    }

    fn handle_engine_exit(&self) {
        {
            let inner = lock_or_recover(&self.inner);
            if inner.terminating || inner.state == SessionState::Terminated {
                return;
            }
        }
        let detail = describe_exit(self.conversation.reap(EXIT_REAP_TIMEOUT));

        let mut deferred = Deferred::default();
        {
            let mut inner = lock_or_recover(&self.inner);
            if inner.terminating || inner.state == SessionState::Terminated {
                return;
            }
            let dropped = inner.outbound.len();
            if dropped > 0 {
                tracing::warn!(session_key = %self.key, dropped, "dropping queued commands of exited engine");
            }
            inner.outbound.clear();
            inner.busy = None;
            let when = if inner.state == SessionState::Starting {
                "before announcing readiness"
            } else {
                "unexpectedly"
            };
            self.transition(
                &mut inner,
                &mut deferred,
                SessionState::Error,
                format!("engine exited {when} ({detail})"),
            );
            if let Some(startup) = inner.startup.take() {
                let _ = startup.try_send(StartupOutcome::Failed(detail));
            }
            deferred.program_notice = take_program_notice(&mut inner);
        }
        self.run_deferred(deferred);
    }
}

impl ConversationListener for SessionShared {
    fn on_line(&self, stream: TranscriptStream, line: &str) {
        match stream {
            TranscriptStream::Stdout => self.handle_stdout_line(line),
            TranscriptStream::Stderr => {
                tracing::debug!(session_key = %self.key, line, "engine stderr");
            }
            TranscriptStream::Stdin | TranscriptStream::System => {}
        }
    }

    fn on_stream_closed(&self, stream: TranscriptStream) {
        if stream == TranscriptStream::Stdout {
            self.handle_engine_exit();
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.conversation.kill();
    }
}

struct SessionLink {
    session_key: String,
    shared: Weak<SessionShared>,
}

impl CommandSink for SessionLink {
    fn session_key(&self) -> &str {
        &self.session_key
    }

    fn send_command(&self, command: &CommandRequest) -> Result<Dispatch, SessionError> {
        let Some(shared) = self.shared.upgrade() else {
            return Err(SessionError::SessionNotFound(self.session_key.clone()));
        };
        shared.send_line(command.encode().as_str(), false)
    }
}

fn take_program_notice(inner: &mut SessionInner) -> Option<(ProgramHandle, SessionState, String)> {
    let (state, reason) = inner.program_notice.take()?;
    let program = inner.program.clone()?;
    Some((program, state, reason))
}

fn command_label(line: &str) -> String {
    decode_line(line)
        .ok()
        .and_then(|message| message.command_name().map(str::to_string))
        .unwrap_or_else(|| "command".to_string())
}

fn log_engine_line(session_key: &str, level: &str, message: &str) {
    match level.to_ascii_lowercase().as_str() {
        "error" => tracing::error!(session_key, engine_message = message, "engine log"),
        "warn" | "warning" => tracing::warn!(session_key, engine_message = message, "engine log"),
        "debug" | "trace" => tracing::debug!(session_key, engine_message = message, "engine log"),
        _ => tracing::info!(session_key, engine_message = message, "engine log"),
    }
}
