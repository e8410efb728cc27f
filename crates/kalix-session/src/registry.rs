//! Owns every engine session of one controller.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};

use kalix_protocol::CommandRequest;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::{ControllerConfig, SessionConfig};
use crate::conversation::LaunchSpec;
use crate::error::SessionError;
use crate::events::{SessionEvent, SessionEventKind};
use crate::locator::locate_engine;
use crate::program::{CommandSink, ProgramHandle};
use crate::router::{InstanceClosure, ResultRouter};
use crate::session::{
    Dispatch, Session, SessionHooks, SessionSnapshot, SessionState, StartupOutcome,
    TerminationReport,
};
use crate::sync_utils::lock_or_recover;

const SESSION_KEY_PREFIX: &str = "session";

struct RegistryInner {
    config: ControllerConfig,
    sessions: Mutex<BTreeMap<String, Session>>,
    next_sequence: AtomicU64,
    hooks: Arc<SessionHooks>,
}

/// Session registry. Clones share the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.inner.config)
            .field("sessions", &self.session_keys())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                sessions: Mutex::new(BTreeMap::new()),
                next_sequence: AtomicU64::new(1),
                hooks: Arc::new(SessionHooks::default()),
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Every subscriber receives every event; per-session order is preserved.
    pub fn subscribe(&self) -> UnboundedReceiver<SessionEvent> {
        self.inner.hooks.events.subscribe()
    }

    /// Installs the consumer of `get_result` responses and instance closures.
    pub fn set_result_router(&self, router: Arc<dyn ResultRouter>) {
        self.inner.hooks.set_router(router);
    }

    /// Starts a session under a generated key and blocks until the engine is
    /// READY, fails, or the startup timeout elapses.
    pub fn start_session(&self, config: SessionConfig) -> Result<String, SessionError> {
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        let key = format!("{SESSION_KEY_PREFIX}-{sequence}");
        self.start_named_session(key.as_str(), config)?;
        Ok(key)
    }

    #[tracing::instrument(skip(self, config))]
    pub fn start_named_session(&self, key: &str, config: SessionConfig) -> Result<(), SessionError> {
        if lock_or_recover(&self.inner.sessions).contains_key(key) {
            return Err(SessionError::KeyInUse(key.to_string()));
        }

        let override_path = config
            .engine_path
            .as_deref()
            .or(self.inner.config.engine_path.as_deref());
        let program = match locate_engine(override_path) {
            Ok(program) => program,
            Err(error) => return Err(self.launch_failed(key, error)),
        };
        let spec = LaunchSpec {
            program,
            args: config
                .args
                .unwrap_or_else(|| self.inner.config.engine_args.clone()),
            working_directory: config.working_directory,
            env: config.env,
        };

        let (session, startup) =
            match Session::launch(key, &spec, Arc::clone(&self.inner.hooks)) {
                Ok(launched) => launched,
                Err(error) => return Err(self.launch_failed(key, error)),
            };
        {
            let mut sessions = lock_or_recover(&self.inner.sessions);
            if sessions.contains_key(key) {
                drop(sessions);
                session.release();
                return Err(SessionError::KeyInUse(key.to_string()));
            }
            sessions.insert(key.to_string(), session.clone());
        }

        let timeout = self.inner.config.startup_timeout();
        match startup.recv_timeout(timeout) {
            Ok(StartupOutcome::Ready) => {
                tracing::info!(
                    session_key = key,
                    uid = session.engine_instance_id().as_deref().unwrap_or("-"),
                    "session ready"
                );
                Ok(())
            }
            Ok(StartupOutcome::Failed(reason)) => Err(SessionError::StartupFailed {
                key: key.to_string(),
                reason,
            }),
            Err(RecvTimeoutError::Timeout) => {
                if session.abort_startup(self.inner.config.startup_timeout_ms) {
                    tracing::error!(
                        session_key = key,
                        timeout_ms = self.inner.config.startup_timeout_ms,
                        "engine startup timed out"
                    );
                    Err(SessionError::StartupTimeout {
                        key: key.to_string(),
                        timeout_ms: self.inner.config.startup_timeout_ms,
                    })
                } else {
                    startup_settled(key, &session)
                }
            }
            Err(RecvTimeoutError::Disconnected) => startup_settled(key, &session),
        }
    }

    /// Reports a failure that happened before a session existed.
    fn launch_failed(&self, key: &str, error: SessionError) -> SessionError {
        tracing::error!(session_key = key, %error, "engine launch failed");
        self.inner.hooks.events.publish(SessionEvent::transition(
            key,
            None,
            SessionState::Error,
            error.to_string(),
        ));
        error
    }

    pub fn session(&self, key: &str) -> Option<Session> {
        lock_or_recover(&self.inner.sessions).get(key).cloned()
    }

    fn require(&self, key: &str) -> Result<Session, SessionError> {
        self.session(key)
            .ok_or_else(|| SessionError::SessionNotFound(key.to_string()))
    }

    pub fn session_keys(&self) -> Vec<String> {
        lock_or_recover(&self.inner.sessions).keys().cloned().collect()
    }

    /// Snapshot of the registered sessions, terminal ones included.
    pub fn active_sessions(&self) -> BTreeMap<String, Session> {
        lock_or_recover(&self.inner.sessions).clone()
    }

    pub fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        self.active_sessions()
            .values()
            .map(Session::snapshot)
            .collect()
    }

    pub fn session_state(&self, key: &str) -> Option<SessionState> {
        self.session(key).map(|session| session.state())
    }

    pub fn engine_instance_id(&self, key: &str) -> Option<String> {
        self.session(key)?.engine_instance_id()
    }

    pub fn send_command(&self, key: &str, command: &CommandRequest) -> Result<Dispatch, SessionError> {
        self.require(key)?.send_command(command)
    }

    pub fn send_routed_command(
        &self,
        key: &str,
        command: &CommandRequest,
    ) -> Result<Dispatch, SessionError> {
        self.require(key)?.send_routed_command(command)
    }

    pub fn send_line(&self, key: &str, line: &str) -> Result<Dispatch, SessionError> {
        self.require(key)?.send_line(line)
    }

    pub fn interrupt(&self, key: &str, reason: &str) -> Result<(), SessionError> {
        self.require(key)?.interrupt(reason)
    }

    pub fn set_active_program(
        &self,
        key: &str,
        program: ProgramHandle,
    ) -> Result<Option<ProgramHandle>, SessionError> {
        self.require(key)?.set_active_program(program)
    }

    pub fn active_program(&self, key: &str) -> Option<ProgramHandle> {
        self.session(key)?.active_program()
    }

    pub fn session_link(&self, key: &str) -> Result<Arc<dyn CommandSink>, SessionError> {
        Ok(self.require(key)?.link())
    }

    pub fn terminate_session(&self, key: &str) -> Result<TerminationReport, SessionError> {
        let session = self.require(key)?;
        Ok(session.terminate(self.inner.config.termination_grace()))
    }

    /// Purges a session in ERROR or TERMINATED and drops its cached results.
    pub fn remove_session(&self, key: &str) -> Result<(), SessionError> {
        let session = {
            let mut sessions = lock_or_recover(&self.inner.sessions);
            let Some(session) = sessions.get(key) else {
                return Err(SessionError::SessionNotFound(key.to_string()));
            };
            let state = session.state();
            if !state.is_terminal() {
                return Err(SessionError::RemoveWhileActive {
                    key: key.to_string(),
                    state,
                });
            }
            match sessions.remove(key) {
                Some(session) => session,
                None => return Err(SessionError::SessionNotFound(key.to_string())),
            }
        };

        let state = session.state();
        session.detach_program();
        session.release();
        if let (Some(router), Some(instance_id)) =
            (self.inner.hooks.router(), session.engine_instance_id())
        {
            router.instance_closed(key, instance_id.as_str(), InstanceClosure::Removed);
        }
        tracing::info!(session_key = key, %state, "session removed");
        self.inner
            .hooks
            .events
            .publish(SessionEvent::removed(key, state));
        Ok(())
    }

    /// Terminates every session that has not reached TERMINATED.
    pub fn shutdown(&self) -> Vec<TerminationReport> {
        let grace = self.inner.config.termination_grace();
        self.active_sessions()
            .into_values()
            .filter(|session| session.state() != SessionState::Terminated)
            .map(|session| session.terminate(grace))
            .collect()
    }
}

fn startup_settled(key: &str, session: &Session) -> Result<(), SessionError> {
    match session.state() {
        SessionState::Ready | SessionState::Running => Ok(()),
        state => Err(SessionError::StartupFailed {
            key: key.to_string(),
            reason: format!("session ended startup in state {state}"),
        }),
    }
}

/// Whether `event` removed a session rather than changing its state.
pub fn is_removal(event: &SessionEvent) -> bool {
    event.kind == SessionEventKind::Removed
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::program::SessionProgram;
    use crate::transcript::TranscriptDirection;
    use kalix_protocol::{echo, get_result, get_version, Message, MessageKind};
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    const FAKE_ENGINE: &str = concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../tests/fixtures/fake_engine.sh"
    );

    fn registry_with(startup_timeout_ms: u64, termination_grace_ms: u64) -> SessionRegistry {
        SessionRegistry::new(ControllerConfig {
            engine_path: Some(PathBuf::from("/bin/sh")),
            engine_args: vec![FAKE_ENGINE.to_string()],
            startup_timeout_ms,
            termination_grace_ms,
            ..ControllerConfig::default()
        })
    }

    fn registry() -> SessionRegistry {
        registry_with(5_000, 2_000)
    }

    fn wait_until<F>(timeout: Duration, predicate: F)
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate() {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    fn drain(receiver: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        std::iter::from_fn(|| receiver.try_recv().ok()).collect()
    }

    fn process_is_running(pid: u32) -> bool {
        std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[derive(Default)]
    struct RecordingProgram {
        kinds: Vec<MessageKind>,
        ended: Vec<(SessionState, String)>,
    }

    impl SessionProgram for RecordingProgram {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn handle_message(&mut self, message: &Message) -> bool {
            self.kinds.push(message.kind());
            true
        }

        fn session_ended(&mut self, state: SessionState, reason: &str) {
            self.ended.push((state, reason.to_string()));
        }

        fn is_finished(&self) -> bool {
            !self.ended.is_empty()
        }

        fn state_description(&self) -> String {
            format!("{} messages", self.kinds.len())
        }
    }

    #[derive(Default)]
    struct RecordingRouter {
        routed: Mutex<Vec<(String, String, MessageKind)>>,
        closed: Mutex<Vec<(String, String, InstanceClosure)>>,
    }

    impl ResultRouter for RecordingRouter {
        fn route_result(&self, session_key: &str, engine_instance_id: &str, message: &Message) {
            lock_or_recover(&self.routed).push((
                session_key.to_string(),
                engine_instance_id.to_string(),
                message.kind(),
            ));
        }

        fn instance_closed(&self, session_key: &str, engine_instance_id: &str, closure: InstanceClosure) {
            lock_or_recover(&self.closed).push((
                session_key.to_string(),
                engine_instance_id.to_string(),
                closure,
            ));
        }
    }

    #[test]
    fn start_session_waits_for_readiness_and_captures_uid() {
        let registry = registry();
        let mut events = registry.subscribe();
        let key = registry
            .start_session(SessionConfig::default().with_env("FAKE_ENGINE_UID", "engine-a"))
            .expect("start session");

        assert_eq!(key, "session-1");
        assert_eq!(registry.session_state(&key), Some(SessionState::Ready));
        assert_eq!(registry.engine_instance_id(&key).as_deref(), Some("engine-a"));

        let transitions: Vec<(Option<SessionState>, SessionState)> = drain(&mut events)
            .into_iter()
            .map(|event| (event.old_state, event.new_state))
            .collect();
        assert_eq!(
            transitions,
            vec![
                (None, SessionState::Starting),
                (Some(SessionState::Starting), SessionState::Running),
                (Some(SessionState::Running), SessionState::Ready),
            ]
        );
        registry.shutdown();
    }

    #[test]
    fn commands_sent_while_running_are_queued_and_written_in_order() {
        let registry = registry();
        let key = registry
            .start_session(SessionConfig::default())
            .expect("start session");

        let first = registry.send_command(&key, &echo("first")).expect("send first");
        let second = registry
            .send_command(&key, &get_version())
            .expect("send second");
        assert_eq!(first, Dispatch::Written);
        assert!(matches!(second, Dispatch::Queued { .. }) || second == Dispatch::Written);

        let session = registry.session(&key).expect("session exists");
        wait_until(Duration::from_secs(5), || {
            session.state() == SessionState::Ready && session.snapshot().queued_commands == 0
        });
        let written: Vec<String> = session
            .transcript()
            .into_iter()
            .filter(|entry| entry.direction == TranscriptDirection::ControllerToEngine)
            .map(|entry| entry.line)
            .collect();
        assert_eq!(written.len(), 2);
        assert!(written[0].contains("\"c\":\"echo\""));
        assert!(written[1].contains("\"c\":\"get_version\""));
        registry.shutdown();
    }

    #[test]
    fn terminated_session_rejects_commands_and_can_be_removed() {
        let registry = registry();
        let mut events = registry.subscribe();
        let key = registry
            .start_session(SessionConfig::default())
            .expect("start session");

        let error = registry.remove_session(&key).expect_err("active session");
        assert!(matches!(error, SessionError::RemoveWhileActive { .. }));

        let report = registry.terminate_session(&key).expect("terminate");
        assert!(report.graceful);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(registry.session_state(&key), Some(SessionState::Terminated));
        assert!(registry.session(&key).expect("still registered").transcript().is_empty());

        let error = registry
            .send_command(&key, &echo("late"))
            .expect_err("terminated session");
        assert!(matches!(
            error,
            SessionError::SessionNotActive {
                state: SessionState::Terminated,
                ..
            }
        ));
        let again = registry.terminate_session(&key).expect("terminate twice");
        assert!(again.already_terminated);

        registry.remove_session(&key).expect("remove terminated");
        assert!(registry.session(&key).is_none());
        assert!(matches!(
            registry.remove_session(&key),
            Err(SessionError::SessionNotFound(_))
        ));
        let last = drain(&mut events).pop().expect("events");
        assert!(is_removal(&last));
    }

    #[test]
    fn engine_crash_moves_session_to_error_and_notifies_program() {
        let registry = registry();
        let key = registry
            .start_session(SessionConfig::default())
            .expect("start session");
        let program = Arc::new(Mutex::new(RecordingProgram::default()));
        registry
            .set_active_program(&key, program.clone())
            .expect("attach program");

        registry
            .send_line(&key, r#"{"m":"cmd","c":"crash","p":{}}"#)
            .expect("send crash");
        wait_until(Duration::from_secs(5), || {
            registry.session_state(&key) == Some(SessionState::Error)
        });
        wait_until(Duration::from_secs(2), || {
            !lock_or_recover(&program).ended.is_empty()
        });

        let ended = lock_or_recover(&program).ended.clone();
        assert_eq!(ended[0].0, SessionState::Error);
        assert!(ended[0].1.contains("exit code 7"), "{}", ended[0].1);
        assert!(matches!(
            registry.send_command(&key, &echo("after crash")),
            Err(SessionError::SessionNotActive { .. })
        ));
        registry.remove_session(&key).expect("remove failed session");
    }

    #[test]
    fn engine_exiting_before_readiness_fails_startup() {
        let registry = registry();
        let mut events = registry.subscribe();
        let error = registry
            .start_session(SessionConfig::default().with_env("FAKE_ENGINE_MODE", "exit_early"))
            .expect_err("engine exits early");
        assert!(matches!(error, SessionError::StartupFailed { .. }));
        assert!(error.to_string().contains("exit code 3"), "{error}");

        let last = drain(&mut events).pop().expect("events");
        assert_eq!(last.new_state, SessionState::Error);
        assert!(last.message.contains("before announcing readiness"));
    }

    #[test]
    fn silent_engine_times_out_and_is_killed() {
        let registry = registry_with(300, 500);
        let temp = tempdir().expect("tempdir");
        let pid_file = temp.path().join("engine.pid");
        let error = registry
            .start_named_session(
                "silent",
                SessionConfig::default()
                    .with_env("FAKE_ENGINE_MODE", "silent")
                    .with_env("FAKE_ENGINE_PID_FILE", pid_file.to_str().expect("utf8 path")),
            )
            .expect_err("startup times out");
        assert_eq!(
            error,
            SessionError::StartupTimeout {
                key: "silent".to_string(),
                timeout_ms: 300
            }
        );
        assert_eq!(registry.session_state("silent"), Some(SessionState::Error));

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .expect("read pid file")
            .trim()
            .parse()
            .expect("parse pid");
        wait_until(Duration::from_secs(2), || !process_is_running(pid));
    }

    #[test]
    fn stubborn_engine_is_killed_after_grace_period() {
        let registry = registry_with(5_000, 200);
        let key = registry
            .start_session(SessionConfig::default().with_env("FAKE_ENGINE_MODE", "ignore_term"))
            .expect("start session");

        let started = Instant::now();
        let report = registry.terminate_session(&key).expect("terminate");
        assert!(!report.graceful);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(registry.session_state(&key), Some(SessionState::Terminated));
    }

    #[test]
    fn missing_engine_reports_error_event_without_registering() {
        let registry = SessionRegistry::new(ControllerConfig {
            engine_path: Some(PathBuf::from("/nonexistent/kalixcli")),
            ..ControllerConfig::default()
        });
        let mut events = registry.subscribe();
        let error = registry
            .start_session(SessionConfig::default())
            .expect_err("engine missing");
        assert!(matches!(error, SessionError::EngineNotFound(_)));
        assert!(registry.session_keys().is_empty());

        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_state, None);
        assert_eq!(events[0].new_state, SessionState::Error);
    }

    #[test]
    fn duplicate_session_key_is_rejected() {
        let registry = registry();
        registry
            .start_named_session("upper", SessionConfig::default())
            .expect("start upper");
        let error = registry
            .start_named_session("upper", SessionConfig::default())
            .expect_err("key in use");
        assert_eq!(error, SessionError::KeyInUse("upper".to_string()));
        registry.shutdown();
    }

    #[test]
    fn routed_fetch_responses_go_to_router_and_other_messages_to_program() {
        let registry = registry();
        let router = Arc::new(RecordingRouter::default());
        registry.set_result_router(router.clone());
        let key = registry
            .start_session(SessionConfig::default().with_env("FAKE_ENGINE_UID", "engine-r"))
            .expect("start session");
        let program = Arc::new(Mutex::new(RecordingProgram::default()));
        registry
            .set_active_program(&key, program.clone())
            .expect("attach program");

        registry
            .send_routed_command(&key, &get_result("node.gauge.dsflow", "csv"))
            .expect("send routed get_result");
        registry
            .send_command(&key, &get_result("node.gauge.usflow", "csv"))
            .expect("send plain get_result");
        registry.send_command(&key, &echo("hi")).expect("send echo");
        let responses = |program: &Mutex<RecordingProgram>| {
            lock_or_recover(program)
                .kinds
                .iter()
                .filter(|kind| **kind == MessageKind::Response)
                .count()
        };
        wait_until(Duration::from_secs(5), || {
            responses(program.as_ref()) == 2 && registry.session_state(&key) == Some(SessionState::Ready)
        });

        let routed = lock_or_recover(&router.routed).clone();
        assert_eq!(
            routed,
            vec![(key.clone(), "engine-r".to_string(), MessageKind::Response)]
        );

        registry.terminate_session(&key).expect("terminate");
        registry.remove_session(&key).expect("remove");
        let closed = lock_or_recover(&router.closed).clone();
        assert_eq!(
            closed,
            vec![
                (key.clone(), "engine-r".to_string(), InstanceClosure::Terminated),
                (key, "engine-r".to_string(), InstanceClosure::Removed),
            ]
        );
        assert_eq!(lock_or_recover(&program).ended.len(), 1);
    }

    #[test]
    fn interrupt_requires_an_interruptible_busy_engine() {
        let registry = registry();
        let key = registry
            .start_session(SessionConfig::default().with_env("FAKE_ENGINE_MODE", "slow_results"))
            .expect("start session");
        assert!(matches!(
            registry.interrupt(&key, "user"),
            Err(SessionError::NotInterruptible { .. })
        ));

        registry
            .send_command(&key, &get_result("node.slow", "csv"))
            .expect("send get_result");
        let session = registry.session(&key).expect("session");
        wait_until(Duration::from_secs(5), || {
            session
                .snapshot()
                .busy
                .is_some_and(|busy| busy.interruptible)
        });

        registry.interrupt(&key, "user").expect("interrupt");
        wait_until(Duration::from_secs(5), || {
            session.state() == SessionState::Ready
        });
        assert!(session
            .transcript()
            .iter()
            .any(|entry| entry.line.contains("command interrupted")));
        registry.shutdown();
    }
}
