//! Diagnostic program used by `version`: echo then get_version.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use kalix_protocol::{echo, get_version, Message, MessageBody, ECHO_COMMAND, GET_VERSION_COMMAND};
use kalix_session::{CommandSink, SessionProgram, SessionState};
use serde_json::Value;

pub(crate) const PROBE_TEXT: &str = "kalix-controller";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ProbeReport {
    Echo(Value),
    Version(Value),
    Failed(String),
}

pub(crate) struct ProbeProgram {
    sink: Arc<dyn CommandSink>,
    reports: Sender<ProbeReport>,
    awaiting: Option<&'static str>,
}

impl ProbeProgram {
    pub(crate) fn new(sink: Arc<dyn CommandSink>, reports: Sender<ProbeReport>) -> Self {
        Self {
            sink,
            reports,
            awaiting: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.send(ECHO_COMMAND);
    }

    fn send(&mut self, command: &'static str) {
        let request = if command == ECHO_COMMAND {
            echo(PROBE_TEXT)
        } else {
            get_version()
        };
        match self.sink.send_command(&request) {
            Ok(_) => self.awaiting = Some(command),
            Err(error) => self.finish(ProbeReport::Failed(error.to_string())),
        }
    }

    fn finish(&mut self, report: ProbeReport) {
        self.awaiting = None;
        let _ = self.reports.send(report);
    }
}

impl SessionProgram for ProbeProgram {
    fn name(&self) -> &'static str {
        "probe"
    }

    fn handle_message(&mut self, message: &Message) -> bool {
        let Some(awaiting) = self.awaiting else {
            return false;
        };
        if !message.is_response_to(awaiting) {
            return false;
        }
        match (&message.body, awaiting) {
            (MessageBody::Response { result, .. }, ECHO_COMMAND) => {
                let _ = self.reports.send(ProbeReport::Echo(result.clone()));
                self.send(GET_VERSION_COMMAND);
            }
            (MessageBody::Response { result, .. }, _) => {
                self.finish(ProbeReport::Version(result.clone()));
            }
            (MessageBody::Error { message, .. }, _) => {
                self.finish(ProbeReport::Failed(message.clone()));
            }
            _ => return false,
        }
        true
    }

    fn session_ended(&mut self, state: SessionState, reason: &str) {
        if self.awaiting.is_some() {
            self.finish(ProbeReport::Failed(format!("session {state}: {reason}")));
        }
    }

    fn is_finished(&self) -> bool {
        self.awaiting.is_none()
    }

    fn state_description(&self) -> String {
        match self.awaiting {
            Some(command) => format!("waiting for {command}"),
            None => "idle".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::channel;
    use std::sync::Mutex;

    use kalix_protocol::{decode_line, CommandRequest};
    use kalix_session::{lock_or_recover, Dispatch, SessionError};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
    }

    impl CommandSink for Recorder {
        fn session_key(&self) -> &str {
            "session-1"
        }

        fn send_command(&self, command: &CommandRequest) -> Result<Dispatch, SessionError> {
            lock_or_recover(&self.sent).push(command.name.clone());
            Ok(Dispatch::Written)
        }
    }

    fn message(line: &str) -> Message {
        decode_line(line).expect("decode test message")
    }

    #[test]
    fn echo_response_triggers_version_request() {
        let sink = Arc::new(Recorder::default());
        let (reports, received) = channel();
        let mut probe = ProbeProgram::new(sink.clone(), reports);
        probe.start();
        assert_eq!(probe.state_description(), "waiting for echo");

        assert!(probe.handle_message(&message(
            r#"{"m":"res","cmd":"echo","r":{"echoed":true}}"#
        )));
        assert!(probe.handle_message(&message(
            r#"{"m":"res","cmd":"get_version","r":{"version":"1.2.3"}}"#
        )));

        assert_eq!(*lock_or_recover(&sink.sent), vec!["echo", "get_version"]);
        assert_eq!(
            received.try_recv().expect("echo report"),
            ProbeReport::Echo(serde_json::json!({"echoed": true}))
        );
        assert_eq!(
            received.try_recv().expect("version report"),
            ProbeReport::Version(serde_json::json!({"version": "1.2.3"}))
        );
        assert!(probe.is_finished());
    }

    #[test]
    fn unrelated_messages_are_ignored() {
        let (reports, received) = channel();
        let mut probe = ProbeProgram::new(Arc::new(Recorder::default()), reports);
        probe.start();
        assert!(!probe.handle_message(&message(r#"{"m":"rdy","rc":0}"#)));
        assert!(!probe.handle_message(&message(
            r#"{"m":"res","cmd":"get_version","r":{}}"#
        )));
        assert!(received.try_recv().is_err());
    }

    #[test]
    fn session_end_while_waiting_reports_failure() {
        let (reports, received) = channel();
        let mut probe = ProbeProgram::new(Arc::new(Recorder::default()), reports);
        probe.start();
        probe.session_ended(SessionState::Error, "engine exited unexpectedly");
        assert_eq!(
            received.try_recv().expect("failure report"),
            ProbeReport::Failed("session ERROR: engine exited unexpectedly".to_string())
        );
    }
}
