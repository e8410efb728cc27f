//! Load a model, run it, and collect the names of the series it produced.

use std::sync::Arc;

use kalix_protocol::{
    load_model_string, run_simulation, Message, MessageBody, LOAD_MODEL_STRING_COMMAND,
    RUN_SIMULATION_COMMAND,
};
use kalix_session::{CommandSink, SessionProgram, SessionState};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::ProgramError;
use crate::sources::{DataSource, RunSource};
use crate::workflow::{engine_failure, ProgramPhase, ProgramStatus, Workflow};

pub struct RunModelProgram {
    workflow: Workflow,
    source: RunSource,
    model_ini: Option<String>,
    outputs_generated: Vec<String>,
    stopped_early: bool,
}

impl RunModelProgram {
    pub fn new(sink: Arc<dyn CommandSink>) -> Self {
        let source = RunSource::new(sink.session_key());
        Self {
            workflow: Workflow::new("run-model", sink),
            source,
            model_ini: None,
            outputs_generated: Vec::new(),
            stopped_early: false,
        }
    }

    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.source = self.source.named(run_name);
        self
    }

    /// Sends the model text and moves to LOADING.
    pub fn start(&mut self, model_ini: &str) -> Result<(), ProgramError> {
        self.workflow.ensure_not_started()?;
        self.model_ini = Some(model_ini.to_string());
        self.workflow.advance(ProgramPhase::Loading);
        self.workflow.send(load_model_string(model_ini))
    }

    pub fn phase(&self) -> ProgramPhase {
        self.workflow.phase()
    }

    pub fn phase_history(&self) -> &[ProgramPhase] {
        self.workflow.history()
    }

    pub fn failure(&self) -> Option<&ProgramError> {
        self.workflow.failure()
    }

    pub fn outputs_generated(&self) -> &[String] {
        &self.outputs_generated
    }

    /// The run ended on an interrupt rather than a result.
    pub fn stopped_early(&self) -> bool {
        self.stopped_early
    }

    pub fn model_ini(&self) -> Option<&str> {
        self.model_ini.as_deref()
    }

    pub fn source(&self) -> &RunSource {
        &self.source
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProgramStatus> {
        self.workflow.subscribe()
    }

    fn handle_loading(&mut self, message: &Message) -> bool {
        match &message.body {
            MessageBody::Ready { rc: 0 } => {
                self.workflow.advance(ProgramPhase::Running);
                // A refused send already moved the workflow to ERROR.
                let _ = self.workflow.send(run_simulation());
                true
            }
            MessageBody::Ready { .. } | MessageBody::Error { .. } => {
                self.workflow.fail(engine_failure(message));
                true
            }
            MessageBody::Response { ok: false, .. }
                if message.command_name() == Some(LOAD_MODEL_STRING_COMMAND) =>
            {
                self.workflow.fail(engine_failure(message));
                true
            }
            MessageBody::Busy { .. } | MessageBody::Response { .. } => true,
            _ => false,
        }
    }

    fn handle_running(&mut self, message: &Message) -> bool {
        match &message.body {
            MessageBody::Busy { .. } => true,
            MessageBody::Progress { .. } => {
                if let Some(progress) = message.progress() {
                    self.workflow.publish_progress(&progress);
                }
                true
            }
            MessageBody::Response { ok, result, .. }
                if message.command_name() == Some(RUN_SIMULATION_COMMAND) =>
            {
                if !*ok {
                    self.workflow.fail(engine_failure(message));
                    return true;
                }
                match extract_outputs(result) {
                    Some(outputs) => self.outputs_generated = outputs,
                    None => tracing::warn!(
                        source = %self.source.display_name(),
                        "simulation result did not list generated outputs"
                    ),
                }
                tracing::info!(
                    source = %self.source.display_name(),
                    outputs = self.outputs_generated.len(),
                    "model run completed"
                );
                self.workflow.advance(ProgramPhase::Done);
                true
            }
            MessageBody::Stopped { .. } => {
                tracing::info!(source = %self.source.display_name(), "model run stopped");
                self.stopped_early = true;
                self.workflow.advance(ProgramPhase::Done);
                true
            }
            MessageBody::Error { .. } => {
                self.workflow.fail(engine_failure(message));
                true
            }
            _ => false,
        }
    }
}

/// Output names from `r.ts.outputs`, falling back to the older
/// `r.outputs_generated`.
fn extract_outputs(result: &Value) -> Option<Vec<String>> {
    let outputs = result
        .get("ts")
        .and_then(|ts| ts.get("outputs"))
        .or_else(|| result.get("outputs_generated"))?
        .as_array()?;
    Some(
        outputs
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

impl SessionProgram for RunModelProgram {
    fn name(&self) -> &'static str {
        self.workflow.program()
    }

    fn handle_message(&mut self, message: &Message) -> bool {
        if !self.workflow.claim(message) {
            return false;
        }
        match self.workflow.phase() {
            ProgramPhase::Loading => self.handle_loading(message),
            ProgramPhase::Running => self.handle_running(message),
            _ => false,
        }
    }

    fn session_ended(&mut self, state: SessionState, reason: &str) {
        self.workflow.session_ended(state, reason);
    }

    fn is_finished(&self) -> bool {
        self.workflow.phase().is_finished()
    }

    fn state_description(&self) -> String {
        format!(
            "{} on {}",
            self.workflow.describe(),
            self.source.display_name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_support::{message, RecordingSink};

    fn program() -> (Arc<RecordingSink>, RunModelProgram) {
        let sink = Arc::new(RecordingSink::new());
        let program = RunModelProgram::new(sink.clone());
        (sink, program)
    }

    #[test]
    fn full_run_collects_outputs() {
        let (sink, mut program) = program();
        let mut progress = program.subscribe_progress();
        program.start("[node.a]\ntype = gr4j\n").expect("start");
        assert_eq!(program.phase(), ProgramPhase::Loading);

        assert!(program.handle_message(&message(r#"{"m":"bsy","cmd":"load_model_string","int":false}"#)));
        assert!(program.handle_message(&message(r#"{"m":"res","cmd":"load_model_string","r":{}}"#)));
        assert!(program.handle_message(&message(r#"{"m":"rdy","rc":0}"#)));
        assert_eq!(program.phase(), ProgramPhase::Running);
        assert_eq!(sink.names(), vec!["load_model_string", "run_simulation"]);

        assert!(program.handle_message(&message(r#"{"m":"bsy","cmd":"run_simulation","int":true}"#)));
        assert!(program.handle_message(&message(r#"{"m":"prg","i":150,"n":100,"t":"sim"}"#)));
        let status = progress.borrow_and_update().clone();
        assert_eq!(status.percentage, 100.0);
        assert_eq!(status.description, "Simulating: 150 of 100");

        assert!(program.handle_message(&message(
            r#"{"m":"res","cmd":"run_simulation","r":{"ts":{"outputs":["node.a.dsflow","node.b.dsflow"]}}}"#
        )));
        assert_eq!(program.phase(), ProgramPhase::Done);
        assert_eq!(program.outputs_generated(), ["node.a.dsflow", "node.b.dsflow"]);
        assert_eq!(
            program.phase_history(),
            [
                ProgramPhase::Starting,
                ProgramPhase::Loading,
                ProgramPhase::Running,
                ProgramPhase::Done
            ]
        );
        assert!(!program.handle_message(&message(r#"{"m":"rdy","rc":0}"#)));
        assert_eq!(progress.borrow().phase, ProgramPhase::Done);
    }

    #[test]
    fn legacy_outputs_field_is_accepted() {
        let outputs = extract_outputs(&serde_json::json!({"outputs_generated": ["x", 3, "y"]}))
            .expect("legacy outputs");
        assert_eq!(outputs, vec!["x", "y"]);
        assert_eq!(extract_outputs(&serde_json::json!({"ts": {}})), None);
    }

    #[test]
    fn load_failure_moves_to_error_with_clean_text() {
        let (sink, mut program) = program();
        program.start("FAIL").expect("start");
        program.handle_message(&message(
            r#"{"m":"err","cmd":"load_model_string","msg":"Command execution error: Failed to parse model"}"#,
        ));
        assert_eq!(program.phase(), ProgramPhase::Error);
        assert_eq!(
            program.failure(),
            Some(&ProgramError::Engine("Failed to parse model".to_string()))
        );
        assert!(!program.handle_message(&message(r#"{"m":"rdy","rc":1}"#)));
        assert_eq!(sink.names(), vec!["load_model_string"]);
    }

    #[test]
    fn interrupted_run_is_done_but_flagged() {
        let (_sink, mut program) = program();
        program.start("model").expect("start");
        program.handle_message(&message(r#"{"m":"res","cmd":"load_model_string","r":{}}"#));
        program.handle_message(&message(r#"{"m":"rdy","rc":0}"#));
        program.handle_message(&message(r#"{"m":"bsy","cmd":"run_simulation","int":true}"#));
        program.handle_message(&message(r#"{"m":"stp","cmd":"run_simulation","exec_ms":12.0}"#));
        assert_eq!(program.phase(), ProgramPhase::Done);
        assert!(program.stopped_early());
        assert!(program.outputs_generated().is_empty());
    }

    #[test]
    fn session_end_before_done_fails_the_program() {
        let (_sink, mut program) = program();
        program.start("model").expect("start");
        program.session_ended(SessionState::Error, "engine exited unexpectedly (exit code 7)");
        assert!(program.is_finished());
        assert!(matches!(
            program.failure(),
            Some(ProgramError::SessionEnded {
                state: SessionState::Error,
                ..
            })
        ));
        assert!(!program.handle_message(&message(r#"{"m":"rdy","rc":0}"#)));

        let (_sink, mut done) = self::program();
        done.start("model").expect("start");
        done.handle_message(&message(r#"{"m":"res","cmd":"load_model_string","r":{}}"#));
        done.handle_message(&message(r#"{"m":"rdy","rc":0}"#));
        done.handle_message(&message(r#"{"m":"res","cmd":"run_simulation","r":{"ts":{"outputs":[]}}}"#));
        done.session_ended(SessionState::Terminated, "engine shut down gracefully");
        assert_eq!(done.phase(), ProgramPhase::Done);
    }

    #[test]
    fn refused_send_fails_start() {
        let mut program = RunModelProgram::new(Arc::new(RecordingSink::refusing()));
        let error = program.start("model").expect_err("session inactive");
        assert!(matches!(error, ProgramError::Dispatch { .. }));
        assert_eq!(program.phase(), ProgramPhase::Error);
        assert!(matches!(
            program.start("again"),
            Err(ProgramError::AlreadyStarted { .. })
        ));
    }

    #[test]
    fn fetch_cycles_between_own_commands_are_ignored() {
        let (sink, mut program) = program();
        program.start("model").expect("start");

        // A fetch that was queued ahead of the load is interrupted.
        assert!(!program.handle_message(&message(r#"{"m":"bsy","cmd":"get_result","int":true}"#)));
        assert!(!program.handle_message(&message(r#"{"m":"rdy","rc":2}"#)));
        assert_eq!(program.phase(), ProgramPhase::Loading);
        assert!(program.failure().is_none());

        // A missing series between load and run leaves the run alone.
        program.handle_message(&message(r#"{"m":"bsy","cmd":"load_model_string","int":false}"#));
        program.handle_message(&message(r#"{"m":"res","cmd":"load_model_string","r":{}}"#));
        program.handle_message(&message(r#"{"m":"rdy","rc":0}"#));
        assert_eq!(program.phase(), ProgramPhase::Running);
        assert!(!program.handle_message(&message(r#"{"m":"bsy","cmd":"get_result","int":true}"#)));
        assert!(!program.handle_message(&message(r#"{"m":"rdy","rc":1}"#)));
        assert_eq!(program.phase(), ProgramPhase::Running);

        program.handle_message(&message(r#"{"m":"bsy","cmd":"run_simulation","int":true}"#));
        program.handle_message(&message(
            r#"{"m":"res","cmd":"run_simulation","r":{"ts":{"outputs":["node.a.dsflow"]}}}"#,
        ));
        assert_eq!(program.phase(), ProgramPhase::Done);
        assert_eq!(sink.names(), vec!["load_model_string", "run_simulation"]);
    }

    #[test]
    fn description_uses_run_name() {
        let (_sink, program) = program();
        let program = program.with_run_name("Baseline");
        assert_eq!(program.state_description(), "Starting on Baseline");
    }
}
