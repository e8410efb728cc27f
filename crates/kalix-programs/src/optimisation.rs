//! Calibrate a model: load it, list its optimisable parameters, then run the
//! optimiser with a configuration document.

use std::collections::BTreeMap;
use std::sync::Arc;

use kalix_protocol::{
    get_optimisable_params, load_model_string, run_optimisation, Message, MessageBody,
    GET_OPTIMISABLE_PARAMS_COMMAND, LOAD_MODEL_STRING_COMMAND, RUN_OPTIMISATION_COMMAND,
};
use kalix_session::{CommandSink, SessionProgram, SessionState};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::ProgramError;
use crate::workflow::{
    clean_engine_error, engine_failure, ProgramPhase, ProgramStatus, Workflow,
};

/// One sample of the optimiser's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergencePoint {
    pub evaluations: i64,
    pub best_objective: f64,
    pub population: Vec<f64>,
}

/// Final record returned by `run_optimisation`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct OptimisationResult {
    pub best_objective: Option<f64>,
    pub evaluations: Option<u64>,
    pub generations: Option<u64>,
    pub message: String,
    pub success: bool,
    pub optimised_model_ini: Option<String>,
    pub parameters_physical: BTreeMap<String, f64>,
    pub parameters_normalised: BTreeMap<String, f64>,
}

pub struct OptimisationProgram {
    workflow: Workflow,
    model_ini: String,
    config: Option<String>,
    model_loaded: bool,
    optimisable_parameters: Vec<String>,
    parameter_warning: Option<String>,
    convergence: Vec<ConvergencePoint>,
    result: Option<OptimisationResult>,
}

impl OptimisationProgram {
    pub fn new(sink: Arc<dyn CommandSink>, model_ini: impl Into<String>) -> Self {
        Self {
            workflow: Workflow::new("optimisation", sink),
            model_ini: model_ini.into(),
            config: None,
            model_loaded: false,
            optimisable_parameters: Vec::new(),
            parameter_warning: None,
            convergence: Vec::new(),
            result: None,
        }
    }

    /// Loads the model; the optimiser is started with `config` once the
    /// parameter listing finishes.
    pub fn start(&mut self, config: &str) -> Result<(), ProgramError> {
        self.workflow.ensure_not_started()?;
        self.config = Some(config.to_string());
        self.workflow.advance(ProgramPhase::Loading);
        let model = load_model_string(self.model_ini.as_str());
        self.workflow.send(model)
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

    pub fn optimisable_parameters(&self) -> &[String] {
        &self.optimisable_parameters
    }

    /// Why the parameter listing was skipped, if it was.
    pub fn parameter_warning(&self) -> Option<&str> {
        self.parameter_warning.as_deref()
    }

    pub fn convergence_history(&self) -> &[ConvergencePoint] {
        &self.convergence
    }

    /// Present once the engine answered `run_optimisation`, even when the
    /// optimiser reported failure.
    pub fn result(&self) -> Option<&OptimisationResult> {
        self.result.as_ref()
    }

    pub fn config(&self) -> Option<&str> {
        self.config.as_deref()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<ProgramStatus> {
        self.workflow.subscribe()
    }

    fn handle_loading(&mut self, message: &Message) -> bool {
        match &message.body {
            MessageBody::Response { ok, .. }
                if message.command_name() == Some(LOAD_MODEL_STRING_COMMAND) =>
            {
                if *ok {
                    self.model_loaded = true;
                } else {
                    self.workflow.fail(engine_failure(message));
                }
                true
            }
            MessageBody::Ready { rc: 0 } => {
                if !self.model_loaded {
                    tracing::debug!(
                        session_key = self.workflow.session_key(),
                        "engine ready without a load result; continuing"
                    );
                }
                self.workflow.advance(ProgramPhase::FetchingParams);
                let _ = self.workflow.send(get_optimisable_params());
                true
            }
            MessageBody::Ready { .. } | MessageBody::Error { .. } => {
                self.workflow.fail(engine_failure(message));
                true
            }
            MessageBody::Busy { .. } => true,
            _ => false,
        }
    }

    fn handle_fetching_params(&mut self, message: &Message) -> bool {
        match &message.body {
            MessageBody::Response { ok: true, result, .. }
                if message.command_name() == Some(GET_OPTIMISABLE_PARAMS_COMMAND) =>
            {
                match extract_parameters(result) {
                    Some(parameters) => self.optimisable_parameters = parameters,
                    None => self.note_parameter_warning("result did not list parameters"),
                }
                true
            }
            MessageBody::Response { .. } | MessageBody::Error { .. } => {
                let reason = match engine_failure(message) {
                    ProgramError::Engine(text) => text,
                    other => other.to_string(),
                };
                self.note_parameter_warning(reason.as_str());
                true
            }
            MessageBody::Ready { .. } => {
                self.workflow.advance(ProgramPhase::Optimising);
                let config = self.config.clone().unwrap_or_default();
                let _ = self.workflow.send(run_optimisation(config.as_str()));
                true
            }
            MessageBody::Busy { .. } => true,
            _ => false,
        }
    }

    fn handle_optimising(&mut self, message: &Message) -> bool {
        match &message.body {
            MessageBody::Busy { .. } => true,
            MessageBody::Progress { .. } => {
                let Some(progress) = message.progress() else {
                    return false;
                };
                self.workflow.publish_progress(&progress);
                if let Some(best_objective) = progress.data.first().copied() {
                    self.convergence.push(ConvergencePoint {
                        evaluations: progress.current,
                        best_objective,
                        population: progress.data.clone(),
                    });
                }
                true
            }
            MessageBody::Response { ok, result, .. }
                if message.command_name() == Some(RUN_OPTIMISATION_COMMAND) =>
            {
                if !*ok {
                    self.workflow.fail(engine_failure(message));
                    return true;
                }
                self.complete(result);
                true
            }
            MessageBody::Error { .. } => {
                self.workflow.fail(engine_failure(message));
                true
            }
            MessageBody::Stopped { .. } => {
                self.workflow
                    .fail(ProgramError::Engine("optimisation interrupted".to_string()));
                true
            }
            _ => false,
        }
    }

    fn complete(&mut self, result: &Value) {
        let parsed = match OptimisationResult::deserialize(result) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.workflow.fail(ProgramError::InvalidResult {
                    command: RUN_OPTIMISATION_COMMAND.to_string(),
                    reason: error.to_string(),
                });
                return;
            }
        };
        let success = parsed.success;
        let message = parsed.message.clone();
        tracing::info!(
            session_key = self.workflow.session_key(),
            success,
            best_objective = parsed.best_objective,
            evaluations = parsed.evaluations,
            "optimisation finished"
        );
        self.result = Some(parsed);
        if success {
            self.workflow.advance(ProgramPhase::Done);
        } else {
            let reason = if message.trim().is_empty() {
                "optimiser reported failure".to_string()
            } else {
                clean_engine_error(message.as_str())
            };
            self.workflow.fail(ProgramError::Engine(reason));
        }
    }

    fn note_parameter_warning(&mut self, reason: &str) {
        tracing::warn!(
            session_key = self.workflow.session_key(),
            reason,
            "could not list optimisable parameters; continuing"
        );
        self.parameter_warning = Some(reason.to_string());
    }
}

fn extract_parameters(result: &Value) -> Option<Vec<String>> {
    let parameters = result.get("parameters")?.as_array()?;
    Some(
        parameters
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

impl SessionProgram for OptimisationProgram {
    fn name(&self) -> &'static str {
        self.workflow.program()
    }

    fn handle_message(&mut self, message: &Message) -> bool {
        if !self.workflow.claim(message) {
            return false;
        }
        match self.workflow.phase() {
            ProgramPhase::Loading => self.handle_loading(message),
            ProgramPhase::FetchingParams => self.handle_fetching_params(message),
            ProgramPhase::Optimising => self.handle_optimising(message),
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
        match self.convergence.last() {
            Some(point) if self.workflow.phase() == ProgramPhase::Optimising => format!(
                "{}, best objective {:.4} after {} evaluations",
                self.workflow.describe(),
                point.best_objective,
                point.evaluations
            ),
            _ => self.workflow.describe(),
        }
    }
}
