#![cfg(unix)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kalix_broker::{BrokerError, RequestBroker};
use kalix_programs::{
    series_label, OptimisationProgram, ProgramPhase, ProgramStatus, RunModelProgram,
};
use kalix_session::{
    lock_or_recover, ControllerConfig, SessionConfig, SessionEvent, SessionRegistry, SessionState,
};
use tokio::sync::{mpsc::UnboundedReceiver, watch};

const FAKE_ENGINE: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../fixtures/fake_engine.sh"
);
const MODEL_INI: &str = "[kalix]\nversion = 0.0.1\n\n[node.gauge]\ntype = gr4j\n";

fn registry() -> SessionRegistry {
    SessionRegistry::new(ControllerConfig {
        engine_path: Some(PathBuf::from("/bin/sh")),
        engine_args: vec![FAKE_ENGINE.to_string()],
        startup_timeout_ms: 5_000,
        termination_grace_ms: 2_000,
        ..ControllerConfig::default()
    })
}

async fn start(registry: &SessionRegistry, config: SessionConfig) -> String {
    let registry = registry.clone();
    tokio::task::spawn_blocking(move || registry.start_session(config))
        .await
        .expect("start task")
        .expect("start fake engine")
}

async fn wait_finished(mut status: watch::Receiver<ProgramStatus>) -> ProgramPhase {
    tokio::time::timeout(Duration::from_secs(10), async move {
        loop {
            let phase = status.borrow_and_update().phase;
            if phase.is_finished() {
                return phase;
            }
            if status.changed().await.is_err() {
                return status.borrow().phase;
            }
        }
    })
    .await
    .expect("program finished in time")
}

async fn wait_state(registry: &SessionRegistry, key: &str, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.session_state(key) != Some(state) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session reached expected state");
}

fn drain(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<(Option<SessionState>, SessionState)> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push((event.old_state, event.new_state));
    }
    seen
}

#[tokio::test]
async fn model_run_then_fetch_output_series() {
    let registry = registry();
    let broker = RequestBroker::new(registry.clone()).expect("broker");
    let mut events = registry.subscribe();
    let key = start(&registry, SessionConfig::default()).await;
    assert_eq!(registry.session_state(&key), Some(SessionState::Ready));

    let program = RunModelProgram::new(registry.session_link(&key).expect("link"))
        .with_run_name("Baseline");
    let status = program.subscribe_progress();
    let program = Arc::new(Mutex::new(program));
    registry
        .set_active_program(&key, program.clone())
        .expect("attach program");
    lock_or_recover(&program).start(MODEL_INI).expect("start run");

    assert_eq!(wait_finished(status).await, ProgramPhase::Done);
    let (outputs, source) = {
        let program = lock_or_recover(&program);
        assert_eq!(
            program.phase_history(),
            [
                ProgramPhase::Starting,
                ProgramPhase::Loading,
                ProgramPhase::Running,
                ProgramPhase::Done
            ]
        );
        assert!(!program.stopped_early());
        (program.outputs_generated().to_vec(), program.source().clone())
    };
    assert_eq!(outputs, vec!["node.gauge.dsflow", "node.gauge.usflow"]);

    let series = broker
        .request(&key, "node.gauge.dsflow")
        .await
        .expect("fetch dsflow");
    assert_eq!(series.len(), 4);
    assert_eq!(series.missing_count(), 1);
    assert_eq!(series.step_seconds, 86_400);
    assert_eq!(
        series_label(&source, "node.gauge.dsflow"),
        "node.gauge.dsflow (Baseline)"
    );
    assert_eq!(broker.cached_count(), 1);

    let missing = broker
        .request(&key, "missing.node.flow")
        .await
        .expect_err("unknown series");
    assert!(matches!(missing, BrokerError::EngineReported { .. }));
    wait_state(&registry, &key, SessionState::Ready).await;

    let transitions = drain(&mut events);
    assert_eq!(transitions.first(), Some(&(None, SessionState::Starting)));
    let position = |transition: (Option<SessionState>, SessionState)| {
        transitions
            .iter()
            .position(|seen| *seen == transition)
            .expect("transition published")
    };
    let first_busy = position((Some(SessionState::Starting), SessionState::Running));
    let first_idle = position((Some(SessionState::Running), SessionState::Ready));
    assert!(first_busy < first_idle);
    assert!(transitions.contains(&(Some(SessionState::Ready), SessionState::Running)));
    assert!(!transitions.contains(&(Some(SessionState::Starting), SessionState::Ready)));

    broker.shutdown();
    let reports = registry.shutdown();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].graceful);
    assert_eq!(registry.session_state(&key), Some(SessionState::Terminated));
}

#[tokio::test]
async fn rejected_model_leaves_session_ready() {
    let registry = registry();
    let key = start(&registry, SessionConfig::default()).await;

    let program = RunModelProgram::new(registry.session_link(&key).expect("link"));
    let status = program.subscribe_progress();
    let program = Arc::new(Mutex::new(program));
    registry
        .set_active_program(&key, program.clone())
        .expect("attach program");
    lock_or_recover(&program)
        .start("[kalix]\nFAIL = yes\n")
        .expect("start run");

    assert_eq!(wait_finished(status).await, ProgramPhase::Error);
    let failure = lock_or_recover(&program)
        .failure()
        .map(ToString::to_string)
        .expect("failure recorded");
    assert!(failure.contains("FAIL marker"), "{failure}");
    wait_state(&registry, &key, SessionState::Ready).await;
    registry.shutdown();
}

#[tokio::test]
async fn optimisation_reports_parameters_and_result() {
    let registry = registry();
    let key = start(&registry, SessionConfig::default()).await;

    let program =
        OptimisationProgram::new(registry.session_link(&key).expect("link"), MODEL_INI);
    let status = program.subscribe_progress();
    let program = Arc::new(Mutex::new(program));
    registry
        .set_active_program(&key, program.clone())
        .expect("attach program");
    lock_or_recover(&program)
        .start("[General]\nAlgorithm = DE\n")
        .expect("start optimisation");

    assert_eq!(wait_finished(status).await, ProgramPhase::Done);
    let program = lock_or_recover(&program);
    assert_eq!(program.optimisable_parameters(), ["node.a.k", "node.b.x"]);
    assert_eq!(program.convergence_history().len(), 2);
    let result = program.result().expect("optimisation result");
    assert!(result.success);
    assert_eq!(result.best_objective, Some(0.42));
    assert_eq!(
        result.optimised_model_ini.as_deref(),
        Some("[node.a]\nk = 1.25\n")
    );
    drop(program);
    registry.shutdown();
}

#[tokio::test]
async fn terminating_session_fails_pending_fetches() {
    let registry = registry();
    let broker = RequestBroker::new(registry.clone()).expect("broker");
    let key = start(
        &registry,
        SessionConfig::default().with_env("FAKE_ENGINE_MODE", "slow_results"),
    )
    .await;

    let pending = broker.request(&key, "node.gauge.dsflow");
    let waiting = tokio::spawn(pending);
    wait_state(&registry, &key, SessionState::Running).await;

    let registry_for_kill = registry.clone();
    let key_for_kill = key.clone();
    let report = tokio::task::spawn_blocking(move || {
        registry_for_kill.terminate_session(&key_for_kill)
    })
    .await
    .expect("terminate task")
    .expect("terminate");
    assert!(!report.already_terminated);

    let outcome = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("fetch settled")
        .expect("join fetch");
    assert!(matches!(outcome, Err(BrokerError::SessionTerminated { .. })));
    assert_eq!(broker.pending_count(), 0);
    registry.remove_session(&key).expect("remove terminated session");
    assert!(registry.session(&key).is_none());
}

#[tokio::test]
async fn interrupted_fetch_ahead_of_a_model_run_does_not_end_the_run() {
    let registry = registry();
    let broker = RequestBroker::new(registry.clone()).expect("broker");
    let key = start(
        &registry,
        SessionConfig::default().with_env("FAKE_ENGINE_MODE", "slow_results"),
    )
    .await;

    let fetch = tokio::spawn(broker.request(&key, "node.gauge.dsflow"));
    wait_state(&registry, &key, SessionState::Running).await;

    let program = RunModelProgram::new(registry.session_link(&key).expect("link"));
    let status = program.subscribe_progress();
    let program = Arc::new(Mutex::new(program));
    registry
        .set_active_program(&key, program.clone())
        .expect("attach program");
    lock_or_recover(&program).start(MODEL_INI).expect("queue run");

    let session = registry.session(&key).expect("session");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !session
            .snapshot()
            .busy
            .is_some_and(|busy| busy.interruptible)
        {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("fetch became interruptible");
    registry.interrupt(&key, "user").expect("interrupt fetch");

    let fetched = tokio::time::timeout(Duration::from_secs(5), fetch)
        .await
        .expect("fetch settled")
        .expect("join fetch");
    assert!(fetched.is_err());

    assert_eq!(wait_finished(status).await, ProgramPhase::Done);
    {
        let program = lock_or_recover(&program);
        assert_eq!(
            program.phase_history(),
            [
                ProgramPhase::Starting,
                ProgramPhase::Loading,
                ProgramPhase::Running,
                ProgramPhase::Done
            ]
        );
        assert!(!program.stopped_early());
        assert_eq!(
            program.outputs_generated(),
            ["node.gauge.dsflow", "node.gauge.usflow"]
        );
    }
    broker.shutdown();
    registry.shutdown();
}
