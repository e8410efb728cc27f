use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use kalix_broker::RequestBroker;
use kalix_programs::{
    series_label, OptimisationProgram, OptimisationResult, ProgramPhase, ProgramStatus,
    RunModelProgram,
};
use kalix_protocol::TimeSeries;
use kalix_session::{
    load_controller_config, lock_or_recover, ControllerConfig, SessionConfig, SessionEvent,
    SessionEventKind, SessionRegistry,
};
use tokio::sync::{mpsc::UnboundedReceiver, watch};
use tokio::task::JoinHandle;

use crate::cli_args::{Cli, CliCommand};
use crate::probe::{ProbeProgram, ProbeReport};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let config = build_controller_config(&cli)?;
    let registry = SessionRegistry::new(config);
    let events = spawn_event_printer(registry.subscribe());
    let outcome = match cli.command {
        CliCommand::Run {
            model,
            series,
            run_name,
        } => execute_run(&registry, &model, &series, run_name).await,
        CliCommand::Optimise {
            model,
            config,
            output,
        } => execute_optimise(&registry, &model, &config, output.as_deref()).await,
        CliCommand::Version => execute_version(&registry).await,
    };
    shutdown_registry(&registry).await;
    drop(registry);
    events.abort();
    outcome
}

/// File settings first, then command-line and environment overrides.
pub(crate) fn build_controller_config(cli: &Cli) -> Result<ControllerConfig> {
    let mut config = match cli.controller_config.as_deref() {
        Some(path) => load_controller_config(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(engine_path) = cli.engine_path.clone() {
        config.engine_path = Some(engine_path);
    }
    if let Some(timeout) = cli.startup_timeout_ms {
        config.startup_timeout_ms = timeout;
    }
    if let Some(grace) = cli.termination_grace_ms {
        config.termination_grace_ms = grace;
    }
    Ok(config)
}

fn spawn_event_printer(mut events: UnboundedReceiver<SessionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", render_event(&event));
        }
    })
}

pub(crate) fn render_event(event: &SessionEvent) -> String {
    match (event.kind, event.old_state) {
        (SessionEventKind::Removed, _) => format!("[{}] removed", event.session_key),
        (SessionEventKind::Transition, Some(old)) => format!(
            "[{}] {old} -> {}: {}",
            event.session_key, event.new_state, event.message
        ),
        (SessionEventKind::Transition, None) => format!(
            "[{}] {}: {}",
            event.session_key, event.new_state, event.message
        ),
    }
}

async fn start_session(registry: &SessionRegistry, config: SessionConfig) -> Result<String> {
    let registry = registry.clone();
    tokio::task::spawn_blocking(move || registry.start_session(config))
        .await
        .context("session start task failed")?
        .context("failed to start engine session")
}

async fn shutdown_registry(registry: &SessionRegistry) {
    let registry = registry.clone();
    match tokio::task::spawn_blocking(move || registry.shutdown()).await {
        Ok(reports) => {
            for report in reports.iter().filter(|report| !report.graceful) {
                tracing::warn!(session_key = %report.session_key, "engine was killed during shutdown");
            }
        }
        Err(error) => tracing::error!(%error, "session shutdown task failed"),
    }
}

fn read_text(path: &Path, what: &str) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} {}", path.display()))
}

/// Follows a program's status channel until it reaches DONE or ERROR,
/// interrupting the engine on Ctrl-C.
async fn follow_program(
    registry: &SessionRegistry,
    session_key: &str,
    mut status: watch::Receiver<ProgramStatus>,
) -> ProgramPhase {
    let mut last_line = String::new();
    let mut interrupted = false;
    loop {
        let current = status.borrow_and_update().clone();
        if current.phase.is_finished() {
            return current.phase;
        }
        let line = format!("  [{:>3.0}%] {}", current.percentage, current.description);
        if line != last_line {
            println!("{line}");
            last_line = line;
        }
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    return status.borrow().phase;
                }
            }
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if signal.is_ok() {
                    if let Err(error) = registry.interrupt(session_key, "interrupted by user") {
                        println!("cannot interrupt: {error}");
                    }
                }
            }
        }
    }
}

async fn execute_run(
    registry: &SessionRegistry,
    model: &Path,
    series: &[String],
    run_name: Option<String>,
) -> Result<()> {
    let model_ini = read_text(model, "model file")?;
    let broker = RequestBroker::new(registry.clone())
        .map_err(|error| anyhow!("failed to start request broker: {error}"))?;
    let key = start_session(registry, SessionConfig::for_model_file(model)).await?;

    let mut program = RunModelProgram::new(registry.session_link(&key)?);
    if let Some(run_name) = run_name {
        program = program.with_run_name(run_name);
    }
    let status = program.subscribe_progress();
    let program = Arc::new(Mutex::new(program));
    registry.set_active_program(&key, program.clone())?;
    lock_or_recover(&program)
        .start(&model_ini)
        .context("failed to start model run")?;

    let phase = follow_program(registry, &key, status).await;
    let (outputs, source) = {
        let program = lock_or_recover(&program);
        if phase == ProgramPhase::Error {
            let reason = program
                .failure()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown failure".to_string());
            bail!("model run failed: {reason}");
        }
        if program.stopped_early() {
            println!("model run stopped before completion");
        }
        (program.outputs_generated().to_vec(), program.source().clone())
    };

    println!("outputs generated: {}", outputs.len());
    let wanted = if series.is_empty() { &outputs } else { series };
    let mut failures = 0usize;
    for name in wanted {
        match broker.request(&key, name).await {
            Ok(fetched) => println!("{}", summarise_series(&series_label(&source, name), &fetched)),
            Err(error) => {
                failures += 1;
                println!("{name}: {error}");
            }
        }
    }
    broker.shutdown();
    if failures > 0 {
        bail!("{failures} series could not be fetched");
    }
    Ok(())
}

async fn execute_optimise(
    registry: &SessionRegistry,
    model: &Path,
    config: &Path,
    output: Option<&Path>,
) -> Result<()> {
    let model_ini = read_text(model, "model file")?;
    let optimisation_config = read_text(config, "optimisation config")?;
    let key = start_session(registry, SessionConfig::for_model_file(model)).await?;

    let program = OptimisationProgram::new(registry.session_link(&key)?, model_ini);
    let status = program.subscribe_progress();
    let program = Arc::new(Mutex::new(program));
    registry.set_active_program(&key, program.clone())?;
    lock_or_recover(&program)
        .start(&optimisation_config)
        .context("failed to start optimisation")?;

    let phase = follow_program(registry, &key, status).await;
    let program = lock_or_recover(&program);
    if !program.optimisable_parameters().is_empty() {
        println!(
            "optimisable parameters: {}",
            program.optimisable_parameters().join(", ")
        );
    }
    if let Some(warning) = program.parameter_warning() {
        println!("warning: could not list optimisable parameters: {warning}");
    }
    if let Some(result) = program.result() {
        println!("{}", render_optimisation_result(result));
    }
    if phase == ProgramPhase::Error {
        let reason = program
            .failure()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown failure".to_string());
        bail!("optimisation failed: {reason}");
    }
    if let (Some(path), Some(ini)) = (
        output,
        program
            .result()
            .and_then(|result| result.optimised_model_ini.as_deref()),
    ) {
        std::fs::write(path, ini)
            .with_context(|| format!("failed to write optimised model {}", path.display()))?;
        println!("optimised model written to {}", path.display());
    }
    Ok(())
}

async fn execute_version(registry: &SessionRegistry) -> Result<()> {
    let key = start_session(registry, SessionConfig::default()).await?;
    let (reports, received) = mpsc::channel();
    let program = Arc::new(Mutex::new(ProbeProgram::new(
        registry.session_link(&key)?,
        reports,
    )));
    registry.set_active_program(&key, program.clone())?;
    lock_or_recover(&program).start();

    let collected = tokio::task::spawn_blocking(move || {
        let mut collected = Vec::new();
        while let Ok(report) = received.recv_timeout(PROBE_TIMEOUT) {
            let last = !matches!(report, ProbeReport::Echo(_));
            collected.push(report);
            if last {
                break;
            }
        }
        collected
    })
    .await
    .context("probe task failed")?;

    println!("session: {key}");
    if let Some(uid) = registry.engine_instance_id(&key) {
        println!("engine instance: {uid}");
    }
    let mut version_seen = false;
    for report in collected {
        match report {
            ProbeReport::Echo(value) => println!("echo: {value}"),
            ProbeReport::Version(value) => {
                version_seen = true;
                let version = value
                    .get("version")
                    .and_then(|version| version.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                println!("engine version: {version}");
            }
            ProbeReport::Failed(reason) => bail!("engine probe failed: {reason}"),
        }
    }
    if !version_seen {
        bail!("engine did not report its version");
    }
    Ok(())
}

pub(crate) fn summarise_series(label: &str, series: &TimeSeries) -> String {
    let present: Vec<f64> = series
        .values
        .iter()
        .copied()
        .filter(|value| !value.is_nan())
        .collect();
    let mean = if present.is_empty() {
        "n/a".to_string()
    } else {
        format!("{:.4}", present.iter().sum::<f64>() / present.len() as f64)
    };
    let end = series
        .end()
        .map(|end| end.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{label}: {} points from {} to {end} every {}s, {} missing, mean {mean}",
        series.len(),
        series.start,
        series.step_seconds,
        series.missing_count()
    )
}

pub(crate) fn render_optimisation_result(result: &OptimisationResult) -> String {
    let mut lines = vec![format!(
        "optimisation {}: {}",
        if result.success { "succeeded" } else { "failed" },
        result.message
    )];
    if let Some(best) = result.best_objective {
        lines.push(format!("  best objective: {best}"));
    }
    if let Some(evaluations) = result.evaluations {
        lines.push(format!("  evaluations: {evaluations}"));
    }
    if let Some(generations) = result.generations {
        lines.push(format!("  generations: {generations}"));
    }
    for (name, value) in &result.parameters_physical {
        lines.push(format!("  {name} = {value}"));
    }
    lines.join("\n")
}
