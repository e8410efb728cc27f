use std::path::PathBuf;

use clap::{Parser, Subcommand};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "kalix-controller",
    about = "Drive kalixcli engine sessions over their stdio JSON protocol",
    version
)]
pub struct Cli {
    #[arg(
        long = "controller-config",
        env = "KALIX_CONTROLLER_CONFIG",
        help = "TOML file with controller settings; command-line flags take precedence"
    )]
    pub controller_config: Option<PathBuf>,

    #[arg(
        long = "engine-path",
        env = "KALIX_ENGINE_PATH",
        help = "Engine executable to launch instead of searching PATH for kalixcli"
    )]
    pub engine_path: Option<PathBuf>,

    #[arg(
        long = "startup-timeout-ms",
        env = "KALIX_STARTUP_TIMEOUT_MS",
        value_parser = parse_positive_u64,
        help = "Time allowed for the engine to announce readiness"
    )]
    pub startup_timeout_ms: Option<u64>,

    #[arg(
        long = "termination-grace-ms",
        env = "KALIX_TERMINATION_GRACE_MS",
        help = "Time allowed for a graceful engine shutdown before it is killed"
    )]
    pub termination_grace_ms: Option<u64>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run a model and print summaries of its output series.
    Run {
        #[arg(long, help = "Model INI file")]
        model: PathBuf,

        #[arg(
            long = "series",
            help = "Output series to fetch; repeat for several. Defaults to every generated output"
        )]
        series: Vec<String>,

        #[arg(long = "run-name", help = "Label shown for this run")]
        run_name: Option<String>,
    },
    /// Calibrate a model and print the optimiser's result.
    Optimise {
        #[arg(long, help = "Model INI file")]
        model: PathBuf,

        #[arg(long, help = "Optimisation configuration file")]
        config: PathBuf,

        #[arg(long, help = "Write the optimised model INI to this file")]
        output: Option<PathBuf>,
    },
    /// Start an engine and report its echo and version responses.
    Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_repeated_series() {
        let cli = Cli::try_parse_from([
            "kalix-controller",
            "--engine-path",
            "/opt/kalix/kalixcli",
            "run",
            "--model",
            "catchment.ini",
            "--series",
            "node.gauge.dsflow",
            "--series",
            "node.gauge.usflow",
        ])
        .expect("parse run");
        assert_eq!(cli.engine_path, Some(PathBuf::from("/opt/kalix/kalixcli")));
        match cli.command {
            CliCommand::Run { model, series, run_name } => {
                assert_eq!(model, PathBuf::from("catchment.ini"));
                assert_eq!(series, vec!["node.gauge.dsflow", "node.gauge.usflow"]);
                assert_eq!(run_name, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn optimise_requires_model_and_config() {
        assert!(Cli::try_parse_from(["kalix-controller", "optimise", "--model", "m.ini"]).is_err());
        let cli = Cli::try_parse_from([
            "kalix-controller",
            "optimise",
            "--model",
            "m.ini",
            "--config",
            "opt.ini",
        ])
        .expect("parse optimise");
        assert!(matches!(cli.command, CliCommand::Optimise { output: None, .. }));
    }

    #[test]
    fn zero_startup_timeout_is_rejected() {
        let error = Cli::try_parse_from(["kalix-controller", "--startup-timeout-ms", "0", "version"])
            .expect_err("zero timeout");
        assert!(error.to_string().contains("greater than 0"));
    }
}
