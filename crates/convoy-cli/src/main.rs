//! Command-line entrypoint for the convoy agent.
//!
//! Exit codes: 0 on clean shutdown (interrupt during the watch loop),
//! 1 after any fatal error, which is logged first. The agent is meant to
//! run under a supervisor that restarts it; recovery resumes from
//! whatever the coordinator state says.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use convoy::bootstrap;
use convoy::config::AgentConfig;
use convoy::logger::Logger;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "convoy", version)]
#[command(about = "Cluster-coordinated MinIO topology and release rollouts")]
struct Cli {
    /// Path to the agent configuration file (overrides CONVOY_CONFIG_FILE).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    match &cli.config {
        Some(path) => AgentConfig::load(path),
        None => AgentConfig::load_default(),
    }
}

async fn run(config: &AgentConfig, log: &Logger) -> Result<()> {
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    let signal_log = *log;
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_log.info("[main] received interrupt, shutting down");
            shutdown.cancel();
        }
    });

    bootstrap::run(config, &cancel, log).await
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let bootstrap_log = Logger::default();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            bootstrap_log.error(format!("{err:#}"));
            return ExitCode::from(1);
        }
    };
    let log = Logger::new(config.log_level());

    let outcome = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")
        .and_then(|runtime| runtime.block_on(run(&config, &log)));

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log.error(format!("{err:#}"));
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_config_flag_is_optional() {
        let cli = Cli::try_parse_from(["convoy"]).expect("parse");
        assert!(cli.config.is_none());
    }

    #[test]
    fn the_config_flag_takes_a_path() {
        let cli =
            Cli::try_parse_from(["convoy", "--config", "/etc/convoy/config.yml"]).expect("parse");
        assert_eq!(cli.config, Some(PathBuf::from("/etc/convoy/config.yml")));
    }

    #[test]
    fn unknown_flags_are_rejected() {
        assert!(Cli::try_parse_from(["convoy", "--bogus"]).is_err());
    }
}
