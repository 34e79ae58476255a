use std::panic;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::config::EngineConfig;
use crate::core::engine::Engine;
use crate::core::registry::TestRegistry;
use crate::sandbox::SandboxExecutor;

mod cli;
mod config;
mod constants;
mod core;
mod protocol;
mod sandbox;

#[cfg(test)]
mod integration_test;

#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    set_panic_hook();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;
    let registry = TestRegistry::builtin()?;
    tracing::debug!("Loaded {} problems", registry.len());

    let passed = match cli.command {
        Command::Problems => {
            cli::list_problems(&registry);
            true
        }
        Command::Show { problem_id } => cli::show_problem(&registry, &problem_id),
        Command::Run {
            problem_id,
            solution_file,
            timeout_ms,
            json,
        } => {
            let mut limits = config.limits();
            if let Some(time_ms) = timeout_ms {
                limits.time_ms = time_ms;
            }
            let engine = Engine::new(Arc::new(SandboxExecutor::new(config.sandbox())));
            cli::run_solution(&engine, &registry, &problem_id, &solution_file, limits, json).await?
        }
        Command::Check { request_file } => {
            let engine = Engine::new(Arc::new(SandboxExecutor::new(config.sandbox())));
            cli::check_request(&engine, &request_file).await?
        }
    };

    Ok(if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
