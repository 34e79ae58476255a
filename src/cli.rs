use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use futures::StreamExt;
use itertools::Itertools;

use crate::{
    core::{
        domain::{CaseState, ExecutionLimits, ExecutionResult, RunOutcome, RunRequest, RunState},
        engine::Engine,
        registry::TestRegistry,
        value::Value,
    },
    protocol::models::{RunRequestMessage, RunResponseMessage},
};

#[derive(Parser)]
#[command(name = "algoflow")]
#[command(about = "AlgoFlow: grade algorithm solutions in an isolated sandbox", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List every problem with registered tests
    Problems,

    /// Show a problem, its test cases and a starter template
    Show {
        /// Problem id (e.g. count-inversions, bubble_sort/1)
        problem_id: String,
    },

    /// Grade a solution file against the tests of a problem
    Run {
        /// Problem id
        problem_id: String,

        /// Path to the solution source
        solution_file: PathBuf,

        /// Per-case time limit in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print the protocol response as JSON instead of progress lines
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Run a raw protocol request and print the protocol response
    Check {
        /// Path to a JSON request
        request_file: PathBuf,
    },
}

pub fn list_problems(registry: &TestRegistry) {
    println!("Available problems:");
    for problem in registry.problems() {
        println!("- {}: {} ({})", problem.id, problem.title, problem.entry_point);
    }
}

/// Returns `false` when the problem is unknown.
pub fn show_problem(registry: &TestRegistry, problem_id: &str) -> bool {
    let Some(problem) = registry.lookup(problem_id) else {
        println!("No tests available for problem '{problem_id}'");
        return false;
    };

    println!("{} [{}]", problem.title, problem.id);
    println!("Category: {:?}", problem.category);
    println!("Entry point: {}({})", problem.entry_point, problem.params.iter().join(", "));
    println!();
    for (idx, case) in problem.cases.iter().enumerate() {
        println!(
            "Test {}: input={} expected={}",
            idx + 1,
            Value::Array(case.input.clone()).display(),
            case.expected.display()
        );
    }
    println!();
    println!("{}", problem.template());
    true
}

/// Grades `solution_file` and returns whether every case passed.
pub async fn run_solution(
    engine: &Engine,
    registry: &TestRegistry,
    problem_id: &str,
    solution_file: &Path,
    limits: ExecutionLimits,
    json: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let problem = match registry.require(problem_id) {
        Ok(problem) => problem,
        Err(error) => {
            println!("{error}");
            return Ok(false);
        }
    };
    let source_text = tokio::fs::read_to_string(solution_file).await?;
    let request = problem.request(source_text, limits);

    if json {
        let outcome = engine.run(request).await;
        let passed = outcome.is_full_pass();
        print_response(outcome)?;
        return Ok(passed);
    }

    let outcome = stream_progress(engine, request).await;
    match &outcome {
        RunOutcome::Completed(set) => println!("{}", set.summary),
        RunOutcome::Failed(failure) => println!("[ERROR] {}: {}", failure.kind, failure.message),
    }
    Ok(outcome.is_full_pass())
}

/// Prints every case as soon as it finishes, then returns the outcome.
async fn stream_progress(engine: &Engine, request: RunRequest) -> RunOutcome {
    let mut snapshots = engine.submit(request);
    let mut printed = 0;
    while let Some(run) = snapshots.next().await {
        if let RunState::Running { cases } = &run.state {
            for (idx, case) in cases.iter().enumerate().skip(printed) {
                let CaseState::Finished(result) = case else {
                    break;
                };
                println!("{}", case_line(idx, result));
                for line in &result.console {
                    println!("    {line}");
                }
                printed = idx + 1;
            }
        }
        if let Some(outcome) = run.outcome() {
            return outcome;
        }
    }
    engine.run_ended_without_result()
}

pub fn case_line(idx: usize, result: &ExecutionResult) -> String {
    let test = idx + 1;
    match &result.error {
        Some(error) => format!(
            "[ERROR] Test {test}: input={} -> {}: {} ({} ms)",
            result.input_display, error.kind, error.message, result.elapsed_ms
        ),
        None if result.passed => format!(
            "[PASS] Test {test}: input={} -> output={} ({} ms)",
            result.input_display, result.actual_display, result.elapsed_ms
        ),
        None => format!(
            "[FAIL] Test {test}: input={} -> expected={}, got={} ({} ms)",
            result.input_display, result.expected_display, result.actual_display, result.elapsed_ms
        ),
    }
}

/// Runs a raw protocol request file and prints the response as JSON.
pub async fn check_request(engine: &Engine, request_file: &Path) -> Result<bool, Box<dyn std::error::Error>> {
    let request = load_request(request_file).await?;
    let outcome = engine.run(request).await;
    let passed = outcome.is_full_pass();
    print_response(outcome)?;
    Ok(passed)
}

pub async fn load_request(path: &Path) -> Result<RunRequest, Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(path).await?;
    let message: RunRequestMessage = serde_json::from_str(&raw)?;
    Ok(message.try_into()?)
}

fn print_response(outcome: RunOutcome) -> Result<(), serde_json::Error> {
    let response: RunResponseMessage = outcome.into();
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
