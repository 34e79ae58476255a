use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{Receiver, Sender};

use super::publish;
use crate::{
    constants::STATE_TX_ERR,
    core::{
        domain::{CaseError, CaseState, ErrorKind, ExecutionResult, ResultSet, Run, RunState, TestCase},
        traits::executor::{Executor, RunError, RunResult},
        value::Value,
    },
};

#[tracing::instrument]
pub fn handle_running(
    state_tx: Sender<Run>,
    mut run_rx: Receiver<Run>,
    executor: Arc<dyn Executor>,
) {
    tokio::spawn(async move {
        while let Some(run) = run_rx.recv().await {
            let state_tx = state_tx.clone();
            let executor = executor.clone();

            tokio::spawn(async move {
                process_run(run, &state_tx, &executor).await;
            });
        }
    });
}

/// Runs every case of a compiled run, one at a time and in order.
async fn process_run(run: Run, state_tx: &Sender<Run>, executor: &Arc<dyn Executor>) {
    tracing::debug!("Running run: {}", run.id);

    let RunState::Compiled(artifact) = run.state.clone() else {
        tracing::error!("Run {} is not compiled", run.id);
        return;
    };

    let mut cases = vec![CaseState::Pending; run.request.cases.len()];
    let mut receiver_alive = publish(
        state_tx,
        run.change_state(RunState::Running { cases: cases.clone() }),
        STATE_TX_ERR,
    )
    .await;

    for (idx, case) in run.request.cases.iter().enumerate() {
        if !receiver_alive {
            break;
        }
        cases[idx] = CaseState::Running;
        publish(
            state_tx,
            run.change_state(RunState::Running { cases: cases.clone() }),
            STATE_TX_ERR,
        )
        .await;

        tracing::debug!("Running case {} of run {}", idx, run.id);
        let started = Instant::now();
        let outcome = executor.run(&artifact, &case.input, &run.request.limits).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        cases[idx] = CaseState::Finished(grade(case, outcome, elapsed_ms));
        receiver_alive = publish(
            state_tx,
            run.change_state(RunState::Running { cases: cases.clone() }),
            STATE_TX_ERR,
        )
        .await;
    }

    executor.release(&artifact).await;

    let results = cases
        .into_iter()
        .filter_map(|case| match case {
            CaseState::Finished(result) => Some(result),
            CaseState::Pending | CaseState::Running => None,
        })
        .collect();
    let run = run.change_state(RunState::Done(ResultSet::new(results)));
    tracing::info!("Run {} completed", run.id);
    publish(state_tx, run, STATE_TX_ERR).await;
}

/// Turns one invocation outcome into the reported result for `case`.
pub fn grade(case: &TestCase, outcome: Result<RunResult, RunError>, elapsed_ms: u64) -> ExecutionResult {
    let input_display = Value::Array(case.input.clone()).display();
    let expected_display = case.expected.display();

    let failed = |kind: ErrorKind, message: String, console: Vec<String>| ExecutionResult {
        passed: false,
        input_display: input_display.clone(),
        expected_display: expected_display.clone(),
        actual_display: "Error".to_string(),
        error: Some(CaseError { kind, message }),
        elapsed_ms,
        console,
    };

    match outcome {
        Ok(RunResult { value, console }) => ExecutionResult {
            passed: value == case.expected,
            input_display: input_display.clone(),
            expected_display: expected_display.clone(),
            actual_display: value.display(),
            error: None,
            elapsed_ms,
            console,
        },
        Err(err @ RunError::Timeout { .. }) => failed(ErrorKind::Timeout, err.to_string(), Vec::new()),
        Err(RunError::Thrown { msg, console }) => failed(ErrorKind::RuntimeError, msg, console),
        Err(RunError::Internal { msg }) => {
            tracing::error!("Internal error while running case: {}", msg);
            failed(
                ErrorKind::RuntimeError,
                format!("Internal error: {msg}"),
                Vec::new(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        domain::{Artifact, ExecutionLimits, RunRequest},
        traits::executor::MockExecutor,
    };
    use serde_json::json;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn case(input: serde_json::Value, expected: serde_json::Value) -> TestCase {
        let serde_json::Value::Array(input) = input else {
            panic!("Case input must be an array");
        };
        TestCase {
            input: input.into_iter().map(Value::from).collect(),
            expected: expected.into(),
        }
    }

    fn create_compiled_run(cases: Vec<TestCase>) -> Run {
        let artifact = Artifact {
            id: Uuid::new_v4(),
            entry_point: "f".to_string(),
        };
        Run::new(RunRequest {
            source_text: "function f(x) { return x; }".to_string(),
            entry_point: "f".to_string(),
            cases,
            limits: ExecutionLimits { time_ms: 100 },
            forbidden_calls: vec![],
        })
        .change_state(RunState::Compiled(artifact))
    }

    /// Echo executor: returns the first argument, with a few magic inputs.
    fn echo_executor() -> MockExecutor {
        let mut executor = MockExecutor::new();
        executor.expect_run().returning(|_, args, limits| match args.first() {
            Some(Value::String(s)) if s == "hang" => Err(RunError::Timeout {
                limit_ms: limits.time_ms,
            }),
            Some(Value::String(s)) if s == "throw" => Err(RunError::Thrown {
                msg: "boom".to_string(),
                console: vec!["about to throw".to_string()],
            }),
            Some(value) => Ok(RunResult {
                value: value.clone(),
                console: vec![],
            }),
            None => Err(RunError::Internal {
                msg: "no args".to_string(),
            }),
        });
        executor.expect_release().times(1).return_const(());
        executor
    }

    async fn run_to_completion(executor: MockExecutor, run: Run) -> Vec<Run> {
        let (state_tx, mut state_rx) = mpsc::channel(100);
        let (run_tx, run_rx) = mpsc::channel(10);
        handle_running(state_tx, run_rx, Arc::new(executor));
        run_tx.send(run).await.unwrap();

        let mut states = Vec::new();
        while let Some(run) = state_rx.recv().await {
            let done = matches!(run.state, RunState::Done(_));
            states.push(run);
            if done {
                break;
            }
        }
        states
    }

    fn result_set(states: &[Run]) -> &ResultSet {
        match &states.last().unwrap().state {
            RunState::Done(set) => set,
            other => panic!("Expected Done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_results_preserve_case_order() {
        let run = create_compiled_run(vec![
            case(json!([1]), json!(1)),
            case(json!([2]), json!(3)),
            case(json!([[1, 2]]), json!([1, 2])),
        ]);
        let states = run_to_completion(echo_executor(), run).await;
        let set = result_set(&states);

        let passed: Vec<bool> = set.results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, vec![true, false, true]);
        assert_eq!(set.results[1].actual_display, "2");
        assert_eq!(set.results[1].expected_display, "3");
        assert_eq!(set.results[2].input_display, "[[1,2]]");
        assert_eq!(set.summary.to_string(), "2/3 tests passed");
    }

    #[tokio::test]
    async fn test_timeout_is_case_local() {
        let run = create_compiled_run(vec![case(json!(["hang"]), json!(0)), case(json!([5]), json!(5))]);
        let states = run_to_completion(echo_executor(), run).await;
        let set = result_set(&states);

        let timeout = &set.results[0];
        assert!(!timeout.passed);
        assert_eq!(timeout.actual_display, "Error");
        assert_eq!(
            timeout.error,
            Some(CaseError {
                kind: ErrorKind::Timeout,
                message: "Timeout after 100 ms".to_string(),
            })
        );
        assert!(set.results[1].passed);
    }

    #[tokio::test]
    async fn test_thrown_error_becomes_runtime_error() {
        let run = create_compiled_run(vec![case(json!(["throw"]), json!(null))]);
        let states = run_to_completion(echo_executor(), run).await;
        let result = &result_set(&states).results[0];

        assert_eq!(
            result.error,
            Some(CaseError {
                kind: ErrorKind::RuntimeError,
                message: "boom".to_string(),
            })
        );
        assert_eq!(result.console, vec!["about to throw"]);
    }

    #[tokio::test]
    async fn test_internal_error_is_reported_on_the_case() {
        let run = create_compiled_run(vec![case(json!([]), json!(null))]);
        let states = run_to_completion(echo_executor(), run).await;
        let result = &result_set(&states).results[0];

        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(ErrorKind::RuntimeError));
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_progress_snapshots() {
        let run = create_compiled_run(vec![case(json!([1]), json!(1)), case(json!([2]), json!(2))]);
        let states = run_to_completion(echo_executor(), run).await;

        // Initial snapshot, then Running + Finished per case, then Done.
        assert_eq!(states.len(), 1 + 2 * 2 + 1);
        let RunState::Running { cases } = &states[0].state else {
            panic!("Expected Running");
        };
        assert!(cases.iter().all(|c| matches!(c, CaseState::Pending)));
        let RunState::Running { cases } = &states[3].state else {
            panic!("Expected Running");
        };
        assert!(matches!(cases[0], CaseState::Finished(_)));
        assert!(matches!(cases[1], CaseState::Running));
    }

    #[tokio::test]
    async fn test_cases_run_sequentially() {
        let in_flight = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let overlap = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut executor = MockExecutor::new();
        {
            let in_flight = in_flight.clone();
            let overlap = overlap.clone();
            executor.expect_run().returning(move |_, args, _| {
                use std::sync::atomic::Ordering;
                if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(RunResult {
                    value: args[0].clone(),
                    console: vec![],
                })
            });
        }
        executor.expect_release().return_const(());

        let cases = (0..5).map(|i| case(json!([i]), json!(i))).collect();
        let states = run_to_completion(executor, create_compiled_run(cases)).await;

        assert_eq!(result_set(&states).summary.passed, 5);
        assert!(!overlap.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_uncompiled_run_is_ignored() {
        let mut executor = MockExecutor::new();
        executor.expect_run().never();
        executor.expect_release().never();

        let (state_tx, mut state_rx) = mpsc::channel(10);
        let (run_tx, run_rx) = mpsc::channel(10);
        handle_running(state_tx, run_rx, Arc::new(executor));

        let run = create_compiled_run(vec![]).change_state(RunState::Compiling);
        run_tx.send(run).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_millis(100), state_rx.recv())
            .await
            .expect_err("Should not publish anything for an uncompiled run");
    }

    #[test]
    fn test_grade_compares_structurally() {
        let case = case(json!([{ "b": 2, "a": 1 }]), json!({ "a": 1, "b": 2 }));
        let outcome = Ok(RunResult {
            value: case.input[0].clone(),
            console: vec![],
        });
        let result = grade(&case, outcome, 3);
        assert!(result.passed);
        assert_eq!(result.elapsed_ms, 3);
        assert_eq!(result.actual_display, r#"{"b":2,"a":1}"#);
    }
}
