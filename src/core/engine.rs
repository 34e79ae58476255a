//! Message-passing facade over the pipeline stages.
//!
//! Every submission gets its own compiling and running stages connected by
//! channels. Callers observe the run only through snapshots, and every
//! failure ends as a structured [`RunOutcome`].

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc::channel;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    constants::{COMPILE_TX_ERR, STREAM_TX_ERR},
    core::{
        domain::{
            ErrorKind, ExecutionLimits, Run, RunFailure, RunOutcome, RunRequest, RunState,
            is_identifier,
        },
        pipeline::{compiling::handle_compiling, running::handle_running},
        registry::TestRegistry,
        traits::executor::Executor,
    },
};

#[derive(Clone, Debug)]
pub struct Engine {
    executor: Arc<dyn Executor>,
}

impl Engine {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Starts a run and streams its snapshots, ending with a terminal one.
    #[tracing::instrument(skip_all, fields(entry_point = %request.entry_point))]
    pub fn submit(&self, request: RunRequest) -> ReceiverStream<Run> {
        let (stream_tx, stream_rx) = channel::<Run>(128);
        let run = Run::new(request);
        tracing::info!("Received run {}", run.id);

        if let Some(failure) = validate(&run.request) {
            let run = run.change_state(RunState::Rejected(failure));
            tokio::spawn(async move {
                if stream_tx.send(run).await.is_err() {
                    tracing::debug!("{}", STREAM_TX_ERR);
                }
            });
            return ReceiverStream::new(stream_rx);
        }

        let (state_tx, mut state_rx) = channel::<Run>(128);
        let (run_tx, run_rx) = channel::<Run>(128);
        let (compile_tx, compile_rx) = channel::<Run>(128);

        handle_compiling(state_tx.clone(), run_tx, compile_rx, self.executor.clone());
        handle_running(state_tx, run_rx, self.executor.clone());

        tokio::spawn(async move {
            if stream_tx.send(run.clone()).await.is_err() {
                tracing::debug!("{}", STREAM_TX_ERR);
                return;
            }
            if compile_tx.send(run).await.is_err() {
                tracing::error!("{}", COMPILE_TX_ERR);
                return;
            }
            drop(compile_tx);

            while let Some(run) = state_rx.recv().await {
                tracing::debug!("Send new state of run {}: {:?}", run.id, run.state);
                let terminal = run.is_terminal();
                if stream_tx.send(run).await.is_err() {
                    tracing::debug!("{}", STREAM_TX_ERR);
                    break;
                }
                if terminal {
                    break;
                }
            }
        });

        ReceiverStream::new(stream_rx)
    }

    /// Runs `request` to completion.
    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        let mut snapshots = self.submit(request);
        while let Some(run) = snapshots.next().await {
            if let Some(outcome) = run.outcome() {
                return outcome;
            }
        }
        self.run_ended_without_result()
    }

    /// Outcome for a snapshot stream that closed before a terminal state.
    pub fn run_ended_without_result(&self) -> RunOutcome {
        tracing::error!("Run ended without a terminal state");
        RunOutcome::Failed(RunFailure {
            kind: ErrorKind::RuntimeError,
            message: "Internal error: the run ended without a result".to_string(),
        })
    }

    /// Grades `source_text` against the registered tests of `problem_id`.
    /// An unknown problem never reaches the executor.
    pub async fn grade(
        &self,
        registry: &TestRegistry,
        problem_id: &str,
        source_text: String,
        limits: ExecutionLimits,
    ) -> RunOutcome {
        match registry.require(problem_id) {
            Ok(problem) => self.run(problem.request(source_text, limits)).await,
            Err(error) => RunOutcome::Failed(RunFailure {
                kind: ErrorKind::NoTestsRegistered,
                message: error.to_string(),
            }),
        }
    }
}

fn validate(request: &RunRequest) -> Option<RunFailure> {
    if request.cases.is_empty() {
        return Some(RunFailure {
            kind: ErrorKind::NoTestsRegistered,
            message: "No tests available".to_string(),
        });
    }
    if !is_identifier(&request.entry_point) {
        return Some(RunFailure {
            kind: ErrorKind::EntryPointMissing,
            message: format!(
                "Function {} was not found. Please define it exactly.",
                request.entry_point
            ),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        domain::{Artifact, TestCase},
        traits::executor::{CompileError, MockExecutor, RunError, RunResult},
        value::Value,
    };
    use uuid::Uuid;

    fn request(cases: Vec<TestCase>) -> RunRequest {
        RunRequest {
            source_text: "function square(n) { return n * n; }".to_string(),
            entry_point: "square".to_string(),
            cases,
            limits: ExecutionLimits::default(),
            forbidden_calls: vec![".sort(".to_string()],
        }
    }

    fn square_case(n: f64) -> TestCase {
        TestCase {
            input: vec![Value::Number(n)],
            expected: Value::Number(n * n),
        }
    }

    fn squaring_executor() -> MockExecutor {
        let mut executor = MockExecutor::new();
        executor.expect_compile().returning(|_, entry_point, _| {
            Ok(Artifact {
                id: Uuid::new_v4(),
                entry_point: entry_point.to_string(),
            })
        });
        executor.expect_run().returning(|_, args, _| match &args[0] {
            Value::Number(n) => Ok(RunResult {
                value: Value::Number(n * n),
                console: vec![],
            }),
            _ => Err(RunError::Thrown {
                msg: "not a number".to_string(),
                console: vec![],
            }),
        });
        executor.expect_release().return_const(());
        executor
    }

    #[tokio::test]
    async fn test_run_full_pass() {
        let engine = Engine::new(Arc::new(squaring_executor()));
        let outcome = engine.run(request(vec![square_case(2.0), square_case(3.0)])).await;

        let RunOutcome::Completed(set) = &outcome else {
            panic!("Expected completed run, got {outcome:?}");
        };
        assert_eq!(set.results.len(), 2);
        assert!(outcome.is_full_pass());
    }

    #[tokio::test]
    async fn test_submit_streams_until_terminal() {
        let engine = Engine::new(Arc::new(squaring_executor()));
        let snapshots: Vec<Run> = engine.submit(request(vec![square_case(4.0)])).collect().await;

        assert!(matches!(snapshots[0].state, RunState::Pending));
        assert!(matches!(snapshots[1].state, RunState::Compiling));
        assert!(matches!(snapshots.last().unwrap().state, RunState::Done(_)));
        assert!(snapshots.iter().all(|run| run.id == snapshots[0].id));
        assert_eq!(snapshots.iter().filter(|run| run.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_forbidden_api_fails_whole_run() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().never();
        executor.expect_run().never();
        let engine = Engine::new(Arc::new(executor));

        let mut request = request(vec![square_case(1.0)]);
        request.source_text = "function square(n) { return [n].sort()[0] ** 2; }".to_string();

        let RunOutcome::Failed(failure) = engine.run(request).await else {
            panic!("Expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::ForbiddenApi);
        assert_eq!(
            failure.message,
            "Forbidden function used (.sort()). You must implement manually."
        );
    }

    #[tokio::test]
    async fn test_compile_failures_are_outcomes() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().return_const(Err(CompileError::EntryPointMissing {
            name: "square".to_string(),
        }));
        executor.expect_run().never();
        let engine = Engine::new(Arc::new(executor));

        let RunOutcome::Failed(failure) = engine.run(request(vec![square_case(1.0)])).await else {
            panic!("Expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::EntryPointMissing);
        assert_eq!(failure.message, "Function square was not found. Please define it exactly.");
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().never();
        let engine = Engine::new(Arc::new(executor));

        let RunOutcome::Failed(empty) = engine.run(request(vec![])).await else {
            panic!("Expected failure");
        };
        assert_eq!(empty.kind, ErrorKind::NoTestsRegistered);

        let mut bad_entry = request(vec![square_case(1.0)]);
        bad_entry.entry_point = "not valid".to_string();
        let RunOutcome::Failed(failure) = engine.run(bad_entry).await else {
            panic!("Expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::EntryPointMissing);
    }

    #[tokio::test]
    async fn test_grade_unknown_problem_skips_executor() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().never();
        let engine = Engine::new(Arc::new(executor));
        let registry = TestRegistry::builtin().unwrap();

        let outcome = engine
            .grade(&registry, "no-such-problem", String::new(), ExecutionLimits::default())
            .await;

        let RunOutcome::Failed(failure) = outcome else {
            panic!("Expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::NoTestsRegistered);
        assert!(failure.message.contains("no-such-problem"));
    }
}
