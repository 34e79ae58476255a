use std::sync::Arc;

use tokio::sync::mpsc::{Receiver, Sender};

use super::publish;
use crate::{
    constants::{RUN_TX_ERR, STATE_TX_ERR},
    core::{
        domain::{ErrorKind, Run, RunFailure, RunState},
        policy::find_forbidden,
        traits::executor::{CompileError, Executor},
    },
};

#[tracing::instrument]
pub fn handle_compiling(
    state_tx: Sender<Run>,
    run_tx: Sender<Run>,
    mut compile_rx: Receiver<Run>,
    executor: Arc<dyn Executor>,
) {
    tokio::spawn(async move {
        while let Some(run) = compile_rx.recv().await {
            let executor = executor.clone();
            let state_tx = state_tx.clone();
            let run_tx = run_tx.clone();

            tokio::spawn(async move {
                handle_run(run, state_tx, run_tx, executor).await;
            });
        }
    });
}

async fn handle_run(run: Run, state_tx: Sender<Run>, run_tx: Sender<Run>, executor: Arc<dyn Executor>) {
    let run = run.change_state(RunState::Compiling);
    if !publish(&state_tx, run.clone(), STATE_TX_ERR).await {
        return;
    }

    let constructs = find_forbidden(&run.request.source_text, &run.request.forbidden_calls);
    if !constructs.is_empty() {
        tracing::debug!("Forbidden constructs found: {:?}", constructs);
        publish(&state_tx, run.change_state(RunState::ForbiddenApi { constructs }), STATE_TX_ERR).await;
        return;
    }

    tracing::debug!("Start compiling");
    let compilation_result = executor
        .compile(&run.request.source_text, &run.request.entry_point, &run.request.limits)
        .await;
    tracing::debug!("Compilation result: {:?}", compilation_result);

    let next = match compilation_result {
        Ok(artifact) => {
            let run = run.change_state(RunState::Compiled(artifact));
            if publish(&state_tx, run.clone(), STATE_TX_ERR).await {
                publish(&run_tx, run, RUN_TX_ERR).await;
            }
            return;
        }
        Err(CompileError::CompilationFailed { msg }) => RunState::CompilationFailed { msg },
        Err(CompileError::EntryPointMissing { name }) => RunState::EntryPointMissing { name },
        Err(CompileError::Internal { msg }) => {
            tracing::error!("Internal error during compilation: {}", msg);
            RunState::Rejected(RunFailure {
                kind: ErrorKind::CompilationError,
                message: format!("Internal error: {msg}"),
            })
        }
    };
    publish(&state_tx, run.change_state(next), STATE_TX_ERR).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        domain::{Artifact, ExecutionLimits, RunRequest, TestCase},
        traits::executor::MockExecutor,
        value::Value,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn create_test_run(source: &str, forbidden: &[&str]) -> Run {
        Run::new(RunRequest {
            source_text: source.to_string(),
            entry_point: "bubbleSort".to_string(),
            cases: vec![TestCase {
                input: vec![Value::Array(vec![Value::Number(2.0), Value::Number(1.0)])],
                expected: Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]),
            }],
            limits: ExecutionLimits::default(),
            forbidden_calls: forbidden.iter().map(|c| c.to_string()).collect(),
        })
    }

    fn artifact() -> Artifact {
        Artifact {
            id: Uuid::new_v4(),
            entry_point: "bubbleSort".to_string(),
        }
    }

    /// Feeds `run` through the stage and collects the published states.
    async fn compile(executor: MockExecutor, run: Run) -> (Vec<Run>, mpsc::Receiver<Run>) {
        let (state_tx, mut state_rx) = mpsc::channel(10);
        let (run_tx, run_rx) = mpsc::channel(10);
        let (compile_tx, compile_rx) = mpsc::channel(10);

        handle_compiling(state_tx, run_tx, compile_rx, Arc::new(executor));
        compile_tx.send(run).await.unwrap();

        let mut states = vec![state_rx.recv().await.unwrap()];
        states.push(state_rx.recv().await.unwrap());
        (states, run_rx)
    }

    #[tokio::test]
    async fn test_successful_compilation() {
        let artifact = artifact();
        let mut executor = MockExecutor::new();
        executor.expect_compile().return_const(Ok(artifact.clone()));

        let run = create_test_run("function bubbleSort(a) { return a; }", &[]);
        let (states, mut run_rx) = compile(executor, run.clone()).await;

        assert!(matches!(states[0].state, RunState::Compiling));
        assert!(matches!(&states[1].state, RunState::Compiled(a) if *a == artifact));
        assert!(states.iter().all(|s| s.id == run.id));

        let forwarded = run_rx.recv().await.unwrap();
        assert_eq!(forwarded.id, run.id);
        assert!(matches!(forwarded.state, RunState::Compiled(_)));
    }

    #[tokio::test]
    async fn test_forbidden_api_short_circuits_before_compiling() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().never();

        let run = create_test_run("function bubbleSort(a) { return a.sort(); }", &[".sort("]);
        let (states, mut run_rx) = compile(executor, run).await;

        let RunState::ForbiddenApi { constructs } = &states[1].state else {
            panic!("Expected ForbiddenApi, got {:?}", states[1].state);
        };
        assert_eq!(constructs, &vec![".sort(".to_string()]);
        tokio::time::timeout(Duration::from_millis(100), run_rx.recv())
            .await
            .expect_err("Should not forward a forbidden run");
    }

    #[tokio::test]
    async fn test_compilation_failed() {
        let mut executor = MockExecutor::new();
        executor
            .expect_compile()
            .return_const(Err(CompileError::CompilationFailed {
                msg: "Unexpected token '{' (1:20)".to_string(),
            }));

        let (states, mut run_rx) = compile(executor, create_test_run("function bubbleSort( {", &[])).await;

        assert!(matches!(
            &states[1].state,
            RunState::CompilationFailed { msg } if msg == "Unexpected token '{' (1:20)"
        ));
        tokio::time::timeout(Duration::from_millis(100), run_rx.recv())
            .await
            .expect_err("Should not forward a run that failed to compile");
    }

    #[tokio::test]
    async fn test_entry_point_missing() {
        let mut executor = MockExecutor::new();
        executor
            .expect_compile()
            .return_const(Err(CompileError::EntryPointMissing {
                name: "bubbleSort".to_string(),
            }));

        let (states, _run_rx) = compile(executor, create_test_run("function sort(a) {}", &[])).await;

        assert!(matches!(
            &states[1].state,
            RunState::EntryPointMissing { name } if name == "bubbleSort"
        ));
        assert!(states[1].is_terminal());
    }

    #[tokio::test]
    async fn test_internal_error_rejects_run() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().return_const(Err(CompileError::Internal {
            msg: "worker thread could not be spawned".to_string(),
        }));

        let (states, _run_rx) = compile(executor, create_test_run("function bubbleSort() {}", &[])).await;

        let RunState::Rejected(failure) = &states[1].state else {
            panic!("Expected Rejected, got {:?}", states[1].state);
        };
        assert_eq!(failure.kind, ErrorKind::CompilationError);
        assert!(failure.message.contains("worker thread could not be spawned"));
    }

    #[tokio::test]
    async fn test_multiple_runs() {
        let mut executor = MockExecutor::new();
        executor.expect_compile().times(2).return_const(Ok(artifact()));

        let (state_tx, mut state_rx) = mpsc::channel(10);
        let (run_tx, mut run_rx) = mpsc::channel(10);
        let (compile_tx, compile_rx) = mpsc::channel(10);
        handle_compiling(state_tx, run_tx, compile_rx, Arc::new(executor));

        let first = create_test_run("function bubbleSort(a) { return a; }", &[]);
        let second = create_test_run("function bubbleSort(a) { return a; }", &[]);
        compile_tx.send(first.clone()).await.unwrap();
        compile_tx.send(second.clone()).await.unwrap();

        let mut published = Vec::new();
        for _ in 0..4 {
            published.push(state_rx.recv().await.unwrap().id);
        }
        let forwarded = [run_rx.recv().await.unwrap().id, run_rx.recv().await.unwrap().id];

        for id in [first.id, second.id] {
            assert_eq!(published.iter().filter(|p| **p == id).count(), 2);
            assert!(forwarded.contains(&id));
        }
    }
}
