use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::core::domain::{ErrorKind, ExecutionLimits, RunOutcome, RunRequest, TestCase};
use crate::core::engine::Engine;
use crate::core::registry::TestRegistry;
use crate::core::value::Value;
use crate::sandbox::{SandboxConfig, SandboxExecutor};

const BUBBLE_SORT: &str = r#"
function bubbleSort(arr) {
    const a = [...arr];
    for (let i = 0; i < a.length; i++) {
        for (let j = 0; j < a.length - i - 1; j++) {
            if (a[j] > a[j + 1]) {
                const tmp = a[j];
                a[j] = a[j + 1];
                a[j + 1] = tmp;
            }
        }
    }
    return a;
}
"#;

const COUNT_INVERSIONS: &str = r#"
function countInversions(arr) {
    function sortCount(a) {
        if (a.length < 2) return { sorted: a, count: 0 };
        const mid = Math.floor(a.length / 2);
        const left = sortCount(a.slice(0, mid));
        const right = sortCount(a.slice(mid));
        const merged = [];
        let count = left.count + right.count;
        let i = 0, j = 0;
        while (i < left.sorted.length && j < right.sorted.length) {
            if (left.sorted[i] <= right.sorted[j]) {
                merged.push(left.sorted[i++]);
            } else {
                merged.push(right.sorted[j++]);
                count += left.sorted.length - i;
            }
        }
        return { sorted: merged.concat(left.sorted.slice(i), right.sorted.slice(j)), count };
    }
    return sortCount(arr).count;
}
"#;

fn engine() -> Engine {
    let config = SandboxConfig {
        cancel_grace: Duration::from_millis(250),
        ..SandboxConfig::default()
    };
    Engine::new(Arc::new(SandboxExecutor::new(config)))
}

fn case(input: serde_json::Value, expected: serde_json::Value) -> TestCase {
    let serde_json::Value::Array(input) = input else {
        panic!("Case input must be an array");
    };
    TestCase {
        input: input.into_iter().map(Value::from).collect(),
        expected: expected.into(),
    }
}

fn request(source: &str, entry_point: &str, cases: Vec<TestCase>) -> RunRequest {
    RunRequest {
        source_text: source.to_string(),
        entry_point: entry_point.to_string(),
        cases,
        limits: ExecutionLimits { time_ms: 1000 },
        forbidden_calls: vec![],
    }
}

fn completed(outcome: RunOutcome) -> crate::core::domain::ResultSet {
    match outcome {
        RunOutcome::Completed(set) => set,
        RunOutcome::Failed(failure) => panic!("Expected completed run, got {failure:?}"),
    }
}

fn failed(outcome: RunOutcome) -> crate::core::domain::RunFailure {
    match outcome {
        RunOutcome::Failed(failure) => failure,
        RunOutcome::Completed(set) => panic!("Expected failed run, got {set:?}"),
    }
}

#[tokio::test]
async fn test_bubble_sort_scenario() {
    let engine = engine();
    let cases = vec![case(
        json!([[64, 34, 25, 12, 22, 11, 90]]),
        json!([11, 12, 22, 25, 34, 64, 90]),
    )];

    let set = completed(engine.run(request(BUBBLE_SORT, "bubbleSort", cases.clone())).await);
    assert!(set.results[0].passed);
    assert_eq!(set.results[0].actual_display, "[11,12,22,25,34,64,90]");

    let unchanged = "function bubbleSort(arr) { return arr; }";
    let set = completed(engine.run(request(unchanged, "bubbleSort", cases)).await);
    assert!(!set.results[0].passed);
    assert_eq!(set.results[0].actual_display, "[64,34,25,12,22,11,90]");
    assert!(set.results[0].error.is_none());
}

#[tokio::test]
async fn test_registered_problems_grade_end_to_end() {
    let engine = engine();
    let registry = TestRegistry::builtin().unwrap();
    let limits = ExecutionLimits { time_ms: 1000 };

    let outcome = engine
        .grade(&registry, "count-inversions", COUNT_INVERSIONS.to_string(), limits)
        .await;
    let set = completed(outcome);
    assert_eq!(set.results[0].actual_display, "5");
    assert!(set.summary.is_full_pass());

    let outcome = engine
        .grade(&registry, "bubble-sort-implementation", BUBBLE_SORT.to_string(), limits)
        .await;
    assert!(outcome.is_full_pass());
}

#[tokio::test]
async fn test_forbidden_sort_short_circuits() {
    let engine = engine();
    let registry = TestRegistry::builtin().unwrap();
    let source = "function bubbleSort(arr) { return [...arr].sort((a, b) => a - b); }";

    let failure = failed(
        engine
            .grade(
                &registry,
                "bubble-sort-implementation",
                source.to_string(),
                ExecutionLimits::default(),
            )
            .await,
    );
    assert_eq!(failure.kind, ErrorKind::ForbiddenApi);
    assert_eq!(
        failure.message,
        "Forbidden function used (.sort()). You must implement manually."
    );
}

#[tokio::test]
async fn test_run_terminal_failures() {
    let engine = engine();
    let cases = vec![case(json!([1]), json!(1))];

    let syntax = failed(engine.run(request("function f( {", "f", cases.clone())).await);
    assert_eq!(syntax.kind, ErrorKind::CompilationError);
    assert!(syntax.message.starts_with("Compilation error: "));

    let missing = failed(engine.run(request("function g(x) { return x; }", "f", cases.clone())).await);
    assert_eq!(missing.kind, ErrorKind::EntryPointMissing);
    assert_eq!(missing.message, "Function f was not found. Please define it exactly.");

    let not_callable = failed(engine.run(request("const f = 42;", "f", cases)).await);
    assert_eq!(not_callable.kind, ErrorKind::EntryPointMissing);
}

#[tokio::test]
async fn test_case_local_errors_keep_order() {
    let engine = engine();
    let source = r#"
        function f(mode) {
            if (mode === "throw") throw new Error("bad input");
            if (mode === "spin") { while (true) {} }
            if (mode === "log") { console.log("seen", [1, 2]); }
            return mode;
        }
    "#;
    let mut run = request(
        source,
        "f",
        vec![
            case(json!(["throw"]), json!(null)),
            case(json!(["spin"]), json!(null)),
            case(json!(["log"]), json!("log")),
            case(json!([7]), json!(7)),
        ],
    );
    run.limits = ExecutionLimits { time_ms: 200 };

    let set = completed(engine.run(run).await);
    assert_eq!(set.results.len(), 4);

    let thrown = set.results[0].error.as_ref().unwrap();
    assert_eq!(thrown.kind, ErrorKind::RuntimeError);
    assert_eq!(thrown.message, "bad input");
    assert_eq!(set.results[0].actual_display, "Error");

    let timeout = set.results[1].error.as_ref().unwrap();
    assert_eq!(timeout.kind, ErrorKind::Timeout);
    assert_eq!(timeout.message, "Timeout after 200 ms");

    assert!(set.results[2].passed);
    assert_eq!(set.results[2].console, vec!["seen [ 1, 2 ]"]);
    assert!(set.results[3].passed);
    assert_eq!(set.summary.to_string(), "2/4 tests passed");
}

#[tokio::test]
async fn test_oversized_strings_fail_only_their_case() {
    let engine = engine();
    let source = r#"
        function f(mode) {
            if (mode === "pad") return "x".padStart(1e11).length;
            if (mode === "padEnd") return "x".padEnd(Infinity);
            if (mode === "double") {
                let s = "x";
                for (let i = 0; i < 40; i++) s += s;
                return s.length;
            }
            if (mode === "charAt") return "abc".charAt(1e300);
            return mode;
        }
    "#;
    let mut run = request(
        source,
        "f",
        vec![
            case(json!(["pad"]), json!(null)),
            case(json!(["padEnd"]), json!(null)),
            case(json!(["double"]), json!(null)),
            case(json!(["charAt"]), json!("")),
            case(json!([7]), json!(7)),
        ],
    );
    run.limits = ExecutionLimits { time_ms: 10_000 };

    let set = completed(engine.run(run).await);
    for result in &set.results[..3] {
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::RuntimeError);
        assert_eq!(error.message, "Invalid string length");
    }
    assert!(set.results[3].passed);
    assert!(set.results[4].passed);
}

#[tokio::test]
async fn test_async_entry_point_is_awaited() {
    let engine = engine();
    let source = r#"
        async function delayed(x) {
            await new Promise((resolve) => setTimeout(resolve, 5));
            return x * 2;
        }
    "#;
    let set = completed(
        engine
            .run(request(source, "delayed", vec![case(json!([21]), json!(42))]))
            .await,
    );
    assert!(set.results[0].passed);
}

#[tokio::test]
async fn test_runs_are_idempotent() {
    let engine = engine();
    let source = r#"
        let calls = 0;
        function counter(x) {
            calls += 1;
            return x + calls;
        }
    "#;
    let cases = vec![case(json!([10]), json!(11)), case(json!([10]), json!(11))];

    let first = completed(engine.run(request(source, "counter", cases.clone())).await);
    let second = completed(engine.run(request(source, "counter", cases)).await);

    let shape = |set: &crate::core::domain::ResultSet| {
        set.results
            .iter()
            .map(|r| (r.passed, r.actual_display.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(shape(&first), shape(&second));
    assert_eq!(first.results[0].actual_display, "11");
    assert_eq!(first.results[1].actual_display, "12");
}

#[tokio::test]
async fn test_unknown_problem_has_no_tests() {
    let engine = engine();
    let registry = TestRegistry::builtin().unwrap();

    let failure = failed(
        engine
            .grade(&registry, "missing", String::new(), ExecutionLimits::default())
            .await,
    );
    assert_eq!(failure.kind, ErrorKind::NoTestsRegistered);
}
