use std::fmt;
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{constants::DEFAULT_TIMEOUT_MS, core::value::Value};

#[derive(Clone, Debug)]
pub struct TestCase {
    pub input: Vec<Value>,
    pub expected: Value,
}

/// Whether `name` can be bound as a function name by a candidate.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Budget for a single invocation, also applied to evaluating the program.
    pub time_ms: u64,
}

impl ExecutionLimits {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.time_ms)
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            time_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunRequest {
    pub source_text: String,
    pub entry_point: String,
    pub cases: Vec<TestCase>,
    pub limits: ExecutionLimits,
    /// Substrings the source must not contain. Empty disables the pre-check.
    pub forbidden_calls: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Run {
    pub id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub request: RunRequest,
    pub state: RunState,
}

impl Run {
    pub fn new(request: RunRequest) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            request,
            state: RunState::default(),
        }
    }

    pub fn change_state(&self, new_state: RunState) -> Self {
        Self {
            state: new_state,
            updated_at: chrono::Utc::now(),
            ..self.clone()
        }
    }

    /// The structured outcome, once the run has reached a terminal state.
    pub fn outcome(&self) -> Option<RunOutcome> {
        let failed = |kind: ErrorKind, message: String| {
            Some(RunOutcome::Failed(RunFailure { kind, message }))
        };

        match &self.state {
            RunState::Rejected(failure) => Some(RunOutcome::Failed(failure.clone())),
            RunState::ForbiddenApi { constructs } => failed(
                ErrorKind::ForbiddenApi,
                format!(
                    "Forbidden function used ({}). You must implement manually.",
                    constructs.iter().map(|c| format!("{c})")).join(", ")
                ),
            ),
            RunState::CompilationFailed { msg } => failed(
                ErrorKind::CompilationError,
                format!("Compilation error: {msg}"),
            ),
            RunState::EntryPointMissing { name } => failed(
                ErrorKind::EntryPointMissing,
                format!("Function {name} was not found. Please define it exactly."),
            ),
            RunState::Done(result_set) => Some(RunOutcome::Completed(result_set.clone())),
            RunState::Pending
            | RunState::Compiling
            | RunState::Compiled(_)
            | RunState::Running { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }
}

#[derive(Clone, Debug, Default)]
pub enum RunState {
    #[default]
    Pending,
    Rejected(RunFailure),

    Compiling,
    ForbiddenApi { constructs: Vec<String> },
    CompilationFailed { msg: String },
    EntryPointMissing { name: String },
    Compiled(Artifact),

    Running { cases: Vec<CaseState> },
    Done(ResultSet),
}

/// Handle to a candidate loaded into an isolated context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub id: Uuid,
    pub entry_point: String,
}

#[derive(Clone, Debug)]
pub enum CaseState {
    Pending,
    Running,
    Finished(ExecutionResult),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    CompilationError,
    EntryPointMissing,
    #[serde(rename = "ForbiddenAPI")]
    ForbiddenApi,
    Timeout,
    RuntimeError,
    NoTestsRegistered,
}

impl ErrorKind {
    /// Run-terminal kinds stop the run before any case executes.
    pub fn is_run_terminal(&self) -> bool {
        !matches!(self, ErrorKind::Timeout | ErrorKind::RuntimeError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::CompilationError => "CompilationError",
            ErrorKind::EntryPointMissing => "EntryPointMissing",
            ErrorKind::ForbiddenApi => "ForbiddenAPI",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::NoTestsRegistered => "NoTestsRegistered",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CaseError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub passed: bool,
    pub input_display: String,
    pub expected_display: String,
    pub actual_display: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CaseError>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub console: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub passed: usize,
    pub total: usize,
}

impl Summary {
    pub fn is_full_pass(&self) -> bool {
        self.total > 0 && self.passed == self.total
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} tests passed", self.passed, self.total)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ResultSet {
    pub results: Vec<ExecutionResult>,
    pub summary: Summary,
}

impl ResultSet {
    pub fn new(results: Vec<ExecutionResult>) -> Self {
        let summary = Summary {
            passed: results.iter().filter(|r| r.passed).count(),
            total: results.len(),
        };
        Self { results, summary }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum RunOutcome {
    Completed(ResultSet),
    Failed(RunFailure),
}

impl RunOutcome {
    pub fn is_full_pass(&self) -> bool {
        matches!(self, RunOutcome::Completed(set) if set.summary.is_full_pass())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(passed: bool) -> ExecutionResult {
        ExecutionResult {
            passed,
            input_display: "[1]".to_string(),
            expected_display: "1".to_string(),
            actual_display: "1".to_string(),
            error: None,
            elapsed_ms: 0,
            console: Vec::new(),
        }
    }

    fn request() -> RunRequest {
        RunRequest {
            source_text: "function f(x) { return x; }".to_string(),
            entry_point: "f".to_string(),
            cases: vec![],
            limits: ExecutionLimits::default(),
            forbidden_calls: vec![],
        }
    }

    #[test]
    fn test_summary_counts_passed_cases() {
        let set = ResultSet::new(vec![result(true), result(false), result(true)]);
        assert_eq!(set.summary, Summary { passed: 2, total: 3 });
        assert_eq!(set.summary.to_string(), "2/3 tests passed");
        assert!(!set.summary.is_full_pass());
    }

    #[test]
    fn test_empty_summary_is_not_full_pass() {
        assert!(!ResultSet::new(vec![]).summary.is_full_pass());
    }

    #[test]
    fn test_intermediate_states_have_no_outcome() {
        let run = Run::new(request());
        assert!(run.outcome().is_none());
        assert!(run.change_state(RunState::Compiling).outcome().is_none());
    }

    #[test]
    fn test_forbidden_outcome_names_construct() {
        let run = Run::new(request()).change_state(RunState::ForbiddenApi {
            constructs: vec![".sort(".to_string()],
        });
        let Some(RunOutcome::Failed(failure)) = run.outcome() else {
            panic!("Expected failed outcome");
        };
        assert_eq!(failure.kind, ErrorKind::ForbiddenApi);
        assert!(failure.message.contains(".sort()"));
    }

    #[test]
    fn test_error_kind_terminality() {
        assert!(ErrorKind::CompilationError.is_run_terminal());
        assert!(ErrorKind::ForbiddenApi.is_run_terminal());
        assert!(!ErrorKind::Timeout.is_run_terminal());
        assert!(!ErrorKind::RuntimeError.is_run_terminal());
    }
}
