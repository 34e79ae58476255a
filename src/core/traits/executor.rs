use crate::core::{
    domain::{Artifact, ExecutionLimits},
    value::Value,
};

/// Isolation boundary: something that can load untrusted source into a
/// context of its own and invoke its entry point.
#[mockall::automock]
#[async_trait::async_trait]
pub trait Executor: std::fmt::Debug + Send + Sync {
    /// Evaluates `source` once in a pristine context and checks that
    /// `entry_point` is bound to a callable.
    async fn compile(
        &self,
        source: &str,
        entry_point: &str,
        limits: &ExecutionLimits,
    ) -> Result<Artifact, CompileError>;

    /// Calls the entry point with positional `args`, awaiting either a
    /// synchronous return or an asynchronous completion.
    async fn run(
        &self,
        artifact: &Artifact,
        args: &[Value],
        limits: &ExecutionLimits,
    ) -> Result<RunResult, RunError>;

    /// Ends the run. The context is reset before it is handed out again.
    async fn release(&self, artifact: &Artifact);
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CompileError {
    #[error("{msg}")]
    CompilationFailed { msg: String },
    #[error("function {name} is not defined")]
    EntryPointMissing { name: String },
    #[error("internal error: {msg}")]
    Internal { msg: String },
}

#[derive(Clone, Debug)]
pub struct RunResult {
    pub value: Value,
    pub console: Vec<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunError {
    #[error("Timeout after {limit_ms} ms")]
    Timeout { limit_ms: u64 },
    #[error("{msg}")]
    Thrown { msg: String, console: Vec<String> },
    #[error("internal error: {msg}")]
    Internal { msg: String },
}
