use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, oneshot};
use uuid::Uuid;

use super::context::{InvokeError, LoadError};
use super::interpreter::InterpreterLimits;
use super::worker::{Worker, WorkerConfig, WorkerError};
use crate::core::{
    domain::{Artifact, ExecutionLimits},
    traits::executor::{CompileError, Executor, RunError, RunResult},
    value::Value,
};

pub const DEFAULT_CANCEL_GRACE_MS: u64 = 250;
pub const DEFAULT_IDLE_POOL_SIZE: usize = 2;
pub const DEFAULT_WORKER_STACK_BYTES: usize = 1 << 30;

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// How long a cancelled context has to acknowledge before it is
    /// replaced.
    pub cancel_grace: Duration,
    /// Released workers kept for reuse.
    pub idle_pool_size: usize,
    /// Never reuse a worker across runs.
    pub recycle_per_run: bool,
    pub worker: WorkerConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_millis(DEFAULT_CANCEL_GRACE_MS),
            idle_pool_size: DEFAULT_IDLE_POOL_SIZE,
            recycle_per_run: false,
            worker: WorkerConfig {
                stack_bytes: DEFAULT_WORKER_STACK_BYTES,
                limits: InterpreterLimits::default(),
            },
        }
    }
}

/// A candidate currently loaded into a worker.
#[derive(Debug, Clone)]
struct Loaded {
    worker: Worker,
    source: Arc<str>,
}

enum Reply<T> {
    Done(T),
    TimedOut { acknowledged: bool },
    /// The worker dropped the request without answering.
    Lost,
}

/// [`Executor`] backed by interpreter worker threads.
#[derive(Debug)]
pub struct SandboxExecutor {
    config: SandboxConfig,
    idle: Mutex<Vec<Worker>>,
    artifacts: DashMap<Uuid, Loaded>,
    next_worker_id: AtomicUsize,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(Vec::new()),
            artifacts: DashMap::new(),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    fn spawn_worker(&self) -> Result<Worker, WorkerError> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        Worker::spawn(id, self.config.worker)
    }

    /// An idle worker that still answers, or a new one.
    async fn checkout(&self) -> Result<Worker, WorkerError> {
        loop {
            let Some(worker) = self.idle.lock().await.pop() else {
                break;
            };
            if let Ok(pong) = worker.ping() {
                if matches!(tokio::time::timeout(self.config.cancel_grace, pong).await, Ok(Ok(()))) {
                    return Ok(worker);
                }
            }
            tracing::warn!(worker = worker.id(), "Discarding unresponsive idle worker");
        }
        self.spawn_worker()
    }

    async fn checkin(&self, worker: Worker) {
        if self.config.recycle_per_run {
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() < self.config.idle_pool_size {
            idle.push(worker);
        }
    }

    /// Waits for `reply` within `limit`. On overrun the worker is cancelled
    /// and given the grace period to acknowledge.
    async fn await_reply<T>(
        &self,
        worker: &Worker,
        mut reply: oneshot::Receiver<T>,
        limit: Duration,
    ) -> Reply<T> {
        match tokio::time::timeout(limit, &mut reply).await {
            Ok(Ok(value)) => return Reply::Done(value),
            Ok(Err(_)) => return Reply::Lost,
            Err(_) => {}
        }

        tracing::debug!(worker = worker.id(), "Deadline passed, cancelling");
        worker.cancel();
        let acknowledged = matches!(
            tokio::time::timeout(self.config.cancel_grace, reply).await,
            Ok(Ok(_))
        );
        Reply::TimedOut { acknowledged }
    }

    /// Replaces the worker of `artifact` with a fresh one and loads the
    /// same program into it. The artifact is dropped if that fails.
    async fn recreate(&self, artifact: &Artifact, loaded: &Loaded, limits: &ExecutionLimits) {
        tracing::warn!(
            artifact = %artifact.id,
            worker = loaded.worker.id(),
            "Recreating sandbox context"
        );
        let restored = match self.spawn_worker() {
            Ok(worker) => match worker.load(&loaded.source, &artifact.entry_point) {
                Ok(reply) => match self.await_reply(&worker, reply, limits.timeout()).await {
                    Reply::Done(Ok(())) => Some(worker),
                    _ => None,
                },
                Err(_) => None,
            },
            Err(e) => {
                tracing::error!("Failed to spawn replacement worker: {}", e);
                None
            }
        };

        match restored {
            Some(worker) => {
                self.artifacts.insert(
                    artifact.id,
                    Loaded {
                        worker,
                        source: loaded.source.clone(),
                    },
                );
            }
            None => {
                tracing::error!(artifact = %artifact.id, "Could not restore sandbox context");
                self.artifacts.remove(&artifact.id);
            }
        }
    }

    #[cfg(test)]
    async fn idle_workers(&self) -> usize {
        self.idle.lock().await.len()
    }
}

fn compile_error(error: LoadError) -> CompileError {
    match error {
        LoadError::Syntax(e) => CompileError::CompilationFailed { msg: e.to_string() },
        LoadError::Thrown(msg) => CompileError::CompilationFailed { msg },
        LoadError::EntryPointMissing(name) => CompileError::EntryPointMissing { name },
        LoadError::Interrupted => CompileError::CompilationFailed {
            msg: "Program evaluation was interrupted".to_string(),
        },
    }
}

#[async_trait::async_trait]
impl Executor for SandboxExecutor {
    #[tracing::instrument(skip(self, source, limits))]
    async fn compile(
        &self,
        source: &str,
        entry_point: &str,
        limits: &ExecutionLimits,
    ) -> Result<Artifact, CompileError> {
        let internal = |e: WorkerError| CompileError::Internal { msg: e.to_string() };
        let worker = self.checkout().await.map_err(internal)?;
        let reply = worker.load(source, entry_point).map_err(internal)?;

        match self.await_reply(&worker, reply, limits.timeout()).await {
            Reply::Done(Ok(())) => {
                let artifact = Artifact {
                    id: Uuid::new_v4(),
                    entry_point: entry_point.to_string(),
                };
                tracing::debug!(artifact = %artifact.id, worker = worker.id(), "Program loaded");
                self.artifacts.insert(
                    artifact.id,
                    Loaded {
                        worker,
                        source: Arc::from(source),
                    },
                );
                Ok(artifact)
            }
            Reply::Done(Err(error)) => {
                self.checkin(worker).await;
                Err(compile_error(error))
            }
            Reply::TimedOut { acknowledged } => {
                if acknowledged {
                    self.checkin(worker).await;
                }
                Err(CompileError::CompilationFailed {
                    msg: format!("Program evaluation timed out after {} ms", limits.time_ms),
                })
            }
            Reply::Lost => Err(internal(WorkerError::Gone(worker.id()))),
        }
    }

    #[tracing::instrument(skip(self, artifact, args, limits), fields(artifact = %artifact.id))]
    async fn run(
        &self,
        artifact: &Artifact,
        args: &[Value],
        limits: &ExecutionLimits,
    ) -> Result<RunResult, RunError> {
        let loaded = self
            .artifacts
            .get(&artifact.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RunError::Internal {
                msg: format!("Artifact {} is not loaded", artifact.id),
            })?;

        let reply = match loaded.worker.invoke(args) {
            Ok(reply) => reply,
            Err(e) => {
                self.recreate(artifact, &loaded, limits).await;
                return Err(RunError::Internal { msg: e.to_string() });
            }
        };

        let timeout = RunError::Timeout {
            limit_ms: limits.time_ms,
        };
        match self.await_reply(&loaded.worker, reply, limits.timeout()).await {
            Reply::Done(Ok(invocation)) => Ok(RunResult {
                value: invocation.value,
                console: invocation.console,
            }),
            Reply::Done(Err(InvokeError::Thrown { msg, console })) => {
                Err(RunError::Thrown { msg, console })
            }
            Reply::Done(Err(InvokeError::Interrupted)) | Reply::TimedOut { acknowledged: true } => {
                Err(timeout)
            }
            Reply::TimedOut {
                acknowledged: false,
            } => {
                self.recreate(artifact, &loaded, limits).await;
                Err(timeout)
            }
            Reply::Lost => {
                tracing::error!(worker = loaded.worker.id(), "Sandbox worker stopped mid-run");
                self.recreate(artifact, &loaded, limits).await;
                Err(RunError::Internal {
                    msg: WorkerError::Gone(loaded.worker.id()).to_string(),
                })
            }
        }
    }

    #[tracing::instrument(skip(self, artifact), fields(artifact = %artifact.id))]
    async fn release(&self, artifact: &Artifact) {
        let Some((_, loaded)) = self.artifacts.remove(&artifact.id) else {
            return;
        };
        let Ok(reply) = loaded.worker.unload() else {
            return;
        };
        match tokio::time::timeout(self.config.cancel_grace, reply).await {
            Ok(Ok(())) => self.checkin(loaded.worker).await,
            _ => tracing::warn!(worker = loaded.worker.id(), "Worker did not unload in time"),
        }
    }
}
