//! One OS thread per execution context, driven only by messages.
//!
//! Runtime values are single-threaded, so everything a candidate touches
//! lives and dies on the worker thread. The host talks to it through a
//! command channel and interrupts it by bumping the shared cancellation
//! epoch.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};

use super::context::{Context, Invocation, InvokeError, LoadError};
use super::interpreter::InterpreterLimits;
use crate::core::value::Value;

#[derive(Debug)]
pub enum Command {
    Load {
        source: String,
        entry_point: String,
        epoch: u64,
        reply: oneshot::Sender<Result<(), LoadError>>,
    },
    Invoke {
        args: Vec<Value>,
        epoch: u64,
        reply: oneshot::Sender<Result<Invocation, InvokeError>>,
    },
    /// Drops the loaded context.
    Unload { reply: oneshot::Sender<()> },
    Ping { reply: oneshot::Sender<()> },
    /// Makes the next `Invoke` panic the worker thread.
    #[cfg(test)]
    PanicOnInvoke,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn sandbox worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("sandbox worker {0} has stopped")]
    Gone(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub stack_bytes: usize,
    pub limits: InterpreterLimits,
}

/// Handle to a worker thread. The thread exits once every handle is dropped
/// and its current command has finished.
#[derive(Debug, Clone)]
pub struct Worker {
    id: usize,
    tx: mpsc::UnboundedSender<Command>,
    cancel: Arc<AtomicU64>,
}

impl Worker {
    pub fn spawn(id: usize, config: WorkerConfig) -> Result<Self, WorkerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicU64::new(0));
        let thread_cancel = cancel.clone();
        std::thread::Builder::new()
            .name(format!("sandbox-{id}"))
            .stack_size(config.stack_bytes)
            .spawn(move || serve(id, rx, thread_cancel, config.limits))?;
        tracing::debug!(worker = id, "Spawned sandbox worker");
        Ok(Self { id, tx, cancel })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Current cancellation epoch; commands stamped with it run until the
    /// next [`Worker::cancel`].
    pub fn epoch(&self) -> u64 {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Interrupts whatever the worker is evaluating.
    pub fn cancel(&self) {
        self.cancel.fetch_add(1, Ordering::SeqCst);
    }

    pub fn load(
        &self,
        source: &str,
        entry_point: &str,
    ) -> Result<oneshot::Receiver<Result<(), LoadError>>, WorkerError> {
        let epoch = self.epoch();
        self.request(|reply| Command::Load {
            source: source.to_string(),
            entry_point: entry_point.to_string(),
            epoch,
            reply,
        })
    }

    pub fn invoke(
        &self,
        args: &[Value],
    ) -> Result<oneshot::Receiver<Result<Invocation, InvokeError>>, WorkerError> {
        let epoch = self.epoch();
        self.request(|reply| Command::Invoke {
            args: args.to_vec(),
            epoch,
            reply,
        })
    }

    pub fn unload(&self) -> Result<oneshot::Receiver<()>, WorkerError> {
        self.request(|reply| Command::Unload { reply })
    }

    pub fn ping(&self) -> Result<oneshot::Receiver<()>, WorkerError> {
        self.request(|reply| Command::Ping { reply })
    }

    #[cfg(test)]
    pub fn panic_on_invoke(&self) {
        let _ = self.tx.send(Command::PanicOnInvoke);
    }

    fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<oneshot::Receiver<T>, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| WorkerError::Gone(self.id))?;
        Ok(rx)
    }
}

fn serve(
    id: usize,
    mut rx: mpsc::UnboundedReceiver<Command>,
    cancel: Arc<AtomicU64>,
    limits: InterpreterLimits,
) {
    let mut context: Option<Context> = None;
    #[cfg(test)]
    let mut panic_on_invoke = false;
    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Load {
                source,
                entry_point,
                epoch,
                reply,
            } => {
                context = None;
                let result =
                    match Context::compile(&source, &entry_point, limits, cancel.clone(), epoch) {
                        Ok(loaded) => {
                            context = Some(loaded);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                let _ = reply.send(result);
            }
            Command::Invoke { args, epoch, reply } => {
                #[cfg(test)]
                assert!(!panic_on_invoke, "sandbox worker {id} crashed mid-invocation");
                let result = match context.as_mut() {
                    Some(context) => context.invoke(&args, epoch),
                    None => Err(InvokeError::Thrown {
                        msg: "No program is loaded".to_string(),
                        console: Vec::new(),
                    }),
                };
                let _ = reply.send(result);
            }
            Command::Unload { reply } => {
                context = None;
                let _ = reply.send(());
            }
            Command::Ping { reply } => {
                let _ = reply.send(());
            }
            #[cfg(test)]
            Command::PanicOnInvoke => panic_on_invoke = true,
        }
    }
    tracing::debug!(worker = id, "Sandbox worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> WorkerConfig {
        WorkerConfig {
            stack_bytes: 1 << 30,
            limits: InterpreterLimits::default(),
        }
    }

    #[tokio::test]
    async fn test_load_and_invoke() {
        let worker = Worker::spawn(0, config()).unwrap();
        let loaded = worker.load("function add(a, b) { return a + b; }", "add").unwrap();
        assert!(loaded.await.unwrap().is_ok());

        let args = [Value::Number(2.0), Value::Number(3.0)];
        let invocation = worker.invoke(&args).unwrap().await.unwrap().unwrap();
        assert_eq!(invocation.value, Value::Number(5.0));
    }

    #[tokio::test]
    async fn test_invoke_without_program() {
        let worker = Worker::spawn(1, config()).unwrap();
        let result = worker.invoke(&[]).unwrap().await.unwrap();
        assert!(matches!(result, Err(InvokeError::Thrown { .. })));
    }

    #[tokio::test]
    async fn test_unload_forgets_program() {
        let worker = Worker::spawn(2, config()).unwrap();
        worker.load("function f() { return 1; }", "f").unwrap().await.unwrap().unwrap();
        worker.unload().unwrap().await.unwrap();
        let result = worker.invoke(&[]).unwrap().await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_infinite_loop() {
        let worker = Worker::spawn(3, config()).unwrap();
        worker.load("function spin() { while (true) {} }", "spin").unwrap().await.unwrap().unwrap();

        let mut reply = worker.invoke(&[]).unwrap();
        let early = tokio::time::timeout(Duration::from_millis(50), &mut reply).await;
        assert!(early.is_err(), "Loop should still be running");

        worker.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), reply)
            .await
            .expect("Worker should acknowledge cancellation")
            .unwrap();
        assert!(matches!(result, Err(InvokeError::Interrupted)));

        worker.ping().unwrap().await.unwrap();
        worker.load("function g() { return 'ok'; }", "g").unwrap().await.unwrap().unwrap();
        let invocation = worker.invoke(&[]).unwrap().await.unwrap().unwrap();
        assert_eq!(invocation.value, Value::from("ok"));
    }

    #[tokio::test]
    async fn test_panicking_worker_drops_pending_replies() {
        let worker = Worker::spawn(4, config()).unwrap();
        worker.load("function f() { return 1; }", "f").unwrap().await.unwrap().unwrap();

        worker.panic_on_invoke();
        let reply = worker.invoke(&[]).unwrap();
        assert!(reply.await.is_err());

        let gone = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if worker.ping().is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(gone.is_ok(), "Channel should close once the thread is gone");
    }
}
