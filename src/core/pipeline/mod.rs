pub mod compiling;
pub mod running;

use tokio::sync::mpsc::Sender;

use crate::core::domain::Run;

/// Publishes a snapshot; `false` once the receiving side is gone.
async fn publish(tx: &Sender<Run>, run: Run, err: &str) -> bool {
    match tx.send(run).await {
        Ok(()) => true,
        Err(_) => {
            tracing::error!("{}", err);
            false
        }
    }
}
