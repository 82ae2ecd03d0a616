//! Detached work that must finish before the worker is torn down.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{trace, warn};

/// A set of detached tasks.
///
/// Spawning never blocks the caller; [`BackgroundTasks::wait_idle`] lets the
/// host keep the process alive until everything spawned so far has finished.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a detached task.
    pub async fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        // Reap finished tasks so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
        trace!(label, "Spawning background task");
        tasks.spawn(task);
    }

    /// Number of tasks not yet reaped.
    pub async fn pending(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Wait until every spawned task has completed.
    pub async fn wait_idle(&self) {
        loop {
            let mut drained = {
                let mut tasks = self.tasks.lock().await;
                if tasks.is_empty() {
                    return;
                }
                // Take the whole set so new spawns are not blocked meanwhile.
                std::mem::take(&mut *tasks)
            };
            while let Some(result) = drained.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Background task panicked");
                }
            }
        }
    }
}
