//! Task spawning abstraction.
//!
//! The scheduler never awaits anything itself. It hands fetch futures to a
//! [`TaskSpawner`] and later polls a channel for their results, so the
//! library works with whatever executor the embedding application runs.

use std::future::Future;
use std::pin::Pin;

/// A boxed, sendable background task.
pub type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs background tasks to completion.
///
/// Tasks return `()`; results travel back over `async_channel` channels.
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: BoxTask);
}

/// Spawns tasks onto a Tokio runtime.
#[cfg(not(target_family = "wasm"))]
#[derive(Debug, Clone)]
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

#[cfg(not(target_family = "wasm"))]
impl TokioSpawner {
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context, if there is one.
    #[must_use]
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

#[cfg(not(target_family = "wasm"))]
impl TaskSpawner for TokioSpawner {
    fn spawn(&self, task: BoxTask) {
        // Detached; the task reports through its channel.
        drop(self.handle.spawn(task));
    }
}

#[cfg(all(test, not(target_family = "wasm")))]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tokio_spawner_runs_task() {
        let spawner = TokioSpawner::current().unwrap();
        let (tx, rx) = async_channel::bounded(1);
        spawner.spawn(Box::pin(async move {
            let _ = tx.send(42u32).await;
        }));
        assert_eq!(rx.recv().await.unwrap(), 42);
    }

    #[test]
    fn test_no_current_runtime_outside_tokio() {
        assert!(TokioSpawner::current().is_none());
    }
}
