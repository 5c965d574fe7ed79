//! Detached best-effort work
//!
//! Used for writes whose failure must never fail the request that caused
//! them (token logs, free-tier counters). Errors are logged and dropped.

use std::fmt::Display;
use std::future::Future;

use tokio::task::JoinHandle;

/// Run `fut` in the background, logging any error under `name`.
///
/// The handle can be awaited by tests; production callers drop it.
pub fn spawn_best_effort<F, E>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            tracing::warn!(task = name, error = %e, "Best-effort task failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_task_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        spawn_best_effort("test", async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<(), String>(())
        })
        .await
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_error_is_swallowed() {
        let handle = spawn_best_effort("test", async { Err::<(), _>("nope") });
        assert!(handle.await.is_ok());
    }
}
