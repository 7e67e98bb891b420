//! Bounded fan-out for per-object calls

use std::future::Future;

use tokio::sync::Semaphore;

/// Run `tasks` concurrently with at most `limit` in flight.
/// Results come back in input order.
pub(crate) async fn run_bounded<F, T>(limit: usize, tasks: impl IntoIterator<Item = F>) -> Vec<T>
where
    F: Future<Output = T>,
{
    let permits = Semaphore::new(limit.max(1));
    let permits = &permits;
    let futures = tasks.into_iter().map(|task| async move {
        // The semaphore is never closed, so acquire cannot fail
        let _permit = permits.acquire().await;
        task.await
    });
    futures::future::join_all(futures).await
}
