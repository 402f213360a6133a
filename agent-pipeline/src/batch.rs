//! Bounded fan-out for independent sub-pipelines

use futures::{stream::FuturesUnordered, Future, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Context provided to each task in a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    /// Task number (1-indexed for display)
    pub task_number: usize,
    /// Total number of tasks in this batch
    pub total_tasks: usize,
}

/// Run every item concurrently, at most `max_concurrency` at a time, and
/// wait for all of them to settle
///
/// Unlike a fail-fast batch, a failing task never cancels its siblings: the
/// executor's output (typically a `Result`) is collected for every item.
/// Results come back in input order.
///
/// # Example
/// ```rust,ignore
/// let outcomes = execute_settled(VulnType::ALL.to_vec(), 5, |vuln, ctx| async move {
///     run_sub_pipeline(vuln, ctx).await
/// })
/// .await;
/// ```
pub async fn execute_settled<T, F, Fut, R>(
    items: Vec<T>,
    max_concurrency: usize,
    task_executor: F,
) -> Vec<R>
where
    F: Fn(T, TaskContext) -> Fut,
    Fut: Future<Output = R>,
{
    let total = items.len();
    let sem = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let executor = &task_executor;
    let mut tasks = FuturesUnordered::new();

    for (idx, item) in items.into_iter().enumerate() {
        let sem = sem.clone();
        let ctx = TaskContext {
            task_number: idx + 1,
            total_tasks: total,
        };

        tasks.push(async move {
            // The semaphore is never closed, so a permit is always granted
            let _permit = sem.acquire().await.ok();
            (idx, executor(item, ctx).await)
        });
    }

    let mut settled = Vec::with_capacity(total);
    while let Some(result) = tasks.next().await {
        settled.push(result);
    }
    settled.sort_by_key(|(idx, _)| *idx);
    settled.into_iter().map(|(_, result)| result).collect()
}
