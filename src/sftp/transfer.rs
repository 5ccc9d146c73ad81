//! Batch scheduler for bulk transfers
//!
//! Work is split into consecutive groups of at most `concurrency` tasks. All
//! tasks of a group are polled concurrently on the calling task (they share
//! one connection, so there is nothing to gain from spawning), and the next
//! group starts only after every task of the current one has settled. The
//! first failure stops scheduling once its group has finished.

use futures_util::future::{join_all, BoxFuture};
use tracing::{debug, warn};

use super::error::{fmt_error, ErrorCode, SftpError};

/// A unit of work for [`run_batched`]
pub type Task<'a, T> = BoxFuture<'a, Result<T, SftpError>>;

/// Fail with the usual batch-size error for `name` unless `size` is positive
pub fn check_batch_size(size: usize, name: &str) -> Result<usize, SftpError> {
    if size == 0 {
        return Err(fmt_error(
            "Batch size must be a positive integer, got 0",
            name,
            Some(ErrorCode::GenericClient),
            None,
        ));
    }
    Ok(size)
}

/// Split `items` into consecutive groups of `size` (the last may be smaller).
pub fn partition<T>(items: Vec<T>, size: usize) -> Result<Vec<Vec<T>>, SftpError> {
    check_batch_size(size, "partition")?;

    let mut groups = Vec::with_capacity(items.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(items.len()));
    for item in items {
        current.push(item);
        if current.len() == size {
            groups.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    Ok(groups)
}

/// Run `tasks` in groups of `concurrency`, returning their outputs in
/// submission order, or the first error (by position) of the first failing
/// group.
pub async fn run_batched<'a, T>(
    tasks: Vec<Task<'a, T>>,
    concurrency: usize,
) -> Result<Vec<T>, SftpError> {
    let total = tasks.len();
    let groups = partition(tasks, concurrency)?;
    let group_count = groups.len();
    let mut outputs = Vec::with_capacity(total);

    for (index, group) in groups.into_iter().enumerate() {
        debug!(
            "Running batch {}/{} ({} task(s))",
            index + 1,
            group_count,
            group.len()
        );
        let mut first_error = None;
        for result in join_all(group).await {
            match result {
                Ok(value) => outputs.push(value),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            warn!(
                "Batch {}/{} failed, skipping {} remaining batch(es): {}",
                index + 1,
                group_count,
                group_count - index - 1,
                e
            );
            return Err(e);
        }
    }

    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_partition_sizes_and_order() {
        for len in [0usize, 1, 7, 10, 11, 100] {
            for size in [1usize, 3, 10, 160] {
                let items: Vec<usize> = (0..len).collect();
                let groups = partition(items.clone(), size).unwrap();

                assert_eq!(groups.len(), len.div_ceil(size));
                for (i, group) in groups.iter().enumerate() {
                    if i + 1 < groups.len() {
                        assert_eq!(group.len(), size);
                    } else {
                        assert!(!group.is_empty() && group.len() <= size);
                    }
                }
                let flat: Vec<usize> = groups.into_iter().flatten().collect();
                assert_eq!(flat, items);
            }
        }
    }

    #[test]
    fn test_partition_zero_fails() {
        let err = partition(vec![1, 2, 3], 0).unwrap_err();
        assert_eq!(err.message, "partition: Batch size must be a positive integer, got 0");
    }

    #[test]
    fn test_check_batch_size_names_the_operation() {
        assert_eq!(check_batch_size(4, "rmdir").unwrap(), 4);
        let err = check_batch_size(0, "upload_dir").unwrap_err();
        assert_eq!(err.message, "upload_dir: Batch size must be a positive integer, got 0");
        assert_eq!(err.code, ErrorCode::GenericClient);
    }

    #[tokio::test]
    async fn test_results_in_submission_order() {
        let tasks: Vec<Task<'_, usize>> = (0..25usize)
            .map(|i| {
                async move {
                    // Later tasks of a group finish first
                    for _ in 0..(25 - i) {
                        tokio::task::yield_now().await;
                    }
                    Ok(i)
                }
                .boxed()
            })
            .collect();

        let out = run_batched(tasks, 4).await.unwrap();
        assert_eq!(out, (0..25).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_groups_are_gated() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<Task<'_, ()>> = (0..10usize)
            .map(|i| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                let started = started.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    started.lock().push(i);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            })
            .collect();

        run_batched(tasks, 3).await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        let started = started.lock();
        // Every task of a group starts before any task of the next group
        for (pos, task) in started.iter().enumerate() {
            assert_eq!(pos / 3, task / 3);
        }
    }

    #[tokio::test]
    async fn test_failure_lets_group_finish_then_stops() {
        let finished = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<Task<'_, usize>> = (0..9usize)
            .map(|i| {
                let finished = finished.clone();
                async move {
                    tokio::task::yield_now().await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    match i {
                        4 => Err(fmt_error("task 4 failed", "put", None, None)),
                        5 => Err(fmt_error("task 5 failed", "put", None, None)),
                        _ => Ok(i),
                    }
                }
                .boxed()
            })
            .collect();

        let err = run_batched(tasks, 3).await.unwrap_err();
        assert_eq!(err.message, "put: task 4 failed");
        // Batches [0,1,2] and [3,4,5] ran to completion, [6,7,8] never started
        assert_eq!(finished.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_zero_concurrency_fails_without_running() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let tasks: Vec<Task<'_, ()>> = vec![async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()];

        assert!(run_batched(tasks, 0).await.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
