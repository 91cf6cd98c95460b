// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Bounded-parallelism task scheduling.
//!
//! [`ConcurrencyLimiter`] gates individual futures behind a fair (FIFO)
//! semaphore so that at most `limit` of them run at once. [`run_all`] drives a
//! list of items through a worker using `min(limit, items.len())` lanes, each
//! lane pulling the next unclaimed item until the list is exhausted.
//!
//! Neither imposes a queue bound; callers apply their own backpressure.

use crate::Error;
use futures::future::join_all;
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::Semaphore;

/// Shared limiter for futures scheduled from many call sites.
///
/// Cloning is cheap and every clone shares the same permits.
#[derive(Clone, Debug)]
pub struct ConcurrencyLimiter {
    sem: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyLimiter {
    /// Create a limiter allowing `limit` unsettled tasks (minimum 1).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            sem: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of tasks currently holding a permit.
    pub fn active(&self) -> usize {
        self.limit - self.sem.available_permits()
    }

    /// Run `task` once a permit is available.
    ///
    /// Waiters are admitted in the order they called `schedule`. The permit
    /// is released when the task settles, whatever its output.
    pub async fn schedule<F, T>(&self, task: F) -> Result<T, Error>
    where
        F: Future<Output = T>,
    {
        let _permit = self.sem.acquire().await?;
        Ok(task.await)
    }
}

/// Drive every item through `worker` with at most `limit` in flight.
pub async fn run_all<T, F, Fut>(items: Vec<T>, limit: usize, worker: F)
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()>,
{
    run_all_while(items, limit, worker, || true).await
}

/// Like [`run_all`], but each lane checks `should_continue` before claiming
/// another item and stops as soon as it returns `false`.
///
/// Items already claimed run to completion; unclaimed items are dropped.
pub async fn run_all_while<T, F, Fut, C>(items: Vec<T>, limit: usize, worker: F, should_continue: C)
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()>,
    C: Fn() -> bool,
{
    let lanes = limit.max(1).min(items.len());
    let queue = Mutex::new(items.into_iter());
    let (queue, worker, should_continue) = (&queue, &worker, &should_continue);

    let lane = move || async move {
        while should_continue() {
            // The guard is dropped before the worker is awaited.
            let next = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .next();
            match next {
                Some(item) => worker(item).await,
                None => break,
            }
        }
    };

    join_all((0..lanes).map(|_| lane())).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        finished: AtomicUsize,
    }

    impl Gauge {
        fn new() -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                finished: AtomicUsize::new(0),
            }
        }

        async fn work(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_schedule_never_exceeds_limit() {
        for limit in [1, 5, 100] {
            for n in [0, 1, 1000] {
                let limiter = ConcurrencyLimiter::new(limit);
                let gauge = Gauge::new();
                let tasks = (0..n).map(|_| limiter.schedule(gauge.work()));
                for result in join_all(tasks).await {
                    result.unwrap();
                }
                assert!(gauge.peak.load(Ordering::SeqCst) <= limit);
                assert_eq!(gauge.finished.load(Ordering::SeqCst), n);
                assert_eq!(limiter.active(), 0);
            }
        }
    }

    #[tokio::test]
    async fn test_schedule_is_fifo() {
        let limiter = ConcurrencyLimiter::new(1);
        let order = Mutex::new(Vec::new());
        let tasks = (0..10).map(|i| {
            let order = &order;
            limiter.schedule(async move {
                tokio::task::yield_now().await;
                order.lock().unwrap().push(i);
            })
        });
        join_all(tasks).await;
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_schedule_failure_does_not_cancel_siblings() {
        let limiter = ConcurrencyLimiter::new(2);
        let tasks = (0..4).map(|i| {
            limiter.schedule(async move {
                if i == 1 {
                    Err(Error::Storage("boom".into()))
                } else {
                    Ok(i)
                }
            })
        });
        let results: Vec<_> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();
        assert!(results[1].is_err());
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    }

    #[tokio::test]
    async fn test_run_all_lanes_bounded() {
        for limit in [1, 5, 100] {
            for n in [0usize, 1, 1000] {
                let gauge = Gauge::new();
                run_all((0..n).collect(), limit, |_| gauge.work()).await;
                assert!(gauge.peak.load(Ordering::SeqCst) <= limit.min(n.max(1)));
                assert_eq!(gauge.finished.load(Ordering::SeqCst), n);
            }
        }
    }

    #[tokio::test]
    async fn test_run_all_while_stops_claiming() {
        let done = AtomicUsize::new(0);
        let done = &done;
        run_all_while(
            (0..50).collect::<Vec<_>>(),
            1,
            |_| async move {
                done.fetch_add(1, Ordering::SeqCst);
            },
            || done.load(Ordering::SeqCst) < 7,
        )
        .await;
        assert_eq!(done.load(Ordering::SeqCst), 7);
    }
}
