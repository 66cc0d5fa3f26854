//! Bounded worker pool for blocking work.
//!
//! Work runs on tokio's blocking thread pool, gated by a semaphore so that at
//! most `num_workers` jobs execute at once. Jobs only see the inputs moved into
//! their closure; results come back through a [`TaskHandle`].

use crate::error::{Result, ServerError};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Awaitable result of a submitted job.
pub struct TaskHandle<T> {
    inner: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().inner).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(ServerError::WorkerFailure(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Decrements the in-flight counter when a job completes or is dropped.
struct InFlightGuard(Arc<watch::Sender<usize>>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub struct BackgroundExecutor {
    permits: Arc<Semaphore>,
    accepting: AtomicBool,
    in_flight: Arc<watch::Sender<usize>>,
}

impl BackgroundExecutor {
    pub fn new(num_workers: usize) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            permits: Arc::new(Semaphore::new(num_workers)),
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(in_flight),
        }
    }

    /// Queue `f` on the pool and return immediately.
    ///
    /// An `Err` from `f`, or a panic inside it, is reported only to whoever
    /// awaits the returned handle.
    pub fn submit<F, T, E>(&self, f: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ServerError::NotAccepting);
        }

        self.in_flight.send_modify(|n| *n += 1);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let permits = Arc::clone(&self.permits);

        let inner = tokio::spawn(async move {
            let _guard = guard;
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|e| ServerError::WorkerFailure(e.to_string()))?;

            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                f()
            })
            .await
            .map_err(|e| {
                warn!("Background task panicked: {}", e);
                ServerError::WorkerFailure(e.to_string())
            })?;

            result.map_err(|e| ServerError::WorkerFailure(e.to_string()))
        });

        Ok(TaskHandle { inner })
    }

    /// Stop accepting new work. With `wait`, also wait for queued and
    /// running jobs to drain; otherwise they finish (or are abandoned at
    /// process exit) on their own.
    pub async fn shutdown(&self, wait: bool) {
        self.accepting.store(false, Ordering::SeqCst);
        debug!(in_flight = self.in_flight(), wait, "Background executor shutting down");
        if wait {
            let mut rx = self.in_flight.subscribe();
            let _ = rx.wait_for(|n| *n == 0).await;
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Jobs submitted but not yet completed.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[tokio::test]
    async fn submit_does_not_wait_for_the_job() {
        let executor = BackgroundExecutor::new(4);
        let (release_tx, release_rx) = mpsc::channel::<()>();

        // The job blocks until released, so reaching the send below proves
        // submit returned before the job ran to completion.
        let handle = executor
            .submit(move || {
                release_rx.recv().map_err(|e| e.to_string())?;
                Ok::<_, String>(42)
            })
            .unwrap();
        assert!(!handle.is_finished());

        release_tx.send(()).unwrap();
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn failure_reaches_only_its_awaiter() {
        let executor = BackgroundExecutor::new(2);
        let failing = executor.submit(|| Err::<u32, _>("boom")).unwrap();
        let ok = executor.submit(|| Ok::<_, String>(7)).unwrap();

        match failing.await {
            Err(ServerError::WorkerFailure(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected worker failure, got {:?}", other.map(|_| ())),
        }
        assert_eq!(ok.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn panic_does_not_poison_the_pool() {
        let executor = BackgroundExecutor::new(1);
        let panicking = executor
            .submit(|| -> std::result::Result<(), String> { panic!("worker exploded") })
            .unwrap();
        assert!(matches!(
            panicking.await,
            Err(ServerError::WorkerFailure(_))
        ));

        let after = executor.submit(|| Ok::<_, String>("still alive")).unwrap();
        assert_eq!(after.await.unwrap(), "still alive");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrency_is_bounded_by_worker_count() {
        let executor = BackgroundExecutor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                executor
                    .submit(move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .unwrap()
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn shutdown_without_wait_returns_while_work_is_running() {
        let executor = BackgroundExecutor::new(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let handle = executor
            .submit(move || {
                release_rx.recv().map_err(|e| e.to_string())?;
                Ok::<_, String>("done")
            })
            .unwrap();

        executor.shutdown(false).await;
        assert!(!executor.is_accepting());
        assert!(matches!(
            executor.submit(|| Ok::<_, String>(())),
            Err(ServerError::NotAccepting)
        ));

        release_tx.send(()).unwrap();
        assert_eq!(handle.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn shutdown_with_wait_drains_in_flight_work() {
        let executor = BackgroundExecutor::new(2);
        let handle = executor
            .submit(|| {
                std::thread::sleep(Duration::from_millis(30));
                Ok::<_, String>(())
            })
            .unwrap();

        executor.shutdown(true).await;
        assert_eq!(executor.in_flight(), 0);
        handle.await.unwrap();
    }
}
