//! Periodic maintenance jobs that run alongside request handling.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

type JobAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A named action fired on a fixed interval.
#[derive(Clone)]
pub struct MaintenanceJob {
    name: &'static str,
    interval: Duration,
    action: JobAction,
}

impl MaintenanceJob {
    pub fn new<F, Fut>(name: &'static str, interval: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            interval,
            action: Arc::new(move || Box::pin(action())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn spawn(&self) -> JoinHandle<()> {
        let name = self.name;
        let period = self.interval;
        let action = Arc::clone(&self.action);
        tokio::spawn(async move {
            // First run happens one full period after start.
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!(job = name, "Running maintenance job");
                action().await;
            }
        })
    }
}

/// Starts and stops a fixed set of independent jobs together.
pub struct MaintenanceScheduler {
    jobs: Vec<MaintenanceJob>,
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    pub fn new(jobs: Vec<MaintenanceJob>) -> Self {
        Self {
            jobs,
            running: Mutex::new(Vec::new()),
        }
    }

    /// Spawn every job. Returns false if the jobs were already running.
    pub fn start(&self) -> bool {
        let mut running = self.lock_running();
        if !running.is_empty() {
            return false;
        }
        running.extend(self.jobs.iter().map(MaintenanceJob::spawn));
        true
    }

    /// Cancel every job. Returns false if nothing was running.
    pub fn stop(&self) -> bool {
        let handles: Vec<_> = self.lock_running().drain(..).collect();
        let was_running = !handles.is_empty();
        for handle in handles {
            handle.abort();
        }
        was_running
    }

    pub fn is_running(&self) -> bool {
        !self.lock_running().is_empty()
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(MaintenanceJob::name).collect()
    }

    pub fn job(&self, name: &str) -> Option<&MaintenanceJob> {
        self.jobs.iter().find(|j| j.name == name)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(name: &'static str, secs: u64, counter: &Arc<AtomicUsize>) -> MaintenanceJob {
        let counter = Arc::clone(counter);
        MaintenanceJob::new(name, Duration::from_secs(secs), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_fire_on_their_own_cadence() {
        let fast = Arc::new(AtomicUsize::new(0));
        let slow = Arc::new(AtomicUsize::new(0));
        let scheduler = MaintenanceScheduler::new(vec![
            counting_job("fast", 10, &fast),
            counting_job("slow", 25, &slow),
        ]);

        assert!(scheduler.start());
        tokio::time::sleep(Duration::from_secs(55)).await;

        assert_eq!(fast.load(Ordering::SeqCst), 5);
        assert_eq!(slow.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_all_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = MaintenanceScheduler::new(vec![
            counting_job("a", 10, &counter),
            counting_job("b", 10, &counter),
        ]);

        scheduler.start();
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        assert!(scheduler.stop());
        assert!(!scheduler.is_running());
        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(!scheduler.stop());
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_does_not_duplicate_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let scheduler = MaintenanceScheduler::new(vec![counting_job("a", 10, &counter)]);

        assert!(scheduler.start());
        assert!(!scheduler.start());
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.job_names(), vec!["a"]);
    }
}
