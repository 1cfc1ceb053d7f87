//! Named, recurring background tasks.
//!
//! [`PeriodicScheduler`] keeps one registry of tasks keyed by name. Starting
//! a name that is already running is a silent no-op; stopping cancels every
//! task with that name. The registry lock only guards bookkeeping: actions
//! run on the scheduler's runtime, each tick in its own spawned task, so a
//! panicking or failing action is logged and the loop keeps its cadence.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{ResilienceError, ResilienceResult};

/// Boxed future returned by a scheduled action.
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

type TaskAction = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// `tokio::time::interval` panics on a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Randomized recurring delay: `base + uniform[0, spread)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterPolicy {
    pub base: Duration,
    pub spread: Duration,
}

impl JitterPolicy {
    pub const fn new(base: Duration, spread: Duration) -> Self {
        Self { base, spread }
    }

    /// Server config polling: 120s plus up to 240s, so clients sharing a
    /// control plane do not poll in lockstep.
    pub const fn config_sync() -> Self {
        Self::new(Duration::from_secs(120), Duration::from_secs(240))
    }

    pub fn sample(&self) -> Duration {
        let spread_ms = self.spread.as_millis() as u64;
        if spread_ms == 0 {
            return self.base;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..spread_ms);
        self.base + Duration::from_millis(jitter_ms)
    }
}

#[derive(Debug)]
struct ScheduledTask {
    name: String,
    handle: JoinHandle<()>,
}

/// Registry of named recurring tasks.
#[derive(Debug, Clone)]
pub struct PeriodicScheduler {
    runtime: Handle,
    tasks: Arc<Mutex<Vec<ScheduledTask>>>,
}

impl PeriodicScheduler {
    /// Scheduler bound to the runtime of the calling context.
    pub fn current() -> ResilienceResult<Self> {
        let runtime = Handle::try_current().map_err(|e| ResilienceError::Config {
            message: format!("periodic scheduler needs a tokio runtime: {}", e),
        })?;
        Ok(Self::with_handle(runtime))
    }

    /// Scheduler that runs its tasks on `runtime`.
    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a recurring task unless one named `name` is already live.
    ///
    /// The first run happens after `initial_delay`, then every `interval`.
    /// Returns `true` when a task was registered.
    pub fn start<F, Fut>(
        &self,
        name: &str,
        initial_delay: Duration,
        interval: Duration,
        action: F,
    ) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.handle.is_finished());

        if tasks.iter().any(|task| task.name == name) {
            debug!(name, "task already scheduled");
            return false;
        }

        let action: TaskAction = Arc::new(move || Box::pin(action()) as TaskFuture);
        let interval = interval.max(MIN_INTERVAL);
        let task_name = name.to_string();

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(initial_delay).await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                run_once(&task_name, &action).await;
            }
        });

        info!(
            name,
            initial_delay_ms = initial_delay.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "scheduled task"
        );
        tasks.push(ScheduledTask {
            name: name.to_string(),
            handle,
        });
        true
    }

    /// Cancel every task named `name`. Runs already in flight finish on
    /// their own. Returns how many tasks were cancelled.
    pub fn stop(&self, name: &str) -> usize {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cancelled = 0;
        tasks.retain(|task| {
            if task.name != name {
                return true;
            }
            task.handle.abort();
            cancelled += 1;
            false
        });

        if cancelled > 0 {
            info!(name, cancelled, "stopped task");
        }
        cancelled
    }

    /// Whether a live task named `name` exists.
    pub fn is_active(&self, name: &str) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks
            .iter()
            .any(|task| task.name == name && !task.handle.is_finished())
    }

    /// Names of live tasks.
    pub fn task_names(&self) -> Vec<String> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks
            .iter()
            .filter(|task| !task.handle.is_finished())
            .map(|task| task.name.clone())
            .collect()
    }

    /// Cancel every task.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.handle.abort();
        }
        debug!("scheduler shut down");
    }
}

/// One tick, isolated in its own task so a panic stays inside it. The
/// closure itself is called inside that task too: it may panic before
/// returning a future.
async fn run_once(name: &str, action: &TaskAction) {
    let action = Arc::clone(action);
    let run = tokio::spawn(async move { action().await });

    match run.await {
        Ok(Ok(())) => debug!(name, "task run finished"),
        Ok(Err(e)) => warn!(name, error = %e, "task run failed"),
        Err(join_err) if join_err.is_panic() => {
            error!(name, panic = ?join_err, "task run panicked");
        }
        Err(join_err) => warn!(name, error = %join_err, "task run cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_action(counter: Arc<AtomicUsize>) -> impl Fn() -> TaskFuture + Send + Sync {
        move || -> TaskFuture {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[test]
    fn test_jitter_within_range() {
        let policy = JitterPolicy::config_sync();
        for _ in 0..200 {
            let sampled = policy.sample();
            assert!(sampled >= Duration::from_secs(120));
            assert!(sampled < Duration::from_secs(360));
        }
    }

    #[test]
    fn test_jitter_without_spread_is_base() {
        let policy = JitterPolicy::new(Duration::from_secs(5), Duration::ZERO);
        assert_eq!(policy.sample(), Duration::from_secs(5));
    }

    #[test]
    fn test_current_requires_runtime() {
        assert!(matches!(
            PeriodicScheduler::current(),
            Err(ResilienceError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_start_is_noop() {
        let scheduler = PeriodicScheduler::current().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.start(
            "sync",
            Duration::from_secs(60),
            Duration::from_secs(60),
            counting_action(Arc::clone(&counter)),
        ));
        assert!(!scheduler.start(
            "sync",
            Duration::ZERO,
            Duration::from_secs(1),
            counting_action(Arc::clone(&counter)),
        ));

        assert_eq!(scheduler.task_names(), vec!["sync".to_string()]);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_stop_then_start_reregisters() {
        let scheduler = PeriodicScheduler::current().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        assert!(scheduler.start(
            "sync",
            Duration::from_secs(60),
            Duration::from_secs(60),
            counting_action(Arc::clone(&counter)),
        ));
        assert_eq!(scheduler.stop("sync"), 1);
        assert!(!scheduler.is_active("sync"));
        assert_eq!(scheduler.stop("sync"), 0);

        assert!(scheduler.start(
            "sync",
            Duration::from_secs(60),
            Duration::from_secs(60),
            counting_action(Arc::clone(&counter)),
        ));
        assert!(scheduler.is_active("sync"));
        scheduler.shutdown();
        assert!(scheduler.task_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_at_interval() {
        let scheduler = PeriodicScheduler::current().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.start(
            "tick",
            Duration::ZERO,
            Duration::from_secs(10),
            counting_action(Arc::clone(&counter)),
        );

        tokio::time::sleep(Duration::from_secs(35)).await;
        let runs = counter.load(Ordering::SeqCst);
        assert!((3..=4).contains(&runs), "unexpected run count {}", runs);

        scheduler.stop("tick");
        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay_respected() {
        let scheduler = PeriodicScheduler::current().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.start(
            "delayed",
            Duration::from_secs(30),
            Duration::from_secs(100),
            counting_action(Arc::clone(&counter)),
        );

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_panicking_actions_keep_running() {
        let scheduler = PeriodicScheduler::current().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let healthy = Arc::new(AtomicUsize::new(0));

        let failing_calls = Arc::clone(&calls);
        scheduler.start("flaky", Duration::ZERO, Duration::from_secs(5), move || {
            let calls = Arc::clone(&failing_calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 {
                    panic!("boom on run {}", n);
                }
                Err::<(), _>(anyhow::anyhow!("failed on run {}", n))
            }
        });
        scheduler.start(
            "healthy",
            Duration::ZERO,
            Duration::from_secs(5),
            counting_action(Arc::clone(&healthy)),
        );

        tokio::time::sleep(Duration::from_secs(22)).await;

        assert!(calls.load(Ordering::SeqCst) >= 4);
        assert!(healthy.load(Ordering::SeqCst) >= 4);
        assert!(scheduler.is_active("flaky"));
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_panicking_before_future_keeps_running() {
        let scheduler = PeriodicScheduler::current().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let closure_calls = Arc::clone(&calls);
        scheduler.start(
            "eager-panic",
            Duration::ZERO,
            Duration::from_secs(5),
            move || -> TaskFuture {
                let n = closure_calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    panic!("closure panicked on run {}", n);
                }
                Box::pin(std::future::ready(Ok(())))
            },
        );

        tokio::time::sleep(Duration::from_secs(22)).await;

        assert!(calls.load(Ordering::SeqCst) >= 4);
        assert!(scheduler.is_active("eager-panic"));
        scheduler.shutdown();
    }
}
