use std::{
    future::Future,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use chat_core::{ChatError, ChatErrorCategory};

/// Lifecycle snapshot of a [`SweepJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStatus {
    /// Whether the job is currently running.
    pub running: bool,
    /// Configured interval, when running.
    pub interval_ms: Option<u64>,
}

struct RunningSweep {
    stop: CancellationToken,
    task: JoinHandle<()>,
    interval_ms: u64,
}

/// Injectable periodic job with an explicit lifecycle.
///
/// Owned by the composition root rather than living as module-level timer
/// state, so tests can control time deterministically. The first run happens
/// one interval after `start`.
#[derive(Default)]
pub struct SweepJob {
    running: Mutex<Option<RunningSweep>>,
}

impl SweepJob {
    /// Idle job.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start running `job` every `interval`. Fails if already running.
    ///
    /// Must be called within a tokio runtime.
    pub fn start<F, Fut>(&self, interval: Duration, mut job: F) -> Result<(), ChatError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut guard = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Err(ChatError::new(
                ChatErrorCategory::Internal,
                "sweep_already_running",
                "sweep job is already running",
            ));
        }

        let interval = interval.max(Duration::from_millis(1));
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // An interval's first tick completes immediately; consume it so
            // the first run lands one interval after start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop_child.cancelled() => break,
                    _ = ticker.tick() => job().await,
                }
            }
        });

        *guard = Some(RunningSweep {
            stop,
            task,
            interval_ms: interval.as_millis() as u64,
        });
        debug!(interval_ms = interval.as_millis() as u64, "sweep job started");
        Ok(())
    }

    /// Stop the job and wait for its task to exit. Fails if not running.
    pub async fn stop(&self) -> Result<(), ChatError> {
        let running = {
            let mut guard = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            guard.take()
        };

        let Some(running) = running else {
            return Err(ChatError::new(
                ChatErrorCategory::Internal,
                "sweep_not_running",
                "sweep job is not running",
            ));
        };

        running.stop.cancel();
        let _ = running.task.await;
        debug!("sweep job stopped");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SweepStatus {
        let guard = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        SweepStatus {
            running: guard.is_some(),
            interval_ms: guard.as_ref().map(|running| running.interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn runs_on_the_configured_interval() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let job = SweepJob::new();

        let counter = Arc::clone(&ticks);
        job.start(Duration::from_millis(100), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("start should work");

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        job.stop().await.expect("stop should work");
        let after_stop = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn rejects_double_start_and_stop_when_idle() {
        let job = SweepJob::new();
        assert_eq!(
            job.status(),
            SweepStatus {
                running: false,
                interval_ms: None,
            }
        );

        let err = job.stop().await.expect_err("stop while idle must fail");
        assert_eq!(err.code, "sweep_not_running");

        job.start(Duration::from_secs(60), || async {})
            .expect("start should work");
        assert_eq!(
            job.status(),
            SweepStatus {
                running: true,
                interval_ms: Some(60_000),
            }
        );

        let err = job
            .start(Duration::from_secs(60), || async {})
            .expect_err("double start must fail");
        assert_eq!(err.code, "sweep_already_running");

        job.stop().await.expect("stop should work");
        assert!(!job.status().running);
    }
}
