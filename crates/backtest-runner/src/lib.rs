use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Default number of backtests allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default wait for a free slot before a job is failed.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum BacktestPoolError {
    /// No worker slot freed up within the acquire timeout. The job is
    /// marked failed instead of queueing indefinitely.
    #[error("no backtest slot available after {waited:?} ({max_concurrent} running)")]
    NoSlotAvailable {
        waited: Duration,
        max_concurrent: usize,
    },
    #[error("backtest job panicked or was cancelled: {0}")]
    JobFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestOutcome {
    pub id: Uuid,
    pub status: JobStatus,
    pub error: Option<String>,
}

/// Bounded worker pool for CPU/memory-heavy backtest runs.
///
/// Backtests are batch work that must never starve the trading loop:
/// concurrency is capped by a fixed permit count, and waiting for a slot is
/// bounded. Jobs run on the blocking thread pool.
pub struct BacktestPool {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    acquire_timeout: Duration,
}

impl BacktestPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Slots currently free.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run one backtest job, waiting up to the acquire timeout for a slot.
    pub async fn run<F, T>(&self, job: F) -> Result<(Uuid, T), BacktestPoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let id = Uuid::new_v4();
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| {
            tracing::warn!(
                "Backtest {} failed: no slot available after {:?}",
                id,
                self.acquire_timeout
            );
            BacktestPoolError::NoSlotAvailable {
                waited: self.acquire_timeout,
                max_concurrent: self.max_concurrent,
            }
        })?
        .expect("backtest semaphore closed");

        tracing::debug!(
            "Backtest {} acquired slot ({} remaining)",
            id,
            self.semaphore.available_permits()
        );

        let result = tokio::task::spawn_blocking(move || {
            let result = job();
            drop(permit);
            result
        })
        .await
        .map_err(|e| BacktestPoolError::JobFailed(e.to_string()))?;

        Ok((id, result))
    }

    /// Convenience wrapper that folds errors into a [`BacktestOutcome`]
    /// suitable for the dashboard read model.
    pub async fn run_to_outcome<F>(&self, job: F) -> BacktestOutcome
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        match self.run(job).await {
            Ok((id, Ok(()))) => BacktestOutcome {
                id,
                status: JobStatus::Completed,
                error: None,
            },
            Ok((id, Err(e))) => BacktestOutcome {
                id,
                status: JobStatus::Failed,
                error: Some(e),
            },
            Err(e) => BacktestOutcome {
                id: Uuid::new_v4(),
                status: JobStatus::Failed,
                error: Some(e.to_string()),
            },
        }
    }
}

impl Default for BacktestPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jobs_run_and_return() {
        let pool = BacktestPool::new(2);
        let (_, value) = pool.run(|| 21 * 2).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.available_slots(), 2);
    }

    #[tokio::test]
    async fn saturated_pool_times_out_with_typed_error() {
        let pool = BacktestPool::new(1).with_acquire_timeout(Duration::from_millis(50));

        // Hold the only slot with a slow job
        let permit = Arc::clone(&pool.semaphore).acquire_owned().await.unwrap();

        let err = pool.run(|| ()).await.unwrap_err();
        match err {
            BacktestPoolError::NoSlotAvailable { max_concurrent, .. } => {
                assert_eq!(max_concurrent, 1);
            }
            other => panic!("expected NoSlotAvailable, got {other:?}"),
        }
        drop(permit);

        // Slot freed: jobs run again
        assert!(pool.run(|| ()).await.is_ok());
    }

    #[tokio::test]
    async fn failed_job_surfaces_in_outcome() {
        let pool = BacktestPool::default();
        let outcome = pool
            .run_to_outcome(|| Err("bad data range".to_string()))
            .await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("bad data range"));
    }

    #[tokio::test]
    async fn concurrent_jobs_bounded() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let pool = Arc::new(BacktestPool::new(3));
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = Arc::clone(&pool);
            let peak = Arc::clone(&peak);
            let running = Arc::clone(&running);
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
