use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Runs blocking inference off the async dispatcher, with admission control.
///
/// At most `max_concurrent` closures run at once; further callers wait for a
/// permit. The permit moves into the blocking task, so a caller that gives up
/// on a timeout does not free capacity until the work actually finishes.
#[derive(Clone, Debug)]
pub struct InferencePool {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    timeout: Option<Duration>,
}

impl InferencePool {
    pub fn new(max_concurrent: usize, timeout: Option<Duration>) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            timeout,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Runs `work` once a permit is free.
    ///
    /// With a timeout configured, one deadline covers both the wait for a
    /// permit and the work itself.
    pub async fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let deadline = self.timeout.map(|limit| (Instant::now() + limit, limit));

        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match deadline {
            Some((at, limit)) => match tokio::time::timeout_at(at, acquire).await {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(?limit, "Timed out waiting for an inference slot");
                    return Err(Error::Timeout(limit));
                }
            },
            None => acquire.await,
        }
        .map_err(|_| Error::PoolClosed)?;
        debug!(available = self.permits.available_permits(), "Dispatching inference task");

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work()
        });

        let joined = match deadline {
            Some((at, limit)) => match tokio::time::timeout_at(at, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(?limit, "Inference exceeded the generation timeout");
                    return Err(Error::Timeout(limit));
                }
            },
            None => task.await,
        };
        joined?
    }

    /// Runs CPU-bound pre/post-processing on the blocking pool without
    /// taking a generation permit.
    pub async fn offload<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(work).await?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_the_concurrency_cap() {
        let pool = InferencePool::new(2, None);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn timeout_reports_fault_and_keeps_permit_until_work_ends() {
        let pool = InferencePool::new(1, Some(Duration::from_millis(20)));
        let started = Instant::now();
        let err = pool
            .run(|| {
                std::thread::sleep(Duration::from_millis(150));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(pool.available(), 0);

        // the abandoned work frees its permit only once it finishes
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.available(), 1);
        pool.run(|| Ok(())).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queued_caller_times_out_behind_busy_permits() {
        let pool = InferencePool::new(2, Some(Duration::from_millis(50)));
        let mut busy = Vec::new();
        for _ in 0..2 {
            let pool = pool.clone();
            busy.push(tokio::spawn(async move {
                pool.run(|| {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(())
                })
                .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.available(), 0);

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let started = Instant::now();
        let err = pool
            .run(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, Error::Timeout(_)));
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(150), "waited {waited:?}");
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        for handle in busy {
            assert!(matches!(handle.await.unwrap(), Err(Error::Timeout(_))));
        }
    }

    #[tokio::test]
    async fn propagates_closure_errors() {
        let pool = InferencePool::new(1, None);
        let err = pool
            .run(|| -> Result<()> { Err(Error::Inference(anyhow::anyhow!("boom"))) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
        assert_eq!(pool.available(), 1);
    }
}
