// Per-provider dispatch queue.
//
// One limiter per provider, owned by an explicitly constructed registry.
// A single worker task drains a bounded FIFO queue and spaces dispatch starts
// at least `1000ms / requests_per_second` apart. State is in-memory only
// (resets on restart).

use crate::config::{RateLimitConfig, RateLimitsConfig};
use crate::error::{Error, Result};
use crate::provider::Provider;
use anyhow::anyhow;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error};

type Job = BoxFuture<'static, ()>;

/// Rate-limited FIFO dispatcher for one provider.
///
/// Tasks run one at a time, in submission order. Once submitted a task cannot
/// be withdrawn; dropping its [`Ticket`] only discards the outcome.
pub struct RateLimiter {
    provider: Provider,
    min_interval: Duration,
    capacity: usize,
    task_timeout: Option<Duration>,
    sender: mpsc::Sender<Job>,
}

/// Handle to the outcome of a submitted task.
pub struct Ticket<T> {
    provider: Provider,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Ticket<T> {
    /// Waits for the task to be dispatched and complete.
    pub async fn outcome(self) -> Result<T> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Backend(anyhow!(
                "{} rate limiter stopped before the task completed",
                self.provider
            ))),
        }
    }
}

impl RateLimiter {
    /// Creates a limiter and spawns its worker. Must be called within a Tokio runtime.
    pub fn new(provider: Provider, config: &RateLimitConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let min_interval = config.min_interval();
        let (sender, receiver) = mpsc::channel(capacity);

        tokio::spawn(run_worker(provider, min_interval, receiver));

        Self {
            provider,
            min_interval,
            capacity,
            task_timeout: config.task_timeout(),
            sender,
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Number of tasks waiting to be dispatched.
    pub fn queued(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    /// Enqueues `task` without waiting for it.
    ///
    /// Fails immediately with [`Error::QueueFull`] when the queue is at capacity.
    pub fn submit<F, T>(&self, task: F) -> Result<Ticket<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let provider = self.provider;
        let timeout = self.task_timeout;

        let job = async move {
            let guarded = AssertUnwindSafe(task).catch_unwind();
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(outcome) => outcome,
                    Err(_) => Ok(Err(Error::TaskTimeout {
                        provider,
                        timeout: limit,
                    })),
                },
                None => guarded.await,
            };
            // A panic fails only this task's ticket; the worker keeps draining.
            let outcome = outcome.unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                error!(provider = %provider, panic = %message, "Rate-limited task panicked");
                Err(Error::Backend(anyhow!(
                    "{} rate-limited task panicked: {}",
                    provider,
                    message
                )))
            });
            // Receiver gone means the caller stopped waiting.
            let _ = tx.send(outcome);
        }
        .boxed();

        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::QueueFull {
                provider,
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => {
                Error::Backend(anyhow!("{} rate limiter is not running", provider))
            }
        })?;

        Ok(Ticket { provider, rx })
    }

    /// Enqueues `task` and resolves with that task's own outcome.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(task)?.outcome().await
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn run_worker(provider: Provider, min_interval: Duration, mut receiver: mpsc::Receiver<Job>) {
    let mut last_dispatch: Option<Instant> = None;

    while let Some(job) = receiver.recv().await {
        if let Some(last) = last_dispatch {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                let wait = min_interval - elapsed;
                debug!(
                    provider = %provider,
                    wait_ms = wait.as_millis() as u64,
                    "Spacing dispatch"
                );
                tokio::time::sleep(wait).await;
            }
        }
        last_dispatch = Some(Instant::now());
        job.await;
    }

    debug!(provider = %provider, "Rate limiter queue closed");
}

/// Owns one [`RateLimiter`] per provider.
///
/// Limiters are created lazily on first use from the registry's configuration.
pub struct RateLimiterRegistry {
    config: RateLimitsConfig,
    limiters: DashMap<Provider, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new(config: RateLimitsConfig) -> Self {
        Self {
            config,
            limiters: DashMap::new(),
        }
    }

    /// Returns the provider's limiter, creating it on first use.
    pub fn get(&self, provider: Provider) -> Arc<RateLimiter> {
        let limiter = self
            .limiters
            .entry(provider)
            .or_insert_with(|| Arc::new(RateLimiter::new(provider, self.config.get(provider))));
        Arc::clone(&limiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn config(requests_per_second: u32, queue_capacity: usize, timeout: Option<u64>) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second,
            queue_capacity,
            task_timeout_secs: timeout,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order_and_spacing() {
        let limiter = RateLimiter::new(Provider::Airtable, &config(5, 16, None));
        let starts: Arc<Mutex<Vec<(usize, Instant)>>> = Arc::new(Mutex::new(Vec::new()));
        let begin = Instant::now();

        let mut tickets = Vec::new();
        for i in 0..5 {
            let starts = Arc::clone(&starts);
            tickets.push(
                limiter
                    .submit(async move {
                        starts.lock().unwrap().push((i, Instant::now()));
                        Ok(i)
                    })
                    .unwrap(),
            );
        }

        for (i, ticket) in tickets.into_iter().enumerate() {
            assert_eq!(ticket.outcome().await.unwrap(), i);
        }

        let starts = starts.lock().unwrap();
        let order: Vec<usize> = starts.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        for pair in starts.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(200));
        }
        assert!(begin.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_after_idle_period() {
        let limiter = RateLimiter::new(Provider::Airtable, &config(5, 16, None));
        limiter.execute(async { Ok(()) }).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let before = Instant::now();
        limiter.execute(async { Ok(()) }).await.unwrap();
        assert!(before.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_error_is_returned_to_caller() {
        let limiter = RateLimiter::new(Provider::GoogleSheets, &config(10, 4, None));
        let result: Result<()> = limiter
            .execute(async { Err(Error::Config("boom".to_string())) })
            .await;
        assert!(matches!(result, Err(Error::Config(msg)) if msg == "boom"));

        // Worker keeps running after a failed task.
        assert_eq!(limiter.execute(async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_does_not_stop_worker() {
        let limiter = RateLimiter::new(Provider::Airtable, &config(10, 4, Some(5)));

        async fn explode() -> Result<()> {
            panic!("task blew up")
        }

        match limiter.execute(explode()).await {
            Err(Error::Backend(err)) => assert!(err.to_string().contains("task blew up")),
            other => panic!("expected a backend error, got {:?}", other),
        }

        assert_eq!(limiter.execute(async { Ok(1) }).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full() {
        let limiter = RateLimiter::new(Provider::Airtable, &config(5, 1, None));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // First task is taken by the worker and blocks it.
        let first = limiter
            .submit(async move {
                let _ = release_rx.await;
                Ok(1)
            })
            .unwrap();
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        let second = limiter.submit(async { Ok(2) }).unwrap();
        assert_eq!(limiter.queued(), 1);

        let third = limiter.submit(async { Ok(3) });
        assert!(matches!(
            third,
            Err(Error::QueueFull {
                provider: Provider::Airtable,
                capacity: 1
            })
        ));

        release_tx.send(()).unwrap();
        assert_eq!(first.outcome().await.unwrap(), 1);
        assert_eq!(second.outcome().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_frees_worker() {
        let limiter = RateLimiter::new(Provider::GoogleSheets, &config(10, 4, Some(1)));

        let slow = limiter.submit(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
        let fast = limiter.submit(async { Ok("fast") });

        let err = slow.unwrap().outcome().await.unwrap_err();
        assert!(matches!(err, Error::TaskTimeout { .. }));
        assert_eq!(fast.unwrap().outcome().await.unwrap(), "fast");
    }

    #[tokio::test]
    async fn test_registry_one_limiter_per_provider() {
        let registry = RateLimiterRegistry::new(RateLimitsConfig::default());
        let a = registry.get(Provider::Airtable);
        let b = registry.get(Provider::Airtable);
        let c = registry.get(Provider::GoogleSheets);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.provider(), Provider::GoogleSheets);
        assert_eq!(a.min_interval(), Duration::from_millis(200));
    }
}
