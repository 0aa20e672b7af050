//! Bounded, cancellable execution of independent work items

use crate::error::Error;
use crate::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Default number of concurrent workers
pub const DEFAULT_CONCURRENCY: usize = 100;

/// Default delay each worker waits before its first network call
pub const DEFAULT_STAGGER: Duration = Duration::from_secs(2);

/// Configuration for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum number of work items in flight
    pub concurrency: usize,
    /// Startup delay per worker, spreads connection bursts
    pub stagger: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            stagger: DEFAULT_STAGGER,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }
}

/// Dispatches work items to a bounded set of workers.
///
/// Each item runs on exactly one worker; outcomes come back in completion
/// order. Once the token is cancelled no further item is dispatched, workers
/// still waiting to start return without doing any work, and workers already
/// running are awaited. A cancelled run ends in [`Error::Cancelled`].
pub struct Coordinator {
    config: CoordinatorConfig,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `work(position, item, token)` for every item.
    ///
    /// `position` is the dispatch index. The token lets a unit stop between
    /// its own attempts.
    pub async fn run<T, O, F, Fut>(&self, items: Vec<T>, work: F) -> Result<Vec<O>>
    where
        T: Send + 'static,
        O: Send + 'static,
        F: Fn(usize, T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
    {
        let total = items.len();
        let work = Arc::new(work);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut outcomes = Vec::with_capacity(total);

        for (position, item) in items.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if self.cancel.is_cancelled() {
                break;
            }

            let work = Arc::clone(&work);
            let cancel = self.cancel.clone();
            let stagger = self.config.stagger;

            set.spawn(async move {
                let _permit = permit; // held until the unit settles

                if !stagger.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(stagger) => {}
                    }
                }
                if cancel.is_cancelled() {
                    return None;
                }

                Some(work(position, item, cancel).await)
            });

            while let Some(joined) = set.try_join_next() {
                collect(joined, &mut outcomes);
            }
        }

        while let Some(joined) = set.join_next().await {
            collect(joined, &mut outcomes);
        }

        if self.cancel.is_cancelled() {
            debug!("Cancelled with {} of {} items settled", outcomes.len(), total);
            return Err(Error::Cancelled {
                finished: outcomes.len(),
                total,
            });
        }

        Ok(outcomes)
    }
}

fn collect<O>(joined: std::result::Result<Option<O>, JoinError>, outcomes: &mut Vec<O>) {
    match joined {
        Ok(Some(outcome)) => outcomes.push(outcome),
        Ok(None) => {}
        Err(e) => error!("Worker task failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator(concurrency: usize) -> Coordinator {
        Coordinator::new(
            CoordinatorConfig::new()
                .with_concurrency(concurrency)
                .with_stagger(Duration::ZERO),
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_config_default() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.stagger, DEFAULT_STAGGER);
        assert_eq!(CoordinatorConfig::new().with_concurrency(0).concurrency, 1);
    }

    #[tokio::test]
    async fn test_every_item_runs_once() {
        let outcomes = coordinator(4)
            .run((0..20).collect(), |_, item: u32, _| async move { item * 2 })
            .await
            .unwrap();

        let mut sorted = outcomes;
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_positions_are_dispatch_indices() {
        let items = vec!["a", "b", "c"];
        let mut outcomes = coordinator(2)
            .run(items, |position, item, _| async move { (position, item) })
            .await
            .unwrap();
        outcomes.sort_unstable();
        assert_eq!(outcomes, vec![(0, "a"), (1, "b"), (2, "c")]);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let outcomes: Vec<u8> = coordinator(4)
            .run(Vec::<u8>::new(), |_, item, _| async move { item })
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_dispatches_nothing() {
        let coordinator = coordinator(4);
        coordinator.cancel_token().cancel();

        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let result = coordinator
            .run((0..10).collect::<Vec<u32>>(), move |_, _, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled { finished: 0, total: 10 })));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_stagger_skips_work() {
        let coordinator = Coordinator::new(
            CoordinatorConfig::new()
                .with_concurrency(10)
                .with_stagger(Duration::from_secs(30)),
            CancellationToken::new(),
        );
        let token = coordinator.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);
        let result = coordinator
            .run((0..5).collect::<Vec<u32>>(), move |_, _, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled { finished: 0, total: 5 })));
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_worker_does_not_sink_run() {
        let outcomes = coordinator(2)
            .run(vec![1u32, 2, 3], |_, item, _| async move {
                if item == 2 {
                    panic!("worker blew up");
                }
                item
            })
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
    }
}
