use crate::config::RefreshConfig;
use crate::metadata_store::StoreError;
use crate::metrics_defs::{POLICY_SYNC_DURATION, POLICY_SYNC_FAILURE, POLICY_SYNC_ROWS};
use crate::router::CanaryRouter;
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at, timeout};

#[derive(thiserror::Error, Debug)]
pub enum RefreshError {
    #[error("metadata store error: {0}")]
    Store(#[from] StoreError),
    #[error("metadata store did not answer within {0:?}")]
    Timeout(Duration),
    #[error("refresh loop is not running")]
    Stopped,
}

#[derive(Debug)]
pub enum Command {
    // Resync outside of the normal interval. The worker replies with the
    // number of documents merged.
    Refresh(oneshot::Sender<Result<usize, RefreshError>>),
    // Stop the worker after the current iteration.
    Shutdown,
}

/// Handle to the background task that keeps the router's index in step with
/// the metadata store.
pub struct RefreshLoop {
    router: Arc<CanaryRouter>,
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

impl RefreshLoop {
    /// Spawns the worker. The first load is bounded by the initial timeout;
    /// a failed or empty first load leaves the router serving an empty
    /// index, and it becomes ready either way.
    pub fn spawn(router: Arc<CanaryRouter>, config: RefreshConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Command>(64);
        let worker_router = router.clone();
        let handle = tokio::spawn(async move {
            run(worker_router, config, rx).await;
        });

        RefreshLoop { router, tx, handle }
    }

    pub fn is_ready(&self) -> bool {
        self.router.is_ready()
    }

    /// Triggers a resync and waits for its outcome.
    pub async fn refresh(&self) -> Result<usize, RefreshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Refresh(reply_tx))
            .await
            .map_err(|_| RefreshError::Stopped)?;
        reply_rx.await.map_err(|_| RefreshError::Stopped)?
    }

    pub async fn shutdown(self) {
        let _ = self.tx.send(Command::Shutdown).await;
        if let Err(err) = self.handle.await {
            tracing::error!(error = %err, "refresh loop terminated abnormally");
        }
    }
}

async fn run(router: Arc<CanaryRouter>, config: RefreshConfig, mut rx: mpsc::Receiver<Command>) {
    match sync_once(&router, config.initial_timeout()).await {
        Ok(count) => tracing::info!(count, "loaded policies"),
        Err(err) => tracing::warn!(
            error = %err,
            "initial policy load failed, starting with an empty index"
        ),
    }
    router.mark_ready();

    let period = config.interval();
    let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // The previous snapshot stays authoritative on failure.
                if let Err(err) = sync_once(&router, config.sync_timeout()).await {
                    tracing::warn!(error = %err, "failed to refresh policies");
                }
            }
            cmd = rx.recv() => match cmd {
                Some(Command::Refresh(reply)) => {
                    let _ = reply.send(sync_once(&router, config.sync_timeout()).await);
                }
                Some(Command::Shutdown) | None => {
                    tracing::info!("refresh loop stopped");
                    return;
                }
            }
        }
    }
}

async fn sync_once(router: &CanaryRouter, limit: Duration) -> Result<usize, RefreshError> {
    let start = Instant::now();
    let result = match timeout(limit, router.load_from_store()).await {
        Ok(Ok(count)) => Ok(count),
        Ok(Err(err)) => Err(RefreshError::Store(err)),
        Err(_) => Err(RefreshError::Timeout(limit)),
    };

    match &result {
        Ok(count) => {
            histogram!(POLICY_SYNC_DURATION).record(start.elapsed().as_secs_f64());
            histogram!(POLICY_SYNC_ROWS).record(*count as f64);
        }
        Err(_) => counter!(POLICY_SYNC_FAILURE).increment(1),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata_store::{MemoryStore, MetadataStore};
    use crate::negative_cache::NegativeCache;
    use crate::router::tests::rollout;
    use crate::types::{PolicyBundle, PolicyRef};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    fn config(interval_secs: u64) -> RefreshConfig {
        RefreshConfig {
            interval_secs,
            initial_timeout_secs: 5,
            sync_timeout_secs: 10,
            ..Default::default()
        }
    }

    /// Never answers.
    struct HangingStore;

    #[async_trait]
    impl MetadataStore for HangingStore {
        async fn list_all(&self) -> Result<Vec<PolicyBundle>, StoreError> {
            std::future::pending().await
        }

        async fn get(&self, reference: &PolicyRef) -> Result<PolicyBundle, StoreError> {
            Err(StoreError::NotFound(reference.to_string()))
        }

        async fn update_canary_percentage(
            &self,
            _reference: &PolicyRef,
            _percentage: u8,
            _updated_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unsupported("hanging"))
        }

        fn kind(&self) -> &'static str {
            "hanging"
        }
    }

    async fn wait_ready(refresh: &RefreshLoop) {
        while !refresh.is_ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_initial_load_and_refresh() {
        let store = Arc::new(MemoryStore::new(rollout()));
        let router = Arc::new(CanaryRouter::new(store.clone(), NegativeCache::default()));
        let refresh = RefreshLoop::spawn(router.clone(), config(30));

        wait_ready(&refresh).await;
        assert_eq!(router.len(), 2);

        store.insert(PolicyBundle::new("test-policy", "v3.0.0", "h3", 0));
        assert_eq!(refresh.refresh().await.unwrap(), 3);
        assert_eq!(router.list_versions("test-policy").unwrap().len(), 3);

        refresh.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_timeout_degrades() {
        let router = Arc::new(CanaryRouter::new(
            Arc::new(HangingStore),
            NegativeCache::default(),
        ));
        let refresh = RefreshLoop::spawn(router.clone(), config(30));

        // Paused time auto-advances past the 5s initial timeout.
        wait_ready(&refresh).await;
        assert!(router.is_empty());
        assert!(matches!(
            router.get_for_request("test-policy", 0),
            Err(crate::router::RouterError::PolicyNotFound(_))
        ));

        assert!(matches!(
            refresh.refresh().await,
            Err(RefreshError::Timeout(_))
        ));
        refresh.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh() {
        let store = Arc::new(MemoryStore::default());
        let router = Arc::new(CanaryRouter::new(store.clone(), NegativeCache::default()));
        let refresh = RefreshLoop::spawn(router.clone(), config(30));
        wait_ready(&refresh).await;
        assert!(router.is_empty());

        for bundle in rollout() {
            store.insert(bundle);
        }
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(router.len(), 2);

        refresh.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_after_shutdown() {
        let router = Arc::new(CanaryRouter::new(
            Arc::new(MemoryStore::default()),
            NegativeCache::default(),
        ));
        let refresh = RefreshLoop::spawn(router, config(30));
        let tx = refresh.tx.clone();
        refresh.shutdown().await;

        let (reply_tx, _reply_rx) = oneshot::channel();
        assert!(tx.send(Command::Refresh(reply_tx)).await.is_err());
    }
}
