use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::InstanceKey;
use crate::strategy::StrategyStatus;
use crate::{Error, Result};

struct WorkerRecord {
    cancel: CancellationToken,
    /// Cancelled when the worker future is dropped, whether it returned or panicked
    done: CancellationToken,
    handle: JoinHandle<()>,
    status: watch::Receiver<StrategyStatus>,
    started_at: DateTime<Utc>,
    last_tick: Option<DateTime<Utc>>,
}

impl WorkerRecord {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// What the registry knows about one worker at a point in time
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub status: StrategyStatus,
    pub started_at: DateTime<Utc>,
    pub last_tick: Option<DateTime<Utc>>,
    pub alive: bool,
}

/// Result of stopping every worker
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StopAllReport {
    pub stopped: Vec<InstanceKey>,
    pub still_running: Vec<InstanceKey>,
}

/// Registry of running workers, keyed by instance
///
/// The lock is held only for map operations, never across an await.
/// Cloning shares the registry.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<Mutex<HashMap<InstanceKey, WorkerRecord>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InstanceKey, WorkerRecord>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if a worker holds `key` and has not finished
    pub fn is_running(&self, key: &InstanceKey) -> bool {
        self.lock().get(key).is_some_and(WorkerRecord::is_live)
    }

    /// Spawn the future built by `worker` as the task for `key`
    ///
    /// Fails with [`Error::AlreadyRunning`] if a live worker holds the key.
    /// A record left behind by a finished worker is replaced.
    pub fn spawn<F, Fut>(
        &self,
        key: InstanceKey,
        status: watch::Receiver<StrategyStatus>,
        worker: F,
    ) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut workers = self.lock();

        if let Some(existing) = workers.get(&key) {
            if existing.is_live() {
                return Err(Error::AlreadyRunning);
            }
            tracing::warn!("Replacing finished worker for {}", key);
        }

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let future = worker(cancel.clone());
        let guard = done.clone().drop_guard();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            future.await;
        });

        workers.insert(
            key,
            WorkerRecord {
                cancel,
                done,
                handle,
                status,
                started_at: Utc::now(),
                last_tick: None,
            },
        );

        Ok(())
    }

    /// Signal the worker and wait up to `timeout` for it to finish
    ///
    /// The record is removed only once the worker has finished. On timeout
    /// it stays registered so the stop can be retried.
    pub async fn stop(&self, key: &InstanceKey, timeout: Duration) -> Result<()> {
        let (cancel, done) = {
            let workers = self.lock();
            let record = workers.get(key).ok_or(Error::NotRunning)?;
            (record.cancel.clone(), record.done.clone())
        };

        cancel.cancel();

        if tokio::time::timeout(timeout, done.cancelled()).await.is_err() {
            tracing::warn!("{} still alive after {:?}", key, timeout);
            return Err(Error::StopTimeout(timeout.as_millis() as u64));
        }

        self.lock().remove(key);
        tracing::info!("Worker stopped for {}", key);

        Ok(())
    }

    /// Signal every worker, then wait up to `timeout` for each
    pub async fn stop_all(&self, timeout: Duration) -> StopAllReport {
        let targets: Vec<(InstanceKey, CancellationToken)> = {
            let workers = self.lock();
            workers
                .iter()
                .map(|(key, record)| {
                    record.cancel.cancel();
                    (key.clone(), record.done.clone())
                })
                .collect()
        };

        let mut report = StopAllReport::default();
        for (key, done) in targets {
            if tokio::time::timeout(timeout, done.cancelled()).await.is_ok() {
                self.lock().remove(&key);
                report.stopped.push(key);
            } else {
                tracing::warn!("{} still alive after {:?}", key, timeout);
                report.still_running.push(key);
            }
        }

        report.stopped.sort();
        report.still_running.sort();
        report
    }

    /// Record that a tick was just consumed for `key`
    pub fn touch(&self, key: &InstanceKey, at: DateTime<Utc>) {
        if let Some(record) = self.lock().get_mut(key) {
            record.last_tick = Some(at);
        }
    }

    pub fn snapshot(&self, key: &InstanceKey) -> Option<WorkerSnapshot> {
        self.lock().get(key).map(|record| WorkerSnapshot {
            status: record.status.borrow().clone(),
            started_at: record.started_at,
            last_tick: record.last_tick,
            alive: record.is_live(),
        })
    }

    /// All registered keys, sorted
    pub fn keys(&self) -> Vec<InstanceKey> {
        let mut keys: Vec<InstanceKey> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{PositionManager, TradeLog};
    use crate::strategy::{TradingEngine, TrailingStopStrategy};
    use tempfile::tempdir;

    fn status_channel(key: &InstanceKey) -> (watch::Sender<StrategyStatus>, watch::Receiver<StrategyStatus>) {
        let dir = tempdir().unwrap();
        let engine = TradingEngine::new(
            &key.symbol,
            &key.owner,
            Box::new(TrailingStopStrategy::default()),
            PositionManager::new(dir.path(), &key.owner, &key.symbol),
            TradeLog::new(dir.path(), &key.owner, &key.symbol),
            None,
            86_400,
        );
        watch::channel(engine.status())
    }

    fn spawn_cooperative(registry: &WorkerRegistry, key: &InstanceKey) -> Result<()> {
        let (_tx, rx) = status_channel(key);
        registry.spawn(key.clone(), rx, |cancel| async move {
            cancel.cancelled().await;
        })
    }

    #[tokio::test]
    async fn test_duplicate_spawn_is_rejected() {
        let registry = WorkerRegistry::new();
        let key = InstanceKey::new("SOL/USD", "alice");

        spawn_cooperative(&registry, &key).unwrap();
        let err = spawn_cooperative(&registry, &key).unwrap_err();

        assert!(matches!(err, Error::AlreadyRunning));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_same_symbol_different_owners() {
        let registry = WorkerRegistry::new();

        spawn_cooperative(&registry, &InstanceKey::new("SOL/USD", "alice")).unwrap();
        spawn_cooperative(&registry, &InstanceKey::new("SOL/USD", "bob")).unwrap();

        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_unknown_key() {
        let registry = WorkerRegistry::new();
        let err = registry
            .stop(&InstanceKey::new("SOL/USD", "alice"), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotRunning));
    }

    #[tokio::test]
    async fn test_stop_removes_cooperative_worker() {
        let registry = WorkerRegistry::new();
        let key = InstanceKey::new("SOL/USD", "alice");
        spawn_cooperative(&registry, &key).unwrap();

        registry.stop(&key, Duration::from_secs(1)).await.unwrap();

        assert!(registry.is_empty());
        assert!(!registry.is_running(&key));
    }

    #[tokio::test]
    async fn test_stop_timeout_keeps_record() {
        let registry = WorkerRegistry::new();
        let key = InstanceKey::new("SOL/USD", "alice");
        let (_tx, rx) = status_channel(&key);

        // ignores its stop signal
        registry
            .spawn(key.clone(), rx, |_cancel| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .unwrap();

        let err = registry.stop(&key, Duration::from_millis(50)).await.unwrap_err();

        assert!(matches!(err, Error::StopTimeout(50)));
        assert!(registry.is_running(&key));
        assert_eq!(registry.keys(), vec![key]);
    }

    #[tokio::test]
    async fn test_finished_worker_can_be_replaced() {
        let registry = WorkerRegistry::new();
        let key = InstanceKey::new("SOL/USD", "alice");
        let (_tx, rx) = status_channel(&key);

        registry.spawn(key.clone(), rx, |_cancel| async {}).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!registry.is_running(&key));
        assert!(!registry.snapshot(&key).unwrap().alive);

        spawn_cooperative(&registry, &key).unwrap();
        assert!(registry.is_running(&key));
    }

    #[tokio::test]
    async fn test_panicking_worker_still_counts_as_done() {
        let registry = WorkerRegistry::new();
        let key = InstanceKey::new("SOL/USD", "alice");
        let (_tx, rx) = status_channel(&key);

        registry
            .spawn(key.clone(), rx, |cancel| async move {
                cancel.cancelled().await;
                panic!("worker blew up");
            })
            .unwrap();

        registry.stop(&key, Duration::from_secs(1)).await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stop_all_partitions_results() {
        let registry = WorkerRegistry::new();
        let good = InstanceKey::new("ETH/USD", "alice");
        let stuck = InstanceKey::new("SOL/USD", "alice");

        spawn_cooperative(&registry, &good).unwrap();
        let (_tx, rx) = status_channel(&stuck);
        registry
            .spawn(stuck.clone(), rx, |_cancel| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .unwrap();

        let report = registry.stop_all(Duration::from_millis(100)).await;

        assert_eq!(report.stopped, vec![good]);
        assert_eq!(report.still_running, vec![stuck.clone()]);
        assert_eq!(registry.keys(), vec![stuck]);
    }

    #[tokio::test]
    async fn test_touch_records_last_tick() {
        let registry = WorkerRegistry::new();
        let key = InstanceKey::new("SOL/USD", "alice");
        spawn_cooperative(&registry, &key).unwrap();
        assert_eq!(registry.snapshot(&key).unwrap().last_tick, None);

        let at = Utc::now();
        registry.touch(&key, at);

        let snapshot = registry.snapshot(&key).unwrap();
        assert_eq!(snapshot.last_tick, Some(at));
        assert!(snapshot.alive);
        assert_eq!(snapshot.status.symbol, "SOL/USD");
    }
}
