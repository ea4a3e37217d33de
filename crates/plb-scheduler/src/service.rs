//! Async wrapper around the engine.
//!
//! `PlbService` keeps the `Plb` behind a mutex that is held only to queue
//! mutations, to plan a refresh and to fold its results back in. The
//! searches themselves run on the blocking pool, one task per domain, so
//! mutations and load queries proceed while they run. Time comes from an
//! injected `Clock`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info};

use plb_state::{NodeId, PartitionId, PendingUpdate};

use crate::engine::{DomainInfo, Plb, RefreshResult, SearchTask, TaskResult};
use crate::error::{SchedulerError, SchedulerResult};

/// Source of the logical time handed to the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Clock advanced by hand; for tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, at: Duration) {
        self.0.store(at.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.0.load(Ordering::SeqCst))
    }
}

/// Time elapsed since the clock was created.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

pub struct PlbService<C: Clock> {
    plb: Arc<Mutex<Plb>>,
    clock: Arc<C>,
}

impl<C: Clock> Clone for PlbService<C> {
    fn clone(&self) -> Self {
        Self {
            plb: Arc::clone(&self.plb),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<C: Clock + 'static> PlbService<C> {
    pub fn new(plb: Plb, clock: C) -> Self {
        Self {
            plb: Arc::new(Mutex::new(plb)),
            clock: Arc::new(clock),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Queue a mutation.
    pub async fn submit(&self, update: PendingUpdate) {
        self.plb.lock().await.submit(update);
    }

    pub async fn process_pending_updates(&self) -> bool {
        let now = self.clock.now();
        self.plb.lock().await.process_pending_updates_periodic_task(now)
    }

    /// Plan under the lock, search without it, then fold results back in.
    pub async fn refresh(&self) -> SchedulerResult<RefreshResult> {
        let now = self.clock.now();
        let tasks = self.plb.lock().await.begin_refresh(now);
        let results = Self::run_tasks(tasks).await?;
        Ok(self.plb.lock().await.finish_refresh(now, results))
    }

    /// Start a refresh and hand back its running searches.
    ///
    /// Lets a caller interleave mutations with the searches before calling
    /// `finish`.
    pub async fn begin(&self) -> PendingRefresh {
        let now = self.clock.now();
        let tasks = self.plb.lock().await.begin_refresh(now);
        let mut set = JoinSet::new();
        for task in tasks {
            set.spawn_blocking(move || task.run());
        }
        PendingRefresh { now, set }
    }

    pub async fn finish(&self, pending: PendingRefresh) -> SchedulerResult<RefreshResult> {
        let results = join_all(pending.set).await?;
        Ok(self.plb.lock().await.finish_refresh(pending.now, results))
    }

    async fn run_tasks(tasks: Vec<SearchTask>) -> SchedulerResult<Vec<TaskResult>> {
        let mut set = JoinSet::new();
        for task in tasks {
            debug!(domain = %task.domain(), phases = ?task.kinds(), "search started");
            set.spawn_blocking(move || task.run());
        }
        join_all(set).await
    }

    // ── Queries ────────────────────────────────────────────────────

    pub async fn node_load(&self, node: NodeId, metric: &str) -> u64 {
        self.plb.lock().await.node_load(node, metric)
    }

    pub async fn node_loads(&self, node: NodeId) -> BTreeMap<String, u64> {
        self.plb.lock().await.node_loads(node)
    }

    pub async fn cluster_load(&self, metric: &str) -> u64 {
        self.plb.lock().await.cluster_load(metric)
    }

    pub async fn service_domains(&self) -> Vec<DomainInfo> {
        self.plb.lock().await.service_domains()
    }

    pub async fn partition(&self, id: PartitionId) -> Option<plb_state::FailoverUnitDescription> {
        self.plb.lock().await.partition(id).cloned()
    }

    /// Run the commit and refresh loop until shutdown.
    ///
    /// Non-empty refresh results are published on `results`; the loop stops
    /// when the receiver is dropped.
    pub async fn run(
        self,
        tick: Duration,
        results: mpsc::Sender<RefreshResult>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(tick_ms = tick.as_millis() as u64, "plb service started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    self.process_pending_updates().await;
                    match self.refresh().await {
                        Ok(result) if result.is_empty() => {}
                        Ok(result) => {
                            if results.send(result).await.is_err() {
                                info!("result receiver dropped, plb service stopping");
                                break;
                            }
                        }
                        Err(e) => error!(error = %e, "refresh failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("plb service shutting down");
                    break;
                }
            }
        }
    }
}

/// Searches of a refresh that are still running.
pub struct PendingRefresh {
    now: Duration,
    set: JoinSet<TaskResult>,
}

impl PendingRefresh {
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

async fn join_all(mut set: JoinSet<TaskResult>) -> SchedulerResult<Vec<TaskResult>> {
    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        results.push(joined.map_err(|e| SchedulerError::Task(e.to_string()))?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plb_core::PlbConfig;
    use plb_state::*;
    use uuid::Uuid;

    fn stateful_partition(id: u128, primary: NodeId, secondary: NodeId) -> FailoverUnitDescription {
        FailoverUnitDescription::new(Uuid::from_u128(id), "svc", 1).with_replicas(vec![
            ReplicaDescription::primary(primary),
            ReplicaDescription::secondary(secondary),
        ])
    }

    async fn seeded_service() -> PlbService<ManualClock> {
        let service = PlbService::new(Plb::new(PlbConfig::default()).unwrap(), ManualClock::new());
        for id in 0..3 {
            let mut node = NodeDescription::new(id);
            node.fault_domain = vec![format!("fd{id}")];
            node.upgrade_domain = format!("ud{id}");
            service.submit(PendingUpdate::Node(node)).await;
        }
        service
            .submit(PendingUpdate::Service(ServiceDescription::new("svc", "T", true)))
            .await;
        for id in 0..4 {
            service
                .submit(PendingUpdate::FailoverUnit(stateful_partition(id, 0, 1)))
                .await;
        }
        service
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(2));
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), Duration::from_millis(2500));
        clock.set(Duration::from_secs(1));
        assert_eq!(clock.now(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn refresh_runs_searches_in_background() {
        let service = seeded_service().await;
        let result = service.refresh().await.unwrap();
        assert!(!result.is_empty());
        assert_eq!(service.service_domains().await.len(), 1);
        assert_eq!(service.node_load(0, "PrimaryCount").await, 4);
    }

    #[tokio::test]
    async fn run_loop_publishes_and_stops() {
        let service = seeded_service().await;
        let (tx, mut rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(service.clone().run(Duration::from_millis(5), tx, shutdown_rx));

        let first = rx.recv().await.unwrap();
        assert!(first.action_count() > 0);
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
