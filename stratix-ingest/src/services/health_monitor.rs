//! Health Monitor
//!
//! Reports real connectivity of the relational store and the object storage
//! plus pipeline backlog. Every poll runs live probes; nothing is reported
//! healthy by default.
//!
//! State lives in an injected [`HealthRegistry`] handle rather than a
//! process-wide global, so tests can create and reset their own.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use stratix_common::events::{EventBus, StratixEvent};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{CircuitState, Dependency, DependencyHealth, HealthSnapshot, QueueDepth};
use crate::storage::ObjectStore;

#[derive(Debug, Default, Clone)]
struct RegistryState {
    relational_store: DependencyHealth,
    object_storage: DependencyHealth,
}

impl RegistryState {
    fn entry(&mut self, dependency: Dependency) -> &mut DependencyHealth {
        match dependency {
            Dependency::RelationalStore => &mut self.relational_store,
            Dependency::ObjectStorage => &mut self.object_storage,
        }
    }
}

/// Shared, injectable dependency health state
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything learned so far
    pub fn reset(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = RegistryState::default();
    }

    pub fn get(&self, dependency: Dependency) -> DependencyHealth {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        match dependency {
            Dependency::RelationalStore => state.relational_store.clone(),
            Dependency::ObjectStorage => state.object_storage.clone(),
        }
    }

    pub fn record_success(&self, dependency: Dependency, latency: Duration) {
        self.update(dependency, |health| {
            health.reachable = true;
            health.last_success = Some(Utc::now());
            health.last_error = None;
            health.latency_ms = Some(latency.as_millis() as u64);
        });
    }

    pub fn record_failure(&self, dependency: Dependency, error: &str) {
        self.update(dependency, |health| {
            health.reachable = false;
            health.last_failure = Some(Utc::now());
            health.last_error = Some(error.to_string());
        });
    }

    pub fn set_circuit(&self, dependency: Dependency, circuit: CircuitState) {
        self.update(dependency, |health| health.circuit = circuit);
    }

    fn update(&self, dependency: Dependency, f: impl FnOnce(&mut DependencyHealth)) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(state.entry(dependency));
    }
}

/// Pipeline backlog counters shared by the import service and orchestrators
#[derive(Debug, Clone, Default)]
pub struct QueueGauge {
    queued_jobs: Arc<AtomicU64>,
    active_jobs: Arc<AtomicU64>,
    pending_batches: Arc<AtomicU64>,
}

fn decrement(counter: &AtomicU64, by: u64) {
    let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
        Some(v.saturating_sub(by))
    });
}

impl QueueGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_queued(&self) {
        self.queued_jobs.fetch_add(1, Ordering::SeqCst);
    }

    /// A queued job acquired a slot
    pub fn job_started(&self) {
        decrement(&self.queued_jobs, 1);
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
    }

    /// A queued job was cancelled before acquiring a slot
    pub fn job_dequeued(&self) {
        decrement(&self.queued_jobs, 1);
    }

    pub fn job_finished(&self) {
        decrement(&self.active_jobs, 1);
    }

    pub fn batches_planned(&self, count: u64) {
        self.pending_batches.fetch_add(count, Ordering::SeqCst);
    }

    /// Batches committed, rolled back or abandoned
    pub fn batches_settled(&self, count: u64) {
        decrement(&self.pending_batches, count);
    }

    pub fn snapshot(&self) -> QueueDepth {
        QueueDepth {
            queued_jobs: self.queued_jobs.load(Ordering::SeqCst),
            active_jobs: self.active_jobs.load(Ordering::SeqCst),
            pending_batches: self.pending_batches.load(Ordering::SeqCst),
        }
    }
}

/// Probes dependencies and assembles [`HealthSnapshot`]s
pub struct HealthMonitor {
    pool: SqlitePool,
    store: Arc<dyn ObjectStore>,
    registry: HealthRegistry,
    gauge: QueueGauge,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(
        pool: SqlitePool,
        store: Arc<dyn ObjectStore>,
        registry: HealthRegistry,
        gauge: QueueGauge,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            store,
            registry,
            gauge,
            probe_timeout,
        }
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Last known state without probing
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot::new(
            self.registry.get(Dependency::RelationalStore),
            self.registry.get(Dependency::ObjectStorage),
            self.gauge.snapshot(),
        )
    }

    /// Probe both dependencies now and return the fresh snapshot
    pub async fn probe_all(&self) -> HealthSnapshot {
        let (db, storage) = tokio::join!(self.probe_relational(), self.probe_storage());
        self.apply(Dependency::RelationalStore, db);
        self.apply(Dependency::ObjectStorage, storage);
        self.snapshot()
    }

    async fn probe_relational(&self) -> Result<Duration, String> {
        let started = Instant::now();
        match tokio::time::timeout(
            self.probe_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        {
            Ok(Ok(_)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "probe timed out after {}ms",
                self.probe_timeout.as_millis()
            )),
        }
    }

    async fn probe_storage(&self) -> Result<Duration, String> {
        let started = Instant::now();
        match tokio::time::timeout(self.probe_timeout, self.store.probe()).await {
            Ok(Ok(())) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "probe timed out after {}ms",
                self.probe_timeout.as_millis()
            )),
        }
    }

    fn apply(&self, dependency: Dependency, result: Result<Duration, String>) {
        match result {
            Ok(latency) => {
                debug!(dependency = %dependency, latency_ms = latency.as_millis() as u64, "Probe succeeded");
                self.registry.record_success(dependency, latency);
            }
            Err(error) => {
                warn!(dependency = %dependency, error = %error, "Probe failed");
                self.registry.record_failure(dependency, &error);
            }
        }
    }

    /// Poll on an interval, announcing reachability changes on the event bus
    pub fn spawn_poller(
        self: Arc<Self>,
        interval: Duration,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut previous: Option<(bool, bool)> = None;

            info!(interval_ms = interval.as_millis() as u64, "Health poller started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let snapshot = self.probe_all().await;
                let current = (
                    snapshot.relational_store.reachable,
                    snapshot.object_storage.reachable,
                );
                let changes = [
                    (
                        Dependency::RelationalStore,
                        previous.map(|p| p.0),
                        &snapshot.relational_store,
                    ),
                    (
                        Dependency::ObjectStorage,
                        previous.map(|p| p.1),
                        &snapshot.object_storage,
                    ),
                ];
                for (dependency, before, now) in changes {
                    // First poll only announces problems
                    let changed = match before {
                        Some(before) => before != now.reachable,
                        None => !now.reachable,
                    };
                    if changed {
                        info!(dependency = %dependency, reachable = now.reachable, "Dependency health changed");
                        events.emit_lossy(StratixEvent::DependencyHealthChanged {
                            dependency: dependency.as_str().to_string(),
                            reachable: now.reachable,
                            error: now.last_error.clone(),
                            timestamp: Utc::now(),
                        });
                    }
                }
                previous = Some(current);
            }
            info!("Health poller stopped");
        })
    }
}
