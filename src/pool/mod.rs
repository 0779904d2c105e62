//! Worker-pool lifecycle management
//!
//! The [`PoolManager`] owns the set of live [`WorkerHandle`]s. It spawns
//! workers with a memory budget, wires each one into the broadcast mesh,
//! drains their lifecycle events on a single control loop, performs rolling
//! restarts bounded by a maximum number of simultaneously-down workers, and
//! replaces crashed workers up to a per-slot retry ceiling.

pub mod handle;
pub(crate) mod idle;
pub mod mesh;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::budget::MemoryBudget;
use crate::message::{Envelope, MeshMessage};
use crate::worker::{ThreadLauncher, WorkerContext, WorkerLauncher, WorkerService};

pub use handle::{WorkerHandle, WorkerId, WorkerOptions, WorkerState, COORDINATOR};

use handle::LifecycleEvent;
use mesh::{BroadcastMesh, MeshPacket};

/// Consecutive unrequested exits tolerated for one logical slot before the
/// supervisor stops replacing it. Bounds crash-loop CPU and log volume.
pub const MAX_UNEXPECTED_RESTARTS: u32 = 50;

/// Default bound on simultaneously-down workers during a rolling restart.
pub const DEFAULT_MAX_WORKERS_DOWN: f64 = 2.0;

/// Errors from pool operations
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("no live worker {0}")]
    NoSuchWorker(WorkerId),
}

/// What it takes to start one worker; retained per slot so crash replacements
/// and rolling-restart replacements reuse the original service and options.
struct WorkerSpec {
    service: Arc<dyn WorkerService>,
    options: WorkerOptions,
}

impl Clone for WorkerSpec {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
            options: self.options.clone(),
        }
    }
}

/// Owns the live worker set and the mesh; everything mutable is applied on
/// the control loop or behind short-lived locks, never from worker threads.
pub struct PoolManager {
    launcher: Arc<dyn WorkerLauncher>,
    default_limits: MemoryBudget,
    workers: DashMap<WorkerId, Arc<WorkerHandle>>,
    specs: DashMap<WorkerId, WorkerSpec>,
    /// Live handles kept sorted by descending expected idleness; the router
    /// walks this so its scan usually terminates within the first few entries.
    routing_order: RwLock<Vec<Arc<WorkerHandle>>>,
    mesh: Mutex<BroadcastMesh>,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    /// Worker-originated mesh traffic, republished for embedders.
    mesh_events: broadcast::Sender<(WorkerId, MeshMessage)>,
    next_id: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

impl PoolManager {
    /// Create a pool with the default thread-backed launcher. Spawns the
    /// control loop and idleness sampler; must be called within a tokio
    /// runtime.
    pub fn new(default_limits: MemoryBudget) -> Arc<Self> {
        Self::with_launcher(default_limits, Arc::new(ThreadLauncher))
    }

    /// Create a pool on a custom worker launcher.
    pub fn with_launcher(
        default_limits: MemoryBudget,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (mesh_events, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        let pool = Arc::new(Self {
            launcher,
            default_limits,
            workers: DashMap::new(),
            specs: DashMap::new(),
            routing_order: RwLock::new(Vec::new()),
            mesh: Mutex::new(BroadcastMesh::new()),
            events_tx,
            mesh_events,
            next_id: AtomicU64::new(1),
            shutdown_tx,
        });

        Self::spawn_control_loop(&pool, events_rx);
        idle::spawn_idle_sampler(&pool);
        pool
    }

    // ========================================================================
    // Worker lifecycle
    // ========================================================================

    /// Start one worker running `service`. The returned handle is `Starting`;
    /// `options.on_started` fires once the worker signals readiness. A spawn
    /// failure is surfaced here and never retried automatically.
    pub fn start_worker(
        &self,
        service: Arc<dyn WorkerService>,
        options: WorkerOptions,
    ) -> Result<Arc<WorkerHandle>, PoolError> {
        self.spawn_slot(service, options, 0)
    }

    fn spawn_slot(
        &self,
        service: Arc<dyn WorkerService>,
        options: WorkerOptions,
        lineage: u32,
    ) -> Result<Arc<WorkerHandle>, PoolError> {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let limits = options.resource_limits.unwrap_or(self.default_limits);
        let (envelope_tx, envelope_rx) = mpsc::unbounded_channel();
        let idle_micros = Arc::new(AtomicU64::new(0));

        let handle = Arc::new(WorkerHandle::new(
            id,
            options.name.clone(),
            limits,
            lineage,
            envelope_tx.clone(),
            Arc::clone(&idle_micros),
        ));

        let join = self.mesh().join(id, envelope_tx.clone());
        self.spawn_coordinator_pump(join.coordinator_rx);

        let ctx = WorkerContext {
            id,
            envelope_rx,
            envelope_tx,
            initial_ports: join.worker_ports,
            events_tx: self.events_tx.clone(),
            idle_micros,
        };

        if let Err(e) = self.launcher.launch(ctx, Arc::clone(&service)) {
            self.mesh().remove(id);
            error!("spawning worker {} failed: {}", id, e);
            return Err(PoolError::Spawn(e));
        }

        self.workers.insert(id, Arc::clone(&handle));
        self.specs.insert(id, WorkerSpec { service, options });
        self.order_write().push(Arc::clone(&handle));

        info!(
            "started worker {} (group {:?}, old-gen {} MB, young-gen {} MB)",
            id,
            handle.name().unwrap_or("-"),
            limits.old_gen_mb,
            limits.young_gen_mb
        );
        Ok(handle)
    }

    /// Roll the workers matching `name` (all workers when `None`): each gets a
    /// shutdown request and, when `start_replacements` is set, an immediately
    /// started replacement whose startup overlaps the old worker's teardown.
    /// At most `max_workers_down` selected workers are down at once; a value
    /// below 1 is read as a fraction of the current pool size. Returns once
    /// every selected worker has exited.
    ///
    /// There is no cancellation: issued shutdown requests are not revocable.
    pub async fn restart_workers(
        &self,
        name: Option<&str>,
        max_workers_down: f64,
        start_replacements: bool,
    ) {
        // Snapshot at call time; pool mutations during the roll (replacement
        // startups, crash replacements) must not perturb the iteration.
        let snapshot = self.workers_matching(name);
        if snapshot.is_empty() {
            debug!("rolling restart: no workers match {:?}", name);
            return;
        }
        let limit = effective_max_down(max_workers_down, self.live_count());
        info!(
            "rolling restart: {} workers selected, at most {} down at once",
            snapshot.len(),
            limit
        );

        let mut waiting = FuturesUnordered::new();
        for handle in snapshot {
            while waiting.len() >= limit {
                waiting.next().await;
            }
            if handle.state() == WorkerState::Exited {
                continue;
            }

            handle.mark_shutdown(start_replacements);
            handle.set_state(WorkerState::ShuttingDown);

            if start_replacements {
                // Clone out of the registry before spawning; spawn_slot
                // writes to the same registry.
                let spec = self.specs.get(&handle.id()).map(|s| s.value().clone());
                match spec {
                    Some(spec) => {
                        // Graceful replacement keeps the slot's crash lineage.
                        if let Err(e) = self.spawn_slot(
                            spec.service,
                            spec.options,
                            handle.unexpected_restarts(),
                        ) {
                            error!(
                                "replacement for {} failed to start: {}",
                                handle.id(),
                                e
                            );
                        }
                    }
                    None => warn!("no spec retained for {}, not replacing", handle.id()),
                }
            }

            if handle.send(Envelope::Shutdown).is_err() {
                trace!("{} already gone before shutdown request", handle.id());
            }
            waiting.push(wait_exited(handle.watch_state()));
        }

        while waiting.next().await.is_some() {}
        info!("rolling restart complete");
    }

    /// Stop the workers matching `name` without replacing them.
    pub async fn shutdown_workers(&self, name: Option<&str>) {
        self.restart_workers(name, f64::INFINITY, false).await;
    }

    /// Stop every worker and the pool's background tasks.
    pub async fn shutdown(&self) {
        info!("shutting down worker pool");
        self.shutdown_workers(None).await;
        self.shutdown_tx.send_replace(true);
    }

    // ========================================================================
    // Mesh traffic
    // ========================================================================

    /// Send a message to every live worker. Per-recipient delivery failures
    /// are logged and never abort delivery to the rest.
    pub fn broadcast(&self, message: &MeshMessage) {
        self.mesh().broadcast(COORDINATOR, message);
    }

    /// Send a message to one worker over the coordinator's mesh edge.
    pub fn send_message(&self, id: WorkerId, message: MeshMessage) -> Result<(), PoolError> {
        if self.mesh().send_to(id, COORDINATOR, message) {
            Ok(())
        } else {
            Err(PoolError::NoSuchWorker(id))
        }
    }

    /// Observe worker-originated mesh traffic without registering callbacks.
    pub fn subscribe(&self) -> broadcast::Receiver<(WorkerId, MeshMessage)> {
        self.mesh_events.subscribe()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn live_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker(&self, id: WorkerId) -> Option<Arc<WorkerHandle>> {
        self.workers.get(&id).map(|h| Arc::clone(&h))
    }

    pub fn is_live(&self, id: WorkerId) -> bool {
        self.worker(id)
            .map(|h| h.state() != WorkerState::Exited)
            .unwrap_or(false)
    }

    /// Live handles matching a group tag, in routing order.
    pub fn workers_matching(&self, name: Option<&str>) -> Vec<Arc<WorkerHandle>> {
        self.order_read()
            .iter()
            .filter(|h| match name {
                Some(name) => h.name() == Some(name),
                None => true,
            })
            .cloned()
            .collect()
    }

    /// The router's view: live handles sorted by descending expected idleness.
    pub fn routing_snapshot(&self) -> Vec<Arc<WorkerHandle>> {
        self.order_read().clone()
    }

    pub fn mesh_edge_count(&self) -> usize {
        self.mesh().edge_count()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn summary(&self) -> PoolSummary {
        let workers: Vec<WorkerSummary> = self
            .workers
            .iter()
            .map(|entry| {
                let h = entry.value();
                WorkerSummary {
                    id: h.id(),
                    name: h.name().map(str::to_string),
                    state: h.state(),
                    unexpected_restarts: h.unexpected_restarts(),
                    expected_idle_micros: h.expected_idle_micros(),
                    requests: h.request_share(),
                    old_gen_mb: h.limits().old_gen_mb,
                    young_gen_mb: h.limits().young_gen_mb,
                    started_at: h.started_at(),
                }
            })
            .collect();
        PoolSummary {
            total: workers.len(),
            running: workers
                .iter()
                .filter(|w| w.state == WorkerState::Running)
                .count(),
            mesh_edges: self.mesh_edge_count(),
            workers,
        }
    }

    // ========================================================================
    // Control loop
    // ========================================================================

    fn spawn_control_loop(
        pool: &Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    ) {
        let weak = Arc::downgrade(pool);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(pool) = weak.upgrade() else { break };
                pool.apply_event(event);
            }
        });
    }

    fn spawn_coordinator_pump(&self, mut rx: mpsc::UnboundedReceiver<MeshPacket>) {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some((from, message)) = rx.recv().await {
                if events_tx
                    .send(LifecycleEvent::Mesh { from, message })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    fn apply_event(self: &Arc<Self>, event: LifecycleEvent) {
        match event {
            LifecycleEvent::Ready(id) => {
                let Some(handle) = self.worker(id) else { return };
                handle.set_state(WorkerState::Running);
                debug!("worker {} is running", id);
                // Clone the callback out first: it may call back into the
                // pool, and holding a registry reference there would deadlock.
                let on_started = self
                    .specs
                    .get(&id)
                    .and_then(|spec| spec.options.on_started.clone());
                if let Some(on_started) = on_started {
                    on_started(&handle);
                }
            }
            LifecycleEvent::Exited(id) => self.apply_exit(id),
            LifecycleEvent::Mesh { from, message } => self.apply_mesh_message(from, message),
        }
    }

    fn apply_exit(self: &Arc<Self>, id: WorkerId) {
        let Some((_, handle)) = self.workers.remove(&id) else {
            return;
        };
        let spec = self.specs.remove(&id).map(|(_, spec)| spec);
        self.mesh().remove(id);
        self.order_write().retain(|h| h.id() != id);
        handle.set_state(WorkerState::Exited);

        if handle.was_shutdown() {
            // Requested exit; the replacement, if wanted, was already started
            // when the shutdown was issued.
            info!("worker {} exited after requested shutdown", id);
            return;
        }

        let Some(spec) = spec else {
            warn!("worker {} exited with no retained spec", id);
            return;
        };
        if !spec.options.auto_restart() {
            warn!("worker {} exited unexpectedly, auto-restart disabled", id);
            return;
        }

        let lineage = handle.unexpected_restarts();
        if lineage >= MAX_UNEXPECTED_RESTARTS {
            error!(
                "worker {} crash-looped {} times, dropping the slot until an operator intervenes",
                id, lineage
            );
            return;
        }

        warn!(
            "worker {} exited unexpectedly, starting replacement ({}/{})",
            id,
            lineage + 1,
            MAX_UNEXPECTED_RESTARTS
        );
        if let Err(e) = self.spawn_slot(spec.service, spec.options, lineage + 1) {
            error!("replacement for crashed worker {} failed: {}", id, e);
        }
    }

    fn apply_mesh_message(self: &Arc<Self>, from: WorkerId, message: MeshMessage) {
        match &message {
            MeshMessage::RestartRequest => {
                let name = self
                    .worker(from)
                    .and_then(|h| h.name().map(str::to_string));
                info!("worker {} requested a restart of its group {:?}", from, name);
                let pool = Arc::clone(self);
                tokio::spawn(async move {
                    pool.restart_workers(name.as_deref(), DEFAULT_MAX_WORKERS_DOWN, true)
                        .await;
                });
            }
            MeshMessage::Unknown => {
                trace!("ignoring unknown mesh message from {}", from);
            }
            MeshMessage::Shutdown | MeshMessage::Broadcast { .. } => {}
        }
        // Republish for embedders; no receivers is fine.
        let _ = self.mesh_events.send((from, message));
    }

    // ========================================================================
    // Lock helpers: short critical sections, poison-tolerant
    // ========================================================================

    pub(crate) fn mesh(&self) -> MutexGuard<'_, BroadcastMesh> {
        self.mesh.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn order_read(&self) -> RwLockReadGuard<'_, Vec<Arc<WorkerHandle>>> {
        self.routing_order.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn order_write(&self) -> RwLockWriteGuard<'_, Vec<Arc<WorkerHandle>>> {
        self.routing_order
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }
}

async fn wait_exited(mut rx: watch::Receiver<WorkerState>) {
    // A dropped sender means the handle is gone, which is as exited as it gets.
    let _ = rx.wait_for(|state| *state == WorkerState::Exited).await;
}

/// Convert the configured bound into an absolute count. Values below 1 are a
/// fraction of the current pool size; an operator restarting 20 workers does
/// not want all 20 down simultaneously.
fn effective_max_down(max_workers_down: f64, pool_size: usize) -> usize {
    if !max_workers_down.is_finite() {
        return usize::MAX;
    }
    if max_workers_down >= 1.0 {
        return max_workers_down as usize;
    }
    if max_workers_down <= 0.0 {
        return 1;
    }
    ((pool_size as f64 * max_workers_down).floor() as usize).max(1)
}

/// Snapshot of the pool for the ops surface.
#[derive(Debug, Serialize)]
pub struct PoolSummary {
    pub total: usize,
    pub running: usize,
    pub mesh_edges: usize,
    pub workers: Vec<WorkerSummary>,
}

#[derive(Debug, Serialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub name: Option<String>,
    pub state: WorkerState,
    pub unexpected_restarts: u32,
    pub expected_idle_micros: u64,
    pub requests: u64,
    pub old_gen_mb: u64,
    pub young_gen_mb: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_max_down_absolute() {
        assert_eq!(effective_max_down(2.0, 10), 2);
        assert_eq!(effective_max_down(1.0, 10), 1);
        assert_eq!(effective_max_down(5.9, 10), 5);
    }

    #[test]
    fn test_effective_max_down_fraction_of_pool() {
        assert_eq!(effective_max_down(0.5, 4), 2);
        assert_eq!(effective_max_down(0.25, 20), 5);
        // A tiny fraction still allows one worker down, or no restart could proceed.
        assert_eq!(effective_max_down(0.01, 4), 1);
    }

    #[test]
    fn test_effective_max_down_unbounded() {
        assert_eq!(effective_max_down(f64::INFINITY, 10), usize::MAX);
    }

    #[test]
    fn test_effective_max_down_nonpositive_defaults_to_one() {
        assert_eq!(effective_max_down(0.0, 10), 1);
        assert_eq!(effective_max_down(-3.0, 10), 1);
    }
}
