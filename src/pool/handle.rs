//! Worker handle: the supervisor-side record of one running worker
//!
//! A handle is created when a worker is started and becomes inert once the
//! worker exits; a replacement is always a brand-new handle, never a
//! resurrection. Idleness bookkeeping lives in atomics because it is written
//! by the idleness sampler and the router while the pool manager owns the
//! handle itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::budget::MemoryBudget;
use crate::message::Envelope;

/// Identity of a mesh participant. `COORDINATOR` is reserved for the
/// supervisor itself; workers count up from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// The supervisor's own mesh identity.
pub const COORDINATOR: WorkerId = WorkerId(0);

/// Lifecycle state of a worker. `Exited` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerState {
    Starting,
    Running,
    ShuttingDown,
    Exited,
}

/// Options for starting a worker.
#[derive(Clone, Default)]
pub struct WorkerOptions {
    /// Logical group tag (e.g. "http"); used to scope restarts to a subset.
    pub name: Option<String>,
    /// Heap budget override; defaults to the pool's computed budget.
    pub resource_limits: Option<MemoryBudget>,
    /// Restart automatically on an unrequested exit. Defaults to true.
    pub auto_restart: Option<bool>,
    /// Invoked each time a worker for this slot signals readiness. Across a
    /// slot's replacement lineage this fires once per replacement, so treat it
    /// as "a worker for this role is ready", not "this instance started once".
    pub on_started: Option<Arc<dyn Fn(&Arc<WorkerHandle>) + Send + Sync>>,
}

impl WorkerOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_limits(mut self, limits: MemoryBudget) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    pub fn with_auto_restart(mut self, auto_restart: bool) -> Self {
        self.auto_restart = Some(auto_restart);
        self
    }

    pub fn with_on_started(
        mut self,
        callback: impl Fn(&Arc<WorkerHandle>) + Send + Sync + 'static,
    ) -> Self {
        self.on_started = Some(Arc::new(callback));
        self
    }

    pub(crate) fn auto_restart(&self) -> bool {
        self.auto_restart.unwrap_or(true)
    }
}

impl std::fmt::Debug for WorkerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerOptions")
            .field("name", &self.name)
            .field("resource_limits", &self.resource_limits)
            .field("auto_restart", &self.auto_restart)
            .field("on_started", &self.on_started.is_some())
            .finish()
    }
}

/// One running worker, as seen by the supervisor.
pub struct WorkerHandle {
    id: WorkerId,
    name: Option<String>,
    limits: MemoryBudget,
    started_at: DateTime<Utc>,
    /// Unrequested exits accumulated by this slot's lineage. Monotonic: a
    /// crash replacement carries its predecessor's count plus one.
    unexpected_restarts: u32,
    state_tx: watch::Sender<WorkerState>,
    was_shutdown: AtomicBool,
    restart_requested: AtomicBool,
    envelope_tx: mpsc::UnboundedSender<Envelope>,

    // Idleness bookkeeping. `idle_micros` is the worker's own cumulative idle
    // counter; the rest is derived by the sampler and consumed by the router.
    pub(crate) idle_micros: Arc<AtomicU64>,
    pub(crate) last_idle_micros: AtomicU64,
    pub(crate) expected_idle_micros: AtomicU64,
    pub(crate) requests: AtomicU64,
}

impl WorkerHandle {
    pub(crate) fn new(
        id: WorkerId,
        name: Option<String>,
        limits: MemoryBudget,
        unexpected_restarts: u32,
        envelope_tx: mpsc::UnboundedSender<Envelope>,
        idle_micros: Arc<AtomicU64>,
    ) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Starting);
        Self {
            id,
            name,
            limits,
            started_at: Utc::now(),
            unexpected_restarts,
            state_tx,
            was_shutdown: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
            envelope_tx,
            idle_micros,
            last_idle_micros: AtomicU64::new(0),
            expected_idle_micros: AtomicU64::new(0),
            requests: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn limits(&self) -> MemoryBudget {
        self.limits
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn unexpected_restarts(&self) -> u32 {
        self.unexpected_restarts
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Subscribe to state transitions; used to await `Exited`.
    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// True once the supervisor has requested this worker stop; distinguishes
    /// a graceful exit from a crash.
    pub fn was_shutdown(&self) -> bool {
        self.was_shutdown.load(Ordering::SeqCst)
    }

    /// True when a replacement is wanted after this worker's requested exit.
    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    pub fn expected_idle_micros(&self) -> u64 {
        self.expected_idle_micros.load(Ordering::Relaxed)
    }

    pub fn request_share(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) fn mark_shutdown(&self, restart: bool) {
        self.was_shutdown.store(true, Ordering::SeqCst);
        self.restart_requested.store(restart, Ordering::SeqCst);
    }

    /// Count one routed connection against this worker.
    pub(crate) fn note_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Send a control envelope. On failure the envelope is handed back so a
    /// connection payload can be re-routed instead of dropped.
    pub(crate) fn send(&self, envelope: Envelope) -> Result<(), Envelope> {
        self.envelope_tx.send(envelope).map_err(|e| e.0)
    }

    /// Transfer an accepted connection's descriptor to this worker. On
    /// failure the socket comes back to the caller for re-selection.
    pub(crate) fn send_connection(
        &self,
        stream: std::net::TcpStream,
        prefix: Vec<u8>,
    ) -> Result<(), (std::net::TcpStream, Vec<u8>)> {
        self.envelope_tx
            .send(Envelope::Connection { stream, prefix })
            .map_err(|e| match e.0 {
                Envelope::Connection { stream, prefix } => (stream, prefix),
                // We constructed the envelope one line up.
                _ => unreachable!(),
            })
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("unexpected_restarts", &self.unexpected_restarts)
            .finish()
    }
}

/// Lifecycle events drained on the supervisor's control loop. Workers never
/// call back into the pool directly; everything arrives through this queue.
#[derive(Debug)]
pub(crate) enum LifecycleEvent {
    /// The worker's harness is up and serving.
    Ready(WorkerId),
    /// The worker's thread ended, gracefully or not.
    Exited(WorkerId),
    /// A mesh message arrived on the coordinator's edge to this worker.
    Mesh {
        from: WorkerId,
        message: crate::message::MeshMessage,
    },
}
