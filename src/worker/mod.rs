//! Worker runtime harness
//!
//! Each pool slot is one OS thread driving a current-thread tokio runtime.
//! The harness owns the slot's control channel: it accounts idle time around
//! its receive waits, wires in mesh edges as they arrive, replays handed-off
//! sockets into the local runtime, and drives the slot's [`WorkerService`],
//! the application body that actually serves connections (a storage bridge in
//! the full server; a line-echo service here and in tests).
//!
//! The launcher seam is a trait so the pool manager stays generic over the
//! underlying concurrency primitive; [`ThreadLauncher`] is the thread-backed
//! implementation used in production and tests alike.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::message::{Envelope, MeshMessage};
use crate::pool::handle::LifecycleEvent;
use crate::pool::mesh::{MeshPacket, MeshPort};
use crate::pool::WorkerId;

/// The application body a worker drives. One service instance is shared by
/// every worker in a pool; per-worker identity comes through the
/// [`WorkerLink`] argument.
///
/// Futures run on the worker's own current-thread runtime and need not be
/// `Send`.
#[async_trait(?Send)]
pub trait WorkerService: Send + Sync + 'static {
    /// Serve one handed-off connection. `prefix` holds bytes the router
    /// consumed while routing (e.g. a buffered request header); they belong
    /// at the front of the stream.
    async fn serve(&self, link: WorkerLink, stream: TcpStream, prefix: Vec<u8>);

    /// A mesh message arrived from another participant. Default: ignore.
    async fn on_message(&self, link: WorkerLink, from: WorkerId, message: MeshMessage) {
        let _ = (link, from, message);
    }

    /// The supervisor requested shutdown. The worker exits once this returns,
    /// so pending work can be drained here.
    async fn on_shutdown(&self, link: WorkerLink) {
        let _ = link;
    }
}

/// A worker-side handle onto the mesh and the slot's own lifecycle, cloneable
/// into connection-serving tasks.
#[derive(Clone)]
pub struct WorkerLink {
    id: WorkerId,
    peers: Arc<DashMap<WorkerId, mpsc::UnboundedSender<MeshPacket>>>,
    envelope_tx: mpsc::UnboundedSender<Envelope>,
}

impl WorkerLink {
    fn new(id: WorkerId, envelope_tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            id,
            peers: Arc::new(DashMap::new()),
            envelope_tx,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Ids of peers this worker currently holds mesh edges to.
    pub fn peers(&self) -> Vec<WorkerId> {
        self.peers.iter().map(|e| *e.key()).collect()
    }

    /// Send a mesh message to one peer. Returns false if the edge is gone.
    pub fn send_to_peer(&self, peer: WorkerId, message: MeshMessage) -> bool {
        match self.peers.get(&peer) {
            Some(tx) => tx.send((self.id, message)).is_ok(),
            None => false,
        }
    }

    /// Fan a mesh message out over every edge this worker holds. Failures are
    /// logged per edge and do not stop the fan-out.
    pub fn broadcast(&self, message: &MeshMessage) {
        for entry in self.peers.iter() {
            if entry.value().send((self.id, message.clone())).is_err() {
                warn!("{}: broadcast to {} failed, edge closed", self.id, entry.key());
            }
        }
    }

    /// Terminate this worker immediately, without graceful-shutdown
    /// semantics. The supervisor treats the resulting exit as unrequested.
    pub fn exit(&self) {
        let _ = self.envelope_tx.send(Envelope::Terminate);
    }
}

/// Everything a launcher needs to run one worker slot.
pub struct WorkerContext {
    pub(crate) id: WorkerId,
    pub(crate) envelope_rx: mpsc::UnboundedReceiver<Envelope>,
    pub(crate) envelope_tx: mpsc::UnboundedSender<Envelope>,
    pub(crate) initial_ports: Vec<MeshPort>,
    pub(crate) events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    pub(crate) idle_micros: Arc<std::sync::atomic::AtomicU64>,
}

impl WorkerContext {
    /// Drive the harness loop to completion. Launchers call this on whatever
    /// execution primitive they provide.
    pub async fn run(self, service: Arc<dyn WorkerService>) {
        run_worker(self, service).await;
    }
}

/// Spawns the execution primitive backing one pool slot.
pub trait WorkerLauncher: Send + Sync + 'static {
    fn launch(&self, ctx: WorkerContext, service: Arc<dyn WorkerService>) -> std::io::Result<()>;
}

/// Thread-backed launcher: one named OS thread per slot, each with its own
/// current-thread tokio runtime.
pub struct ThreadLauncher;

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, ctx: WorkerContext, service: Arc<dyn WorkerService>) -> std::io::Result<()> {
        let id = ctx.id;
        std::thread::Builder::new()
            .name(format!("loomdb-{}", id))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        // The exit guard inside run_worker never arms; report
                        // the exit directly so the slot is not leaked.
                        error!("{}: failed to build worker runtime: {}", id, e);
                        let _ = ctx.events_tx.send(LifecycleEvent::Exited(id));
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, ctx.run(service));
            })?;
        Ok(())
    }
}

/// Sends `Exited` when the harness unwinds, panicking or not, so the
/// supervisor always observes the end of a worker.
struct ExitGuard {
    id: WorkerId,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.events_tx.send(LifecycleEvent::Exited(self.id));
    }
}

async fn run_worker(ctx: WorkerContext, service: Arc<dyn WorkerService>) {
    let WorkerContext {
        id,
        mut envelope_rx,
        envelope_tx,
        initial_ports,
        events_tx,
        idle_micros,
    } = ctx;

    let _guard = ExitGuard {
        id,
        events_tx: events_tx.clone(),
    };
    let link = WorkerLink::new(id, envelope_tx.clone());

    for port in initial_ports {
        wire_port(port, &link, &envelope_tx);
    }

    if events_tx.send(LifecycleEvent::Ready(id)).is_err() {
        // Supervisor already gone; nothing to serve for.
        return;
    }
    debug!("{}: worker ready", id);

    loop {
        // Time parked waiting for the next message counts as idle.
        let wait_started = Instant::now();
        let Some(envelope) = envelope_rx.recv().await else {
            break;
        };
        idle_micros.fetch_add(wait_started.elapsed().as_micros() as u64, Ordering::Relaxed);

        match envelope {
            Envelope::Shutdown => {
                debug!("{}: shutdown requested", id);
                service.on_shutdown(link.clone()).await;
                break;
            }
            Envelope::Terminate => {
                warn!("{}: terminating on internal request", id);
                break;
            }
            Envelope::AddedPort(port) => {
                trace!("{}: new mesh edge to {}", id, port.peer);
                wire_port(port, &link, &envelope_tx);
            }
            Envelope::Connection { stream, prefix } => match TcpStream::from_std(stream) {
                Ok(stream) => {
                    let service = Arc::clone(&service);
                    let link = link.clone();
                    tokio::task::spawn_local(async move {
                        service.serve(link, stream, prefix).await;
                    });
                }
                Err(e) => warn!("{}: could not adopt handed-off socket: {}", id, e),
            },
            Envelope::Mesh { from, message } => {
                service.on_message(link.clone(), from, message).await;
            }
        }
    }
    debug!("{}: worker loop ended", id);
}

/// Store the edge's send side and pump its receive side into the worker's own
/// control queue, preserving per-edge FIFO order. The edge is pruned when the
/// far end closes.
fn wire_port(port: MeshPort, link: &WorkerLink, envelope_tx: &mpsc::UnboundedSender<Envelope>) {
    let MeshPort { peer, tx, mut rx } = port;
    link.peers.insert(peer, tx);
    let envelope_tx = envelope_tx.clone();
    let peers = Arc::clone(&link.peers);
    tokio::task::spawn_local(async move {
        while let Some((from, message)) = rx.recv().await {
            if envelope_tx.send(Envelope::Mesh { from, message }).is_err() {
                break;
            }
        }
        peers.remove(&peer);
    });
}

/// Minimal connection service: echoes the routed prefix, then every line, back
/// to the client. Stands in for a storage bridge in the binary and the tests.
pub struct EchoService;

#[async_trait(?Send)]
impl WorkerService for EchoService {
    async fn serve(&self, link: WorkerLink, mut stream: TcpStream, prefix: Vec<u8>) {
        if !prefix.is_empty() {
            if let Err(e) = stream.write_all(&prefix).await {
                trace!("{}: echo write failed: {}", link.id(), e);
                return;
            }
        }
        let (reader, mut writer) = stream.split();
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = format!("{}\n", line);
            if writer.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_peer_send_without_edge() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = WorkerLink::new(WorkerId(3), tx);
        assert!(!link.send_to_peer(WorkerId(9), MeshMessage::Shutdown));
        assert!(link.peers().is_empty());
    }

    #[test]
    fn test_link_exit_sends_terminate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = WorkerLink::new(WorkerId(3), tx);
        link.exit();
        assert!(matches!(rx.try_recv(), Ok(Envelope::Terminate)));
    }
}
