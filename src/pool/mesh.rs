//! Full-mesh broadcast fabric between the supervisor and all live workers
//!
//! Every live participant holds exactly one bidirectional edge to every other
//! live participant. Edges are created lazily: when a worker joins after
//! others are already running, the mesh creates one fresh edge per existing
//! participant and delivers the far end to each of them as an `AddedPort`
//! control message, so no participant needs to know total membership in
//! advance. Edges are pruned when either endpoint exits.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::message::{Envelope, MeshMessage};
use crate::pool::handle::{WorkerId, COORDINATOR};

/// A message on a mesh edge, tagged with the sender.
pub type MeshPacket = (WorkerId, MeshMessage);

/// One end of a bidirectional mesh edge.
pub struct MeshPort {
    /// Identity of the far end.
    pub peer: WorkerId,
    /// Sends toward the far end.
    pub tx: mpsc::UnboundedSender<MeshPacket>,
    /// Receives from the far end. FIFO per edge; no ordering guarantee exists
    /// across different edges.
    pub rx: mpsc::UnboundedReceiver<MeshPacket>,
}

/// Create both ends of an edge between `a` and `b`.
pub(crate) fn mesh_pair(a: WorkerId, b: WorkerId) -> (MeshPort, MeshPort) {
    let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
    let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();
    let port_a = MeshPort {
        peer: b,
        tx: a_to_b_tx,
        rx: b_to_a_rx,
    };
    let port_b = MeshPort {
        peer: a,
        tx: b_to_a_tx,
        rx: a_to_b_rx,
    };
    (port_a, port_b)
}

/// Outcome of wiring a new participant into the mesh.
pub(crate) struct MeshJoin {
    /// The new worker's ends of every created edge (peers plus coordinator).
    pub worker_ports: Vec<MeshPort>,
    /// The coordinator's receive side of its edge to the new worker.
    pub coordinator_rx: mpsc::UnboundedReceiver<MeshPacket>,
}

/// Supervisor-side bookkeeping for the mesh.
pub(crate) struct BroadcastMesh {
    /// Control channels of live workers, used to deliver `AddedPort`.
    participants: HashMap<WorkerId, mpsc::UnboundedSender<Envelope>>,
    /// The coordinator's send side of its edge to each worker.
    coordinator_ports: HashMap<WorkerId, mpsc::UnboundedSender<MeshPacket>>,
    /// Live edges, stored as ordered id pairs.
    edges: HashSet<(WorkerId, WorkerId)>,
}

impl BroadcastMesh {
    pub fn new() -> Self {
        Self {
            participants: HashMap::new(),
            coordinator_ports: HashMap::new(),
            edges: HashSet::new(),
        }
    }

    /// Wire a new worker into the mesh: one edge to the coordinator, one edge
    /// to every existing worker. Existing workers are told about their new
    /// edge via `AddedPort` on their control channel.
    pub fn join(
        &mut self,
        id: WorkerId,
        envelope_tx: mpsc::UnboundedSender<Envelope>,
    ) -> MeshJoin {
        let mut worker_ports = Vec::with_capacity(self.participants.len() + 1);

        // Coordinator edge.
        let (coordinator_port, worker_port) = mesh_pair(COORDINATOR, id);
        let MeshPort {
            tx: coordinator_tx,
            rx: coordinator_rx,
            ..
        } = coordinator_port;
        self.coordinator_ports.insert(id, coordinator_tx);
        self.edges.insert(edge_key(COORDINATOR, id));
        worker_ports.push(worker_port);

        // One edge per existing worker, delivered out-of-band.
        for (&peer, peer_tx) in &self.participants {
            let (peer_port, worker_port) = mesh_pair(peer, id);
            if peer_tx.send(Envelope::AddedPort(peer_port)).is_err() {
                // Peer is tearing down; its exit event will prune the edge.
                warn!("could not deliver new mesh edge to {}", peer);
                continue;
            }
            self.edges.insert(edge_key(peer, id));
            worker_ports.push(worker_port);
        }

        self.participants.insert(id, envelope_tx);
        debug!("{} joined mesh, {} edges live", id, self.edges.len());

        MeshJoin {
            worker_ports,
            coordinator_rx,
        }
    }

    /// Drop a participant and every edge touching it.
    pub fn remove(&mut self, id: WorkerId) {
        self.participants.remove(&id);
        self.coordinator_ports.remove(&id);
        self.edges.retain(|&(a, b)| a != id && b != id);
        debug!("{} left mesh, {} edges live", id, self.edges.len());
    }

    /// Send a message to every live worker. Delivery failures are logged per
    /// recipient and never abort delivery to the rest.
    pub fn broadcast(&self, from: WorkerId, message: &MeshMessage) {
        for (&id, tx) in &self.coordinator_ports {
            if tx.send((from, message.clone())).is_err() {
                warn!("broadcast delivery to {} failed, worker gone", id);
            }
        }
    }

    /// Send a message to a single worker over the coordinator's edge.
    pub fn send_to(&self, id: WorkerId, from: WorkerId, message: MeshMessage) -> bool {
        match self.coordinator_ports.get(&id) {
            Some(tx) => tx.send((from, message)).is_ok(),
            None => false,
        }
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}

fn edge_key(a: WorkerId, b: WorkerId) -> (WorkerId, WorkerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_worker(mesh: &mut BroadcastMesh, id: u64) -> (MeshJoin, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (mesh.join(WorkerId(id), tx), rx)
    }

    #[test]
    fn test_full_mesh_edge_count() {
        let mut mesh = BroadcastMesh::new();
        let mut joins = Vec::new();
        for id in 1..=4u64 {
            joins.push(join_worker(&mut mesh, id));
        }
        // 4 coordinator edges plus 4*3/2 worker pairs.
        assert_eq!(mesh.edge_count(), 4 + 6);
        assert_eq!(mesh.participant_count(), 4);
    }

    #[test]
    fn test_later_joiner_gets_ports_to_all_peers() {
        let mut mesh = BroadcastMesh::new();
        let (_first, mut first_rx) = join_worker(&mut mesh, 1);
        let (second, _second_rx) = join_worker(&mut mesh, 2);

        // Second worker holds edges to the coordinator and to worker 1.
        let peers: Vec<WorkerId> = second.worker_ports.iter().map(|p| p.peer).collect();
        assert!(peers.contains(&COORDINATOR));
        assert!(peers.contains(&WorkerId(1)));

        // Worker 1 was informed out-of-band.
        match first_rx.try_recv() {
            Ok(Envelope::AddedPort(port)) => assert_eq!(port.peer, WorkerId(2)),
            other => panic!("expected AddedPort, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_prunes_all_touching_edges() {
        let mut mesh = BroadcastMesh::new();
        let mut joins = Vec::new();
        for id in 1..=3u64 {
            joins.push(join_worker(&mut mesh, id));
        }
        assert_eq!(mesh.edge_count(), 3 + 3);

        mesh.remove(WorkerId(2));
        // Edges left: coordinator-1, coordinator-3, 1-3.
        assert_eq!(mesh.edge_count(), 3);
        assert_eq!(mesh.participant_count(), 2);
    }

    #[test]
    fn test_broadcast_reaches_every_worker() {
        let mut mesh = BroadcastMesh::new();
        let (mut a, _arx) = join_worker(&mut mesh, 1);
        let (mut b, _brx) = join_worker(&mut mesh, 2);

        mesh.broadcast(COORDINATOR, &MeshMessage::Shutdown);

        for join in [&mut a, &mut b] {
            let rx = join
                .worker_ports
                .iter_mut()
                .find(|p| p.peer == COORDINATOR)
                .map(|p| &mut p.rx)
                .unwrap();
            let (from, msg) = rx.try_recv().unwrap();
            assert_eq!(from, COORDINATOR);
            assert_eq!(msg, MeshMessage::Shutdown);
        }
    }

    #[test]
    fn test_broadcast_survives_dead_recipient() {
        let mut mesh = BroadcastMesh::new();
        let (a, _arx) = join_worker(&mut mesh, 1);
        let (mut b, _brx) = join_worker(&mut mesh, 2);
        drop(a); // worker 1's ports gone, channel closed

        // Must not panic, and worker 2 still receives.
        mesh.broadcast(COORDINATOR, &MeshMessage::RestartRequest);
        let rx = b
            .worker_ports
            .iter_mut()
            .find(|p| p.peer == COORDINATOR)
            .map(|p| &mut p.rx)
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
