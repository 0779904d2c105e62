//! Connection router
//!
//! Accepts raw TCP connections and hands each one off to a live worker chosen
//! by the configured strategy. The router never streams connection bytes
//! through itself: the accepted socket is downgraded to its underlying
//! descriptor and transferred to the worker in a control message. Only the
//! header-affinity strategy reads from the connection at all, and then just
//! far enough to observe the routing header; whatever it consumed travels
//! with the descriptor.

pub mod affinity;
pub mod strategy;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::pool::{PoolManager, WorkerHandle};

pub use affinity::DEFAULT_AFFINITY_TTL;
pub use strategy::{NoWorkerPolicy, RoutingStrategy};

use affinity::AffinityMap;
use strategy::MostIdleSelector;

/// Connections held under the queue policy while no worker is live.
const QUEUE_LIMIT: usize = 1024;
/// How often queued connections are retried.
const QUEUE_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Most bytes the header-affinity strategy will buffer before giving up on
/// finding the routing header.
const HEADER_BUFFER_LIMIT: usize = 8 * 1024;
/// Longest the header-affinity strategy waits for a client to send its header.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the socket server
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("failed to bind listening socket: {0}")]
    Bind(std::io::Error),
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub strategy: RoutingStrategy,
    pub affinity_ttl: Duration,
    pub no_worker_policy: NoWorkerPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::MostIdle,
            affinity_ttl: DEFAULT_AFFINITY_TTL,
            no_worker_policy: NoWorkerPolicy::default(),
        }
    }
}

impl RouterConfig {
    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_affinity_ttl(mut self, ttl: Duration) -> Self {
        self.affinity_ttl = ttl;
        self
    }

    pub fn with_no_worker_policy(mut self, policy: NoWorkerPolicy) -> Self {
        self.no_worker_policy = policy;
        self
    }
}

/// A running socket server.
pub struct ServerHandle {
    local_addr: std::net::SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Already handed-off connections are unaffected.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Bind a listening socket and route accepted connections to pool workers.
pub async fn start_socket_server(
    pool: Arc<PoolManager>,
    bind_addr: &str,
    port: u16,
    config: RouterConfig,
) -> Result<ServerHandle, RouterError> {
    let listener = TcpListener::bind((bind_addr, port))
        .await
        .map_err(RouterError::Bind)?;
    let local_addr = listener.local_addr().map_err(RouterError::Bind)?;
    info!(
        "socket server listening on {} (strategy {})",
        local_addr, config.strategy
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(run_accept_loop(listener, pool, config, shutdown_rx));

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
    })
}

/// A connection waiting for a routing decision or for a worker to exist.
struct PendingConnection {
    stream: std::net::TcpStream,
    prefix: Vec<u8>,
    key: Option<String>,
}

async fn run_accept_loop(
    listener: TcpListener,
    pool: Arc<PoolManager>,
    config: RouterConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut core = RouterCore::new(pool, &config);
    let (parsed_tx, mut parsed_rx) = mpsc::unbounded_channel::<PendingConnection>();
    let mut sweep = tokio::time::interval(config.affinity_ttl);
    let mut retry = tokio::time::interval(QUEUE_RETRY_INTERVAL);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => match &config.strategy {
                    RoutingStrategy::HeaderAffinity(header) => {
                        // Routing must wait for the header; buffer off-loop so
                        // a slow client cannot stall the accept path.
                        let header = header.clone();
                        let parsed_tx = parsed_tx.clone();
                        tokio::spawn(read_routing_header(stream, header, parsed_tx));
                    }
                    RoutingStrategy::RemoteAffinity => {
                        let key = Some(remote.ip().to_string());
                        core.admit(stream, Vec::new(), key);
                    }
                    RoutingStrategy::MostIdle => {
                        core.admit(stream, Vec::new(), None);
                    }
                },
                Err(e) => warn!("accept failed: {}", e),
            },
            Some(pending) = parsed_rx.recv() => {
                core.dispatch(pending);
            }
            _ = sweep.tick() => {
                let removed = core.sweep();
                if removed > 0 {
                    debug!("affinity sweep removed {} entries", removed);
                }
            }
            _ = retry.tick(), if core.has_queued() => {
                core.drain_queue();
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("socket server stopping");
                    break;
                }
            }
        }
    }
}

/// Selection state and the handoff path. Owned by the accept loop alone, so
/// none of it needs locking.
struct RouterCore {
    pool: Arc<PoolManager>,
    selector: MostIdleSelector,
    affinity: AffinityMap,
    policy: NoWorkerPolicy,
    queued: VecDeque<PendingConnection>,
}

impl RouterCore {
    fn new(pool: Arc<PoolManager>, config: &RouterConfig) -> Self {
        Self {
            pool,
            selector: MostIdleSelector::new(),
            affinity: AffinityMap::new(config.affinity_ttl),
            policy: config.no_worker_policy,
            queued: VecDeque::new(),
        }
    }

    /// Entry point for a freshly accepted connection.
    fn admit(&mut self, stream: TcpStream, prefix: Vec<u8>, key: Option<String>) {
        match stream.into_std() {
            Ok(stream) => self.dispatch(PendingConnection {
                stream,
                prefix,
                key,
            }),
            Err(e) => warn!("could not detach accepted socket: {}", e),
        }
    }

    /// Route one connection, applying the no-worker policy on failure.
    fn dispatch(&mut self, pending: PendingConnection) {
        match self.try_route(pending) {
            None => {}
            Some(pending) => match self.policy {
                NoWorkerPolicy::Reject => {
                    warn!("no live worker available, rejecting connection");
                }
                NoWorkerPolicy::Queue => {
                    if self.queued.len() >= QUEUE_LIMIT {
                        warn!("connection queue full, dropping oldest");
                        self.queued.pop_front();
                    }
                    debug!("no live worker available, queueing connection");
                    self.queued.push_back(pending);
                }
            },
        }
    }

    /// Hand the connection to a worker, re-selecting if the chosen worker
    /// died between selection and handoff. Returns the connection when no
    /// worker could take it.
    fn try_route(&mut self, pending: PendingConnection) -> Option<PendingConnection> {
        let PendingConnection {
            mut stream,
            mut prefix,
            key,
        } = pending;
        let now = Instant::now();
        let mut excluded: Vec<crate::pool::WorkerId> = Vec::new();

        loop {
            let candidates: Vec<Arc<WorkerHandle>> = self
                .pool
                .routing_snapshot()
                .into_iter()
                .filter(|h| h.is_running() && !excluded.contains(&h.id()))
                .collect();

            let Some(target) = self.select_target(&candidates, key.as_deref(), now) else {
                return Some(PendingConnection {
                    stream,
                    prefix,
                    key,
                });
            };

            target.note_request();
            match target.send_connection(stream, prefix) {
                Ok(()) => {
                    trace!("routed connection to {}", target.id());
                    return None;
                }
                Err((returned_stream, returned_prefix)) => {
                    warn!("handoff to {} failed, re-selecting", target.id());
                    if let Some(key) = &key {
                        self.affinity.unbind(key);
                    }
                    excluded.push(target.id());
                    stream = returned_stream;
                    prefix = returned_prefix;
                }
            }
        }
    }

    /// Pick a destination: affinity hit first when a key is present, falling
    /// back to most-idle selection and recording the new binding.
    fn select_target(
        &mut self,
        candidates: &[Arc<WorkerHandle>],
        key: Option<&str>,
        now: Instant,
    ) -> Option<Arc<WorkerHandle>> {
        if let Some(key) = key {
            if let Some(bound) = self.affinity.lookup(key, now) {
                if let Some(handle) = candidates.iter().find(|h| h.id() == bound) {
                    return Some(Arc::clone(handle));
                }
                // The bound worker exited or stopped serving; purge the stale
                // entry rather than waiting for the TTL.
                self.affinity.unbind(key);
            }
        }

        let index = self.selector.select(candidates)?;
        let handle = Arc::clone(&candidates[index]);
        if let Some(key) = key {
            self.affinity.bind(key.to_string(), handle.id(), now);
        }
        Some(handle)
    }

    fn sweep(&mut self) -> usize {
        let pool = Arc::clone(&self.pool);
        self.affinity
            .sweep(Instant::now(), move |id| pool.is_live(id))
    }

    fn has_queued(&self) -> bool {
        !self.queued.is_empty()
    }

    /// Retry queued connections, oldest first. A connection that still cannot
    /// be routed goes back to the end of the queue.
    fn drain_queue(&mut self) {
        for _ in 0..self.queued.len() {
            let Some(pending) = self.queued.pop_front() else {
                break;
            };
            self.dispatch(pending);
        }
    }
}

/// Read from the connection until the named header is observed, the header
/// block ends, the buffer limit is hit, or the client stalls past the
/// timeout. Whatever was consumed is returned as the connection's prefix; a
/// missing header falls back to most-idle routing.
async fn read_routing_header(
    mut stream: TcpStream,
    header: String,
    parsed_tx: mpsc::UnboundedSender<PendingConnection>,
) {
    let mut buffer: Vec<u8> = Vec::with_capacity(512);
    let key = tokio::time::timeout(HEADER_READ_TIMEOUT, async {
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => return None,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if let Some(value) = find_header_value(&buffer, &header) {
                        return Some(value);
                    }
                    if buffer.len() >= HEADER_BUFFER_LIMIT || header_block_complete(&buffer) {
                        return None;
                    }
                }
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();

    if key.is_none() {
        debug!("routing header not observed, falling back to most-idle");
    }

    match stream.into_std() {
        Ok(stream) => {
            let _ = parsed_tx.send(PendingConnection {
                stream,
                prefix: buffer,
                key,
            });
        }
        Err(e) => warn!("could not detach buffered socket: {}", e),
    }
}

/// Find `name: value` in the complete lines of a header block. Matching is
/// case-insensitive on the name; the search stops at the blank line ending
/// the block.
fn find_header_value(buffer: &[u8], name: &str) -> Option<String> {
    let end = buffer.iter().rposition(|&b| b == b'\n')?;
    let complete = String::from_utf8_lossy(&buffer[..=end]);
    for line in complete.lines() {
        if line.trim().is_empty() {
            return None;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn header_block_complete(buffer: &[u8]) -> bool {
    buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.windows(2).any(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::budget::MemoryBudget;
    use crate::pool::{WorkerId, WorkerState};
    use crate::worker::ThreadLauncher;

    fn running_handle(id: u64, expected_idle: u64) -> Arc<WorkerHandle> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        std::mem::forget(rx);
        let handle = WorkerHandle::new(
            WorkerId(id),
            None,
            MemoryBudget {
                old_gen_mb: 512,
                young_gen_mb: 16,
            },
            0,
            tx,
            Arc::new(AtomicU64::new(0)),
        );
        handle.set_state(WorkerState::Running);
        handle
            .expected_idle_micros
            .store(expected_idle, Ordering::Relaxed);
        Arc::new(handle)
    }

    fn test_core() -> RouterCore {
        let pool = PoolManager::with_launcher(
            MemoryBudget {
                old_gen_mb: 512,
                young_gen_mb: 16,
            },
            Arc::new(ThreadLauncher),
        );
        RouterCore::new(pool, &RouterConfig::default())
    }

    #[test]
    fn test_find_header_value() {
        let buf = b"GET / HTTP/1.1\r\nHost: db.local\r\nAuthorization: Basic abc123\r\n\r\n";
        assert_eq!(
            find_header_value(buf, "authorization"),
            Some("Basic abc123".to_string())
        );
        assert_eq!(find_header_value(buf, "host"), Some("db.local".to_string()));
        assert_eq!(find_header_value(buf, "x-missing"), None);
    }

    #[test]
    fn test_find_header_value_ignores_partial_last_line() {
        // The value's line has no terminator yet; it must not match.
        let buf = b"Authorization: Bas";
        assert_eq!(find_header_value(buf, "authorization"), None);

        let buf = b"Authorization: Basic abc\r\nHost: par";
        assert_eq!(
            find_header_value(buf, "authorization"),
            Some("Basic abc".to_string())
        );
        assert_eq!(find_header_value(buf, "host"), None);
    }

    #[test]
    fn test_header_block_complete() {
        assert!(header_block_complete(b"GET /\r\n\r\n"));
        assert!(header_block_complete(b"a\n\n"));
        assert!(!header_block_complete(b"GET /\r\nHost: x\r\n"));
    }

    #[tokio::test]
    async fn test_affinity_split_follows_addresses() {
        let mut core = test_core();
        let candidates = vec![
            running_handle(1, 1_000),
            running_handle(2, 1_000),
            running_handle(3, 1_000),
            running_handle(4, 1_000),
        ];
        let now = Instant::now();

        // 100 connections from two addresses in a 75/25 split.
        let mut counts: std::collections::HashMap<WorkerId, (usize, usize)> =
            std::collections::HashMap::new();
        for i in 0..100 {
            let (key, slot) = if i % 4 < 3 {
                ("10.1.1.1", 0)
            } else {
                ("10.2.2.2", 1)
            };
            let target = core
                .select_target(&candidates, Some(key), now)
                .expect("a worker must be selected");
            target.note_request();
            let entry = counts.entry(target.id()).or_default();
            if slot == 0 {
                entry.0 += 1;
            } else {
                entry.1 += 1;
            }
        }

        // Exactly two workers ever receive traffic, split 75/25.
        assert_eq!(counts.len(), 2, "expected 2 workers, got {:?}", counts);
        let mut totals: Vec<usize> = counts.values().map(|(a, b)| a + b).collect();
        totals.sort_unstable();
        assert_eq!(totals, vec![25, 75]);
        // And no worker serves both addresses.
        for (a, b) in counts.values() {
            assert!(*a == 0 || *b == 0);
        }
    }

    /// Handle whose control channel we keep, so a handoff can be observed.
    fn attached_handle(
        id: u64,
        expected_idle: u64,
    ) -> (
        Arc<WorkerHandle>,
        tokio::sync::mpsc::UnboundedReceiver<crate::message::Envelope>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = WorkerHandle::new(
            WorkerId(id),
            None,
            MemoryBudget {
                old_gen_mb: 512,
                young_gen_mb: 16,
            },
            0,
            tx,
            Arc::new(AtomicU64::new(0)),
        );
        handle.set_state(WorkerState::Running);
        handle
            .expected_idle_micros
            .store(expected_idle, Ordering::Relaxed);
        (Arc::new(handle), rx)
    }

    fn socket_pair() -> std::net::TcpStream {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        // Keep the client end alive for the duration of the test.
        std::mem::forget(client);
        accepted
    }

    #[tokio::test]
    async fn test_handoff_failure_triggers_reselection() {
        let mut core = test_core();

        // The more-idle worker is already dead: its control channel is closed.
        let (dead, dead_rx) = attached_handle(1, 9_000);
        drop(dead_rx);
        let (live, mut live_rx) = attached_handle(2, 1_000);

        core.pool.order_write().push(Arc::clone(&dead));
        core.pool.order_write().push(Arc::clone(&live));

        let pending = PendingConnection {
            stream: socket_pair(),
            prefix: b"hello".to_vec(),
            key: None,
        };
        let leftover = core.try_route(pending);
        assert!(leftover.is_none(), "connection must be routed, not returned");

        // The live worker received the connection, prefix intact.
        match live_rx.try_recv() {
            Ok(crate::message::Envelope::Connection { prefix, .. }) => {
                assert_eq!(prefix, b"hello");
            }
            other => panic!("expected a connection envelope, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_worker_leaves_connection_undelivered() {
        let mut core = test_core();
        let pending = PendingConnection {
            stream: socket_pair(),
            prefix: Vec::new(),
            key: None,
        };
        let leftover = core.try_route(pending);
        assert!(leftover.is_some(), "no worker means the connection comes back");
    }

    #[tokio::test]
    async fn test_affinity_rebinds_when_bound_worker_leaves() {
        let mut core = test_core();
        let mut candidates = vec![running_handle(1, 2_000), running_handle(2, 1_000)];
        let now = Instant::now();

        let first = core
            .select_target(&candidates, Some("10.9.9.9"), now)
            .unwrap();
        assert_eq!(first.id(), WorkerId(1));

        // Bound worker exits: the stale entry is purged and the key re-resolves.
        candidates.remove(0);
        let second = core
            .select_target(&candidates, Some("10.9.9.9"), now)
            .unwrap();
        assert_eq!(second.id(), WorkerId(2));

        // The new binding sticks.
        let third = core
            .select_target(&candidates, Some("10.9.9.9"), now)
            .unwrap();
        assert_eq!(third.id(), WorkerId(2));
    }
}
