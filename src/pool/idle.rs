//! Periodic idleness sampling
//!
//! Each worker maintains a monotonically increasing cumulative idle counter
//! (time its harness spends parked waiting for work). On a fixed period the
//! sampler turns that into a decayed "expected idleness" score per worker and
//! re-sorts the routing order so the router's selection scan usually
//! terminates within the first few entries.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::PoolManager;

/// Sampling period.
pub(crate) const IDLE_SAMPLE_INTERVAL: Duration = Duration::from_millis(1000);

/// Additive floor on each sample. A worker that was briefly 100% busy must
/// decay back toward eligibility over successive windows instead of being
/// starved forever.
pub(crate) const IDLE_DECAY_FLOOR_MICROS: u64 = 1_000;

/// Run the sampler until the pool shuts down. Holds only a weak reference so
/// the sampler never keeps a dropped pool alive on its own.
pub(crate) fn spawn_idle_sampler(pool: &Arc<PoolManager>) {
    let weak = Arc::downgrade(pool);
    let mut shutdown = pool.shutdown_signal();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(IDLE_SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(pool) = weak.upgrade() else { break };
                    pool.sample_idleness();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        trace!("idle sampler stopping");
                        break;
                    }
                }
            }
        }
    });
}

impl PoolManager {
    /// One sampling pass: refresh every worker's expected idleness from its
    /// cumulative counter, reset its request share, and re-sort the routing
    /// order by descending expected idleness.
    pub(crate) fn sample_idleness(&self) {
        for entry in self.workers.iter() {
            let handle = entry.value();
            let idle = handle.idle_micros.load(Ordering::Relaxed);
            let last = handle.last_idle_micros.swap(idle, Ordering::Relaxed);
            let delta = idle.saturating_sub(last);
            handle
                .expected_idle_micros
                .store(delta + IDLE_DECAY_FLOOR_MICROS, Ordering::Relaxed);
            handle.requests.store(1, Ordering::Relaxed);
        }

        self.order_write()
            .sort_by(|a, b| b.expected_idle_micros().cmp(&a.expected_idle_micros()));
    }
}
