//! Worker selection strategies
//!
//! The most-idle selector walks the routing order (already sorted by
//! descending expected idleness) computing an availability score per worker.
//! It remembers the runner-up score from the previous pass so a later pass can
//! usually stop after the first few entries: anything beating the previous
//! runner-up is good enough. The short-circuit trades a little staleness for
//! near-constant selection cost under steady load; correctness never depends
//! on it.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::pool::WorkerHandle;

/// How the router picks a destination worker for an accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// Route to the worker with the best availability score.
    MostIdle,
    /// Sticky routing by the connecting socket's remote address.
    RemoteAffinity,
    /// Sticky routing by the value of a request header; connections are held
    /// un-routed until the named header has been observed.
    HeaderAffinity(String),
}

impl RoutingStrategy {
    /// `most-idle` and `remote-affinity` are reserved; any other string names
    /// the header to route on.
    pub fn parse(s: &str) -> Self {
        match s {
            "most-idle" => RoutingStrategy::MostIdle,
            "remote-affinity" => RoutingStrategy::RemoteAffinity,
            header => RoutingStrategy::HeaderAffinity(header.to_string()),
        }
    }
}

impl FromStr for RoutingStrategy {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingStrategy::MostIdle => write!(f, "most-idle"),
            RoutingStrategy::RemoteAffinity => write!(f, "remote-affinity"),
            RoutingStrategy::HeaderAffinity(h) => write!(f, "{}", h),
        }
    }
}

/// What to do with an accepted connection when no worker is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoWorkerPolicy {
    /// Close the connection immediately.
    #[default]
    Reject,
    /// Hold the connection and retry once a worker becomes available.
    Queue,
}

/// Most-idle selection state.
pub(crate) struct MostIdleSelector {
    /// Runner-up availability from the previous pass; 0 disables the
    /// short-circuit for the next pass.
    second_best: f64,
}

impl MostIdleSelector {
    pub fn new() -> Self {
        Self { second_best: 0.0 }
    }

    /// Pick the most available candidate. Ties break toward the earlier list
    /// position, which makes selection deterministic.
    pub fn select(&mut self, candidates: &[Arc<WorkerHandle>]) -> Option<usize> {
        let mut best: Option<usize> = None;
        let mut best_avail = 0.0_f64;
        let mut runner_up = 0.0_f64;

        for (i, worker) in candidates.iter().enumerate() {
            let requests = worker.request_share().max(1) as f64;
            let avail = worker.expected_idle_micros() as f64 / requests;
            if avail > best_avail {
                runner_up = best_avail;
                best_avail = avail;
                best = Some(i);
                if self.second_best > 0.0 && avail > self.second_best {
                    break;
                }
            } else if avail > runner_up {
                runner_up = avail;
            }
        }

        self.second_best = runner_up;

        // Workers with no idleness sample yet score zero; fall back to the
        // head of the routing order rather than refusing to route.
        best.or(if candidates.is_empty() { None } else { Some(0) })
    }
}
