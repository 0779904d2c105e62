//! Per-worker memory budget computation
//!
//! Given the machine's total memory, the desired worker count, and an optional
//! licensed memory ceiling, this module computes how much heap each worker may
//! claim. A single worker must never take the majority of system memory: the
//! storage engine relies on what remains for OS page cache.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest old-generation budget a worker is ever given, in MB.
pub const MIN_OLD_GEN_MB: u64 = 512;

/// Young-generation budget bounds, in MB.
pub const MIN_YOUNG_GEN_MB: u64 = 16;
pub const MAX_YOUNG_GEN_MB: u64 = 64;

/// Errors from budget computation
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BudgetError {
    #[error("thread count must be positive, got {0}")]
    InvalidThreadCount(u32),
}

/// Heap budget for a single worker, in MB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    /// Old-generation (long-lived heap) budget
    pub old_gen_mb: u64,
    /// Young-generation (allocation nursery) budget
    pub young_gen_mb: u64,
}

/// Compute the per-worker memory budget.
///
/// The old-generation budget divides total memory by `1 + threads/4`: the `/4`
/// softens the decrease as the pool grows, so small pools still get generous
/// per-worker budgets. The result is clamped to at least [`MIN_OLD_GEN_MB`]
/// and at most the licensed ceiling, when one is configured. The
/// young-generation budget is `old_gen >> 7`, clamped to
/// [[`MIN_YOUNG_GEN_MB`], [`MAX_YOUNG_GEN_MB`]].
///
/// A licensed ceiling below the old-generation floor loses: the floor wins.
///
/// Pure function, no side effects.
pub fn compute_memory_budget(
    thread_count: u32,
    total_system_memory_mb: u64,
    licensed_memory_mb: Option<u64>,
) -> Result<MemoryBudget, BudgetError> {
    if thread_count == 0 {
        return Err(BudgetError::InvalidThreadCount(thread_count));
    }

    let divisor = 1.0 + thread_count as f64 / 4.0;
    let raw = (total_system_memory_mb as f64 / divisor).floor() as u64;

    let ceiling = licensed_memory_mb.unwrap_or(u64::MAX).max(MIN_OLD_GEN_MB);
    let old_gen_mb = raw.clamp(MIN_OLD_GEN_MB, ceiling);

    let young_gen_mb = (old_gen_mb >> 7).clamp(MIN_YOUNG_GEN_MB, MAX_YOUNG_GEN_MB);

    Ok(MemoryBudget {
        old_gen_mb,
        young_gen_mb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_threads_rejected() {
        assert_eq!(
            compute_memory_budget(0, 16384, None),
            Err(BudgetError::InvalidThreadCount(0))
        );
    }

    #[test]
    fn test_single_thread_generous_budget() {
        // 16 GB / (1 + 1/4) = 13107 MB
        let budget = compute_memory_budget(1, 16384, None).unwrap();
        assert_eq!(budget.old_gen_mb, 13107);
        assert_eq!(budget.young_gen_mb, 64); // 13107 >> 7 = 102, clamped down
    }

    #[test]
    fn test_large_pool_shrinks_budget() {
        let small_pool = compute_memory_budget(2, 32768, None).unwrap();
        let large_pool = compute_memory_budget(32, 32768, None).unwrap();
        assert!(large_pool.old_gen_mb < small_pool.old_gen_mb);
    }

    #[test]
    fn test_old_gen_floor() {
        // Tiny machine: 1 GB across 16 threads would be 204 MB, floor applies.
        let budget = compute_memory_budget(16, 1024, None).unwrap();
        assert_eq!(budget.old_gen_mb, MIN_OLD_GEN_MB);
        assert_eq!(budget.young_gen_mb, MIN_YOUNG_GEN_MB);
    }

    #[test]
    fn test_licensed_ceiling_applies() {
        let budget = compute_memory_budget(1, 65536, Some(4096)).unwrap();
        assert_eq!(budget.old_gen_mb, 4096);
        assert_eq!(budget.young_gen_mb, 32); // 4096 >> 7
    }

    #[test]
    fn test_licensed_ceiling_below_floor_loses() {
        let budget = compute_memory_budget(1, 65536, Some(128)).unwrap();
        assert_eq!(budget.old_gen_mb, MIN_OLD_GEN_MB);
    }

    #[test]
    fn test_bounds_hold_for_any_input() {
        for threads in [1u32, 2, 4, 8, 64, 1024] {
            for total in [1u64, 512, 4096, 1 << 20] {
                let budget = compute_memory_budget(threads, total, None).unwrap();
                assert!(budget.old_gen_mb >= MIN_OLD_GEN_MB);
                assert!(budget.young_gen_mb >= MIN_YOUNG_GEN_MB);
                assert!(budget.young_gen_mb <= MAX_YOUNG_GEN_MB);
            }
        }
    }
}
