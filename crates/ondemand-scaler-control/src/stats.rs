//! Process-wide counters.
//!
//! Every counter is an atomic owned by one [`ScalerStats`] in the
//! application context. Busy guards take a thread out of the free count for
//! as long as they live.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Scaler counters.
#[derive(Debug, Default)]
pub struct ScalerStats {
    accepted_evals: AtomicU64,
    accepted_allocs: AtomicU64,
    scaling_timeouts: AtomicU64,
    no_suited_events: AtomicU64,
    scaling_threads: AtomicUsize,
    free_scaling_threads: AtomicUsize,
    gc_threads: AtomicUsize,
    free_gc_threads: AtomicUsize,
}

/// Copy of the counters at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Evaluations received from the cluster.
    pub accepted_evals: u64,
    /// Allocations received from the cluster.
    pub accepted_allocs: u64,
    /// Pool updates that hit the hung-prevention deadline.
    pub scaling_timeouts: u64,
    /// Task groups with demand but no suitable pool.
    pub no_suited_events: u64,
    /// Scaling workers.
    pub scaling_threads: usize,
    /// Scaling workers waiting for work.
    pub free_scaling_threads: usize,
    /// GC loops.
    pub gc_threads: usize,
    /// GC loops between cycles.
    pub free_gc_threads: usize,
}

/// Marks one thread busy until dropped.
#[must_use = "the thread is only busy while the guard lives"]
pub struct BusyGuard<'a>(&'a AtomicUsize);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

impl ScalerStats {
    /// Counters for `scaling_threads` workers and `gc_threads` GC loops, all
    /// free.
    #[must_use]
    pub fn new(scaling_threads: usize, gc_threads: usize) -> Self {
        Self {
            scaling_threads: AtomicUsize::new(scaling_threads),
            free_scaling_threads: AtomicUsize::new(scaling_threads),
            gc_threads: AtomicUsize::new(gc_threads),
            free_gc_threads: AtomicUsize::new(gc_threads),
            ..Self::default()
        }
    }

    /// Count one received evaluation.
    pub fn inc_accepted_evals(&self) {
        self.accepted_evals.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one received allocation.
    pub fn inc_accepted_allocs(&self) {
        self.accepted_allocs.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one timed-out pool update.
    pub fn inc_scaling_timeouts(&self) {
        self.scaling_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one task group without a suitable pool.
    pub fn inc_no_suited(&self) {
        self.no_suited_events.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a scaling worker busy.
    pub fn scaling_busy(&self) -> BusyGuard<'_> {
        self.free_scaling_threads.fetch_sub(1, Ordering::Relaxed);
        BusyGuard(&self.free_scaling_threads)
    }

    /// Mark a GC loop busy.
    pub fn gc_busy(&self) -> BusyGuard<'_> {
        self.free_gc_threads.fetch_sub(1, Ordering::Relaxed);
        BusyGuard(&self.free_gc_threads)
    }

    /// Read every counter.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted_evals: self.accepted_evals.load(Ordering::Relaxed),
            accepted_allocs: self.accepted_allocs.load(Ordering::Relaxed),
            scaling_timeouts: self.scaling_timeouts.load(Ordering::Relaxed),
            no_suited_events: self.no_suited_events.load(Ordering::Relaxed),
            scaling_threads: self.scaling_threads.load(Ordering::Relaxed),
            free_scaling_threads: self.free_scaling_threads.load(Ordering::Relaxed),
            gc_threads: self.gc_threads.load(Ordering::Relaxed),
            free_gc_threads: self.free_gc_threads.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_guard_restores_free_count() {
        let stats = ScalerStats::new(2, 1);
        {
            let _a = stats.scaling_busy();
            let _b = stats.scaling_busy();
            let _gc = stats.gc_busy();
            let snap = stats.snapshot();
            assert_eq!(snap.free_scaling_threads, 0);
            assert_eq!(snap.free_gc_threads, 0);
        }
        let snap = stats.snapshot();
        assert_eq!(snap.free_scaling_threads, 2);
        assert_eq!(snap.scaling_threads, 2);
        assert_eq!(snap.free_gc_threads, 1);
    }

    #[test]
    fn counters() {
        let stats = ScalerStats::new(1, 0);
        stats.inc_accepted_evals();
        stats.inc_accepted_evals();
        stats.inc_accepted_allocs();
        stats.inc_scaling_timeouts();
        stats.inc_no_suited();
        let snap = stats.snapshot();
        assert_eq!(
            (snap.accepted_evals, snap.accepted_allocs, snap.scaling_timeouts, snap.no_suited_events),
            (2, 1, 1, 1)
        );
    }
}
