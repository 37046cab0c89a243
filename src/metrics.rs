use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A 'snapshot' of a heap's allocation and collection counters.
///
/// Obtained by calling [`crate::Heap::metrics`].
#[derive(Clone, Debug, Default)]
pub struct HeapMetrics {
    pub heap_id: u64,
    /// Number of arenas currently chained to the heap.
    pub arenas: usize,
    /// Bytes mapped for allocation across all arenas.
    pub bytes_reserved: usize,
    /// Bytes handed out across all arenas.
    pub bytes_used: usize,
    /// Allocations since the last collection.
    pub alloc_count: u64,
    /// Allocations over the heap's lifetime.
    pub total_alloc_count: u64,
    /// Records that survived the last collection.
    pub inherit_count: u64,
    /// Number of collections that have occured.
    pub collections: u64,
    pub last_collect_time: Duration,
    /// Average time that takes for a collection to complete.
    pub avg_collect_time: Duration,
}

/// Collection counters that are updated from the collector and read
/// concurrently by metrics snapshots.
#[derive(Debug, Default)]
pub(crate) struct CollectCounters {
    pub collections: AtomicU64,
    pub last_collect_nanos: AtomicU64,
    pub avg_collect_nanos: AtomicU64,
}

impl CollectCounters {
    pub fn record(&self, elapsed: Duration) {
        let nanos = elapsed.as_nanos() as u64;
        let sample = self.collections.fetch_add(1, Ordering::Relaxed) + 1;

        self.last_collect_nanos.store(nanos, Ordering::Relaxed);
        update_avg_u64(&self.avg_collect_nanos, nanos, sample);
    }

    pub fn collections(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    pub fn last(&self) -> Duration {
        Duration::from_nanos(self.last_collect_nanos.load(Ordering::Relaxed))
    }

    pub fn avg(&self) -> Duration {
        Duration::from_nanos(self.avg_collect_nanos.load(Ordering::Relaxed))
    }
}

pub fn update_avg_u64(running_avg: &AtomicU64, new_value: u64, sample_size: u64) {
    let sample_size = sample_size.max(1);
    let avg = running_avg.load(Ordering::Relaxed);
    let update = new_value.abs_diff(avg) / sample_size;
    let new_avg = if new_value >= avg {
        avg + update
    } else {
        avg - update
    };

    running_avg.store(new_avg, Ordering::Relaxed);
}
