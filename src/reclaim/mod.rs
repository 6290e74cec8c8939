//! Deferred memory reclamation
//!
//! Freeing memory the device may still be reading is deferred: the
//! descriptor is queued with the timestamp after which it is safe to
//! release, and the queue is drained opportunistically (on allocation
//! attempts and process detach) against the device's retired timestamp.
//! Submissions are totally ordered per ring, so the queue is
//! timestamp-ordered by construction and only the eligible prefix ever
//! needs to be examined.

use std::collections::VecDeque;

use crate::memory::{MemoryDescriptor, ProcessId};
use crate::ring::{timestamp_at_or_after, Timestamp};

/// One deferred free
#[derive(Debug, Clone)]
pub struct PendingFree {
    /// The allocation to release
    pub descriptor: MemoryDescriptor,
    /// Safe to release once the retired counter reaches this
    pub timestamp: Timestamp,
    /// Process the release is attributed to
    pub process_id: ProcessId,
}

/// Per-device FIFO of deferred frees
#[derive(Debug, Default)]
pub struct ReclaimQueue {
    pending: VecDeque<PendingFree>,
}

impl ReclaimQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries waiting for the device
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Append a deferred free
    pub fn enqueue(
        &mut self,
        descriptor: MemoryDescriptor,
        timestamp: Timestamp,
        process_id: ProcessId,
    ) {
        tracing::trace!(
            device_address = descriptor.device_address,
            timestamp,
            process_id,
            "deferred free queued"
        );
        self.pending.push_back(PendingFree {
            descriptor,
            timestamp,
            process_id,
        });
    }

    /// Unlink the prefix of entries whose timestamp is at or before
    /// `retired`, in FIFO order, stopping at the first ineligible node.
    pub fn drain_ready(&mut self, retired: Timestamp) -> Vec<PendingFree> {
        let mut ready = Vec::new();
        while let Some(head) = self.pending.front() {
            if !timestamp_at_or_after(retired, head.timestamp) {
                break;
            }
            ready.push(self.pending.pop_front().expect("front checked above"));
        }
        ready
    }

    /// Unlink everything regardless of device progress (teardown)
    pub fn drain_all(&mut self) -> Vec<PendingFree> {
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ApertureKind;

    fn desc(addr: u64) -> MemoryDescriptor {
        MemoryDescriptor {
            device_address: addr,
            host_address: None,
            size: 4096,
            aperture: ApertureKind::Virtual,
            process_id: 1,
            external: false,
        }
    }

    #[test]
    fn test_drains_exactly_the_eligible_prefix() {
        let mut queue = ReclaimQueue::new();
        for ts in 1..=5u32 {
            queue.enqueue(desc(ts as u64 * 0x1000), ts, 1);
        }
        let ready = queue.drain_ready(3);
        let stamps: Vec<u32> = ready.iter().map(|p| p.timestamp).collect();
        assert_eq!(stamps, vec![1, 2, 3]);
        assert_eq!(queue.len(), 2);
        // No progress, nothing more comes out
        assert!(queue.drain_ready(3).is_empty());
        let rest = queue.drain_ready(5);
        assert_eq!(rest.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_order_preserved() {
        let mut queue = ReclaimQueue::new();
        queue.enqueue(desc(0x1000), 2, 1);
        queue.enqueue(desc(0x2000), 2, 1);
        queue.enqueue(desc(0x3000), 2, 1);
        let ready = queue.drain_ready(2);
        let addrs: Vec<u64> = ready.iter().map(|p| p.descriptor.device_address).collect();
        assert_eq!(addrs, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn test_drain_is_wraparound_safe() {
        let mut queue = ReclaimQueue::new();
        let near_max = u32::MAX - 1;
        queue.enqueue(desc(0x1000), near_max, 1);
        queue.enqueue(desc(0x2000), near_max.wrapping_add(2), 1);
        // Retired counter has wrapped past the first entry only
        let ready = queue.drain_ready(near_max.wrapping_add(1));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].timestamp, near_max);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_all_ignores_timestamps() {
        let mut queue = ReclaimQueue::new();
        queue.enqueue(desc(0x1000), 10, 1);
        queue.enqueue(desc(0x2000), 20, 2);
        assert_eq!(queue.drain_all().len(), 2);
        assert!(queue.is_empty());
    }
}
