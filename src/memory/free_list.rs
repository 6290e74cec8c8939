//! Circular free-list arena
//!
//! One `FreeList` tracks the free byte ranges of a single aperture as a
//! circular doubly-linked ring kept in strictly increasing address order.
//! Nodes live in an index-based slab (no pointer arithmetic); two roving
//! cursors persist across calls: the alloc cursor implements next-fit
//! allocation, the free cursor gives nearest-neighbor insertion on free.
//!
//! The list always holds at least one node; a single zero-length node is the
//! canonical "fully allocated" state, which avoids special-casing an empty
//! ring everywhere else.

use crate::error::{DriverError, DriverResult};

/// Minimum allocation alignment in bytes
pub const MIN_ALIGNMENT: u64 = 32;

/// Round `value` up to a power-of-two `alignment`
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[derive(Debug, Clone, Copy)]
struct FreeNode {
    /// Byte offset from the aperture base
    offset: u64,
    /// Length in bytes
    size: u64,
    prev: usize,
    next: usize,
}

/// Free-range tracker for one aperture
#[derive(Debug)]
pub struct FreeList {
    nodes: Vec<FreeNode>,
    /// Recycled slab slots
    spare: Vec<usize>,
    /// Lowest-offset node in the ring
    head: usize,
    /// Next-fit starting point
    alloc_cursor: usize,
    /// Nearest-neighbor starting point for free insertion
    free_cursor: usize,
    /// Live node count
    count: usize,
    capacity: u64,
}

impl FreeList {
    /// Create a free list covering `[0, capacity)`
    pub fn new(capacity: u64) -> Self {
        Self {
            nodes: vec![FreeNode {
                offset: 0,
                size: capacity,
                prev: 0,
                next: 0,
            }],
            spare: Vec::new(),
            head: 0,
            alloc_cursor: 0,
            free_cursor: 0,
            count: 1,
            capacity,
        }
    }

    /// Total bytes tracked as free
    pub fn total_free(&self) -> u64 {
        let mut sum = 0;
        let mut cur = self.head;
        for _ in 0..self.count {
            sum += self.nodes[cur].size;
            cur = self.nodes[cur].next;
        }
        sum
    }

    /// Number of free ranges in the ring
    pub fn fragment_count(&self) -> usize {
        if self.count == 1 && self.nodes[self.head].size == 0 {
            0
        } else {
            self.count
        }
    }

    /// Largest single allocation that could succeed at `alignment`,
    /// accounting for alignment loss in each block
    pub fn largest_free(&self, alignment: u64) -> u64 {
        let align = alignment.max(MIN_ALIGNMENT);
        let mut best = 0;
        let mut cur = self.head;
        for _ in 0..self.count {
            let node = self.nodes[cur];
            let aligned = align_up(node.offset, align);
            let pad = aligned - node.offset;
            best = best.max(node.size.saturating_sub(pad));
            cur = node.next;
        }
        best
    }

    fn take_slot(&mut self, node: FreeNode) -> usize {
        if let Some(idx) = self.spare.pop() {
            self.nodes[idx] = node;
            idx
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    /// Insert `idx` immediately before `at` in the ring
    fn link_before(&mut self, at: usize, idx: usize) {
        let prev = self.nodes[at].prev;
        self.nodes[idx].prev = prev;
        self.nodes[idx].next = at;
        self.nodes[prev].next = idx;
        self.nodes[at].prev = idx;
        self.count += 1;
    }

    fn unlink(&mut self, idx: usize) {
        debug_assert!(self.count > 1);
        let FreeNode { prev, next, .. } = self.nodes[idx];
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        if self.head == idx {
            self.head = next;
        }
        if self.alloc_cursor == idx {
            self.alloc_cursor = next;
        }
        if self.free_cursor == idx {
            self.free_cursor = next;
        }
        self.spare.push(idx);
        self.count -= 1;
    }

    /// Next-fit allocation.
    ///
    /// Rounds `size` up to the effective alignment (at least
    /// [`MIN_ALIGNMENT`]), then walks the ring from the alloc cursor for the
    /// first block whose aligned remainder fits. Splits the block, emitting
    /// a new node for any pre-alignment fragment, and leaves the alloc
    /// cursor on the block that absorbed the allocation.
    ///
    /// Returns `(offset, rounded_size)`; the caller must free exactly
    /// `rounded_size` bytes at `offset` later.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<(u64, u64)> {
        debug_assert!(size > 0);
        let align = alignment.max(MIN_ALIGNMENT);
        let rounded = align_up(size, align);

        let start = self.alloc_cursor;
        let mut cur = start;
        loop {
            let node = self.nodes[cur];
            let aligned = align_up(node.offset, align);
            let pad = aligned - node.offset;
            if node.size >= pad + rounded {
                if pad > 0 {
                    let pre = self.take_slot(FreeNode {
                        offset: node.offset,
                        size: pad,
                        prev: 0,
                        next: 0,
                    });
                    self.link_before(cur, pre);
                    if self.head == cur {
                        self.head = pre;
                    }
                }
                let n = &mut self.nodes[cur];
                n.offset = aligned + rounded;
                n.size = node.size - pad - rounded;
                if self.nodes[cur].size == 0 && self.count > 1 {
                    let next = self.nodes[cur].next;
                    self.unlink(cur);
                    self.alloc_cursor = next;
                } else {
                    self.alloc_cursor = cur;
                }
                tracing::trace!(offset = aligned, size = rounded, "arena allocate");
                return Some((aligned, rounded));
            }
            cur = node.next;
            if cur == start {
                return None;
            }
        }
    }

    /// Return `[offset, offset + size)` to the free ring.
    ///
    /// Tries the cheap paths first (prepend to head, append to tail), then
    /// a bidirectional walk from the nearer of head and the free cursor.
    /// Contiguous neighbors are coalesced; otherwise a node is inserted and
    /// the free cursor parked on it.
    ///
    /// Returns false when the range overlaps an existing free range (double
    /// free or cross-aperture free); the ring is left untouched in that
    /// case.
    pub fn free(&mut self, offset: u64, size: u64) -> bool {
        debug_assert!(size > 0);
        if offset + size > self.capacity {
            return false;
        }

        // Canonical empty state: one zero-length node
        if self.count == 1 && self.nodes[self.head].size == 0 {
            let head = self.head;
            self.nodes[head].offset = offset;
            self.nodes[head].size = size;
            self.free_cursor = head;
            return true;
        }

        let head = self.head;
        let head_off = self.nodes[head].offset;

        // Prepend to head
        if offset < head_off {
            if offset + size < head_off {
                let idx = self.take_slot(FreeNode {
                    offset,
                    size,
                    prev: 0,
                    next: 0,
                });
                self.link_before(head, idx);
                self.head = idx;
                self.free_cursor = idx;
            } else if offset + size == head_off {
                self.nodes[head].offset = offset;
                self.nodes[head].size += size;
                self.free_cursor = head;
            } else {
                return false; // runs into the head block
            }
            return true;
        }
        if offset == head_off {
            return false; // double free of the head range
        }

        // Append to tail
        let tail = self.nodes[head].prev;
        let tail_off = self.nodes[tail].offset;
        let tail_end = tail_off + self.nodes[tail].size;
        if offset >= tail_off {
            if offset == tail_off || offset < tail_end {
                return false; // inside the tail block
            }
            if offset == tail_end {
                self.nodes[tail].size += size;
                self.free_cursor = tail;
            } else {
                let idx = self.take_slot(FreeNode {
                    offset,
                    size,
                    prev: 0,
                    next: 0,
                });
                self.link_before(head, idx); // ring insert after tail
                self.free_cursor = idx;
            }
            return true;
        }

        // Interior: head_off < offset < tail_off. Start from whichever of
        // head and the free cursor sits closer by address.
        let fc_off = self.nodes[self.free_cursor].offset;
        let mut a = if fc_off.abs_diff(offset) < head_off.abs_diff(offset) {
            self.free_cursor
        } else {
            head
        };
        while self.nodes[a].offset >= offset {
            a = self.nodes[a].prev;
        }
        while self.nodes[self.nodes[a].next].offset < offset && self.nodes[a].next != self.head {
            a = self.nodes[a].next;
        }
        let b = self.nodes[a].next;

        if self.nodes[b].offset == offset {
            return false; // double free
        }
        let a_end = self.nodes[a].offset + self.nodes[a].size;
        if offset < a_end || offset + size > self.nodes[b].offset {
            return false; // overlaps a neighbor
        }

        if offset == a_end {
            self.nodes[a].size += size;
            // Bridged the gap to b entirely?
            if self.nodes[a].offset + self.nodes[a].size == self.nodes[b].offset {
                self.nodes[a].size += self.nodes[b].size;
                self.unlink(b);
            }
            self.free_cursor = a;
        } else if offset + size == self.nodes[b].offset {
            self.nodes[b].offset = offset;
            self.nodes[b].size += size;
            self.free_cursor = b;
        } else {
            let idx = self.take_slot(FreeNode {
                offset,
                size,
                prev: 0,
                next: 0,
            });
            self.link_before(b, idx);
            self.free_cursor = idx;
        }
        true
    }

    /// Walk the ring verifying circular-link integrity, strict ascending
    /// order and non-overlap. Cheap enough for debug builds; gated by the
    /// driver consistency-check flag at the aperture layer.
    pub fn check_consistency(&self) -> DriverResult<()> {
        let mut cur = self.head;
        let mut seen = 0usize;
        let mut sum = 0u64;
        loop {
            let node = self.nodes[cur];
            if self.nodes[node.next].prev != cur || self.nodes[node.prev].next != cur {
                return Err(DriverError::InternalInconsistency(format!(
                    "free list link broken at slot {}",
                    cur
                )));
            }
            if node.size == 0 && self.count > 1 {
                return Err(DriverError::InternalInconsistency(format!(
                    "zero-length node at offset {:#x} in multi-node ring",
                    node.offset
                )));
            }
            sum += node.size;
            seen += 1;
            let next = node.next;
            if next == self.head {
                break;
            }
            if seen > self.count {
                return Err(DriverError::InternalInconsistency(
                    "free list walk did not terminate at head".into(),
                ));
            }
            if self.nodes[next].offset < node.offset + node.size {
                return Err(DriverError::InternalInconsistency(format!(
                    "free blocks overlap or misordered at offset {:#x}",
                    node.offset
                )));
            }
            cur = next;
        }
        if seen != self.count {
            return Err(DriverError::InternalInconsistency(format!(
                "free list count mismatch: walked {}, tracked {}",
                seen, self.count
            )));
        }
        if sum > self.capacity {
            return Err(DriverError::InternalInconsistency(format!(
                "free total {} exceeds capacity {}",
                sum, self.capacity
            )));
        }
        Ok(())
    }
}
