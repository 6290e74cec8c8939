//! Software MMU
//!
//! One page table per caller process, shared across every device that uses
//! the same virtual-address convention. Page-table entries are packed
//! 64-bit words held in device-addressable backing memory; dirty tracking
//! happens at "super-PTE" granularity (fixed groups of entries) so that TLB
//! invalidation can be batched: an unmap only marks groups dirty, and the
//! flush is paid once when a dirty group is reused or the table is next
//! bound, not once per unmap.

use std::collections::HashMap;

use crate::error::{DriverError, DriverResult};
use crate::hal::PhysicalPage;
use crate::memory::{MemoryDescriptor, ProcessId};

/// Page-table entries per dirty-tracking group
pub const SUPER_PTE_ENTRIES: usize = 16;

/// Extra entries allocated past the window, absorbing boundary prefetch
const OWNER_SLACK_ENTRIES: usize = 8;

/// Access permission for a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Device may read the pages
    ReadOnly,
    /// Device may read and write the pages
    ReadWrite,
}

/// Packed page-table entry: valid and writable bits in the low bits, the
/// physical page number above them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte(u64);

impl Pte {
    const VALID: u64 = 1 << 0;
    const WRITABLE: u64 = 1 << 1;
    const PAGE_SHIFT: u32 = 12;

    /// The zero entry; maps nothing
    pub const INVALID: Pte = Pte(0);

    /// Pack a physical page and access permission
    pub fn encode(page: PhysicalPage, access: Access) -> Self {
        let mut bits = (page >> Self::PAGE_SHIFT) << Self::PAGE_SHIFT | Self::VALID;
        if access == Access::ReadWrite {
            bits |= Self::WRITABLE;
        }
        Pte(bits)
    }

    /// Whether the entry maps a page
    pub fn is_valid(self) -> bool {
        self.0 & Self::VALID != 0
    }

    /// Whether the device may write through this entry
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE != 0
    }

    /// The mapped physical page
    pub fn page(self) -> PhysicalPage {
        (self.0 >> Self::PAGE_SHIFT) << Self::PAGE_SHIFT
    }
}

/// Pending-invalidation set, one bit per super-PTE group
#[derive(Debug)]
struct DirtyBitmap {
    bits: Vec<u64>,
}

impl DirtyBitmap {
    fn new(groups: usize) -> Self {
        Self {
            bits: vec![0; groups.div_ceil(64)],
        }
    }

    fn mark(&mut self, group: usize) {
        self.bits[group / 64] |= 1 << (group % 64);
    }

    fn is_dirty(&self, group: usize) -> bool {
        self.bits[group / 64] & (1 << (group % 64)) != 0
    }

    fn any(&self) -> bool {
        self.bits.iter().any(|w| *w != 0)
    }

    fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }
}

/// One software page table, reference counted across attach calls
pub struct PageTableOwner {
    process_id: ProcessId,
    ref_count: u32,
    entries: Vec<Pte>,
    /// One past the highest super-PTE group holding a valid entry
    last_super_pte: usize,
    dirty: DirtyBitmap,
    /// Device-addressable storage backing the entry array
    backing: MemoryDescriptor,
    mapped_entries: usize,
}

impl PageTableOwner {
    /// Process this table belongs to
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Current reference count
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Entries currently mapped
    pub fn mapped_entries(&self) -> usize {
        self.mapped_entries
    }

    /// High-water super-PTE mark
    pub fn last_super_pte(&self) -> usize {
        self.last_super_pte
    }

    fn group_has_valid_entries(&self, group: usize) -> bool {
        let start = group * SUPER_PTE_ENTRIES;
        let end = (start + SUPER_PTE_ENTRIES).min(self.entries.len());
        self.entries[start..end].iter().any(|pte| pte.is_valid())
    }
}

/// Registry of page-table owners for one virtual-address convention.
///
/// Shared by every device of that convention; the registry's lock guards
/// reference counts and the dirty bitmaps regardless of which device
/// triggered the access.
pub struct PageTableRegistry {
    virt_base: u64,
    virt_range: u64,
    page_size: u64,
    owners: HashMap<ProcessId, PageTableOwner>,
}

impl PageTableRegistry {
    /// Create an empty registry for the window `[virt_base, virt_base +
    /// virt_range)` at `page_size` granularity.
    pub fn new(virt_base: u64, virt_range: u64, page_size: u64) -> Self {
        Self {
            virt_base,
            virt_range,
            page_size,
            owners: HashMap::new(),
        }
    }

    /// Entries a backing store must hold (window plus slack)
    pub fn entry_capacity(&self) -> usize {
        (self.virt_range / self.page_size) as usize + OWNER_SLACK_ENTRIES
    }

    /// Bytes of device-addressable memory a backing store needs
    pub fn backing_bytes(&self) -> u64 {
        self.entry_capacity() as u64 * std::mem::size_of::<u64>() as u64
    }

    /// Whether an owner already exists for `process_id`
    pub fn has_owner(&self, process_id: ProcessId) -> bool {
        self.owners.contains_key(&process_id)
    }

    /// Number of live owners
    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }

    /// Create the page table for `process_id`, zero-filled, refcount zero.
    /// When an owner already exists (another device of the same convention
    /// created it for this process) it is reused and `backing` is returned
    /// to the caller for release.
    pub fn create_owner(
        &mut self,
        process_id: ProcessId,
        backing: MemoryDescriptor,
    ) -> Option<MemoryDescriptor> {
        if self.has_owner(process_id) {
            tracing::debug!(process_id, "page table owner reused");
            return Some(backing);
        }
        let capacity = self.entry_capacity();
        let groups = capacity.div_ceil(SUPER_PTE_ENTRIES);
        self.owners.insert(
            process_id,
            PageTableOwner {
                process_id,
                ref_count: 0,
                entries: vec![Pte::INVALID; capacity],
                last_super_pte: 0,
                dirty: DirtyBitmap::new(groups),
                backing,
                mapped_entries: 0,
            },
        );
        tracing::info!(process_id, entries = capacity, "page table owner created");
        None
    }

    fn owner_mut(&mut self, process_id: ProcessId) -> DriverResult<&mut PageTableOwner> {
        self.owners
            .get_mut(&process_id)
            .ok_or(DriverError::NotInitialized("page table owner"))
    }

    /// Borrow an owner for inspection
    pub fn owner(&self, process_id: ProcessId) -> Option<&PageTableOwner> {
        self.owners.get(&process_id)
    }

    /// Increment the owner's reference count
    pub fn attach(&mut self, process_id: ProcessId) -> DriverResult<u32> {
        let owner = self.owner_mut(process_id)?;
        owner.ref_count += 1;
        Ok(owner.ref_count)
    }

    /// Decrement the owner's reference count. The owner (and its backing
    /// descriptor, returned for release) is destroyed only once the count
    /// reaches zero with no mappings outstanding; outstanding mappings are
    /// a leak and are reported but keep the storage alive.
    pub fn detach(&mut self, process_id: ProcessId) -> DriverResult<Option<MemoryDescriptor>> {
        let owner = self.owner_mut(process_id)?;
        owner.ref_count = owner.ref_count.saturating_sub(1);
        if owner.ref_count > 0 {
            return Ok(None);
        }
        if owner.mapped_entries > 0 {
            debug_assert!(
                false,
                "page table for process {} detached with {} mappings outstanding",
                process_id, owner.mapped_entries
            );
            tracing::warn!(
                process_id,
                mapped = owner.mapped_entries,
                "detach with mappings outstanding; storage retained"
            );
            return Ok(None);
        }
        let owner = self
            .owners
            .remove(&process_id)
            .expect("owner present above");
        tracing::info!(process_id, "page table owner destroyed");
        Ok(Some(owner.backing))
    }

    fn entry_index(&self, device_virtual: u64) -> DriverResult<usize> {
        if device_virtual % self.page_size != 0 {
            return Err(DriverError::InvalidArgument(format!(
                "virtual address {:#x} not page aligned",
                device_virtual
            )));
        }
        device_virtual
            .checked_sub(self.virt_base)
            .map(|off| (off / self.page_size) as usize)
            .filter(|idx| *idx < (self.virt_range / self.page_size) as usize)
            .ok_or_else(|| {
                DriverError::InvalidArgument(format!(
                    "virtual address {:#x} outside the window",
                    device_virtual
                ))
            })
    }

    /// Map `pages` starting at `device_virtual`.
    ///
    /// Returns true when a super-PTE group being reused was left dirty by an
    /// earlier unmap, in which case every device sharing this table must
    /// schedule a TLB flush before its next command submission.
    ///
    /// Mapping over a valid entry is an invariant violation (the arena
    /// guarantees disjoint ranges); the operation is aborted without
    /// modifying the table.
    pub fn map(
        &mut self,
        process_id: ProcessId,
        device_virtual: u64,
        pages: &[PhysicalPage],
        access: Access,
    ) -> DriverResult<bool> {
        if pages.is_empty() {
            return Err(DriverError::InvalidArgument(
                "mapping with zero pages".into(),
            ));
        }
        let first = self.entry_index(device_virtual)?;
        let window_entries = (self.virt_range / self.page_size) as usize;
        if first + pages.len() > window_entries {
            return Err(DriverError::InvalidArgument(format!(
                "mapping of {} pages at {:#x} exceeds the window",
                pages.len(),
                device_virtual
            )));
        }
        let owner = self.owner_mut(process_id)?;

        for (i, slot) in owner.entries[first..first + pages.len()].iter().enumerate() {
            if slot.is_valid() {
                tracing::error!(
                    process_id,
                    entry = first + i,
                    "mapping over an already-mapped entry"
                );
                return Err(DriverError::InternalInconsistency(format!(
                    "PTE {} already mapped for process {}",
                    first + i,
                    process_id
                )));
            }
        }
        for (i, page) in pages.iter().enumerate() {
            owner.entries[first + i] = Pte::encode(*page, access);
        }
        owner.mapped_entries += pages.len();

        let first_group = first / SUPER_PTE_ENTRIES;
        let last_group = (first + pages.len() - 1) / SUPER_PTE_ENTRIES;
        let needs_flush = (first_group..=last_group).any(|g| owner.dirty.is_dirty(g));
        owner.last_super_pte = owner.last_super_pte.max(last_group + 1);
        tracing::trace!(
            process_id,
            device_virtual,
            pages = pages.len(),
            needs_flush,
            "mmu map"
        );
        Ok(needs_flush)
    }

    /// Unmap `length` bytes starting at `device_virtual`: clear the
    /// entries, mark every touched super-PTE group dirty (pending
    /// invalidation) and retract the high-water mark when the freed range
    /// was the mapped tail.
    pub fn unmap(
        &mut self,
        process_id: ProcessId,
        device_virtual: u64,
        length: u64,
    ) -> DriverResult<()> {
        if length == 0 {
            return Err(DriverError::InvalidArgument("unmap of zero bytes".into()));
        }
        let first = self.entry_index(device_virtual)?;
        let count = length.div_ceil(self.page_size) as usize;
        let window_entries = (self.virt_range / self.page_size) as usize;
        if first + count > window_entries {
            return Err(DriverError::InvalidArgument(format!(
                "unmap of {:#x}+{:#x} exceeds the window",
                device_virtual, length
            )));
        }
        let owner = self.owner_mut(process_id)?;

        let mut cleared = 0usize;
        for slot in &mut owner.entries[first..first + count] {
            if slot.is_valid() {
                cleared += 1;
            }
            *slot = Pte::INVALID;
        }
        owner.mapped_entries -= cleared;

        let first_group = first / SUPER_PTE_ENTRIES;
        let last_group = (first + count - 1) / SUPER_PTE_ENTRIES;
        for group in first_group..=last_group {
            owner.dirty.mark(group);
        }
        // Pull the high-water mark back over now-empty tail groups
        if last_group + 1 == owner.last_super_pte {
            let mut mark = owner.last_super_pte;
            while mark > 0 && !owner.group_has_valid_entries(mark - 1) {
                mark -= 1;
            }
            owner.last_super_pte = mark;
        }
        tracing::trace!(process_id, device_virtual, length, "mmu unmap");
        Ok(())
    }

    /// Look up the entry backing `device_virtual` for a process
    pub fn query(&self, process_id: ProcessId, device_virtual: u64) -> Option<Pte> {
        let owner = self.owners.get(&process_id)?;
        let off = device_virtual.checked_sub(self.virt_base)?;
        let idx = (off / self.page_size) as usize;
        owner
            .entries
            .get(idx)
            .copied()
            .filter(|pte| pte.is_valid())
    }

    /// Whether the owner has invalidations pending
    pub fn has_pending_invalidations(&self, process_id: ProcessId) -> bool {
        self.owners
            .get(&process_id)
            .map(|o| o.dirty.any())
            .unwrap_or(false)
    }

    /// Clear the pending-invalidation set after a flush was issued
    pub fn acknowledge_flush(&mut self, process_id: ProcessId) {
        if let Some(owner) = self.owners.get_mut(&process_id) {
            owner.dirty.clear_all();
        }
    }

    /// Process ids of every live owner
    pub fn owner_ids(&self) -> Vec<ProcessId> {
        self.owners.keys().copied().collect()
    }

    /// Remove an owner unconditionally, ignoring reference counts and
    /// outstanding mappings, and return its backing for release. Fault and
    /// shutdown path only.
    pub fn force_destroy(&mut self, process_id: ProcessId) -> Option<MemoryDescriptor> {
        let owner = self.owners.remove(&process_id)?;
        if owner.mapped_entries > 0 {
            tracing::warn!(
                process_id,
                mapped = owner.mapped_entries,
                "page table destroyed with mappings outstanding"
            );
        }
        Some(owner.backing)
    }

    /// Device address of the owner's backing table (for the base register)
    pub fn table_base(&self, process_id: ProcessId) -> DriverResult<u64> {
        self.owners
            .get(&process_id)
            .map(|o| o.backing.device_address)
            .ok_or(DriverError::NotInitialized("page table owner"))
    }
}
