//! Allocation handles
//!
//! `MemoryDescriptor` is the handle a client holds between `allocate` and
//! the matching `free` (or hands to the deferred reclaim queue). It carries
//! everything the driver needs to route the release without consulting the
//! caller again.

use serde::{Deserialize, Serialize};

/// Opaque caller-process identity, resolved by the platform layer
pub type ProcessId = u32;

/// Which aperture family an allocation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApertureKind {
    /// Physically contiguous, host-visible memory
    Contiguous,
    /// GPU-virtualized memory mapped through a per-process page table
    Virtual,
    /// Quota-limited virtualized window for client-supplied buffers
    External,
}

/// Handle to one live allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDescriptor {
    /// Device-visible address of the range
    pub device_address: u64,
    /// Host-visible address, when the aperture is host mapped
    pub host_address: Option<u64>,
    /// Rounded allocation size in bytes
    pub size: u64,
    /// Owning aperture family
    pub aperture: ApertureKind,
    /// Process the allocation is attributed to
    pub process_id: ProcessId,
    /// Backing memory supplied by the client, not owned by the allocator.
    /// Freeing an external descriptor must not hand its backing to any
    /// arena or page pool.
    pub external: bool,
}

impl MemoryDescriptor {
    /// Whether this range goes through a page table
    pub fn is_virtualized(&self) -> bool {
        matches!(self.aperture, ApertureKind::Virtual | ApertureKind::External)
    }
}
