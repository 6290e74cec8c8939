//! Driver context and public API surface
//!
//! `DriverContext` is the explicitly constructed owner of every aperture,
//! page table and command ring; nothing in the crate lives in static state.
//! The public methods compose the lower layers into the operations the rest
//! of a driver stack calls: allocate/free (immediate and
//! timestamp-deferred), external-buffer mapping, batch submission and
//! completion waits, plus the teardown entry points a device-fatal path
//! needs.
//!
//! Locking: one coarse API mutex serializes the external surface so that
//! compound operations (allocate-then-map, switch-context-then-submit) are
//! atomic with respect to concurrent callers; each component keeps its own
//! mutex underneath. Lock order is always API mutex → component mutex, and
//! components never call back into the API layer. Blocking waits snapshot
//! the handles they need and release the API mutex before suspending.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DriverError, DriverResult};
use crate::hal::{
    DeviceSharedMemory, InterruptSource, PagePool, PhysicalPage, RegisterBus, PAGE_SIZE,
    REG_PT_BASE_HI, REG_PT_BASE_LO, REG_SPACE_SIZE, REG_TLB_FLUSH,
};
use crate::memory::{Aperture, ApertureConfig, ApertureKind, MemoryDescriptor, ProcessId};
use crate::mmu::{Access, PageTableRegistry};
use crate::reclaim::ReclaimQueue;
use crate::ring::{wait_for_timestamp, CommandRing, Timestamp};

/// Index of a device within the driver context
pub type DeviceId = usize;

/// Driver-wide configuration, normally deserialized from the platform
/// layout table.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Aperture layout table
    pub apertures: Vec<ApertureConfig>,
    /// Submission granularity of every command ring, in words
    #[serde(default = "default_ring_block_words")]
    pub ring_block_words: u32,
    /// Whether the GPU virtual-memory path is active
    #[serde(default = "default_true")]
    pub mmu_enabled: bool,
    /// Base of the device-virtual window covered by the page tables
    pub virt_base: u64,
    /// Size of the device-virtual window
    pub virt_range: u64,
    /// Run free-list consistency checks around allocator mutations
    #[serde(default)]
    pub consistency_checks: bool,
    /// Bound on ring start / initialization waits, milliseconds
    #[serde(default = "default_start_timeout_ms")]
    pub start_timeout_ms: u64,
}

fn default_ring_block_words() -> u32 {
    16
}

fn default_true() -> bool {
    true
}

fn default_start_timeout_ms() -> u64 {
    1000
}

impl Default for DriverConfig {
    /// A layout suitable for tests and bring-up: a host-visible contiguous
    /// aperture plus a virtual and an external window sharing one
    /// page-table convention.
    fn default() -> Self {
        Self {
            apertures: vec![
                ApertureConfig {
                    kind: ApertureKind::Contiguous,
                    host_base: Some(0x0000_7f00_0000_0000),
                    device_base: 0x8000_0000,
                    size: 8 << 20,
                },
                ApertureConfig {
                    kind: ApertureKind::Virtual,
                    host_base: None,
                    device_base: 0x1_0000_0000,
                    size: 64 << 20,
                },
                ApertureConfig {
                    kind: ApertureKind::External,
                    host_base: None,
                    device_base: 0x1_0400_0000,
                    size: 32 << 20,
                },
            ],
            ring_block_words: default_ring_block_words(),
            mmu_enabled: true,
            virt_base: 0x1_0000_0000,
            virt_range: 128 << 20,
            consistency_checks: true,
            start_timeout_ms: default_start_timeout_ms(),
        }
    }
}

/// The per-device collaborator handles the platform layer supplies
pub struct DeviceHardware {
    /// Register window access
    pub registers: Arc<dyn RegisterBus>,
    /// Interrupt delivery
    pub interrupts: Arc<dyn InterruptSource>,
    /// Driver/device shared memory window (status slots + ring words)
    pub shared: Arc<DeviceSharedMemory>,
}

struct BoundState {
    pagetable: Option<ProcessId>,
    /// A shared page table was remapped over dirty groups; flush before
    /// the next submission
    pending_flush: bool,
}

struct Device {
    registers: Arc<dyn RegisterBus>,
    interrupts: Arc<dyn InterruptSource>,
    shared: Arc<DeviceSharedMemory>,
    ring: Mutex<CommandRing>,
    reclaim: Mutex<ReclaimQueue>,
    bound: Mutex<BoundState>,
}

struct Backing {
    process_id: ProcessId,
    /// Pool pages behind the mapping; empty for client-owned buffers
    pages: Vec<PhysicalPage>,
    aperture: ApertureKind,
    size: u64,
    external: bool,
}

/// Owner of all driver state; every public operation goes through here
pub struct DriverContext {
    api: Mutex<()>,
    apertures: Vec<Aperture>,
    pagetables: Mutex<PageTableRegistry>,
    devices: Vec<Device>,
    pages: Arc<dyn PagePool>,
    /// Physical pages behind each virtualized allocation, keyed by device
    /// address
    backings: Mutex<HashMap<u64, Backing>>,
    mmu_enabled: bool,
    start_timeout: Duration,
}

impl DriverContext {
    /// Build the context from the layout table and per-device hardware
    /// handles. Ring backing memory (plus a status slot area) is carved
    /// from the contiguous aperture here; rings stay `Uninitialized` until
    /// [`start_device`].
    ///
    /// [`start_device`]: DriverContext::start_device
    pub fn new(
        config: DriverConfig,
        hardware: Vec<DeviceHardware>,
        pages: Arc<dyn PagePool>,
    ) -> DriverResult<Self> {
        let mut apertures = Vec::with_capacity(config.apertures.len());
        for entry in &config.apertures {
            if apertures
                .iter()
                .any(|a: &Aperture| a.kind() == entry.kind)
            {
                return Err(DriverError::InvalidArgument(format!(
                    "duplicate aperture {:?} in layout",
                    entry.kind
                )));
            }
            apertures.push(Aperture::new(entry, config.consistency_checks)?);
        }
        let contiguous = apertures
            .iter()
            .find(|a| a.kind() == ApertureKind::Contiguous)
            .ok_or_else(|| {
                DriverError::InvalidArgument("layout lacks a contiguous aperture".into())
            })?;

        let mut devices = Vec::with_capacity(hardware.len());
        for hw in hardware {
            let ring_bytes = hw.shared.ring_words() as u64 * 4;
            // Ring words plus one page of status slots in a single range
            let desc = contiguous.allocate(ring_bytes + PAGE_SIZE, PAGE_SIZE, 0)?;
            let base = desc.device_address;
            let status = base + ring_bytes;
            let ring = CommandRing::new(
                hw.shared.clone(),
                hw.registers.clone(),
                config.ring_block_words,
                base,
                status,
                Some(desc),
            )?;
            devices.push(Device {
                registers: hw.registers,
                interrupts: hw.interrupts,
                shared: hw.shared,
                ring: Mutex::new(ring),
                reclaim: Mutex::new(ReclaimQueue::new()),
                bound: Mutex::new(BoundState {
                    pagetable: None,
                    pending_flush: false,
                }),
            });
        }

        tracing::info!(
            apertures = apertures.len(),
            devices = devices.len(),
            mmu = config.mmu_enabled,
            "driver context created"
        );
        Ok(Self {
            api: Mutex::new(()),
            apertures,
            pagetables: Mutex::new(PageTableRegistry::new(
                config.virt_base,
                config.virt_range,
                PAGE_SIZE,
            )),
            devices,
            pages,
            backings: Mutex::new(HashMap::new()),
            mmu_enabled: config.mmu_enabled,
            start_timeout: Duration::from_millis(config.start_timeout_ms),
        })
    }

    fn aperture(&self, kind: ApertureKind) -> DriverResult<&Aperture> {
        self.apertures
            .iter()
            .find(|a| a.kind() == kind)
            .ok_or(DriverError::NoSuchAperture(kind))
    }

    fn device(&self, id: DeviceId) -> DriverResult<&Device> {
        self.devices.get(id).ok_or(DriverError::NoSuchDevice(id))
    }

    /// Number of devices owned by this context
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    // -----------------------------------------------------------------
    // Device lifecycle
    // -----------------------------------------------------------------

    /// Program the device and start its command ring (re-entrant)
    pub fn start_device(&self, device: DeviceId) -> DriverResult<()> {
        let _api = self.api.lock()?;
        self.device(device)?.ring.lock()?.start(self.start_timeout)
    }

    /// Halt a device's command ring
    pub fn stop_device(&self, device: DeviceId) -> DriverResult<()> {
        let _api = self.api.lock()?;
        self.device(device)?.ring.lock()?.stop();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Process lifecycle
    // -----------------------------------------------------------------

    /// Attach a process: create (or reuse) its page table and take a
    /// reference. A no-op when the MMU is disabled.
    pub fn attach_process(&self, process_id: ProcessId) -> DriverResult<()> {
        let _api = self.api.lock()?;
        if !self.mmu_enabled {
            return Ok(());
        }
        self.ensure_owner_locked(process_id)?;
        self.pagetables.lock()?.attach(process_id)?;
        Ok(())
    }

    /// Detach a process: drain pending reclaims, drop the page-table
    /// reference, release the table storage once the last reference with no
    /// outstanding mappings goes away.
    pub fn detach_process(&self, process_id: ProcessId) -> DriverResult<()> {
        let _api = self.api.lock()?;
        for id in 0..self.devices.len() {
            self.drain_reclaim_locked(id)?;
        }
        if !self.mmu_enabled {
            return Ok(());
        }
        let released = self.pagetables.lock()?.detach(process_id)?;
        if let Some(desc) = released {
            self.aperture(desc.aperture)?.free(&desc)?;
        }
        Ok(())
    }

    /// Page table owner exists for `process_id` (created on first use)
    fn ensure_owner_locked(&self, process_id: ProcessId) -> DriverResult<()> {
        let registry = self.pagetables.lock()?;
        if registry.has_owner(process_id) {
            return Ok(());
        }
        let bytes = registry.backing_bytes();
        drop(registry);
        // Table storage is device-addressable contiguous memory
        let backing = self
            .aperture(ApertureKind::Contiguous)?
            .allocate(bytes, PAGE_SIZE, process_id)?;
        let mut registry = self.pagetables.lock()?;
        if let Some(unused) = registry.create_owner(process_id, backing) {
            drop(registry);
            self.aperture(unused.aperture)?.free(&unused)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------

    /// Allocate `size` bytes from the requested aperture family on behalf
    /// of `process_id`.
    ///
    /// With the MMU disabled, any failed or virtualized request falls over
    /// to the default contiguous aperture. With the MMU enabled there is no
    /// fallback: a virtualized request must not silently change which page
    /// table backs it.
    pub fn allocate(
        &self,
        kind: ApertureKind,
        size: u64,
        process_id: ProcessId,
    ) -> DriverResult<MemoryDescriptor> {
        let _api = self.api.lock()?;
        // Opportunistic reclaim keeps the arenas honest before we give up
        for id in 0..self.devices.len() {
            self.drain_reclaim_locked(id)?;
        }

        if !self.mmu_enabled {
            // Virtualized families fail over to the default aperture; there
            // is no page table to route them through.
            let kind = if matches!(kind, ApertureKind::Virtual | ApertureKind::External) {
                ApertureKind::Contiguous
            } else {
                kind
            };
            return self.aperture(kind)?.allocate(size, 1, process_id);
        }

        let desc = self.aperture(kind)?.allocate(size, 1, process_id)?;
        if !desc.is_virtualized() {
            return Ok(desc);
        }

        // Attach physical backing through the process page table
        if let Err(err) = self.ensure_owner_locked(process_id) {
            self.aperture(kind)?.free(&desc)?;
            return Err(err);
        }
        let count = (desc.size / PAGE_SIZE) as usize;
        let pages = match self.pages.acquire_pages(count) {
            Ok(pages) => pages,
            Err(err) => {
                self.aperture(kind)?.free(&desc)?;
                return Err(err);
            }
        };
        let mapped = self.pagetables.lock()?.map(
            process_id,
            desc.device_address,
            &pages,
            Access::ReadWrite,
        );
        match mapped {
            Ok(needs_flush) => {
                if needs_flush {
                    self.schedule_flush_all_locked()?;
                }
                self.backings.lock()?.insert(
                    desc.device_address,
                    Backing {
                        process_id,
                        pages,
                        aperture: kind,
                        size: desc.size,
                        external: false,
                    },
                );
                Ok(desc)
            }
            Err(err) => {
                self.pages.release_pages(pages);
                self.aperture(kind)?.free(&desc)?;
                Err(err)
            }
        }
    }

    /// Map client-supplied physical pages into the external window.
    ///
    /// The returned descriptor is marked external: its backing pages are
    /// owned by the client and are never handed to the page pool or a host
    /// arena on free.
    pub fn map_external(
        &self,
        pages: &[PhysicalPage],
        access: Access,
        process_id: ProcessId,
    ) -> DriverResult<MemoryDescriptor> {
        let _api = self.api.lock()?;
        if !self.mmu_enabled {
            return Err(DriverError::InvalidArgument(
                "external mappings require the MMU".into(),
            ));
        }
        if pages.is_empty() {
            return Err(DriverError::InvalidArgument(
                "external mapping of zero pages".into(),
            ));
        }
        let size = pages.len() as u64 * PAGE_SIZE;
        let mut desc = self
            .aperture(ApertureKind::External)?
            .allocate(size, PAGE_SIZE, process_id)?;
        desc.external = true;
        self.ensure_owner_locked(process_id)?;
        let mapped =
            self.pagetables
                .lock()?
                .map(process_id, desc.device_address, pages, access);
        match mapped {
            Ok(needs_flush) => {
                if needs_flush {
                    self.schedule_flush_all_locked()?;
                }
                self.backings.lock()?.insert(
                    desc.device_address,
                    Backing {
                        process_id,
                        pages: Vec::new(),
                        aperture: ApertureKind::External,
                        size: desc.size,
                        external: true,
                    },
                );
                Ok(desc)
            }
            Err(err) => {
                self.aperture(ApertureKind::External)?.free(&desc)?;
                Err(err)
            }
        }
    }

    /// Release an allocation immediately. The caller asserts the device no
    /// longer references it; use [`free_at_timestamp`] otherwise.
    ///
    /// [`free_at_timestamp`]: DriverContext::free_at_timestamp
    pub fn free(&self, desc: &MemoryDescriptor, process_id: ProcessId) -> DriverResult<()> {
        let _api = self.api.lock()?;
        if desc.process_id != process_id {
            tracing::warn!(
                owner = desc.process_id,
                caller = process_id,
                "free attributed to a different process"
            );
        }
        self.release_descriptor_locked(desc)
    }

    /// Queue an allocation for release once the device's retired timestamp
    /// passes `timestamp`.
    pub fn free_at_timestamp(
        &self,
        device: DeviceId,
        desc: MemoryDescriptor,
        timestamp: Timestamp,
    ) -> DriverResult<()> {
        let _api = self.api.lock()?;
        let process_id = desc.process_id;
        self.device(device)?
            .reclaim
            .lock()?
            .enqueue(desc, timestamp, process_id);
        Ok(())
    }

    /// Drain one device's reclaim queue against its retired timestamp
    pub fn drain_reclaim(&self, device: DeviceId) -> DriverResult<usize> {
        let _api = self.api.lock()?;
        self.drain_reclaim_locked(device)
    }

    /// Capacity query: largest allocation that could succeed right now
    pub fn largest_free_block(&self, kind: ApertureKind, alignment: u64) -> DriverResult<u64> {
        let _api = self.api.lock()?;
        self.aperture(kind)?.largest_free_block(alignment)
    }

    fn release_descriptor_locked(&self, desc: &MemoryDescriptor) -> DriverResult<()> {
        if desc.is_virtualized() && self.mmu_enabled {
            self.pagetables
                .lock()?
                .unmap(desc.process_id, desc.device_address, desc.size)?;
            if let Some(backing) = self.backings.lock()?.remove(&desc.device_address) {
                // Client-owned pages stay with the client; pool pages go back
                if !backing.external {
                    self.pages.release_pages(backing.pages);
                }
            }
        }
        self.aperture(desc.aperture)?.free(desc)
    }

    fn drain_reclaim_locked(&self, device: DeviceId) -> DriverResult<usize> {
        let dev = self.device(device)?;
        let retired = dev.shared.retired_timestamp();
        let ready = dev.reclaim.lock()?.drain_ready(retired);
        let mut count = 0usize;
        let mut first_error = None;
        // Best effort: one bad entry must not strand the frees behind it
        for entry in ready {
            match self.release_descriptor_locked(&entry.descriptor) {
                Ok(()) => count += 1,
                Err(err) => {
                    tracing::error!(
                        device,
                        device_address = entry.descriptor.device_address,
                        error = %err,
                        "deferred free failed"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        if count > 0 {
            tracing::debug!(device, retired, count, "deferred frees reclaimed");
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    fn schedule_flush_all_locked(&self) -> DriverResult<()> {
        for dev in &self.devices {
            dev.bound.lock()?.pending_flush = true;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------

    /// Bind `process_id`'s page table on the device if it is not already
    /// active, then submit the batch. Returns the batch timestamp.
    pub fn submit_batch(
        &self,
        device: DeviceId,
        words: &[u32],
        process_id: ProcessId,
    ) -> DriverResult<Timestamp> {
        let _api = self.api.lock()?;
        let dev = self.device(device)?;
        if self.mmu_enabled {
            self.set_active_pagetable_locked(dev, process_id)?;
        }
        dev.ring.lock()?.submit(words)
    }

    /// Lazy-invalidation context switch: rebinding the base register always
    /// flushes; an unchanged binding flushes only when invalidations are
    /// pending. Either way the dirty set is cleared once the flush is
    /// issued.
    fn set_active_pagetable_locked(&self, dev: &Device, process_id: ProcessId) -> DriverResult<()> {
        self.ensure_owner_locked(process_id)?;
        let mut bound = dev.bound.lock()?;
        let mut registry = self.pagetables.lock()?;
        let flush = if bound.pagetable != Some(process_id) {
            let base = registry.table_base(process_id)?;
            dev.registers.write_register(REG_PT_BASE_LO, base as u32);
            dev.registers
                .write_register(REG_PT_BASE_HI, (base >> 32) as u32);
            bound.pagetable = Some(process_id);
            true
        } else {
            bound.pending_flush || registry.has_pending_invalidations(process_id)
        };
        if flush {
            dev.registers.write_register(REG_TLB_FLUSH, 1);
            registry.acknowledge_flush(process_id);
            bound.pending_flush = false;
        }
        Ok(())
    }

    /// Block until the device retires `timestamp` or `timeout` elapses.
    /// The API mutex is released while blocked.
    pub fn wait_timestamp(
        &self,
        device: DeviceId,
        timestamp: Timestamp,
        timeout: Duration,
    ) -> DriverResult<()> {
        let (shared, interrupts) = {
            let _api = self.api.lock()?;
            let dev = self.device(device)?;
            (dev.shared.clone(), dev.interrupts.clone())
        };
        wait_for_timestamp(&shared, interrupts.as_ref(), timestamp, timeout)
    }

    /// Whether the device has retired everything it accepted
    pub fn is_idle(&self, device: DeviceId) -> DriverResult<bool> {
        let _api = self.api.lock()?;
        Ok(self.device(device)?.ring.lock()?.is_idle())
    }

    // -----------------------------------------------------------------
    // Debug register access
    // -----------------------------------------------------------------

    /// Bounds-checked register read for diagnostics
    pub fn read_register(&self, device: DeviceId, offset: u32) -> DriverResult<u32> {
        let _api = self.api.lock()?;
        if offset >= REG_SPACE_SIZE {
            return Err(DriverError::InvalidArgument(format!(
                "register offset {:#x} out of range",
                offset
            )));
        }
        Ok(self.device(device)?.registers.read_register(offset))
    }

    /// Bounds-checked register write for diagnostics
    pub fn write_register(&self, device: DeviceId, offset: u32, value: u32) -> DriverResult<()> {
        let _api = self.api.lock()?;
        if offset >= REG_SPACE_SIZE {
            return Err(DriverError::InvalidArgument(format!(
                "register offset {:#x} out of range",
                offset
            )));
        }
        self.device(device)?.registers.write_register(offset, value);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Forcibly release everything attributed to one process: its pending
    /// reclaims on every device (regardless of device progress), its
    /// remaining mappings and page-table storage, and any device binding to
    /// its table. Used by the device-fault path and by process exit.
    pub fn destroy_process_contexts(&self, process_id: ProcessId) -> DriverResult<()> {
        let _api = self.api.lock()?;
        for dev in &self.devices {
            let all = dev.reclaim.lock()?.drain_all();
            for entry in all {
                if entry.process_id == process_id {
                    self.release_descriptor_locked(&entry.descriptor)?;
                } else {
                    let mut queue = dev.reclaim.lock()?;
                    queue.enqueue(entry.descriptor, entry.timestamp, entry.process_id);
                }
            }
            let mut bound = dev.bound.lock()?;
            if bound.pagetable == Some(process_id) {
                bound.pagetable = None;
                bound.pending_flush = true;
            }
        }
        if !self.mmu_enabled {
            return Ok(());
        }
        // Reclaim leaked mappings: return pool pages and the arena ranges
        let leftover: Vec<u64> = {
            let backings = self.backings.lock()?;
            backings
                .iter()
                .filter(|(_, b)| b.process_id == process_id)
                .map(|(addr, _)| *addr)
                .collect()
        };
        for addr in leftover {
            let removed = self.backings.lock()?.remove(&addr);
            if let Some(backing) = removed {
                if !backing.external {
                    self.pages.release_pages(backing.pages);
                }
                let desc = MemoryDescriptor {
                    device_address: addr,
                    host_address: None,
                    size: backing.size,
                    aperture: backing.aperture,
                    process_id,
                    external: backing.external,
                };
                self.aperture(backing.aperture)?.free(&desc)?;
                tracing::warn!(
                    process_id,
                    device_address = addr,
                    "leaked mapping released at context teardown"
                );
            }
        }
        if let Some(desc) = self.pagetables.lock()?.force_destroy(process_id) {
            self.aperture(desc.aperture)?.free(&desc)?;
        }
        Ok(())
    }

    /// Full driver teardown: stop every ring, force-drain every reclaim
    /// queue, release ring backings and remaining page tables.
    pub fn shutdown(&self) -> DriverResult<()> {
        let _api = self.api.lock()?;
        for dev in &self.devices {
            let all = dev.reclaim.lock()?.drain_all();
            for entry in all {
                self.release_descriptor_locked(&entry.descriptor)?;
            }
            let mut ring = dev.ring.lock()?;
            ring.stop();
            if let Some(desc) = ring.take_descriptor() {
                self.aperture(desc.aperture)?.free(&desc)?;
            }
        }
        let remaining = {
            let registry = self.pagetables.lock()?;
            registry.owner_ids()
        };
        for pid in remaining {
            if let Some(desc) = self.pagetables.lock()?.force_destroy(pid) {
                self.aperture(desc.aperture)?.free(&desc)?;
            }
        }
        tracing::info!("driver context shut down");
        Ok(())
    }
}
