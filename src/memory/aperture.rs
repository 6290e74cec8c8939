//! Memory apertures
//!
//! An aperture is one flat, contiguously-addressed region managed by the
//! allocator: a host-visible base (when mapped), a device-visible base, a
//! size fixed for the aperture's lifetime, and exactly one free list.
//! Apertures are created at driver start from the platform-supplied layout
//! table and never resized while live.

use std::sync::Mutex;

use serde::Deserialize;

use crate::error::{DriverError, DriverResult};
use crate::hal::PAGE_SIZE;

use super::free_list::{FreeList, MIN_ALIGNMENT};
use super::{ApertureKind, MemoryDescriptor, ProcessId};

/// One entry of the platform layout table
#[derive(Debug, Clone, Deserialize)]
pub struct ApertureConfig {
    /// Aperture family
    pub kind: ApertureKind,
    /// Host-visible base address, when the region is host mapped
    #[serde(default)]
    pub host_base: Option<u64>,
    /// Device-visible base address
    pub device_base: u64,
    /// Total size in bytes
    pub size: u64,
}

/// One address range with its free list
pub struct Aperture {
    kind: ApertureKind,
    host_base: Option<u64>,
    device_base: u64,
    size: u64,
    free: Mutex<FreeList>,
    /// Run free-list consistency checks around mutations
    check: bool,
}

impl Aperture {
    /// Build an aperture from a layout entry. Virtualized apertures must be
    /// page-granular.
    pub fn new(config: &ApertureConfig, check: bool) -> DriverResult<Self> {
        if config.size == 0 {
            return Err(DriverError::InvalidArgument(format!(
                "aperture {:?} has zero size",
                config.kind
            )));
        }
        let virtualized = matches!(config.kind, ApertureKind::Virtual | ApertureKind::External);
        if virtualized && (config.size % PAGE_SIZE != 0 || config.device_base % PAGE_SIZE != 0) {
            return Err(DriverError::InvalidArgument(format!(
                "virtualized aperture {:?} not page aligned",
                config.kind
            )));
        }
        tracing::info!(
            kind = ?config.kind,
            device_base = config.device_base,
            size = config.size,
            "aperture created"
        );
        Ok(Self {
            kind: config.kind,
            host_base: config.host_base,
            device_base: config.device_base,
            size: config.size,
            free: Mutex::new(FreeList::new(config.size)),
            check,
        })
    }

    /// Aperture family
    pub fn kind(&self) -> ApertureKind {
        self.kind
    }

    /// Total size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Device-visible base address
    pub fn device_base(&self) -> u64 {
        self.device_base
    }

    /// Whether allocations from here go through a page table
    pub fn is_virtualized(&self) -> bool {
        matches!(self.kind, ApertureKind::Virtual | ApertureKind::External)
    }

    /// Whether `device_address` falls inside this aperture
    pub fn contains(&self, device_address: u64) -> bool {
        device_address >= self.device_base && device_address < self.device_base + self.size
    }

    /// Carve an aligned range out of this aperture.
    ///
    /// Sizes are rounded up to the effective alignment (minimum 32 bytes);
    /// virtualized apertures additionally round up to the page size because
    /// physical backing will be attached per page.
    pub fn allocate(
        &self,
        size: u64,
        alignment: u64,
        process_id: ProcessId,
    ) -> DriverResult<MemoryDescriptor> {
        if size == 0 {
            return Err(DriverError::InvalidArgument(
                "allocation size must be positive".into(),
            ));
        }
        if !alignment.is_power_of_two() {
            return Err(DriverError::InvalidArgument(format!(
                "alignment {} is not a power of two",
                alignment
            )));
        }
        let (size, alignment) = if self.is_virtualized() {
            (size, alignment.max(PAGE_SIZE))
        } else {
            (size, alignment.max(MIN_ALIGNMENT))
        };

        let mut free = self.free.lock()?;
        if self.check {
            free.check_consistency()?;
        }
        let (offset, rounded) = free.allocate(size, alignment).ok_or_else(|| {
            DriverError::ResourceExhausted(format!(
                "aperture {:?}: no free block for {} bytes (largest {})",
                self.kind,
                size,
                free.largest_free(alignment)
            ))
        })?;
        if self.check {
            free.check_consistency()?;
        }
        Ok(MemoryDescriptor {
            device_address: self.device_base + offset,
            host_address: self.host_base.map(|base| base + offset),
            size: rounded,
            aperture: self.kind,
            process_id,
            external: false,
        })
    }

    /// Return a descriptor's range to the free list.
    ///
    /// Double frees and descriptors from other apertures are rejected
    /// without corrupting the list.
    pub fn free(&self, desc: &MemoryDescriptor) -> DriverResult<()> {
        if desc.aperture != self.kind {
            return Err(DriverError::InvalidArgument(format!(
                "descriptor from aperture {:?} freed into {:?}",
                desc.aperture, self.kind
            )));
        }
        let offset = desc
            .device_address
            .checked_sub(self.device_base)
            .filter(|off| off + desc.size <= self.size)
            .ok_or_else(|| {
                DriverError::InvalidArgument(format!(
                    "descriptor {:#x}+{:#x} outside aperture {:?}",
                    desc.device_address, desc.size, self.kind
                ))
            })?;

        let mut free = self.free.lock()?;
        if self.check {
            free.check_consistency()?;
        }
        if !free.free(offset, desc.size) {
            tracing::warn!(
                device_address = desc.device_address,
                size = desc.size,
                kind = ?self.kind,
                "rejected free overlapping the free list (double free?)"
            );
            return Err(DriverError::InvalidArgument(format!(
                "free of {:#x}+{:#x} overlaps free space (double free?)",
                desc.device_address, desc.size
            )));
        }
        if self.check {
            free.check_consistency()?;
        }
        tracing::trace!(
            device_address = desc.device_address,
            size = desc.size,
            "aperture free"
        );
        Ok(())
    }

    /// Largest allocation that could currently succeed at `alignment`.
    /// Capacity query only; does not reserve anything.
    pub fn largest_free_block(&self, alignment: u64) -> DriverResult<u64> {
        Ok(self.free.lock()?.largest_free(alignment))
    }

    /// Total bytes currently free
    pub fn free_bytes(&self) -> DriverResult<u64> {
        Ok(self.free.lock()?.total_free())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contiguous(size: u64) -> Aperture {
        Aperture::new(
            &ApertureConfig {
                kind: ApertureKind::Contiguous,
                host_base: Some(0x1_0000_0000),
                device_base: 0x8000_0000,
                size,
            },
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_descriptor_addresses_offset_from_bases() {
        let ap = contiguous(1 << 20);
        let desc = ap.allocate(4096, 32, 7).unwrap();
        assert!(ap.contains(desc.device_address));
        assert_eq!(desc.device_address, 0x8000_0000);
        assert_eq!(desc.host_address, Some(0x1_0000_0000));
        assert_eq!(desc.process_id, 7);
        ap.free(&desc).unwrap();
        assert_eq!(ap.free_bytes().unwrap(), 1 << 20);
    }

    #[test]
    fn test_zero_size_rejected() {
        let ap = contiguous(1 << 20);
        assert!(matches!(
            ap.allocate(0, 32, 1),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_virtualized_rounds_to_page() {
        let ap = Aperture::new(
            &ApertureConfig {
                kind: ApertureKind::Virtual,
                host_base: None,
                device_base: 0x1_0000_0000,
                size: 1 << 22,
            },
            true,
        )
        .unwrap();
        let desc = ap.allocate(100, 32, 1).unwrap();
        assert_eq!(desc.size, PAGE_SIZE);
        assert_eq!(desc.device_address % PAGE_SIZE, 0);
        assert_eq!(desc.host_address, None);
        ap.free(&desc).unwrap();
    }

    #[test]
    fn test_cross_aperture_free_rejected() {
        let ap = contiguous(1 << 20);
        let other = Aperture::new(
            &ApertureConfig {
                kind: ApertureKind::Virtual,
                host_base: None,
                device_base: 0x1_0000_0000,
                size: 1 << 22,
            },
            true,
        )
        .unwrap();
        let desc = other.allocate(4096, 32, 1).unwrap();
        assert!(matches!(
            ap.free(&desc),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_exhaustion_reports_out_of_memory() {
        let ap = contiguous(4096);
        let desc = ap.allocate(4096, 32, 1).unwrap();
        assert!(matches!(
            ap.allocate(32, 32, 1),
            Err(DriverError::ResourceExhausted(_))
        ));
        ap.free(&desc).unwrap();
        assert_eq!(ap.largest_free_block(32).unwrap(), 4096);
    }
}
