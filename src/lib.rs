//! GPUForge - GPU driver resource and command lifecycle core
//!
//! This crate implements the memory- and submission-management heart of a
//! GPU driver stack: aperture arena allocation, a software MMU with batched
//! TLB invalidation, a bounded command ring with wraparound-safe completion
//! tracking, and a deferred reclaim queue driven by the same completion
//! counter.
//!
//! Hardware access is abstracted behind the [`hal`] collaborator traits;
//! a software device model ([`hal::sim`]) is provided for tests and
//! bring-up without real hardware.

#![allow(clippy::collapsible_else_if)] // Sometimes clearer for control flow
#![allow(clippy::collapsible_if)] // Sometimes clearer for control flow

pub mod driver;
pub mod error;
pub mod hal;
pub mod logging;
pub mod memory;
pub mod mmu;
pub mod reclaim;
pub mod ring;

pub use driver::{DeviceHardware, DeviceId, DriverConfig, DriverContext};
pub use error::{DriverError, DriverResult, ErrorCategory};
pub use memory::{Aperture, ApertureConfig, ApertureKind, MemoryDescriptor, ProcessId};
pub use mmu::{Access, PageTableRegistry};
pub use ring::{timestamp_at_or_after, CommandRing, Timestamp};
