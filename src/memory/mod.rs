//! Device memory management
//!
//! Apertures (flat address ranges owned by the driver) and the circular
//! free-list arena that subdivides them. Each aperture owns exactly one
//! free list; multiple apertures coexist independently (a physically
//! contiguous region, a GPU-virtualized region, a quota-limited external
//! window).

pub mod aperture;
pub mod descriptor;
pub mod free_list;

pub use aperture::{Aperture, ApertureConfig};
pub use descriptor::{ApertureKind, MemoryDescriptor, ProcessId};
pub use free_list::{align_up, FreeList, MIN_ALIGNMENT};
