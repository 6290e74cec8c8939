//! Hardware abstraction boundary
//!
//! The resource core never touches hardware directly; everything it needs
//! from the platform is expressed by the collaborator traits in this module:
//! 32-bit register access, interrupt waits, and physical page supply.
//!
//! [`DeviceSharedMemory`] models the memory window shared between driver and
//! device (the ring buffer plus the status slots the device writes back).
//! On real hardware this would be a mapped BAR/GART region; the software
//! device model in [`sim`] reads the same structure directly.

pub mod sim;

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::DriverResult;

/// Opaque handle to one physical page supplied by the platform allocator
pub type PhysicalPage = u64;

/// Page granularity for virtualized apertures and the page pool
pub const PAGE_SIZE: u64 = 4096;

// ---------------------------------------------------------------------------
// Register map
//
// Offsets into the device's 32-bit register window. The window is bounds
// checked at the API boundary; offsets at or past `REG_SPACE_SIZE` are a
// caller error, never forwarded to the bus.
// ---------------------------------------------------------------------------

/// Ring buffer base address, low half
pub const REG_RING_BASE_LO: u32 = 0x000;
/// Ring buffer base address, high half
pub const REG_RING_BASE_HI: u32 = 0x004;
/// Ring size in words (power of two)
pub const REG_RING_SIZE: u32 = 0x008;
/// Address the device polls/writes the read cursor through, low half
pub const REG_RING_RPTR_ADDR_LO: u32 = 0x00c;
/// Address the device polls/writes the read cursor through, high half
pub const REG_RING_RPTR_ADDR_HI: u32 = 0x010;
/// Write cursor doorbell; writing publishes new work to the device
pub const REG_RING_WPTR: u32 = 0x014;
/// Microcode upload address register
pub const REG_UCODE_ADDR: u32 = 0x018;
/// Microcode upload data register (auto-incrementing)
pub const REG_UCODE_DATA: u32 = 0x01c;
/// Active page table base, low half
pub const REG_PT_BASE_LO: u32 = 0x020;
/// Active page table base, high half
pub const REG_PT_BASE_HI: u32 = 0x024;
/// Writing any value invalidates the device TLB
pub const REG_TLB_FLUSH: u32 = 0x028;
/// Device control register
pub const REG_CONTROL: u32 = 0x02c;
/// Scratch register written by the fence sequence
pub const REG_SCRATCH: u32 = 0x030;

/// One past the last valid register offset
pub const REG_SPACE_SIZE: u32 = 0x100;

/// Control register bit: engine enabled
pub const CONTROL_ENABLE: u32 = 1 << 0;
/// Control register bit: halt requested
pub const CONTROL_HALT: u32 = 1 << 1;

// ---------------------------------------------------------------------------
// Command words
//
// The core does not interpret client command contents; it only emits the
// padding and fence words below and treats everything else as payload.
// ---------------------------------------------------------------------------

/// No-op padding word (used to fill the ring tail before a wrap)
pub const OP_NOP: u32 = 0x1000_0000;
/// Device initialization command (one word)
pub const OP_INIT: u32 = 0x2000_0000;
/// Write the following word into the scratch register
pub const OP_SET_SCRATCH: u32 = 0x3000_0000;
/// End-of-pipe event: after all prior work retires, deposit the following
/// word into the retired-timestamp status slot
pub const OP_EVENT_EOP: u32 = 0x3100_0000;

/// Words appended to every submission by the fence sequence
pub const FENCE_WORDS: u32 = 4;

/// Fixed microcode image uploaded during ring start
pub const DEVICE_MICROCODE: [u32; 8] = [
    0xc0de_0001,
    0xc0de_0002,
    0x0badf00d,
    0x1111_2222,
    0x3333_4444,
    0x5555_6666,
    0x7777_8888,
    0xc0de_fffe,
];

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// 32-bit register access supplied by the platform layer
pub trait RegisterBus: Send + Sync {
    /// Read a 32-bit register at `offset`
    fn read_register(&self, offset: u32) -> u32;
    /// Write a 32-bit register at `offset`
    fn write_register(&self, offset: u32, value: u32);
}

/// Interrupt classes the core waits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptClass {
    /// A submission completed (fence retired)
    Completion,
    /// The device reported a fault
    Fault,
}

/// Interrupt delivery supplied by the platform layer
pub trait InterruptSource: Send + Sync {
    /// Block until an interrupt of `class` fires or `timeout` elapses.
    /// Returns true when the interrupt occurred. Spurious wakeups are
    /// permitted; callers re-check their condition.
    fn wait_for_interrupt(&self, class: InterruptClass, timeout: Duration) -> bool;
}

/// Physical page provider supplied by the platform layer
pub trait PagePool: Send + Sync {
    /// Acquire `count` physical pages
    fn acquire_pages(&self, count: usize) -> DriverResult<Vec<PhysicalPage>>;
    /// Return pages previously handed out by `acquire_pages`
    fn release_pages(&self, pages: Vec<PhysicalPage>);
}

// ---------------------------------------------------------------------------
// Device-shared memory
// ---------------------------------------------------------------------------

/// Fixed offsets of the status slots within the shared window (documented
/// for the register-programmed poll address; the Rust side goes through the
/// typed accessors below).
pub const STATUS_READ_CURSOR_OFFSET: u32 = 0x0;
/// Offset of the consumed-timestamp slot
pub const STATUS_CONSUMED_OFFSET: u32 = 0x4;
/// Offset of the retired-timestamp slot
pub const STATUS_RETIRED_OFFSET: u32 = 0x8;

/// The memory window shared between driver and device: three status slots
/// the device writes back (read cursor, consumed timestamp, retired
/// timestamp) followed by the command ring words.
///
/// All slots are plain atomics with acquire/release ordering; the ring
/// ordering contract (publish via doorbell after the words are visible)
/// depends on it.
pub struct DeviceSharedMemory {
    read_cursor: AtomicU32,
    consumed_timestamp: AtomicU32,
    retired_timestamp: AtomicU32,
    ring: Vec<AtomicU32>,
}

impl DeviceSharedMemory {
    /// Create a shared window with a ring of `ring_words` command words,
    /// all slots zeroed.
    pub fn new(ring_words: usize) -> Self {
        let mut ring = Vec::with_capacity(ring_words);
        ring.resize_with(ring_words, || AtomicU32::new(0));
        Self {
            read_cursor: AtomicU32::new(0),
            consumed_timestamp: AtomicU32::new(0),
            retired_timestamp: AtomicU32::new(0),
            ring,
        }
    }

    /// Ring capacity in words
    pub fn ring_words(&self) -> usize {
        self.ring.len()
    }

    /// Last read cursor published by the device
    pub fn read_cursor(&self) -> u32 {
        self.read_cursor.load(Ordering::Acquire)
    }

    /// Publish a new read cursor (device side)
    pub fn set_read_cursor(&self, value: u32) {
        self.read_cursor.store(value, Ordering::Release);
    }

    /// Start-of-pipeline progress marker
    pub fn consumed_timestamp(&self) -> u32 {
        self.consumed_timestamp.load(Ordering::Acquire)
    }

    /// Publish consumed progress (device side)
    pub fn set_consumed_timestamp(&self, value: u32) {
        self.consumed_timestamp.store(value, Ordering::Release);
    }

    /// End-of-pipeline progress marker
    pub fn retired_timestamp(&self) -> u32 {
        self.retired_timestamp.load(Ordering::Acquire)
    }

    /// Publish retired progress (device side)
    pub fn set_retired_timestamp(&self, value: u32) {
        self.retired_timestamp.store(value, Ordering::Release);
    }

    /// Read one ring word
    pub fn ring_word(&self, index: usize) -> u32 {
        self.ring[index].load(Ordering::Acquire)
    }

    /// Write one ring word
    pub fn set_ring_word(&self, index: usize, value: u32) {
        self.ring[index].store(value, Ordering::Release);
    }

    /// Zero every slot and ring word (ring start)
    pub fn reset(&self) {
        self.read_cursor.store(0, Ordering::Release);
        self.consumed_timestamp.store(0, Ordering::Release);
        self.retired_timestamp.store(0, Ordering::Release);
        for word in &self.ring {
            word.store(0, Ordering::Release);
        }
    }
}
