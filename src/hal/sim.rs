//! Software device model
//!
//! `SimDevice` stands in for the hardware behind the [`RegisterBus`] /
//! [`InterruptSource`] collaborator traits. It consumes ring words when the
//! doorbell register is written, decodes the padding/fence words the core
//! emits, and advances the consumed/retired status slots the way a real
//! command processor would.
//!
//! By default every fence retires as soon as it is consumed. Tests that need
//! to observe in-flight submissions (timeout paths, deferred reclaim) switch
//! to manual mode with [`SimDevice::set_auto_retire`] and drive progress via
//! [`SimDevice::retire_next`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{DriverError, DriverResult};

use super::{
    DeviceSharedMemory, InterruptClass, InterruptSource, PagePool, PhysicalPage, RegisterBus,
    OP_EVENT_EOP, OP_SET_SCRATCH, PAGE_SIZE, REG_RING_WPTR, REG_TLB_FLUSH, REG_UCODE_DATA,
};

#[derive(Default)]
struct SimState {
    regs: HashMap<u32, u32>,
    rptr: u32,
    scratch: u32,
    ucode: Vec<u32>,
    auto_retire: bool,
    pending_fences: VecDeque<u32>,
    retire_seq: u64,
    tlb_flushes: u64,
}

/// Software model of the command processor
pub struct SimDevice {
    shared: Arc<DeviceSharedMemory>,
    state: Mutex<SimState>,
    completion: Condvar,
}

impl SimDevice {
    /// Create a device model over the given shared window. Fences retire
    /// automatically on consumption until [`set_auto_retire`] disables it.
    ///
    /// [`set_auto_retire`]: SimDevice::set_auto_retire
    pub fn new(shared: Arc<DeviceSharedMemory>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            state: Mutex::new(SimState {
                auto_retire: true,
                ..SimState::default()
            }),
            completion: Condvar::new(),
        })
    }

    /// Enable or disable automatic fence retirement
    pub fn set_auto_retire(&self, auto: bool) {
        self.state.lock().unwrap().auto_retire = auto;
    }

    /// Retire the oldest consumed-but-unretired fence, if any, and raise a
    /// completion interrupt. Returns the retired timestamp.
    pub fn retire_next(&self) -> Option<u32> {
        let mut st = self.state.lock().unwrap();
        let ts = st.pending_fences.pop_front()?;
        self.shared.set_retired_timestamp(ts);
        st.retire_seq += 1;
        self.completion.notify_all();
        Some(ts)
    }

    /// Number of consumed fences not yet retired (manual mode)
    pub fn pending_fences(&self) -> usize {
        self.state.lock().unwrap().pending_fences.len()
    }

    /// Last value written through the fence scratch sequence
    pub fn scratch(&self) -> u32 {
        self.state.lock().unwrap().scratch
    }

    /// Number of TLB invalidations the driver has issued
    pub fn tlb_flush_count(&self) -> u64 {
        self.state.lock().unwrap().tlb_flushes
    }

    /// Microcode words uploaded through the ucode registers
    pub fn loaded_microcode(&self) -> Vec<u32> {
        self.state.lock().unwrap().ucode.clone()
    }

    fn consume_ring(&self, st: &mut SimState, wptr: u32) {
        let size = self.shared.ring_words() as u32;
        if size == 0 {
            return;
        }
        let mut i = st.rptr % size;
        let wptr = wptr % size;
        let mut consumed_any = false;
        while i != wptr {
            let word = self.shared.ring_word(i as usize);
            match word {
                OP_SET_SCRATCH => {
                    let next = (i + 1) % size;
                    if next == wptr {
                        break; // truncated packet, stop at the cursor
                    }
                    st.scratch = self.shared.ring_word(next as usize);
                    i = (i + 2) % size;
                }
                OP_EVENT_EOP => {
                    let next = (i + 1) % size;
                    if next == wptr {
                        break;
                    }
                    let ts = self.shared.ring_word(next as usize);
                    self.shared.set_consumed_timestamp(ts);
                    if st.auto_retire {
                        self.shared.set_retired_timestamp(ts);
                        st.retire_seq += 1;
                    } else {
                        st.pending_fences.push_back(ts);
                    }
                    consumed_any = true;
                    i = (i + 2) % size;
                }
                // OP_NOP, OP_INIT and client payload words are one word each
                _ => i = (i + 1) % size,
            }
        }
        st.rptr = wptr;
        self.shared.set_read_cursor(wptr);
        if consumed_any {
            self.completion.notify_all();
        }
    }
}

impl RegisterBus for SimDevice {
    fn read_register(&self, offset: u32) -> u32 {
        let st = self.state.lock().unwrap();
        st.regs.get(&offset).copied().unwrap_or(0)
    }

    fn write_register(&self, offset: u32, value: u32) {
        let mut st = self.state.lock().unwrap();
        st.regs.insert(offset, value);
        match offset {
            REG_RING_WPTR => self.consume_ring(&mut st, value),
            REG_UCODE_DATA => st.ucode.push(value),
            REG_TLB_FLUSH => st.tlb_flushes += 1,
            _ => {}
        }
        // Doorbell and fence consumption may unblock waiters even when no
        // fence was involved (ring space waits poll the read cursor).
        self.completion.notify_all();
    }
}

impl InterruptSource for SimDevice {
    fn wait_for_interrupt(&self, class: InterruptClass, timeout: Duration) -> bool {
        if class == InterruptClass::Fault {
            // The model never faults; honor the timeout
            std::thread::sleep(timeout);
            return false;
        }
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock().unwrap();
        let seen = st.retire_seq;
        while st.retire_seq == seen {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .completion
                .wait_timeout(st, deadline - now)
                .unwrap();
            st = guard;
            if result.timed_out() {
                return st.retire_seq != seen;
            }
        }
        true
    }
}

/// Simulated physical page provider with leak accounting
pub struct SimPagePool {
    inner: Mutex<PoolState>,
}

struct PoolState {
    next: u64,
    outstanding: HashSet<PhysicalPage>,
}

impl SimPagePool {
    /// Create an empty pool
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolState {
                next: 0x1000,
                outstanding: HashSet::new(),
            }),
        })
    }

    /// Pages currently handed out and not yet released
    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().outstanding.len()
    }
}

impl PagePool for SimPagePool {
    fn acquire_pages(&self, count: usize) -> DriverResult<Vec<PhysicalPage>> {
        if count == 0 {
            return Err(DriverError::InvalidArgument(
                "page acquisition of zero pages".into(),
            ));
        }
        let mut pool = self.inner.lock().unwrap();
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            let page = pool.next * PAGE_SIZE;
            pool.next += 1;
            pool.outstanding.insert(page);
            pages.push(page);
        }
        Ok(pages)
    }

    fn release_pages(&self, pages: Vec<PhysicalPage>) {
        let mut pool = self.inner.lock().unwrap();
        for page in pages {
            if !pool.outstanding.remove(&page) {
                tracing::warn!(page, "release of page not handed out by this pool");
            }
        }
    }
}
