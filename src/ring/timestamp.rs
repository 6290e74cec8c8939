//! Wraparound-safe timestamp comparison
//!
//! Submission timestamps are 32-bit counters that wrap. Every completion
//! check in the driver goes through [`timestamp_at_or_after`] instead of a
//! naive `>=`: the difference is computed as a signed value, and a huge
//! negative difference (beyond the epsilon window) is treated as a wrap
//! rather than "behind".

/// Monotonic submission counter, wraps at 32 bits
pub type Timestamp = u32;

/// Comparison window; safely smaller than half the counter range
pub const TIMESTAMP_EPSILON: u32 = 0x1000_0000;

/// True when `a` is at or past `b` in submission order, tolerating wrap
#[inline]
pub fn timestamp_at_or_after(a: Timestamp, b: Timestamp) -> bool {
    let diff = a.wrapping_sub(b) as i32;
    diff >= 0 || diff < -(TIMESTAMP_EPSILON as i32)
}

/// True when `a` is strictly before `b` in submission order
#[inline]
pub fn timestamp_before(a: Timestamp, b: Timestamp) -> bool {
    !timestamp_at_or_after(a, b)
}
