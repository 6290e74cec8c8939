//! Unified error handling for GPUForge
//!
//! This module provides a centralized error type covering every failure the
//! resource/command core can report. It implements error categorization for:
//! - User errors (bad arguments, exhausted resources - actionable by callers)
//! - Device errors (timeouts waiting on hardware progress)
//! - Internal errors (broken invariants, poisoned locks - bugs)

use std::fmt;
use std::time::Duration;

/// Unified error type for GPUForge
///
/// The variants mirror the driver core's error taxonomy. Callers match on
/// the variant (or on [`DriverError::category`]) to decide whether a failure
/// is retryable, a caller bug, or fatal.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// No free block large enough in the requested aperture (after any
    /// permitted fallback). Returned, never retried internally.
    #[error("out of memory: {0}")]
    ResourceExhausted(String),

    /// Zero/negative size, out-of-range register offset, unaligned mapping
    /// base, or a similar caller mistake.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted on an aperture/ring/page table before its
    /// `start`/`create` completed.
    #[error("not initialized: {0}")]
    NotInitialized(&'static str),

    /// A bounded wait expired before the device reported completion.
    /// Recoverable: the caller may retry or treat the device as hung.
    #[error("device timeout after {timeout:?} waiting for timestamp {timestamp}")]
    DeviceTimeout {
        /// Timestamp that was being waited on
        timestamp: u32,
        /// How long the caller was willing to wait
        timeout: Duration,
    },

    /// A consistency check failed (free-list overlap, double-mapped PTE).
    /// Fatal: it indicates a broken invariant elsewhere.
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    /// The requested aperture does not exist in this driver's layout.
    /// Distinct from `ResourceExhausted` by contract.
    #[error("no such aperture: {0:?}")]
    NoSuchAperture(crate::memory::ApertureKind),

    /// The requested device index does not exist.
    #[error("no such device: {0}")]
    NoSuchDevice(usize),

    /// Internal lock poisoned - this indicates a bug
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for DriverError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DriverError::LockPoisoned(format!("lock poisoned: {}", err))
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller-actionable errors (bad arguments, exhausted quotas)
    User,
    /// Hardware-progress errors (timeouts); retryable
    Device,
    /// Bugs and broken invariants; not recoverable
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "user"),
            ErrorCategory::Device => write!(f, "device"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

impl DriverError {
    /// Classify this error for logging and recovery decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            DriverError::ResourceExhausted(_)
            | DriverError::InvalidArgument(_)
            | DriverError::NotInitialized(_)
            | DriverError::NoSuchAperture(_)
            | DriverError::NoSuchDevice(_) => ErrorCategory::User,
            DriverError::DeviceTimeout { .. } => ErrorCategory::Device,
            DriverError::InternalInconsistency(_) | DriverError::LockPoisoned(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// True when the caller may reasonably retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::DeviceTimeout { .. })
    }
}

/// Result type used throughout the crate
pub type DriverResult<T> = Result<T, DriverError>;
