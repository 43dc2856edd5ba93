//! A 32-bit wide, monotonically advancing logical clock with wraparound-safe
//! comparison (§3).

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Reserved sentinel meaning "no epoch observed yet".
const INVALID: u32 = 0;

/// A logical clock value. Comparison is circular: `a < b` iff
/// `(b.wrapping_sub(a))` lies in the lower half of the `u32` range. This
/// makes the 32-bit counter safe to wrap as long as no caller ever needs to
/// compare two epochs more than `2^31` ticks apart, which in practice means:
/// never persist a value older than the durable epoch.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct Epoch(u32);

impl Epoch {
    /// The invalid/zero epoch. Not a valid commit epoch for any transaction.
    pub const INVALID: Epoch = Epoch(INVALID);

    pub fn new(value: u32) -> Self {
        Epoch(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 != INVALID
    }

    /// Returns the epoch incremented by one, wrapping past `u32::MAX` back to
    /// 1 (0 stays reserved as invalid).
    pub fn next(&self) -> Epoch {
        let n = self.0.wrapping_add(1);
        Epoch(if n == INVALID { 1 } else { n })
    }

    pub fn increment(&mut self) {
        *self = self.next();
    }

    pub fn store_max(&mut self, other: Epoch) {
        if !self.is_valid() || other > *self {
            *self = other;
        }
    }

    pub fn store_min(&mut self, other: Epoch) {
        if !self.is_valid() || (other.is_valid() && other < *self) {
            *self = other;
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

/// Circular ordering: treats the `u32` space as a ring, so a counter that has
/// wrapped past `u32::MAX` still compares correctly against recent values.
impl PartialOrd for Epoch {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Epoch {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        if self.0 == other.0 {
            return std::cmp::Ordering::Equal;
        }
        let diff = other.0.wrapping_sub(self.0);
        if diff < (1u32 << 31) {
            std::cmp::Ordering::Less
        } else {
            std::cmp::Ordering::Greater
        }
    }
}

/// Atomic holder for an engine-wide epoch value (`current_global_epoch`,
/// `durable_global_epoch`, per-worker `in_commit_log_epoch`). §5 requires
/// these be read with acquire and written under their owning mutex/release,
/// which this type enforces at the one place they're stored.
#[derive(Debug)]
pub struct AtomicEpoch(AtomicU32);

impl AtomicEpoch {
    pub fn new(initial: Epoch) -> Self {
        Self(AtomicU32::new(initial.0))
    }

    pub fn load_acquire(&self) -> Epoch {
        Epoch(self.0.load(Ordering::Acquire))
    }

    pub fn store_release(&self, value: Epoch) {
        self.0.store(value.0, Ordering::Release);
    }
}
