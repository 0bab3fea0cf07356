//! Hybrid timestamps.
//!
//! A [`Timestamp`] packs a physical wall-clock time in milliseconds into the
//! high bits and an 18-bit logical counter into the low bits, so commit,
//! delete, travel and retention timestamps share one totally ordered space.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Number of low bits reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 18;

const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Hybrid (physical << 18 | logical) timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Smallest timestamp; sorts before any allocated one.
    pub const ZERO: Self = Self(0);
    /// Largest timestamp; reads at `MAX` see everything committed.
    pub const MAX: Self = Self(u64::MAX);

    /// Wraps a raw hybrid value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Composes a timestamp from physical milliseconds and a logical counter.
    #[must_use]
    pub const fn compose(physical_ms: u64, logical: u64) -> Self {
        Self((physical_ms << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    /// Builds the first timestamp of the given physical millisecond.
    #[must_use]
    pub const fn from_physical(physical_ms: u64) -> Self {
        Self::compose(physical_ms, 0)
    }

    /// Returns the raw hybrid value.
    #[must_use]
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Physical part in milliseconds since the Unix epoch.
    #[must_use]
    pub const fn physical(&self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    /// Logical counter part.
    #[must_use]
    pub const fn logical(&self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    /// Moves the physical part back by `by`, saturating at zero.
    #[must_use]
    pub fn saturating_sub(&self, by: Duration) -> Self {
        let ms = by.as_millis().min(u128::from(u64::MAX)) as u64;
        Self::compose(self.physical().saturating_sub(ms), self.logical())
    }

    /// Moves the physical part forward by `by`.
    #[must_use]
    pub fn saturating_add(&self, by: Duration) -> Self {
        let ms = by.as_millis().min(u128::from(u64::MAX)) as u64;
        Self::compose(self.physical().saturating_add(ms), self.logical())
    }

    /// Shifts the physical part by a (possibly fractional) number of
    /// milliseconds, keeping the logical counter.
    #[must_use]
    pub fn shifted_ms(&self, delta_ms: i64) -> Self {
        let physical = if delta_ms >= 0 {
            self.physical().saturating_add(delta_ms as u64)
        } else {
            self.physical().saturating_sub(delta_ms.unsigned_abs())
        };
        Self::compose(physical, self.logical())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocates strictly increasing hybrid timestamps.
///
/// The physical part follows the wall clock; when several timestamps are
/// requested within one millisecond the logical counter advances instead.
#[derive(Debug, Default)]
pub struct TimestampOracle {
    last: Mutex<Timestamp>,
}

impl TimestampOracle {
    /// Creates an oracle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next timestamp.
    pub fn allocate(&self) -> Timestamp {
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last.lock();
        let next = if now_ms > last.physical() {
            Timestamp::from_physical(now_ms)
        } else if last.logical() < LOGICAL_MASK {
            Timestamp::compose(last.physical(), last.logical() + 1)
        } else {
            Timestamp::from_physical(last.physical() + 1)
        };
        *last = next;
        next
    }
}
