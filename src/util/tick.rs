//! Simulation tick counter.
//!
//! A tick is a monotonically increasing `u32`. All arithmetic saturates so
//! that comparisons against the zero tick ("never") stay well defined even
//! for freshly connected viewers.

use std::fmt;
use std::ops::Add;

/// Monotonic simulation tick. `Tick::ZERO` means "never happened".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tick(pub u32);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    #[inline]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The tick before this one, saturating at zero.
    #[inline]
    pub const fn prev(self) -> Tick {
        Tick(self.0.saturating_sub(1))
    }

    /// The tick after this one, saturating at `u32::MAX`.
    #[inline]
    pub const fn next(self) -> Tick {
        Tick(self.0.saturating_add(1))
    }

    #[inline]
    pub fn max(self, other: Tick) -> Tick {
        Tick(self.0.max(other.0))
    }

    /// Number of ticks elapsed since `earlier`, zero if `earlier` is ahead.
    #[inline]
    pub const fn since(self, earlier: Tick) -> u32 {
        self.0.saturating_sub(earlier.0)
    }

    #[inline]
    pub const fn saturating_sub(self, ticks: u32) -> Tick {
        Tick(self.0.saturating_sub(ticks))
    }
}

impl Add<u32> for Tick {
    type Output = Tick;

    #[inline]
    fn add(self, rhs: u32) -> Tick {
        Tick(self.0.saturating_add(rhs))
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
