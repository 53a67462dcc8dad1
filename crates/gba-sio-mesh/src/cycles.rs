use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Monotonic CPU-cycle accumulator (`linkCycles` / `nextEvent` / `transferTime`).
///
/// Signed to match the host core's own cycle-count convention; this crate
/// never converts cycles to wall-clock time, that mapping belongs to the
/// emulator core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Cycles(pub i32);

impl Cycles {
    pub const ZERO: Cycles = Cycles(0);

    /// A `nextEvent` value meaning "no mesh event scheduled".
    pub const FAR_FUTURE: Cycles = Cycles(i32::MAX);

    /// Rebases this accumulator against a master-issued `sync` value,
    /// returning the post-rebase cycles (`self - sync`). Used both for a
    /// joiner adopting a Hello's `sync` as its initial clock and for a
    /// slave rebasing `linkCycles` on `TransferStart`.
    #[must_use]
    pub fn rebase(self, sync: u32) -> Cycles {
        Cycles(self.0.wrapping_sub(sync as i32))
    }

    pub fn as_u32(self) -> u32 {
        self.0 as u32
    }
}

impl From<u32> for Cycles {
    fn from(value: u32) -> Self {
        Cycles(value as i32)
    }
}

impl Add for Cycles {
    type Output = Cycles;
    fn add(self, rhs: Cycles) -> Cycles {
        Cycles(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Cycles {
    fn add_assign(&mut self, rhs: Cycles) {
        *self = *self + rhs;
    }
}

impl Sub for Cycles {
    type Output = Cycles;
    fn sub(self, rhs: Cycles) -> Cycles {
        Cycles(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Cycles {
    fn sub_assign(&mut self, rhs: Cycles) {
        *self = *self - rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_matches_scenario_five() {
        let link_cycles = Cycles(1200);
        assert_eq!(link_cycles.rebase(1000), Cycles(200));
    }

    #[test]
    fn rebase_is_simple_subtraction_not_saturating() {
        let link_cycles = Cycles(50);
        assert_eq!(link_cycles.rebase(1000), Cycles(-950));
    }
}
