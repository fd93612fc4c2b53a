//! CPU bitmasks
//!
//! A fixed-width mask of logical CPUs plus an atomic variant that can be
//! read by remote CPUs without holding any run-queue lock.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Maximum number of logical CPUs supported.
pub const NR_CPUS: usize = 64;

/// A set of logical CPUs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuMask(u64);

impl CpuMask {
    /// The empty mask.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build a mask from raw bits.
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// CPUs `0..n`.
    pub const fn first_n(n: usize) -> Self {
        if n >= NR_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << n) - 1)
        }
    }

    /// Build a mask from a list of CPU ids. Ids past `NR_CPUS` are ignored.
    pub fn from_cpus(cpus: &[usize]) -> Self {
        cpus.iter().copied().collect()
    }

    /// A mask holding only `cpu`.
    pub fn single(cpu: usize) -> Self {
        let mut mask = Self::empty();
        mask.set(cpu);
        mask
    }

    /// Raw bits.
    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < NR_CPUS {
            self.0 |= 1 << cpu;
        }
    }

    pub fn clear(&mut self, cpu: usize) {
        if cpu < NR_CPUS {
            self.0 &= !(1 << cpu);
        }
    }

    /// Whether `cpu` is in the mask.
    pub fn test(self, cpu: usize) -> bool {
        cpu < NR_CPUS && self.0 & (1 << cpu) != 0
    }

    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// CPUs in `self` but not in `other`.
    pub const fn andnot(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of CPUs in the mask.
    pub const fn weight(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest CPU in the mask.
    pub fn first(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    /// Lowest CPU strictly greater than `after`; `None` starts from the
    /// beginning of the mask.
    pub fn next(self, after: Option<usize>) -> Option<usize> {
        match after {
            None => self.first(),
            Some(cpu) if cpu + 1 >= NR_CPUS => None,
            Some(cpu) => Self(self.0 & (u64::MAX << (cpu + 1))).first(),
        }
    }

    /// Iterate CPUs in ascending order.
    pub fn iter(self) -> CpuIter {
        CpuIter(self.0)
    }
}

impl FromIterator<usize> for CpuMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for cpu in iter {
            mask.set(cpu);
        }
        mask
    }
}

impl IntoIterator for CpuMask {
    type Item = usize;
    type IntoIter = CpuIter;

    fn into_iter(self) -> CpuIter {
        self.iter()
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for CpuMask {
    /// Kernel cpulist format, e.g. `0-3,6`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut iter = self.iter().peekable();
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{}", start)?;
            } else {
                write!(f, "{}-{}", start, end)?;
            }
        }
        Ok(())
    }
}

/// Ascending iterator over a [`CpuMask`].
pub struct CpuIter(u64);

impl Iterator for CpuIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            return None;
        }
        let cpu = self.0.trailing_zeros() as usize;
        self.0 &= self.0 - 1;
        Some(cpu)
    }
}

/// A [`CpuMask`] shared between CPUs.
#[derive(Default)]
pub struct AtomicCpuMask(AtomicU64);

impl AtomicCpuMask {
    pub const fn new(mask: CpuMask) -> Self {
        Self(AtomicU64::new(mask.0))
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> CpuMask {
        CpuMask(self.0.load(order))
    }

    #[inline]
    pub fn store(&self, mask: CpuMask, order: Ordering) {
        self.0.store(mask.0, order);
    }

    #[inline]
    pub fn set(&self, cpu: usize, order: Ordering) {
        if cpu < NR_CPUS {
            self.0.fetch_or(1 << cpu, order);
        }
    }

    #[inline]
    pub fn clear(&self, cpu: usize, order: Ordering) {
        if cpu < NR_CPUS {
            self.0.fetch_and(!(1 << cpu), order);
        }
    }

    #[inline]
    pub fn test(&self, cpu: usize, order: Ordering) -> bool {
        self.load(order).test(cpu)
    }
}

impl fmt::Debug for AtomicCpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_set_clear_test() {
        let mut mask = CpuMask::empty();
        mask.set(3);
        mask.set(63);
        mask.set(64);
        assert!(mask.test(3));
        assert!(mask.test(63));
        assert!(!mask.test(64));
        assert_eq!(mask.weight(), 2);
        mask.clear(3);
        assert!(!mask.test(3));
    }

    #[test]
    fn test_next_walks_in_order() {
        let mask = CpuMask::from_cpus(&[1, 4, 5]);
        assert_eq!(mask.next(None), Some(1));
        assert_eq!(mask.next(Some(1)), Some(4));
        assert_eq!(mask.next(Some(4)), Some(5));
        assert_eq!(mask.next(Some(5)), None);
        assert_eq!(mask.next(Some(63)), None);
    }

    #[test]
    fn test_first_n() {
        assert_eq!(CpuMask::first_n(0), CpuMask::empty());
        assert_eq!(CpuMask::first_n(4).bits(), 0b1111);
        assert_eq!(CpuMask::first_n(64).weight(), 64);
    }

    #[test]
    fn test_cpulist_format() {
        let mask = CpuMask::from_cpus(&[0, 1, 2, 3, 6, 8, 9]);
        assert_eq!(format!("{}", mask), "0-3,6,8-9");
        assert_eq!(format!("{}", CpuMask::empty()), "");
    }

    #[test]
    fn test_atomic_mask() {
        let mask = AtomicCpuMask::new(CpuMask::empty());
        mask.set(2, Ordering::Relaxed);
        mask.set(7, Ordering::Relaxed);
        mask.clear(2, Ordering::Relaxed);
        assert_eq!(mask.load(Ordering::Relaxed), CpuMask::single(7));
    }
}
