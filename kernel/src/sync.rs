//! # Ordered Locking Primitives
//!
//! Lock wrappers that encode their position in the scheduler's lock
//! hierarchy. The ordering is:
//!
//! 1. run-queue locks, in ascending CPU order
//! 2. the global RT bandwidth lock
//! 3. per-CPU RT runtime locks
//! 4. the root-domain relay lock
//! 5. the task directory
//! 6. the ontime task set
//!
//! A path holding a lock at level N may only take locks at level > N, with
//! one exception: a second run-queue lock, taken through the double-lock
//! protocol in `sched::migrate`.

use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock ordering levels.
///
/// Locks must be acquired in increasing level order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// Level 0: per-CPU run-queues
    RunQueue = 0,
    /// Level 1: global RT period/runtime
    Bandwidth = 1,
    /// Level 2: per-CPU RT runtime accounting
    Runtime = 2,
    /// Level 3: root-domain IPI relay cursor
    RootDomain = 3,
    /// Level 4: task id to CPU directory
    Directory = 4,
    /// Level 5: ontime task set
    Ontime = 5,
}

/// A spin mutex with an associated ordering level.
pub struct OrderedMutex<T, const LEVEL: u8> {
    inner: Mutex<T>,
    #[cfg(debug_assertions)]
    name: &'static str,
}

impl<T, const LEVEL: u8> OrderedMutex<T, LEVEL> {
    /// Create a new ordered mutex.
    pub const fn new(value: T, _name: &'static str) -> Self {
        Self {
            inner: Mutex::new(value),
            #[cfg(debug_assertions)]
            name: _name,
        }
    }

    /// Acquire the lock, spinning until it is free.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    /// Try to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// Whether some holder currently owns the lock. Racy by nature.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Get the lock level.
    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }

    /// Get the lock name (debug builds only).
    #[cfg(debug_assertions)]
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// A read-write lock with an associated ordering level.
pub struct OrderedRwLock<T, const LEVEL: u8> {
    inner: RwLock<T>,
    #[cfg(debug_assertions)]
    name: &'static str,
}

impl<T, const LEVEL: u8> OrderedRwLock<T, LEVEL> {
    /// Create a new ordered lock.
    pub const fn new(value: T, _name: &'static str) -> Self {
        Self {
            inner: RwLock::new(value),
            #[cfg(debug_assertions)]
            name: _name,
        }
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    /// Get the lock level.
    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }

    /// Get the lock name (debug builds only).
    #[cfg(debug_assertions)]
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

/// Level 0 lock - a CPU's run-queue
pub type RqLock<T> = OrderedMutex<T, { LockLevel::RunQueue as u8 }>;

/// Level 1 lock - global RT bandwidth
pub type BandwidthLock<T> = OrderedMutex<T, { LockLevel::Bandwidth as u8 }>;

/// Level 2 lock - per-CPU RT runtime
pub type RuntimeLock<T> = OrderedMutex<T, { LockLevel::Runtime as u8 }>;

/// Level 3 lock - relay cursor
pub type RelayLock<T> = OrderedMutex<T, { LockLevel::RootDomain as u8 }>;

/// Level 4 lock - task directory
pub type DirectoryLock<T> = OrderedRwLock<T, { LockLevel::Directory as u8 }>;

/// Level 5 lock - ontime task set
pub type OntimeLock<T> = OrderedMutex<T, { LockLevel::Ontime as u8 }>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_levels() {
        let rq: RqLock<i32> = RqLock::new(0, "test_rq");
        let bw: BandwidthLock<i32> = BandwidthLock::new(0, "test_bw");
        let runtime: RuntimeLock<i32> = RuntimeLock::new(0, "test_runtime");
        let relay: RelayLock<i32> = RelayLock::new(0, "test_relay");
        let dir: DirectoryLock<i32> = DirectoryLock::new(0, "test_dir");
        let ontime: OntimeLock<i32> = OntimeLock::new(0, "test_ontime");

        assert_eq!(rq.level(), 0);
        assert_eq!(bw.level(), 1);
        assert_eq!(runtime.level(), 2);
        assert_eq!(relay.level(), 3);
        assert_eq!(dir.level(), 4);
        assert_eq!(ontime.level(), 5);
    }

    #[test]
    fn test_lock_unlock() {
        let lock: RqLock<i32> = RqLock::new(42, "test");

        {
            let mut guard = lock.lock();
            *guard = 100;
            assert!(lock.is_locked());
        }

        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 100);
    }

    #[test]
    fn test_try_lock() {
        let lock: RuntimeLock<i32> = RuntimeLock::new(42, "test");

        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_read_write() {
        let lock: DirectoryLock<i32> = DirectoryLock::new(1, "test");
        *lock.write() = 5;
        assert_eq!(*lock.read(), 5);
    }
}
