// src/core/namespace/locking.rs

//! The re-entrant, multi-granularity locking discipline for metadata entities.
//!
//! Each entity couples a shared/exclusive lock with its payload. A thread
//! records the entities it holds in two thread-local count maps keyed by the
//! entity address, one for read holdings and one for write holdings. A nested
//! acquisition is a no-op against the underlying lock and only bumps the
//! tracker; a write acquisition registers a shadow read acquisition so a
//! nested read re-entry never attempts a shared acquire against the thread's
//! own exclusive hold.
//!
//! Lock acquisition never fails from the caller's point of view; the
//! discipline guarantees progress, and a violation is a programming bug.

use parking_lot::RawRwLock;
use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use std::cell::{RefCell, UnsafeCell};
use std::collections::HashMap;

thread_local! {
    static READ_HOLDINGS: RefCell<HashMap<usize, u64>> = RefCell::new(HashMap::new());
    static WRITE_HOLDINGS: RefCell<HashMap<usize, u64>> = RefCell::new(HashMap::new());
}

fn register(map: &'static std::thread::LocalKey<RefCell<HashMap<usize, u64>>>, addr: usize) {
    map.with(|m| *m.borrow_mut().entry(addr).or_insert(0) += 1);
}

fn unregister(map: &'static std::thread::LocalKey<RefCell<HashMap<usize, u64>>>, addr: usize) {
    map.with(|m| {
        let mut m = m.borrow_mut();
        if let Some(count) = m.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                m.remove(&addr);
            }
        }
    });
}

fn is_registered(
    map: &'static std::thread::LocalKey<RefCell<HashMap<usize, u64>>>,
    addr: usize,
) -> bool {
    map.with(|m| m.borrow().contains_key(&addr))
}

/// A metadata payload guarded by the re-entrant discipline.
///
/// Data access goes through [`Lockable::run_read_op`] and
/// [`Lockable::run_write_op`]; the RAII guards returned by the `*_lock`
/// methods are pure lock scopes and expose no data themselves.
///
/// Safety contract of the `UnsafeCell`: a closure passed to a run-op must not
/// re-enter a run-op on the same entity; entity accessors are leaf operations
/// on the payload, which upholds this throughout the crate.
pub struct Lockable<T> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Lockable<T> {}
unsafe impl<T: Send + Sync> Sync for Lockable<T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for Lockable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lockable").finish_non_exhaustive()
    }
}

impl<T> Lockable<T> {
    pub fn new(data: T) -> Self {
        Self {
            raw: RawRwLock::INIT,
            data: UnsafeCell::new(data),
        }
    }

    fn addr(&self) -> usize {
        self as *const _ as usize
    }

    /// Whether this thread may read the payload without acquiring: a write
    /// hold counts as a read hold, otherwise a shared acquire against our own
    /// exclusive hold would deadlock.
    fn holds_read(&self) -> bool {
        is_registered(&WRITE_HOLDINGS, self.addr()) || is_registered(&READ_HOLDINGS, self.addr())
    }

    fn holds_write(&self) -> bool {
        is_registered(&WRITE_HOLDINGS, self.addr())
    }

    /// Runs a read operation on the payload, acquiring the shared lock only
    /// when this thread holds nothing on the entity yet.
    pub fn run_read_op<R>(&self, op: impl FnOnce(&T) -> R) -> R {
        if self.holds_read() {
            return op(unsafe { &*self.data.get() });
        }

        self.raw.lock_shared();
        let _release = ReleaseShared(&self.raw);
        op(unsafe { &*self.data.get() })
    }

    /// Runs a write operation on the payload, acquiring the exclusive lock
    /// only when this thread does not hold it yet.
    pub fn run_write_op<R>(&self, op: impl FnOnce(&mut T) -> R) -> R {
        if self.holds_write() {
            return op(unsafe { &mut *self.data.get() });
        }

        debug_assert!(
            !is_registered(&READ_HOLDINGS, self.addr()),
            "write operation under a read-only hold"
        );

        self.raw.lock_exclusive();
        let _release = ReleaseExclusive(&self.raw);
        op(unsafe { &mut *self.data.get() })
    }

    /// Takes a read lock scope. Re-entrant: a thread already holding a read
    /// or write on this entity only bumps the tracker.
    pub fn read_lock(&self) -> ReadLockScope<'_, T> {
        let acquired = !self.holds_read();

        if acquired {
            self.raw.lock_shared();
        }

        register(&READ_HOLDINGS, self.addr());
        ReadLockScope {
            lockable: self,
            acquired,
        }
    }

    /// Takes a write lock scope. Re-entrant for a thread already holding the
    /// write; also registers the shadow read hold.
    pub fn write_lock(&self) -> WriteLockScope<'_, T> {
        let acquired = !self.holds_write();

        if acquired {
            self.raw.lock_exclusive();
        }

        register(&WRITE_HOLDINGS, self.addr());
        register(&READ_HOLDINGS, self.addr());
        WriteLockScope {
            lockable: self,
            acquired,
        }
    }

    /// Tries to take a read lock scope without blocking.
    pub fn try_read_lock(&self) -> Option<ReadLockScope<'_, T>> {
        if self.holds_read() {
            register(&READ_HOLDINGS, self.addr());
            return Some(ReadLockScope {
                lockable: self,
                acquired: false,
            });
        }

        if !self.raw.try_lock_shared() {
            return None;
        }

        register(&READ_HOLDINGS, self.addr());
        Some(ReadLockScope {
            lockable: self,
            acquired: true,
        })
    }

    /// Tries to take a write lock scope without blocking.
    pub fn try_write_lock(&self) -> Option<WriteLockScope<'_, T>> {
        if self.holds_write() {
            register(&WRITE_HOLDINGS, self.addr());
            register(&READ_HOLDINGS, self.addr());
            return Some(WriteLockScope {
                lockable: self,
                acquired: false,
            });
        }

        if !self.raw.try_lock_exclusive() {
            return None;
        }

        register(&WRITE_HOLDINGS, self.addr());
        register(&READ_HOLDINGS, self.addr());
        Some(WriteLockScope {
            lockable: self,
            acquired: true,
        })
    }
}

struct ReleaseShared<'a>(&'a RawRwLock);

impl Drop for ReleaseShared<'_> {
    fn drop(&mut self) {
        unsafe { self.0.unlock_shared() };
    }
}

struct ReleaseExclusive<'a>(&'a RawRwLock);

impl Drop for ReleaseExclusive<'_> {
    fn drop(&mut self) {
        unsafe { self.0.unlock_exclusive() };
    }
}

/// An RAII read lock scope on one entity.
pub struct ReadLockScope<'a, T> {
    lockable: &'a Lockable<T>,
    acquired: bool,
}

impl<T> Drop for ReadLockScope<'_, T> {
    fn drop(&mut self) {
        unregister(&READ_HOLDINGS, self.lockable.addr());

        if self.acquired {
            unsafe { self.lockable.raw.unlock_shared() };
        }
    }
}

/// An RAII write lock scope on one entity.
pub struct WriteLockScope<'a, T> {
    lockable: &'a Lockable<T>,
    acquired: bool,
}

impl<T> Drop for WriteLockScope<'_, T> {
    fn drop(&mut self) {
        unregister(&WRITE_HOLDINGS, self.lockable.addr());
        unregister(&READ_HOLDINGS, self.lockable.addr());

        if self.acquired {
            unsafe { self.lockable.raw.unlock_exclusive() };
        }
    }
}
