//! Owner-reentrant locks guarding the clock tree
//!
//! There are two of them. The prepare lock serializes everything that touches topology, rates
//! and the prepare/protect counts, and may be held across ops that sleep. The enable lock only
//! covers enable counts and the enable/disable ops, and runs with interrupts masked.
//!
//! Both may be taken again by the actor that already holds them.
//!
//! Underneath both sits the node store's own mutex. It's only ever held briefly, never across
//! an op, and always with interrupts masked so an enable from interrupt context can't spin on
//! a holder it interrupted.
use crate::node::NodeStore;
use core::{
    hint::spin_loop,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};
use critical_section::RestoreState;
use spin::{Mutex, MutexGuard};

const UNOWNED: usize = usize::MAX;

/// A spinning lock that the owning actor can re-acquire without blocking
#[derive(Debug)]
pub(crate) struct ReentrantLock {
    name: &'static str,
    owner: AtomicUsize,
    depth: AtomicUsize,
}

impl ReentrantLock {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            name,
            owner: AtomicUsize::new(UNOWNED),
            depth: AtomicUsize::new(0),
        }
    }

    /// Take the lock on behalf of `actor`
    ///
    /// # Panics
    /// Panics if `actor` is `usize::MAX`, which is reserved to mean "nobody"
    pub(crate) fn acquire(&self, actor: usize) {
        assert_ne!(actor, UNOWNED);
        if self.owner.load(Ordering::Acquire) == actor {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }

        while self
            .owner
            .compare_exchange_weak(UNOWNED, actor, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        self.depth.store(1, Ordering::Relaxed);
    }

    /// Drop one level of ownership, releasing the lock at depth zero
    pub(crate) fn release(&self, actor: usize) {
        if self.owner.load(Ordering::Relaxed) != actor {
            log::warn!("clk: {} released by an actor that doesn't own it", self.name);
            return;
        }

        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(UNOWNED, Ordering::Release);
        }
    }

    /// Check if `actor` currently owns the lock
    pub(crate) fn is_held_by(&self, actor: usize) -> bool {
        self.owner.load(Ordering::Acquire) == actor
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Holds one level of a [ReentrantLock] until dropped
pub(crate) struct LockGuard<'a> {
    lock: &'a ReentrantLock,
    actor: usize,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.actor);
    }
}

/// The pair of locks used by a clock tree
pub(crate) struct Locks {
    actor: fn() -> usize,
    prepare: ReentrantLock,
    enable: ReentrantLock,
}

impl Locks {
    /// `actor` identifies the caller, e.g. the current hart or thread
    pub(crate) const fn new(actor: fn() -> usize) -> Self {
        Self {
            actor,
            prepare: ReentrantLock::new("prepare lock"),
            enable: ReentrantLock::new("enable lock"),
        }
    }

    /// Take the prepare lock for the lifetime of the returned guard
    pub(crate) fn prepare(&self) -> LockGuard<'_> {
        let actor = (self.actor)();
        self.prepare.acquire(actor);
        LockGuard {
            lock: &self.prepare,
            actor,
        }
    }

    /// Run `f` under the enable lock with interrupts masked
    pub(crate) fn enable<R>(&self, f: impl FnOnce() -> R) -> R {
        critical_section::with(|_| {
            let actor = (self.actor)();
            self.enable.acquire(actor);
            let _guard = LockGuard {
                lock: &self.enable,
                actor,
            };
            f()
        })
    }

    /// Check if the calling actor holds the prepare lock
    pub(crate) fn prepare_held(&self) -> bool {
        self.prepare.is_held_by((self.actor)())
    }
}

/// The locked node store; interrupts stay masked until it's dropped
pub(crate) struct StoreGuard<'a> {
    guard: ManuallyDrop<MutexGuard<'a, NodeStore>>,
    restore: RestoreState,
}

impl<'a> StoreGuard<'a> {
    #[allow(unsafe_code)]
    pub(crate) fn lock(store: &'a Mutex<NodeStore>) -> Self {
        // SAFETY: released exactly once, in `drop`. Guards can't nest since the mutex isn't
        // reentrant, so releases happen in the reverse order of acquisition.
        let restore = unsafe { critical_section::acquire() };
        Self {
            guard: ManuallyDrop::new(store.lock()),
            restore,
        }
    }
}

impl Deref for StoreGuard<'_> {
    type Target = NodeStore;

    fn deref(&self) -> &NodeStore {
        &self.guard
    }
}

impl DerefMut for StoreGuard<'_> {
    fn deref_mut(&mut self) -> &mut NodeStore {
        &mut self.guard
    }
}

impl Drop for StoreGuard<'_> {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: `guard` isn't touched again, and `restore` came from the matching acquire
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
            critical_section::release(self.restore);
        }
    }
}
