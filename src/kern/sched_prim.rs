//! Scheduling Primitives - Wait/Wakeup
//!
//! Provides the scheduler contract the busy gate blocks through, and the
//! per-class wait sets that record who must be woken when bits clear.

use alloc::vec::Vec;

use crate::types::ThreadId;

// ============================================================================
// Scheduler Contract
// ============================================================================

/// Thread blocking and wakeup, supplied by the embedding kernel
///
/// A wake issued for a thread that has not blocked yet must not be lost: the
/// next `block_current` of that thread returns immediately. `block_current`
/// may also return without any wake at all, so callers always re-check their
/// condition.
pub trait Scheduler: Send + Sync {
    /// The thread on whose behalf the caller runs
    fn current_thread(&self) -> ThreadId;

    /// Suspend the current thread until woken
    fn block_current(&self);

    /// Make a blocked thread runnable again
    fn wake_thread(&self, thread_id: ThreadId);

    /// Whether a cancellation signal is pending for the current thread
    fn signal_pending(&self) -> bool;

    /// The current thread left the wait it entered with `current_thread`
    ///
    /// Called once per acquire on every exit path, after the device lock is
    /// dropped. Per-thread bookkeeping kept for the wait can go here.
    fn finish_wait(&self) {}
}

// ============================================================================
// Waiter Entry
// ============================================================================

/// A thread waiting for busy bits to clear
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    /// The waiting thread
    pub thread_id: ThreadId,
    /// Is this wait interruptible?
    pub interruptible: bool,
}

impl Waiter {
    pub fn new(thread_id: ThreadId, interruptible: bool) -> Self {
        Self {
            thread_id,
            interruptible,
        }
    }
}

// ============================================================================
// Wait Set
// ============================================================================

/// Threads waiting on one operation class of a device
///
/// Not internally locked: the owner mutates it only under the device lock.
#[derive(Debug, Default)]
pub struct WaitSet {
    waiters: Vec<Waiter>,
}

impl WaitSet {
    pub const fn new() -> Self {
        Self {
            waiters: Vec::new(),
        }
    }

    /// Add a waiter; a thread already present is not added twice
    pub fn add(&mut self, waiter: Waiter) {
        if !self.contains(waiter.thread_id) {
            self.waiters.push(waiter);
        }
    }

    /// Remove a specific waiter
    pub fn remove(&mut self, thread_id: ThreadId) -> Option<Waiter> {
        let pos = self.waiters.iter().position(|w| w.thread_id == thread_id)?;
        Some(self.waiters.swap_remove(pos))
    }

    /// Take every waiter out of the set
    pub fn drain(&mut self) -> Vec<Waiter> {
        core::mem::take(&mut self.waiters)
    }

    /// Threads currently in the set
    pub fn threads(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.waiters.iter().map(|w| w.thread_id)
    }

    pub fn contains(&self, thread_id: ThreadId) -> bool {
        self.waiters.iter().any(|w| w.thread_id == thread_id)
    }

    /// Get count of waiters
    pub fn count(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
