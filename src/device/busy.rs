//! Busy Gate - per-device exclusion by operation class
//!
//! Each device carries a busy mask with one bit per operation class. An
//! operation takes the bits of its class for as long as it runs; operations
//! of other classes keep going. A caller whose bits are taken registers in
//! the wait set of each wanted class, drops the device lock and blocks in
//! the scheduler. Every release wakes all waiters of the device and each of
//! them re-checks the mask under the lock, so correctness never depends on
//! who got woken.
//!
//! A holder that goes away without releasing leaves its bits set for good.
//! Callers pair every acquire with a release on all exit paths.
//!
//! Bits outside the known classes are dropped on entry: they have no wait
//! set, so nothing could ever wake a thread blocked on them.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, trace, warn};
use spin::Mutex;

use crate::config::OP_CLASSES;
use crate::error::{DeviceError, Result};
use crate::kern::{Scheduler, WaitSet, Waiter};
use crate::types::ThreadId;

// ============================================================================
// Operation Classes
// ============================================================================

bitflags! {
    /// Operation classes; each bit is exclusive on its device
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpClass: u32 {
        /// Read-class transfers
        const READ = 0b001;
        /// Write-class transfers
        const WRITE = 0b010;
        /// Control operations
        const CONTROL = 0b100;
    }
}

impl OpClass {
    /// Wait-set slots covered by this class mask
    fn slots(self) -> impl Iterator<Item = usize> {
        (0..OP_CLASSES).filter(move |&i| self.bits() & (1 << i) != 0)
    }
}

// ============================================================================
// Busy Token
// ============================================================================

/// Proof that the holder owns `class` on the device at `minor`
///
/// Handed back to [`BusyGate::release`] to clear the bits. Not `Clone`, so
/// the same bits cannot be released twice. The token also names the gate
/// instance that issued it; a device re-attached at the same minor gets a
/// new gate and refuses older tokens.
#[must_use = "dropping a BusyToken leaves its bits set until the device is detached"]
#[derive(Debug, PartialEq, Eq)]
pub struct BusyToken {
    minor: u32,
    generation: u64,
    class: OpClass,
}

impl BusyToken {
    /// Minor number of the device the bits are held on
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Held class bits
    pub fn class(&self) -> OpClass {
        self.class
    }
}

// ============================================================================
// Gate State
// ============================================================================

/// State guarded by the device lock
#[derive(Debug)]
struct GateState {
    /// Classes currently held
    busy: OpClass,
    /// One wait set per class
    wait_sets: [WaitSet; OP_CLASSES],
}

impl GateState {
    fn new() -> Self {
        Self {
            busy: OpClass::empty(),
            wait_sets: core::array::from_fn(|_| WaitSet::new()),
        }
    }

    fn enqueue(&mut self, class: OpClass, waiter: Waiter) {
        for slot in class.slots() {
            self.wait_sets[slot].add(waiter);
        }
    }

    fn forget(&mut self, thread_id: ThreadId) {
        for set in self.wait_sets.iter_mut() {
            set.remove(thread_id);
        }
    }

    /// Empty every wait set, one entry per distinct thread
    fn drain_all(&mut self) -> Vec<ThreadId> {
        let mut threads = BTreeSet::new();
        for set in self.wait_sets.iter_mut() {
            threads.extend(set.drain().into_iter().map(|w| w.thread_id));
        }
        threads.into_iter().collect()
    }
}

// ============================================================================
// Busy Gate
// ============================================================================

/// Busy mask and wait sets of one device
pub struct BusyGate {
    minor: u32,
    generation: u64,
    state: Mutex<GateState>,
}

impl BusyGate {
    pub fn new(minor: u32) -> Self {
        static GENERATION: AtomicU64 = AtomicU64::new(1);
        Self {
            minor,
            generation: GENERATION.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(GateState::new()),
        }
    }

    fn token(&self, class: OpClass) -> BusyToken {
        BusyToken {
            minor: self.minor,
            generation: self.generation,
            class,
        }
    }

    /// Take `class` on this device, blocking while any of its bits is held
    ///
    /// With `interruptible` set, a pending signal observed while the bits
    /// are still held ends the wait with [`DeviceError::Cancelled`] and the
    /// busy mask untouched.
    pub fn acquire(
        &self,
        sched: &dyn Scheduler,
        class: OpClass,
        interruptible: bool,
    ) -> Result<BusyToken> {
        let class = class & OpClass::all();
        let me = sched.current_thread();
        let result = self.wait_for(sched, me, class, interruptible);
        sched.finish_wait();
        result
    }

    fn wait_for(
        &self,
        sched: &dyn Scheduler,
        me: ThreadId,
        class: OpClass,
        interruptible: bool,
    ) -> Result<BusyToken> {
        let mut state = self.state.lock();

        // Wait for other holders to leave
        loop {
            if !state.busy.intersects(class) {
                state.busy |= class;
                state.forget(me);
                trace!("mach_dev[{}]: {:?} taken, busy={:?}", self.minor, class, state.busy);
                return Ok(self.token(class));
            }

            if interruptible && sched.signal_pending() {
                state.forget(me);
                debug!("mach_dev[{}]: wait for {:?} cancelled", self.minor, class);
                return Err(DeviceError::Cancelled);
            }

            state.enqueue(class, Waiter::new(me, interruptible));
            drop(state);

            sched.block_current();

            state = self.state.lock();
        }
    }

    /// Take `class` only if it is free right now
    pub fn try_acquire(&self, class: OpClass) -> Option<BusyToken> {
        let class = class & OpClass::all();
        let mut state = self.state.lock();
        if state.busy.intersects(class) {
            return None;
        }
        state.busy |= class;
        Some(self.token(class))
    }

    /// Clear the bits held by `token` and wake every waiter of the device
    ///
    /// A token issued by another gate, or naming bits this gate does not
    /// hold, is refused: nothing is cleared and `false` is returned.
    pub fn release(&self, sched: &dyn Scheduler, token: BusyToken) -> bool {
        if token.generation != self.generation {
            warn!(
                "mach_dev[{}]: refusing {:?} token issued for minor {} by another gate",
                self.minor, token.class, token.minor
            );
            return false;
        }

        let woken = {
            let mut state = self.state.lock();
            if !state.busy.contains(token.class) {
                warn!(
                    "mach_dev[{}]: refusing release of {:?}, busy={:?}",
                    self.minor, token.class, state.busy
                );
                return false;
            }
            state.busy.remove(token.class);
            trace!("mach_dev[{}]: {:?} released, busy={:?}", self.minor, token.class, state.busy);
            state.drain_all()
        };

        // Wake outside the lock so woken threads do not spin on it
        for thread_id in woken {
            sched.wake_thread(thread_id);
        }
        true
    }

    /// Classes currently held
    pub fn busy(&self) -> OpClass {
        self.state.lock().busy
    }

    /// Number of distinct threads blocked on this gate
    pub fn waiting(&self) -> usize {
        let state = self.state.lock();
        let mut threads = BTreeSet::new();
        for set in state.wait_sets.iter() {
            threads.extend(set.threads());
        }
        threads.len()
    }
}

impl fmt::Debug for BusyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusyGate")
            .field("minor", &self.minor)
            .field("busy", &self.busy())
            .finish()
    }
}
