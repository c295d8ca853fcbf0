//! Thread-backed scheduler
//!
//! Implements [`Scheduler`] on top of OS threads: blocking is
//! `std::thread::park`, wakeup is `Thread::unpark`. The park token gives the
//! "wake before block is not lost" guarantee the gate relies on. Signals are
//! modelled as a pending set that the owner raises with [`ThreadScheduler::signal`].
//!
//! A thread is known to the scheduler only between `current_thread` and
//! `finish_wait`. Its pending signal is dropped at `finish_wait` too, so
//! short-lived threads leave nothing behind.

use alloc::collections::{BTreeMap, BTreeSet};
use spin::Mutex;
use std::thread::{self, Thread};

use super::sched_prim::Scheduler;
use crate::types::ThreadId;

std::thread_local! {
    static CURRENT: ThreadId = ThreadId::new();
}

/// Scheduler for hosted builds and tests
#[derive(Debug, Default)]
pub struct ThreadScheduler {
    /// Threads inside a wait
    threads: Mutex<BTreeMap<ThreadId, Thread>>,
    /// Threads with a pending cancellation signal
    signals: Mutex<BTreeSet<ThreadId>>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread and return its id
    ///
    /// Paired with [`Scheduler::finish_wait`], which forgets the thread again.
    pub fn enroll(&self) -> ThreadId {
        let id = CURRENT.with(|id| *id);
        self.threads
            .lock()
            .entry(id)
            .or_insert_with(thread::current);
        id
    }

    /// Raise a cancellation signal for `thread_id` and kick it out of any block
    pub fn signal(&self, thread_id: ThreadId) {
        self.signals.lock().insert(thread_id);
        self.wake_thread(thread_id);
    }

    /// Acknowledge a delivered signal
    pub fn clear_signal(&self, thread_id: ThreadId) {
        self.signals.lock().remove(&thread_id);
    }

    /// Number of threads currently registered
    pub fn enrolled(&self) -> usize {
        self.threads.lock().len()
    }
}

impl Scheduler for ThreadScheduler {
    fn current_thread(&self) -> ThreadId {
        self.enroll()
    }

    fn block_current(&self) {
        thread::park();
    }

    fn wake_thread(&self, thread_id: ThreadId) {
        let target = self.threads.lock().get(&thread_id).cloned();
        if let Some(thread) = target {
            thread.unpark();
        }
    }

    fn signal_pending(&self) -> bool {
        let id = CURRENT.with(|id| *id);
        self.signals.lock().contains(&id)
    }

    fn finish_wait(&self) {
        let id = CURRENT.with(|id| *id);
        self.threads.lock().remove(&id);
        self.signals.lock().remove(&id);
    }
}
