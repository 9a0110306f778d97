//! The move lock: shared/exclusive coordination for live relocation.
//!
//! Orthogonal to the lifecycle gate. Short-lived engine-touching operations
//! acquire it shared; the mover acquires it exclusively at the three phase
//! boundaries of a relocation (start, swap, teardown). The lock carries the
//! move state machine:
//!
//! ```text
//! None ──start──▶ Lock ──acquired──▶ Moving ──swap──▶ Lock ──released──▶ Cleanup ──done──▶ None
//!                    ▲                                                        │
//!                    └────────────────────── abort ───────────────────────────┘
//! ```
//!
//! This is not a standard reader-writer lock. The shared side is recursive
//! while held: the Lock gate is only consulted on the zero-to-one holder
//! transition, so an operation that nests further shared acquires under an
//! enclosing one (the put path probes, then mutates) can never deadlock
//! against an exclusive waiter that arrived in between.

use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::error::MoveInProgressSnafu;
use crate::error::Result;

/// Phase of the relocation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveState {
    /// No move in progress.
    None,
    /// A move is under way; shared traffic flows freely.
    Moving,
    /// A move finished or aborted; teardown is running.
    Cleanup,
    /// An exclusive transition holds the lock; shared entry is gated.
    Lock,
}

#[derive(Debug)]
struct Inner {
    state: MoveState,
    shared: usize,
}

/// The two-tier lock itself.
#[derive(Debug)]
pub struct MoveLock {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl Default for MoveLock {
    fn default() -> Self {
        Self::new()
    }
}

impl MoveLock {
    /// A fresh lock in [`MoveState::None`].
    pub fn new() -> MoveLock {
        MoveLock {
            inner: Mutex::new(Inner {
                state: MoveState::None,
                shared: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Shared acquire for the duration of one engine access.
    ///
    /// Blocks only while an exclusive transition holds the lock, and only
    /// when no shared holder is already present (recursive-while-held).
    pub fn lock_db(&self) -> DbGuard<'_> {
        let mut inner = self.inner.lock();
        if inner.shared == 0 {
            while inner.state == MoveState::Lock {
                self.cond.wait(&mut inner);
            }
        }
        inner.shared += 1;
        DbGuard { lock: self }
    }

    /// Exclusive acquire: gate new shared entry, then wait out the holders.
    ///
    /// The returned guard keeps the lock until [`MoveGuard::release`] names
    /// the next state.
    pub fn lock_move(&self) -> MoveGuard<'_> {
        let mut inner = self.inner.lock();
        inner.state = MoveState::Lock;
        while inner.shared > 0 {
            self.cond.wait(&mut inner);
        }
        MoveGuard {
            lock: self,
            inner: Some(inner),
        }
    }

    /// The initial fence of a move: refuse if one is already running,
    /// otherwise acquire exclusively and land in [`MoveState::Moving`].
    ///
    /// Inlined rather than composed from [`Self::lock_move`] so a losing
    /// racer cannot clobber the winner's state.
    pub fn begin_move(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != MoveState::None {
            return MoveInProgressSnafu.fail();
        }

        inner.state = MoveState::Lock;
        while inner.shared > 0 {
            self.cond.wait(&mut inner);
        }

        inner.state = MoveState::Moving;
        self.cond.notify_all();
        Ok(())
    }

    /// Current state, for tests and logging.
    pub fn state(&self) -> MoveState {
        self.inner.lock().state
    }
}

/// Shared guard returned by [`MoveLock::lock_db`].
#[derive(Debug)]
pub struct DbGuard<'a> {
    lock: &'a MoveLock,
}

impl Drop for DbGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.lock.inner.lock();
        inner.shared -= 1;
        if inner.shared == 0 && inner.state == MoveState::Lock {
            self.lock.cond.notify_all();
        }
    }
}

/// Exclusive guard returned by [`MoveLock::lock_move`].
///
/// Must be released with an explicit next state; dropping it without a
/// release (a panic unwinding through the mover) falls back to
/// [`MoveState::None`] so shared traffic is never wedged.
#[derive(Debug)]
pub struct MoveGuard<'a> {
    lock: &'a MoveLock,
    inner: Option<MutexGuard<'a, Inner>>,
}

impl MoveGuard<'_> {
    /// Release the exclusive lock, landing in `next`.
    pub fn release(mut self, next: MoveState) {
        if let Some(mut inner) = self.inner.take() {
            inner.state = next;
            self.lock.cond.notify_all();
        }
    }
}

impl Drop for MoveGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.state = MoveState::None;
            self.lock.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn shared_acquires_nest() {
        let lock = MoveLock::new();
        let outer = lock.lock_db();
        let inner = lock.lock_db();
        drop(inner);
        drop(outer);
        assert_eq!(lock.state(), MoveState::None);
    }

    #[test]
    fn exclusive_waits_for_shared_holders() {
        let lock = Arc::new(MoveLock::new());
        let guard = lock.lock_db();

        let (tx, rx) = mpsc::channel();
        let mover = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let exclusive = lock.lock_move();
                tx.send(()).expect("send");
                exclusive.release(MoveState::Moving);
            })
        };

        // The mover is fenced out while the shared guard lives.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        drop(guard);
        rx.recv_timeout(Duration::from_secs(5)).expect("mover acquired");
        mover.join().expect("mover joins");
        assert_eq!(lock.state(), MoveState::Moving);
    }

    #[test]
    fn nested_shared_acquire_bypasses_the_gate() {
        let lock = Arc::new(MoveLock::new());
        let outer = lock.lock_db();

        // An exclusive waiter parks and flips the state to Lock.
        let mover = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let exclusive = lock.lock_move();
                exclusive.release(MoveState::None);
            })
        };

        while lock.state() != MoveState::Lock {
            std::thread::yield_now();
        }

        // A nested shared acquire must not deadlock against the waiter.
        let nested = lock.lock_db();
        drop(nested);
        drop(outer);

        mover.join().expect("mover joins");
        assert_eq!(lock.state(), MoveState::None);
    }

    #[test]
    fn second_move_is_rejected() {
        let lock = MoveLock::new();
        lock.begin_move().expect("first move starts");
        assert_eq!(lock.state(), MoveState::Moving);

        let err = lock.begin_move().expect_err("second move rejected");
        assert!(matches!(err, crate::BlockstoreError::MoveInProgress));

        // Teardown re-arms the lock.
        let exclusive = lock.lock_move();
        exclusive.release(MoveState::None);
        lock.begin_move().expect("move can start again");
    }

    #[test]
    fn shared_entry_blocks_while_locked() {
        let lock = Arc::new(MoveLock::new());
        let exclusive = lock.lock_move();

        let (tx, rx) = mpsc::channel();
        let reader = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let guard = lock.lock_db();
                tx.send(()).expect("send");
                drop(guard);
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        exclusive.release(MoveState::Moving);
        rx.recv_timeout(Duration::from_secs(5)).expect("reader admitted");
        reader.join().expect("reader joins");
    }
}
