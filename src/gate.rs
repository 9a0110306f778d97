//! Lifecycle gate: admission control and shutdown draining.
//!
//! The gate moves monotonically through Open → Closing → Closed. Every
//! public store operation is admitted through it and holds an
//! [`AccessGuard`] for its duration; `close` flips the state to Closing,
//! waits for the in-flight count to drain to zero, releases resources, and
//! seals the state. This is deliberately separate from the move lock: the
//! gate drains, the move lock fences (see `movelock`).

use std::sync::Arc;

use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::error::ClosedSnafu;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct GateInner {
    state: LifecycleState,
    in_flight: usize,
}

/// Admission gate shared by all operations of one store.
#[derive(Debug)]
pub struct LifecycleGate {
    inner: Mutex<GateInner>,
    idle: Condvar,
}

impl LifecycleGate {
    /// A fresh gate in the Open state.
    pub fn new() -> Arc<LifecycleGate> {
        Arc::new(LifecycleGate {
            inner: Mutex::new(GateInner {
                state: LifecycleState::Open,
                in_flight: 0,
            }),
            idle: Condvar::new(),
        })
    }

    /// Admit one caller, or fail with `Closed` once shutdown has begun.
    ///
    /// The guard owns a handle to the gate so iteration producers can carry
    /// their admission into a worker thread.
    pub fn admit(gate: &Arc<LifecycleGate>) -> Result<AccessGuard> {
        let mut inner = gate.inner.lock();
        if inner.state != LifecycleState::Open {
            return ClosedSnafu.fail();
        }
        inner.in_flight += 1;
        Ok(AccessGuard {
            gate: Arc::clone(gate),
        })
    }

    /// Whether the gate is still admitting.
    ///
    /// Long-running iteration re-checks this at every yield so a shutdown
    /// is not stalled behind a slow consumer.
    pub fn is_open(&self) -> bool {
        self.inner.lock().state == LifecycleState::Open
    }

    /// Begin shutdown. Returns false when a close is already under way (or
    /// done), which callers treat as a successful no-op.
    pub fn begin_close(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != LifecycleState::Open {
            return false;
        }
        inner.state = LifecycleState::Closing;
        true
    }

    /// Block until every admitted caller has left.
    pub fn wait_idle(&self) {
        let mut inner = self.inner.lock();
        while inner.in_flight > 0 {
            self.idle.wait(&mut inner);
        }
    }

    /// Seal the gate after resources are released.
    pub fn finish_close(&self) {
        self.inner.lock().state = LifecycleState::Closed;
    }
}

/// In-flight marker handed out by [`LifecycleGate::admit`].
///
/// Dropping it is the `leave` half of the admission bracket.
#[derive(Debug)]
pub struct AccessGuard {
    gate: Arc<LifecycleGate>,
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        let mut inner = self.gate.inner.lock();
        inner.in_flight -= 1;
        if inner.in_flight == 0 {
            self.gate.idle.notify_all();
        }
    }
}
