//! Producer/dispatcher synchronization primitives.
//!
//! `Signal` is an auto-reset event: one `wait` consumes one `signal`, and a
//! signal delivered before the wait lets the waiter through immediately.
//! The command queue uses a pair of them to hand off between producers and
//! the dispatcher (ready / consumed).
//!
//! `Fence` layers a published 32-bit value on top of a signal. Producers
//! enqueue fence signals behind a chain of writes; a waiter that needs
//! those writes durable blocks on the fence, either for the next signal or
//! until the published value reaches a threshold.

use std::sync::{Condvar, Mutex};

pub struct Signal {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Blocks until signaled, then resets.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
        *signaled = false;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

struct FenceState {
    value: u32,
    signaled: bool,
}

pub struct Fence {
    state: Mutex<FenceState>,
    cond: Condvar,
}

impl Fence {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FenceState {
                value: 0,
                signaled: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Marks the fence signaled without publishing a value.
    pub fn signal(&self) {
        let mut state = self.state.lock().unwrap();
        state.signaled = true;
        self.cond.notify_all();
    }

    /// Publishes `value` and marks the fence signaled.
    pub fn signal_value(&self, value: u32) {
        let mut state = self.state.lock().unwrap();
        state.value = value;
        state.signaled = true;
        self.cond.notify_all();
    }

    /// Blocks until the fence is signaled, then resets the signal.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.signaled {
            state = self.cond.wait(state).unwrap();
        }
        state.signaled = false;
    }

    /// Blocks until the published value reaches `value`. Level-triggered:
    /// returns immediately if the value is already there, and does not
    /// reset the signal.
    pub fn wait_value(&self, value: u32) {
        let mut state = self.state.lock().unwrap();
        while state.value < value {
            state = self.cond.wait(state).unwrap();
        }
    }

    pub fn value(&self) -> u32 {
        self.state.lock().unwrap().value
    }

    /// Clears the value and signal for reuse across passes.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.value = 0;
        state.signaled = false;
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Fence")
            .field("value", &state.value)
            .field("signaled", &state.signaled)
            .finish()
    }
}
