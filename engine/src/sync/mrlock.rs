// Multi-reader lock
// Explicit lock/unlock (no guard) so that a transaction can hold it across calls

use super::{lock, wait};
use crate::types::LockMode;
use std::sync::{Condvar, Mutex};

#[derive(Debug, Default)]
struct MrState {
    readers: u32,
    writer: bool,
    writers_waiting: u32,
}

/// Reader/writer lock with writer preference.
///
/// Unlike `std::sync::RwLock` the lock is not tied to a guard's lifetime: the
/// holder calls `unlock` with the mode it acquired. Waiting writers block new
/// readers so a stream of readers cannot starve an update.
#[derive(Debug)]
pub struct MrLock {
    name: &'static str,
    state: Mutex<MrState>,
    cond: Condvar,
}

impl MrLock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(MrState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the lock, sleeping until it is available
    pub fn lock(&self, mode: LockMode) {
        let mut state = lock(&self.state);
        match mode {
            LockMode::Shared => {
                while state.writer || state.writers_waiting > 0 {
                    state = wait(&self.cond, state);
                }
                state.readers += 1;
            }
            LockMode::Exclusive => {
                state.writers_waiting += 1;
                while state.writer || state.readers > 0 {
                    state = wait(&self.cond, state);
                }
                state.writers_waiting -= 1;
                state.writer = true;
            }
        }
    }

    /// Acquire the lock only if that does not require sleeping
    pub fn try_lock(&self, mode: LockMode) -> bool {
        let mut state = lock(&self.state);
        match mode {
            LockMode::Shared => {
                if state.writer || state.writers_waiting > 0 {
                    return false;
                }
                state.readers += 1;
            }
            LockMode::Exclusive => {
                if state.writer || state.readers > 0 {
                    return false;
                }
                state.writer = true;
            }
        }
        true
    }

    pub fn unlock(&self, mode: LockMode) {
        let mut state = lock(&self.state);
        match mode {
            LockMode::Shared => {
                debug_assert!(state.readers > 0, "{}: shared unlock without holder", self.name);
                state.readers = state.readers.saturating_sub(1);
                if state.readers == 0 {
                    self.cond.notify_all();
                }
            }
            LockMode::Exclusive => {
                debug_assert!(state.writer, "{}: exclusive unlock without holder", self.name);
                state.writer = false;
                self.cond.notify_all();
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        let state = lock(&self.state);
        state.writer || state.readers > 0
    }

    pub fn is_exclusive(&self) -> bool {
        lock(&self.state).writer
    }
}
