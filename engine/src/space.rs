// Log space manager
// Grant accounting with strictly FIFO admission of transactions waiting for space

use crate::sync::interrupt::INTERRUPT_POLL;
use crate::sync::{lock, wait, wait_timeout, Interrupt};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use xfstx_core::{XfsError, XfsResult};

#[derive(Debug, Default)]
struct SpaceState {
    /// Bytes promised to running transactions
    reserved: u64,
    /// Bytes of log between tail and head
    used: u64,
    /// Tickets of sleeping reservers, oldest first
    queue: VecDeque<u64>,
    next_ticket: u64,
    shutdown: bool,
    stats: SpaceStats,
}

/// Log space statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct SpaceStats {
    pub grants: u64,
    /// Grants that had to sleep first
    pub waits: u64,
    pub interrupted: u64,
    pub max_queue: usize,
}

/// Log space pool.
///
/// `free = total - reserved - used`. A reservation that cannot be satisfied
/// takes a ticket and sleeps; only the oldest ticket may take space, so a
/// large request is never starved by a stream of small ones.
pub struct LogSpace {
    total: u64,
    state: Mutex<SpaceState>,
    cond: Condvar,
}

impl LogSpace {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            state: Mutex::new(SpaceState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn free_bytes(&self) -> u64 {
        let state = lock(&self.state);
        self.free(&state)
    }

    pub fn reserved_bytes(&self) -> u64 {
        lock(&self.state).reserved
    }

    pub fn used_bytes(&self) -> u64 {
        lock(&self.state).used
    }

    /// Number of reservers currently asleep
    pub fn waiters(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn stats(&self) -> SpaceStats {
        lock(&self.state).stats.clone()
    }

    fn free(&self, state: &SpaceState) -> u64 {
        self.total.saturating_sub(state.reserved + state.used)
    }

    /// Take `bytes` from the pool, sleeping in FIFO order while short.
    /// With an interrupt handle the sleep can be aborted.
    pub fn reserve(&self, bytes: u64, interrupt: Option<&Interrupt>) -> XfsResult<()> {
        if bytes > self.total {
            return Err(XfsError::ReservationTooLarge {
                class: "log space request".to_string(),
                needed: bytes,
                total: self.total,
            });
        }

        let mut state = lock(&self.state);
        if state.shutdown {
            return Err(XfsError::Shutdown);
        }
        if state.queue.is_empty() && self.free(&state) >= bytes {
            state.reserved += bytes;
            state.stats.grants += 1;
            return Ok(());
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);
        state.stats.waits += 1;
        state.stats.max_queue = state.stats.max_queue.max(state.queue.len());
        log::debug!(
            "Ticket {} waiting for {} bytes ({} free, {} queued)",
            ticket,
            bytes,
            self.free(&state),
            state.queue.len()
        );

        loop {
            if state.shutdown {
                state.queue.retain(|&t| t != ticket);
                self.cond.notify_all();
                return Err(XfsError::Shutdown);
            }
            if state.queue.front() == Some(&ticket) && self.free(&state) >= bytes {
                state.queue.pop_front();
                state.reserved += bytes;
                state.stats.grants += 1;
                // The next ticket may fit in what is left
                self.cond.notify_all();
                return Ok(());
            }
            if interrupt.is_some_and(|i| i.is_interrupted()) {
                state.queue.retain(|&t| t != ticket);
                state.stats.interrupted += 1;
                self.cond.notify_all();
                log::debug!("Ticket {} interrupted", ticket);
                return Err(XfsError::Interrupted);
            }
            state = match interrupt {
                Some(_) => wait_timeout(&self.cond, state, INTERRUPT_POLL),
                None => wait(&self.cond, state),
            };
        }
    }

    /// Return an unused reservation to the pool
    pub fn release(&self, bytes: u64) {
        let mut state = lock(&self.state);
        debug_assert!(state.reserved >= bytes, "released more than reserved");
        state.reserved = state.reserved.saturating_sub(bytes);
        self.cond.notify_all();
    }

    /// A commit wrote `written` bytes under a reservation of `reserved`:
    /// the written part now occupies the log, the rest goes back to the pool
    pub fn commit(&self, reserved: u64, written: u64) {
        let mut state = lock(&self.state);
        debug_assert!(written <= reserved, "commit wrote past its reservation");
        state.reserved = state.reserved.saturating_sub(reserved);
        state.used += written;
        self.cond.notify_all();
    }

    /// The tail moved forward over `bytes` of log
    pub fn release_used(&self, bytes: u64) {
        let mut state = lock(&self.state);
        debug_assert!(state.used >= bytes, "tail moved past the head");
        state.used = state.used.saturating_sub(bytes);
        self.cond.notify_all();
    }

    /// Fail every current and future waiter with `Shutdown`
    pub fn shutdown(&self) {
        lock(&self.state).shutdown = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn wait_for_waiters(space: &LogSpace, n: usize) {
        for _ in 0..400 {
            if space.waiters() == n {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("expected {} waiters, have {}", n, space.waiters());
    }

    #[test]
    fn test_reserve_and_release() {
        let space = LogSpace::new(1000);
        space.reserve(600, None).unwrap();
        assert_eq!(space.free_bytes(), 400);
        space.commit(600, 100);
        assert_eq!(space.free_bytes(), 900);
        space.release_used(100);
        assert_eq!(space.free_bytes(), 1000);
    }

    #[test]
    fn test_too_large_fails_immediately() {
        let space = LogSpace::new(1000);
        assert!(matches!(
            space.reserve(1001, None),
            Err(XfsError::ReservationTooLarge { needed: 1001, .. })
        ));
    }

    #[test]
    fn test_fifo_head_blocks_later_small_requests() {
        let space = Arc::new(LogSpace::new(1000));
        space.reserve(900, None).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let big = {
            let (space, order) = (Arc::clone(&space), Arc::clone(&order));
            thread::spawn(move || {
                space.reserve(500, None).unwrap();
                order.lock().unwrap().push("big");
            })
        };
        wait_for_waiters(&space, 1);

        // 100 bytes are free, but the small request queues behind the big one
        let small = {
            let (space, order) = (Arc::clone(&space), Arc::clone(&order));
            thread::spawn(move || {
                space.reserve(50, None).unwrap();
                order.lock().unwrap().push("small");
            })
        };
        wait_for_waiters(&space, 2);
        assert!(order.lock().unwrap().is_empty());

        space.release(900);
        big.join().unwrap();
        small.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["big", "small"]);
        assert_eq!(space.reserved_bytes(), 550);
    }

    #[test]
    fn test_release_wakes_exactly_one() {
        let space = Arc::new(LogSpace::new(1000));
        space.reserve(500, None).unwrap();
        space.reserve(500, None).unwrap();

        let granted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (space, granted) = (Arc::clone(&space), Arc::clone(&granted));
                thread::spawn(move || {
                    space.reserve(500, None).unwrap();
                    granted.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        wait_for_waiters(&space, 2);

        space.release(500);
        wait_for_waiters(&space, 1);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(granted.load(Ordering::SeqCst), 1);

        space.release(500);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(granted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_interrupt_removes_ticket() {
        let space = Arc::new(LogSpace::new(100));
        space.reserve(100, None).unwrap();
        let interrupt = Interrupt::new();

        let waiter = {
            let (space, interrupt) = (Arc::clone(&space), interrupt.clone());
            thread::spawn(move || space.reserve(10, Some(&interrupt)))
        };
        wait_for_waiters(&space, 1);
        interrupt.interrupt();
        assert!(matches!(waiter.join().unwrap(), Err(XfsError::Interrupted)));
        assert_eq!(space.waiters(), 0);
        assert_eq!(space.reserved_bytes(), 100);
        assert_eq!(space.stats().interrupted, 1);
    }

    #[test]
    fn test_shutdown_fails_waiters() {
        let space = Arc::new(LogSpace::new(100));
        space.reserve(100, None).unwrap();
        let waiter = {
            let space = Arc::clone(&space);
            thread::spawn(move || space.reserve(10, None))
        };
        wait_for_waiters(&space, 1);
        space.shutdown();
        assert!(matches!(waiter.join().unwrap(), Err(XfsError::Shutdown)));
        assert!(matches!(space.reserve(1, None), Err(XfsError::Shutdown)));
    }
}
