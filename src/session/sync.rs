//! Locking primitives shared by the breakpoint coordinator and the run-state
//! tracker.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Default)]
struct Tickets {
    next: u64,
    serving: u64,
}

/// FIFO lock: waiters are served in arrival order and sleep on a condition
/// variable while they wait.
#[derive(Debug, Default)]
pub struct TicketLock {
    tickets: Mutex<Tickets>,
    turn: Condvar,
}

impl TicketLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn tickets(&self) -> MutexGuard<'_, Tickets> {
        self.tickets.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn lock(&self) -> TicketGuard<'_> {
        let mut tickets = self.tickets();
        let mine = tickets.next;
        tickets.next += 1;
        while tickets.serving != mine {
            tickets = self.turn.wait(tickets).unwrap_or_else(|p| p.into_inner());
        }
        TicketGuard { lock: self }
    }

    /// Take the lock only if nobody holds it or waits for it.
    pub fn try_lock(&self) -> Option<TicketGuard<'_>> {
        let mut tickets = self.tickets();
        if tickets.next == tickets.serving {
            tickets.next += 1;
            Some(TicketGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        let tickets = self.tickets();
        tickets.next != tickets.serving
    }
}

pub struct TicketGuard<'a> {
    lock: &'a TicketLock,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        let mut tickets = self.lock.tickets();
        tickets.serving += 1;
        drop(tickets);
        self.lock.turn.notify_all();
    }
}

/// State of the break-all / conditional-breakpoint gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GateState {
    Idle = 0,
    BreakAllPending = 1,
    CondBpPending = 2,
}

impl GateState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => GateState::BreakAllPending,
            2 => GateState::CondBpPending,
            _ => GateState::Idle,
        }
    }
}

/// Single token arbitrating between a user break-all and breakpoint-hit
/// processing that wants to resume the inferior.
#[derive(Debug, Default)]
pub struct BreakGate {
    state: AtomicU8,
}

const SPIN_YIELDS: u32 = 16;
const MAX_BACKOFF: Duration = Duration::from_millis(10);

impl BreakGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> GateState {
        GateState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Move Idle -> `to` if the gate is free.
    pub fn try_acquire(&self, to: GateState) -> Option<GateGuard<'_>> {
        self.state
            .compare_exchange(
                GateState::Idle as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .ok()
            .map(|_| GateGuard { gate: self, held: to })
    }

    /// Spin for the gate, yielding first and then sleeping with a capped
    /// exponential backoff.
    pub fn acquire(&self, to: GateState) -> GateGuard<'_> {
        let mut attempts = 0u32;
        let mut backoff = Duration::from_millis(1);
        loop {
            if let Some(guard) = self.try_acquire(to) {
                return guard;
            }
            attempts += 1;
            if attempts < SPIN_YIELDS {
                thread::yield_now();
            } else {
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    fn release(&self, from: GateState) {
        if self
            .state
            .compare_exchange(from as u8, GateState::Idle as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Break gate released from {:?} but was {:?}", from, self.current());
        }
    }
}

pub struct GateGuard<'a> {
    gate: &'a BreakGate,
    held: GateState,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.release(self.held);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ticket_lock_serves_in_order() {
        let lock = Arc::new(TicketLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let held = lock.lock();

        let mut handles = Vec::new();
        for i in 0..4 {
            let waiter = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let _g = waiter.lock();
                order.lock().unwrap().push(i);
            }));
            // Let each waiter take its ticket before the next one starts
            while lock.tickets().next != i + 2 {
                thread::yield_now();
            }
        }
        drop(held);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = TicketLock::new();
        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!lock.is_locked());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_gate_excludes_other_holder() {
        let gate = BreakGate::new();
        let break_all = gate.try_acquire(GateState::BreakAllPending).unwrap();
        assert!(gate.try_acquire(GateState::CondBpPending).is_none());
        assert_eq!(gate.current(), GateState::BreakAllPending);
        drop(break_all);
        assert_eq!(gate.current(), GateState::Idle);
        let _cond = gate.acquire(GateState::CondBpPending);
        assert_eq!(gate.current(), GateState::CondBpPending);
    }

    #[test]
    fn test_gate_acquire_waits_for_release() {
        let gate = Arc::new(BreakGate::new());
        let held = gate.try_acquire(GateState::CondBpPending).unwrap();
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _g = gate.acquire(GateState::BreakAllPending);
                gate.current()
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().unwrap(), GateState::BreakAllPending);
    }
}
