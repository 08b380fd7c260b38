//! Priority gate
//!
//! Arbitrates which of several competing tasks may use a scarce resource
//! (a decoder, a network budget, a GPU surface) at any given moment. Each
//! task registers an integer priority, then asks the gate whether it may
//! proceed; only the task(s) holding the current highest registered
//! priority are admitted. The gate enforces a priority floor, not mutual
//! exclusion: when several tasks tie at the maximum, all of them proceed.
//!
//! The gate is a classic monitor: one mutex guards the registered-priority
//! multiset and the cached maximum, and a condition variable wakes blocked
//! waiters whenever the maximum changes. Blocking waits re-check their
//! condition in a loop after every wake, since removal broadcasts to all
//! waiters rather than tracking waiter identity.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Gate state guarded by the monitor lock
struct GateState {
    /// Registered priorities as a multiset (priority -> live registration count).
    /// Duplicates are permitted; two tasks may hold the same priority.
    registered: BTreeMap<i32, usize>,

    /// Cached maximum of `registered`, `None` while no task is registered.
    /// Invariant: always equals the greatest key in `registered`.
    highest: Option<i32>,
}

/// Shared monitor: state plus the condition variable waiters block on
struct Shared {
    state: Mutex<GateState>,
    condvar: Condvar,
}

/// Priority-gated task coordinator.
///
/// Clones share the same underlying gate, so a gate can be handed to each
/// worker thread that contends for the resource it guards.
///
/// Callers are expected to pair every [`register`](Self::register) with
/// exactly one eventual [`unregister`](Self::unregister) of the same value;
/// a leaked registration permanently biases the maximum and can starve
/// lower-priority callers. [`register_scoped`](Self::register_scoped)
/// enforces the pairing through a drop guard.
#[derive(Clone)]
pub struct PriorityGate {
    shared: Arc<Shared>,
}

impl PriorityGate {
    /// Create an empty gate with no registered priorities
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(GateState {
                    registered: BTreeMap::new(),
                    highest: None,
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Register a task at the given priority.
    ///
    /// Always succeeds. The cached maximum is raised incrementally (no
    /// rescan on insertion). Waiters are deliberately not woken: the
    /// maximum can only grow here, so a waiter whose priority was below
    /// the maximum before is still below it now.
    pub fn register(&self, priority: i32) {
        let mut state = self.shared.state.lock().unwrap();
        *state.registered.entry(priority).or_insert(0) += 1;
        if state.highest.map_or(true, |h| priority > h) {
            state.highest = Some(priority);
        }
        trace!(
            "Registered priority {} (highest now {:?})",
            priority,
            state.highest
        );
    }

    /// Unregister one instance of the given priority.
    ///
    /// Removes a single multiset entry; unregistering a priority that is
    /// not registered is a silent no-op. If the maximum changed, every
    /// blocked waiter is woken so it can re-evaluate its own condition.
    pub fn unregister(&self, priority: i32) {
        let mut state = self.shared.state.lock().unwrap();
        let Some(count) = state.registered.get_mut(&priority) else {
            debug!("Unregister of absent priority {} ignored", priority);
            return;
        };
        *count -= 1;
        let emptied = *count == 0;
        if emptied {
            state.registered.remove(&priority);
        }

        // Recompute from what remains; the sorted multiset keeps its
        // greatest key at the back.
        let recomputed = state.registered.keys().next_back().copied();
        trace!(
            "Unregistered priority {} (highest now {:?})",
            priority,
            recomputed
        );
        if recomputed != state.highest {
            state.highest = recomputed;
            debug!("Highest priority changed, waking all waiters");
            self.shared.condvar.notify_all();
        }
    }

    /// Block until the given priority is the highest registered priority.
    ///
    /// Waits indefinitely; there is no timeout. The wait loop re-checks
    /// the condition after every wake because unregister broadcasts to
    /// all waiters, not just the one entitled to proceed. Use
    /// [`proceed_cancellable`](Self::proceed_cancellable) if the wait
    /// must be abandonable.
    pub fn proceed(&self, priority: i32) {
        let mut state = self.shared.state.lock().unwrap();
        while state.highest != Some(priority) {
            state = self.shared.condvar.wait(state).unwrap();
        }
    }

    /// Block like [`proceed`](Self::proceed), but abandon the wait with
    /// [`Error::Cancelled`] once `token` is cancelled.
    ///
    /// Cancellation affects only this wait: the lock is released and the
    /// registered priorities are left untouched. Unregistering remains the
    /// caller's responsibility.
    pub fn proceed_cancellable(&self, priority: i32, token: &CancelToken) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        loop {
            if token.cancelled.load(Ordering::SeqCst) {
                return Err(Error::Cancelled);
            }
            if state.highest == Some(priority) {
                return Ok(());
            }
            state = self.shared.condvar.wait(state).unwrap();
        }
    }

    /// Return immediately whether the given priority may proceed.
    ///
    /// True iff `priority` equals the current highest registered priority;
    /// always false while nothing is registered.
    pub fn proceed_non_blocking(&self, priority: i32) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.highest == Some(priority)
    }

    /// Succeed iff the given priority may proceed right now.
    ///
    /// On failure the [`Error::PriorityTooLow`] carries both the attempted
    /// priority and the current highest, so the caller can decide to retry,
    /// yield, or abort.
    pub fn proceed_or_fail(&self, priority: i32) -> Result<()> {
        let state = self.shared.state.lock().unwrap();
        if state.highest == Some(priority) {
            Ok(())
        } else {
            Err(Error::PriorityTooLow {
                attempted: priority,
                current: state.highest,
            })
        }
    }

    /// Register a task and return a guard that unregisters it on drop
    pub fn register_scoped(&self, priority: i32) -> Registration {
        self.register(priority);
        Registration {
            gate: self.clone(),
            priority,
        }
    }

    /// Create a cancellation token for use with
    /// [`proceed_cancellable`](Self::proceed_cancellable).
    ///
    /// The token holds a handle to this gate's monitor so that
    /// [`CancelToken::cancel`] can wake a waiter currently blocked in it.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            shared: Arc::clone(&self.shared),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current highest registered priority, `None` while the gate is empty
    /// (for diagnostics)
    pub fn highest_priority(&self) -> Option<i32> {
        self.shared.state.lock().unwrap().highest
    }

    /// Number of live registrations, counting duplicates (for diagnostics)
    pub fn registered_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap()
            .registered
            .values()
            .sum()
    }
}

impl Default for PriorityGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop guard for a single registration.
///
/// Created by [`PriorityGate::register_scoped`]; unregisters its priority
/// exactly once when dropped, keeping the register/unregister pairing
/// correct across early returns and panics.
pub struct Registration {
    gate: PriorityGate,
    priority: i32,
}

impl Registration {
    /// Priority this guard holds registered
    pub fn priority(&self) -> i32 {
        self.priority
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.gate.unregister(self.priority);
    }
}

/// Cancellation handle for a blocking wait.
///
/// Clones share the same cancelled flag, so one clone can be kept by the
/// waiting thread and another by whoever decides to abandon the wait.
#[derive(Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Cancel the wait. Idempotent; wakes every waiter on the gate so the
    /// cancelled one can observe the flag and bail out.
    pub fn cancel(&self) {
        {
            // Flip the flag under the gate lock so a waiter cannot slip
            // between its flag check and its wait while we signal.
            let _state = self.shared.state.lock().unwrap();
            self.cancelled.store(true, Ordering::SeqCst);
        }
        self.shared.condvar.notify_all();
    }

    /// Whether this token has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Recompute the maximum the slow way, straight from the multiset
    fn true_highest(gate: &PriorityGate) -> Option<i32> {
        gate.shared
            .state
            .lock()
            .unwrap()
            .registered
            .keys()
            .next_back()
            .copied()
    }

    #[test]
    fn test_cached_maximum_tracks_multiset() {
        let gate = PriorityGate::new();
        assert_eq!(gate.highest_priority(), None);

        let ops: &[(bool, i32)] = &[
            (true, 3),
            (true, 7),
            (true, 5),
            (true, 7),
            (false, 7),
            (false, 3),
            (true, -2),
            (false, 7),
            (false, 5),
            (false, -2),
        ];

        for &(is_register, priority) in ops {
            if is_register {
                gate.register(priority);
            } else {
                gate.unregister(priority);
            }
            assert_eq!(gate.highest_priority(), true_highest(&gate));
        }
        assert_eq!(gate.highest_priority(), None);
        assert_eq!(gate.registered_count(), 0);
    }

    #[test]
    fn test_non_blocking_admits_only_maximum() {
        let gate = PriorityGate::new();
        gate.register(5);
        gate.register(3);

        assert!(gate.proceed_non_blocking(5));
        assert!(!gate.proceed_non_blocking(3));

        gate.unregister(5);
        assert!(gate.proceed_non_blocking(3));
        assert!(!gate.proceed_non_blocking(5));
    }

    #[test]
    fn test_equal_priorities_all_admitted() {
        let gate = PriorityGate::new();
        gate.register(7);
        gate.register(7);

        assert!(gate.proceed_non_blocking(7));
        assert_eq!(gate.registered_count(), 2);

        // One instance removed, the other still holds the maximum.
        gate.unregister(7);
        assert!(gate.proceed_non_blocking(7));
        assert_eq!(gate.registered_count(), 1);

        gate.unregister(7);
        assert!(!gate.proceed_non_blocking(7));
    }

    #[test]
    fn test_unregister_absent_priority_is_noop() {
        let gate = PriorityGate::new();
        gate.register(4);

        gate.unregister(9);
        assert_eq!(gate.highest_priority(), Some(4));
        assert_eq!(gate.registered_count(), 1);

        // Double unregister is equally silent.
        gate.unregister(4);
        gate.unregister(4);
        assert_eq!(gate.highest_priority(), None);
    }

    #[test]
    fn test_empty_gate_admits_nothing() {
        let gate = PriorityGate::new();

        for p in [i32::MIN, -1, 0, 1, i32::MAX] {
            assert!(!gate.proceed_non_blocking(p));
            assert_eq!(
                gate.proceed_or_fail(p),
                Err(Error::PriorityTooLow {
                    attempted: p,
                    current: None,
                })
            );
        }
    }

    #[test]
    fn test_or_fail_matches_non_blocking() {
        let gate = PriorityGate::new();
        gate.register(10);
        gate.register(2);

        for p in [-1, 2, 5, 10, 11] {
            assert_eq!(gate.proceed_non_blocking(p), gate.proceed_or_fail(p).is_ok());
        }

        let err = gate.proceed_or_fail(2).unwrap_err();
        assert_eq!(
            err,
            Error::PriorityTooLow {
                attempted: 2,
                current: Some(10),
            }
        );
    }

    #[test]
    fn test_proceed_returns_immediately_at_maximum() {
        let gate = PriorityGate::new();
        gate.register(8);

        // Must not block: 8 is the maximum.
        gate.proceed(8);

        let token = gate.cancel_token();
        assert!(gate.proceed_cancellable(8, &token).is_ok());
    }

    #[test]
    fn test_cancelled_token_fails_fast() {
        let gate = PriorityGate::new();
        gate.register(8);

        let token = gate.cancel_token();
        token.cancel();
        assert!(token.is_cancelled());

        // Cancellation wins even when the condition already holds.
        assert_eq!(gate.proceed_cancellable(8, &token), Err(Error::Cancelled));

        // Cancelling leaves registrations untouched.
        assert_eq!(gate.highest_priority(), Some(8));
    }

    #[test]
    fn test_scoped_registration_unregisters_on_drop() {
        let gate = PriorityGate::new();
        {
            let reg = gate.register_scoped(6);
            assert_eq!(reg.priority(), 6);
            assert_eq!(gate.highest_priority(), Some(6));

            let inner = gate.register_scoped(9);
            assert_eq!(gate.highest_priority(), Some(9));
            drop(inner);
            assert_eq!(gate.highest_priority(), Some(6));
        }
        assert_eq!(gate.highest_priority(), None);
        assert_eq!(gate.registered_count(), 0);
    }
}
