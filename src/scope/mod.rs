//! Structured lifetime anchor for asynchronous work.
//!
//! A [`Scope`] tracks every operation admitted into it and offers a
//! single join point: [`Scope::join`] completes exactly when the scope
//! has been closed and its use count has drained to zero.
//!
//! ## Accounting
//!
//! All accounting is expressed as ownership of [`ScopeRef`]s: a nest
//! sender holding its unconsumed reservation, a running nested
//! operation, an eagerly spawned operation, a live future handle — each
//! owns one, and dropping it is what records the work as done. The
//! "every admitted operation is recorded exactly once" invariant is
//! therefore carried by the borrow checker, not by convention.
//!
//! ## State encoding
//!
//! One atomic word: the low bit is set while the scope is open, the
//! remaining bits count outstanding reservations in steps of two. A
//! closed, drained scope reads exactly zero.
//!
//! ## Example
//!
//! ```
//! use telaio::{Scope, SenderExt, just, sync_wait};
//!
//! let scope = Scope::new();
//!
//! // eager work, observed through a future
//! let doubled = scope.spawn_future(just(21).then(|v| v * 2));
//!
//! // lazy work, tracked from the moment it is nested
//! let tracked = scope.nest(just("tracked"));
//! assert!(scope.use_count() >= 2);
//!
//! assert_eq!(sync_wait(doubled).value(), Some(42));
//! assert_eq!(sync_wait(tracked).value(), Some("tracked"));
//!
//! // join closes the scope and waits for the drain
//! assert_eq!(sync_wait(scope.join()).value(), Some(()));
//! assert!(scope.is_closed());
//!
//! // nothing is admitted afterwards
//! assert!(sync_wait(scope.nest(just(1))).is_done());
//! ```

mod join;
mod nest;

pub use join::{Join, JoinOp};
pub use nest::{Nest, NestOp};

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::event::Event;
use crate::sender::Sender;
use crate::stop::{StopSource, StopToken};

const OPEN_BIT: usize = 1;
const ONE_OP: usize = 2;

pub(crate) struct ScopeState {
    /// Low bit: open. Remaining bits: outstanding reservations.
    op_state: CachePadded<AtomicUsize>,
    /// Set when the scope is closed and drained.
    evt: Event,
    /// Stop source observed by every operation nested in the scope.
    pub(crate) stop: StopSource,
}

impl ScopeState {
    fn new() -> Self {
        Self {
            op_state: CachePadded::new(AtomicUsize::new(OPEN_BIT)),
            evt: Event::new(),
            stop: StopSource::new(),
        }
    }

    pub(crate) fn event(&self) -> &Event {
        &self.evt
    }

    /// Acquire-load of the packed state; pairs with the release
    /// decrements in `record_done` so a reader that has seen the drain
    /// also sees every finished operation's writes.
    pub(crate) fn synchronize(&self) -> usize {
        self.op_state.load(Ordering::Acquire)
    }

    /// Tries to reserve a slot for one unit of work. Fails iff the scope
    /// has been closed.
    pub(crate) fn try_record_start(this: &Arc<Self>) -> Option<ScopeRef> {
        let mut state = this.op_state.load(Ordering::Relaxed);
        loop {
            if state & OPEN_BIT == 0 {
                return None;
            }
            debug_assert!(state.checked_add(ONE_OP).is_some());
            match this.op_state.compare_exchange_weak(
                state,
                state + ONE_OP,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(ScopeRef {
                        scope: this.clone(),
                    });
                }
                Err(observed) => state = observed,
            }
        }
    }

    fn record_done(&self) {
        let old = self.op_state.fetch_sub(ONE_OP, Ordering::Release);
        debug_assert!(old >= ONE_OP);
        if old & OPEN_BIT == 0 && old >> 1 == 1 {
            // closed, and we were the last outstanding reservation
            self.evt.set();
        }
    }

    /// Marks the scope so no further work is admitted. Idempotent.
    pub(crate) fn close(&self) {
        let old = self.op_state.fetch_and(!OPEN_BIT, Ordering::Release);
        if old >> 1 == 0 {
            // nothing outstanding to wait for
            self.evt.set();
        }
    }
}

/// An RAII reservation of one unit of work inside a scope.
///
/// Dropping it records the work as done; the drop that empties a closed
/// scope fires the join event.
pub(crate) struct ScopeRef {
    pub(crate) scope: Arc<ScopeState>,
}

impl Drop for ScopeRef {
    fn drop(&mut self) {
        self.scope.record_done();
    }
}

/// A reference-counted lifetime anchor for asynchronous operations.
///
/// Work enters a scope through [`nest`](Scope::nest) (lazy),
/// [`spawn_future`](Scope::spawn_future) (eager, observable) or
/// [`spawn_detached`](Scope::spawn_detached) (eager, fire-and-forget).
/// [`join`](Scope::join) closes the scope and completes once everything
/// admitted has finished.
///
/// Dropping the last `Scope` handle closes the scope and requests stop,
/// so abandoned scopes cancel their children rather than leak them;
/// operations already admitted keep the shared state alive until they
/// finish.
pub struct Scope {
    pub(crate) state: Arc<ScopeState>,
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ScopeState::new()),
        }
    }

    /// Wraps `sender` so that running it is tracked by this scope.
    ///
    /// Admission is decided here: if the scope is open, the returned
    /// sender holds a reservation (keeping `join` pending even while the
    /// sender sits unconsumed) and releases it when the wrapped
    /// operation completes or the sender is dropped. If the scope is
    /// already closed, the returned sender completes with done on start.
    ///
    /// Nesting itself starts nothing.
    pub fn nest<S>(&self, sender: S) -> Nest<S>
    where
        S: Sender,
    {
        Nest::new(sender, &self.state)
    }

    /// A sender that closes the scope on start and completes with
    /// `set_value(())` once the use count drains to zero.
    ///
    /// Join is idempotent: every started join operation — including
    /// clones started concurrently — completes when the scope drains.
    #[must_use = "senders do nothing unless connected and started"]
    pub fn join(&self) -> Join {
        Join::new(self.state.clone())
    }

    /// Closes the scope without cancelling: future admissions are
    /// rejected, work in flight keeps running. Idempotent.
    pub fn close(&self) {
        self.state.close();
    }

    /// Closes the scope and requests stop on its internal source,
    /// cancelling work in flight. Idempotent.
    pub fn request_stop(&self) {
        self.state.close();
        self.state.stop.request_stop();
    }

    /// A token observing the scope's internal stop source. Every
    /// operation nested in the scope observes this token combined with
    /// its own receiver's.
    pub fn stop_token(&self) -> StopToken {
        self.state.stop.token()
    }

    /// Number of outstanding reservations.
    pub fn use_count(&self) -> usize {
        self.state.synchronize() >> 1
    }

    /// Whether the scope has stopped admitting work.
    pub fn is_closed(&self) -> bool {
        self.state.synchronize() & OPEN_BIT == 0
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.state.close();
        self.state.stop.request_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{SenderExt, just, never};
    use crate::completion::Completion;
    use crate::sync_wait::sync_wait;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicBool;

    /// Joining an untouched scope completes immediately
    #[test]
    fn test_join_empty_scope() {
        let scope = Scope::new();
        assert_eq!(scope.use_count(), 0);
        assert!(!scope.is_closed());
        assert_eq!(sync_wait(scope.join()).value(), Some(()));
        assert!(scope.is_closed());
    }

    /// A nested sender behaves like the sender it wraps
    #[test]
    fn test_nest_transparent() {
        let scope = Scope::new();
        let out = sync_wait(scope.nest(just(5).then(|v| v + 1)));
        assert_eq!(out.value(), Some(6));
        assert_eq!(sync_wait(scope.join()).value(), Some(()));
        assert_eq!(scope.use_count(), 0);
    }

    /// Nesting reserves a slot even before the sender runs
    #[test]
    fn test_nest_reserves() {
        let scope = Scope::new();
        let nested = scope.nest(just(1));
        assert_eq!(scope.use_count(), 1);
        drop(nested);
        assert_eq!(scope.use_count(), 0);
    }

    /// A sender nested after close completes with done, not value
    #[test]
    fn test_nest_after_close_is_done() {
        let scope = Scope::new();
        assert_eq!(sync_wait(scope.join()).value(), Some(()));

        let rejected = scope.nest(just(1));
        assert_eq!(scope.use_count(), 0);
        assert!(sync_wait(rejected).is_done());
    }

    /// Double join is idempotent; both edges complete
    #[test]
    fn test_double_join() {
        let scope = Scope::new();
        assert_eq!(sync_wait(scope.join()).value(), Some(()));
        assert_eq!(sync_wait(scope.join()).value(), Some(()));
    }

    /// Join only completes once in-flight work drains
    #[test]
    fn test_join_waits_for_inflight() {
        let scope = Scope::new();
        let nested = scope.nest(never::<(), Infallible>());

        let joined = Arc::new(AtomicBool::new(false));
        let waiter = {
            let join = scope.join();
            let joined = joined.clone();
            std::thread::spawn(move || {
                let out = sync_wait(join);
                joined.store(true, Ordering::SeqCst);
                out
            })
        };

        // the nested sender still holds its reservation
        while !scope.is_closed() {
            std::hint::spin_loop();
        }
        assert!(!joined.load(Ordering::SeqCst));

        // releasing the reservation drains the scope
        drop(nested);
        assert!(matches!(waiter.join().unwrap(), Completion::Value(())));
        assert!(joined.load(Ordering::SeqCst));
    }

    /// Cancelling the scope cancels nested work through the combined token
    #[test]
    fn test_request_stop_cancels_nested() {
        let scope = Scope::new();
        let nested = scope.nest(never::<i32, Infallible>());

        let waiter = std::thread::spawn(move || sync_wait(nested));
        // close+stop: the nested never-sender observes the scope token
        scope.request_stop();
        assert!(waiter.join().unwrap().is_done());
        assert_eq!(sync_wait(scope.join()).value(), Some(()));
    }

    /// request_stop on an already-stopped scope is a no-op
    #[test]
    fn test_request_stop_idempotent() {
        let scope = Scope::new();
        scope.request_stop();
        scope.request_stop();
        assert!(scope.is_closed());
        assert_eq!(sync_wait(scope.join()).value(), Some(()));
    }

    /// Many threads nesting and running work concurrently all drain
    #[test]
    fn test_concurrent_nest_stress() {
        let scope = Arc::new(Scope::new());
        const THREADS: usize = 4;
        const ROUNDS: usize = 100;

        let workers: Vec<_> = (0..THREADS)
            .map(|t| {
                let scope = scope.clone();
                std::thread::spawn(move || {
                    let mut sum = 0;
                    for i in 0..ROUNDS {
                        sum += sync_wait(scope.nest(just(t * ROUNDS + i)))
                            .value()
                            .unwrap_or(0);
                    }
                    sum
                })
            })
            .collect();

        let total: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        let n = THREADS * ROUNDS;
        assert_eq!(total, n * (n - 1) / 2);
        assert_eq!(sync_wait(scope.join()).value(), Some(()));
        assert_eq!(scope.use_count(), 0);
    }

    /// Cloned nest senders each hold their own reservation
    #[test]
    fn test_nest_clone_reattaches() {
        let scope = Scope::new();
        let a = scope.nest(just(7));
        let b = a.clone();
        assert_eq!(scope.use_count(), 2);
        assert_eq!(sync_wait(a).value(), Some(7));
        assert_eq!(sync_wait(b).value(), Some(7));
        assert_eq!(scope.use_count(), 0);

        // clones made after close are rejected
        scope.close();
        let c = scope.nest(just(7));
        assert!(sync_wait(c).is_done());
    }
}
