//! Single-slot bidirectional rendezvous.
//!
//! A [`Pass`] synchronizes one *caller* with one *acceptor*: whoever
//! arrives first parks in the pass; the second arrival performs the
//! rendezvous and both sides complete. At most one waiter of either kind
//! exists at any time, and never both.
//!
//! ```text
//!  caller ──┐                       ┌── acceptor
//!           │   ┌───────────────┐   │
//!  value ───┼──▶│  waiting_call │   │
//!           │   │ waiting_accept│◀──┼── (suspends if no caller)
//!           │   └──────┬────────┘   │
//!           │          ▼            │
//!           └──── rendezvous ───────┘
//! ```
//!
//! The error parameter `E` plays the role of a throw channel from the
//! caller to the acceptor; with the default `E = Infallible` the pass is
//! the non-throwing variant and no error can even be constructed.
//!
//! ## Scheduler affinity
//!
//! The in-memory exchange happens on whichever thread arrives second,
//! under the pass mutex. Completions are never delivered from there:
//! each side records a [`Completion`] into its own pinned operation and
//! a *forwarder* job is submitted on that side's declared scheduler,
//! which performs the real `set_*` call. A stop request that loses the
//! race to a recorded completion is ignored — the recorded result wins.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use telaio::{Pass, sync_wait};
//!
//! let pass: Arc<Pass<u32>> = Arc::new(Pass::new());
//!
//! let acceptor = {
//!     let pass = pass.clone();
//!     std::thread::spawn(move || sync_wait(pass.async_accept()))
//! };
//!
//! // park the caller side until the acceptor shows up (or vice versa)
//! assert_eq!(sync_wait(pass.async_call(7)).value(), Some(()));
//! assert_eq!(acceptor.join().unwrap().value(), Some(7));
//! assert!(pass.is_idle());
//! ```

mod accept;
mod call;

pub use accept::{AcceptOp, AcceptSender};
pub use call::{CallOp, CallSender};

use std::convert::Infallible;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::completion::Completion;
use crate::sched::AnyScheduler;
use crate::stop::StopCallback;

/// A parked acceptor. `complete` records the rendezvous outcome into the
/// acceptor's pinned operation and hands back its forwarder; it runs
/// with the pass lock held.
struct AcceptWaiter<T, E> {
    op: NonNull<()>,
    complete: unsafe fn(NonNull<()>, Completion<T, E>) -> Forward,
}

/// A parked caller. `produce` moves the caller's payload out of its
/// pinned operation (running the deferred call body, which may yield the
/// throw-channel error); `resume` marks the caller complete and hands
/// back its forwarder. Both run with the pass lock held.
struct CallWaiter<T, E> {
    op: NonNull<()>,
    produce: unsafe fn(NonNull<()>) -> Result<T, E>,
    resume: unsafe fn(NonNull<()>) -> Forward,
}

struct Waiting<T, E> {
    call: Option<CallWaiter<T, E>>,
    accept: Option<AcceptWaiter<T, E>>,
}

// Safe: the pointers address pinned operations whose owners keep them
// alive while registered; payloads are Send.
unsafe impl<T: Send, E: Send> Send for Waiting<T, E> {}

/// A deferred completion delivery: run `run(op)` on `sched`.
///
/// Built under the pass lock, submitted strictly after it is released —
/// the forwarder tears down stop-callback guards, and doing that under
/// the lock could deadlock against a cancellation callback waiting for
/// it.
struct Forward {
    sched: AnyScheduler,
    run: unsafe fn(NonNull<()>),
    op: NonNull<()>,
}

impl Forward {
    fn submit(self) {
        let Forward { sched, run, op } = self;
        let op = RawOp(op);
        sched.submit(Box::new(move || unsafe { run(op.into_inner()) }));
    }
}

struct RawOp(NonNull<()>);

impl RawOp {
    // Calling this (rather than projecting `.0` directly) keeps closures
    // that capture a `RawOp` from using disjoint-field capture to grab the
    // inner `NonNull` instead of the `Send`-asserting wrapper.
    fn into_inner(self) -> NonNull<()> {
        self.0
    }
}

// Safe: the operation behind the pointer stays pinned and live until its
// forwarder has delivered the completion.
unsafe impl Send for RawOp {}

struct PassPtr<T, E>(NonNull<Pass<T, E>>);

impl<T, E> PassPtr<T, E> {
    // See `RawOp::into_inner`: avoids disjoint-field capture unwrapping
    // this back to a non-Send `NonNull` in the capturing closure.
    fn into_inner(self) -> NonNull<Pass<T, E>> {
        self.0
    }
}

// Safe: operations hold a borrow of the pass, so the pass outlives every
// registered cancellation callback.
unsafe impl<T: Send, E: Send> Send for PassPtr<T, E> {}

/// The per-operation state shared by both sides of the pass.
///
/// `claimed` and the registration slots are only ever touched with the
/// pass lock held; once an operation is claimed, the recorded completion
/// and receiver belong exclusively to its forwarder.
struct PassCore<C, R> {
    claimed: bool,
    completion: Option<C>,
    receiver: Option<R>,
    guard: Option<StopCallback>,
    sched: AnyScheduler,
}

/// A single-slot rendezvous between one caller and one acceptor.
///
/// `T` is the payload carried from caller to acceptor; `E` is the
/// optional throw channel (the acceptor's error type). The caller side
/// always completes with `set_value(())` once the exchange has happened,
/// including for [`async_throw`](Pass::async_throw).
///
/// | operation | behaviour |
/// |-----------|-----------|
/// | [`try_call`](Pass::try_call) | rendezvous now, or give the value back |
/// | [`try_call_with`](Pass::try_call_with) | rendezvous running the deferred body |
/// | [`try_throw`](Pass::try_throw) | deliver an error now, or give it back |
/// | [`try_accept`](Pass::try_accept) | take a parked caller's payload now |
/// | [`async_call`](Pass::async_call) | sender; parks until an acceptor arrives |
/// | [`async_call_with`](Pass::async_call_with) | sender; body runs at rendezvous |
/// | [`async_throw`](Pass::async_throw) | sender; parks, then throws to the acceptor |
/// | [`async_accept`](Pass::async_accept) | sender; parks until a caller arrives |
pub struct Pass<T, E = Infallible> {
    waiting: Mutex<Waiting<T, E>>,
}

impl<T, E> Default for Pass<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Pass<T, E> {
    pub fn new() -> Self {
        Self {
            waiting: Mutex::new(Waiting {
                call: None,
                accept: None,
            }),
        }
    }

    /// Neither side is parked.
    pub fn is_idle(&self) -> bool {
        let waiting = self.waiting.lock();
        waiting.call.is_none() && waiting.accept.is_none()
    }

    /// An acceptor is parked, waiting for a caller.
    pub fn is_expecting_call(&self) -> bool {
        self.waiting.lock().accept.is_some()
    }

    /// A caller is parked, waiting for an acceptor.
    pub fn is_expecting_accept(&self) -> bool {
        self.waiting.lock().call.is_some()
    }

    /// Delivers `value` to a parked acceptor. Returns the value back if
    /// no acceptor is waiting.
    pub fn try_call(&self, value: T) -> Result<(), T> {
        let forward;
        {
            let mut waiting = self.waiting.lock();
            debug_assert!(waiting.call.is_none(), "a caller is already parked");
            match waiting.accept.take() {
                Some(acceptor) => {
                    forward =
                        unsafe { (acceptor.complete)(acceptor.op, Completion::Value(value)) };
                }
                None => return Err(value),
            }
        }
        forward.submit();
        Ok(())
    }

    /// Like [`try_call`](Pass::try_call), but the payload is produced at
    /// rendezvous time by `body`; an `Err` is delivered to the acceptor's
    /// error channel. Returns false if no acceptor is waiting (and `body`
    /// is not run).
    pub fn try_call_with<F>(&self, body: F) -> bool
    where
        F: FnOnce() -> Result<T, E>,
    {
        let forward;
        {
            let mut waiting = self.waiting.lock();
            debug_assert!(waiting.call.is_none(), "a caller is already parked");
            match waiting.accept.take() {
                Some(acceptor) => {
                    let completion = Completion::from(body());
                    forward = unsafe { (acceptor.complete)(acceptor.op, completion) };
                }
                None => return false,
            }
        }
        forward.submit();
        true
    }

    /// Delivers `error` to a parked acceptor's error channel. Returns
    /// the error back if no acceptor is waiting.
    pub fn try_throw(&self, error: E) -> Result<(), E> {
        let forward;
        {
            let mut waiting = self.waiting.lock();
            debug_assert!(waiting.call.is_none(), "a caller is already parked");
            match waiting.accept.take() {
                Some(acceptor) => {
                    forward =
                        unsafe { (acceptor.complete)(acceptor.op, Completion::Error(error)) };
                }
                None => return Err(error),
            }
        }
        forward.submit();
        Ok(())
    }

    /// Takes a parked caller's payload. Returns `None` if no caller is
    /// waiting; `Some(Err(_))` if the caller threw.
    pub fn try_accept(&self) -> Option<Result<T, E>> {
        let payload;
        let forward;
        {
            let mut waiting = self.waiting.lock();
            debug_assert!(waiting.accept.is_none(), "an acceptor is already parked");
            let caller = waiting.call.take()?;
            payload = unsafe { (caller.produce)(caller.op) };
            forward = unsafe { (caller.resume)(caller.op) };
        }
        forward.submit();
        Some(payload)
    }

    /// A sender that parks until a caller arrives and completes with the
    /// caller's payload (or its thrown error).
    #[must_use = "senders do nothing unless connected and started"]
    pub fn async_accept(&self) -> AcceptSender<'_, T, E> {
        AcceptSender::new(self)
    }

    /// A sender that delivers `value` to the acceptor side, parking
    /// until one arrives. Completes with `set_value(())` once accepted.
    #[must_use = "senders do nothing unless connected and started"]
    pub fn async_call(
        &self,
        value: T,
    ) -> CallSender<'_, T, E, impl FnOnce() -> Result<T, E> + Send + 'static>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        CallSender::new(self, move || Ok(value))
    }

    /// Like [`async_call`](Pass::async_call), with the payload produced
    /// at rendezvous time by `body`.
    #[must_use = "senders do nothing unless connected and started"]
    pub fn async_call_with<F>(&self, body: F) -> CallSender<'_, T, E, F>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        CallSender::new(self, body)
    }

    /// A sender that delivers `error` to the acceptor side, parking
    /// until one arrives. The caller still completes with
    /// `set_value(())`.
    #[must_use = "senders do nothing unless connected and started"]
    pub fn async_throw(
        &self,
        error: E,
    ) -> CallSender<'_, T, E, impl FnOnce() -> Result<T, E> + Send + 'static>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        CallSender::new(self, move || Err(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::StopSource;
    use crate::sync_wait::{sync_wait, sync_wait_with};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// try ops on an idle pass hand their payload back
    #[test]
    fn test_try_on_idle() {
        let pass: Pass<i32, String> = Pass::new();
        assert!(pass.is_idle());
        assert_eq!(pass.try_call(1), Err(1));
        assert_eq!(pass.try_throw("e".to_string()), Err("e".to_string()));
        assert_eq!(pass.try_accept(), None);
        assert!(!pass.try_call_with(|| Ok(2)));
        assert!(pass.is_idle());
    }

    /// Rendezvous with the acceptor arriving first
    #[test]
    fn test_accept_then_call() {
        let pass: Arc<Pass<u32>> = Arc::new(Pass::new());
        let acceptor = {
            let pass = pass.clone();
            std::thread::spawn(move || sync_wait(pass.async_accept()))
        };

        while !pass.is_expecting_call() {
            std::thread::yield_now();
        }
        assert_eq!(pass.try_call(7), Ok(()));
        assert_eq!(acceptor.join().unwrap().value(), Some(7));
        assert!(pass.is_idle());
    }

    /// Rendezvous with the caller arriving first
    #[test]
    fn test_call_then_accept() {
        let pass: Arc<Pass<u32>> = Arc::new(Pass::new());
        let caller = {
            let pass = pass.clone();
            std::thread::spawn(move || sync_wait(pass.async_call(7)))
        };

        while !pass.is_expecting_accept() {
            std::thread::yield_now();
        }
        assert_eq!(pass.try_accept(), Some(Ok(7)));
        assert_eq!(caller.join().unwrap().value(), Some(()));
        assert!(pass.is_idle());
    }

    /// Both sides async, either interleaving, same outcome
    #[test]
    fn test_async_both_sides() {
        for accept_first in [true, false] {
            let pass: Arc<Pass<u32>> = Arc::new(Pass::new());
            let (first, second): (
                std::thread::JoinHandle<Option<u32>>,
                std::thread::JoinHandle<Option<u32>>,
            ) = if accept_first {
                let a = {
                    let pass = pass.clone();
                    std::thread::spawn(move || sync_wait(pass.async_accept()).value())
                };
                while !pass.is_expecting_call() {
                    std::thread::yield_now();
                }
                let b = {
                    let pass = pass.clone();
                    std::thread::spawn(move || {
                        sync_wait(pass.async_call(9)).value().map(|()| 0)
                    })
                };
                (a, b)
            } else {
                let b = {
                    let pass = pass.clone();
                    std::thread::spawn(move || {
                        sync_wait(pass.async_call(9)).value().map(|()| 0)
                    })
                };
                while !pass.is_expecting_accept() {
                    std::thread::yield_now();
                }
                let a = {
                    let pass = pass.clone();
                    std::thread::spawn(move || sync_wait(pass.async_accept()).value())
                };
                (b, a)
            };

            let (x, y) = (first.join().unwrap(), second.join().unwrap());
            // one side observed the payload, the other observed ()↦0
            assert!(
                (x == Some(9) && y == Some(0)) || (x == Some(0) && y == Some(9)),
                "unexpected rendezvous outcome: {x:?} {y:?}"
            );
            assert!(pass.is_idle());
        }
    }

    /// async_throw delivers the error to the acceptor, value to the caller
    #[test]
    fn test_throw_reaches_acceptor() {
        let pass: Arc<Pass<u32, String>> = Arc::new(Pass::new());
        let thrower = {
            let pass = pass.clone();
            std::thread::spawn(move || sync_wait(pass.async_throw("boom".to_string())))
        };

        while !pass.is_expecting_accept() {
            std::thread::yield_now();
        }
        let accepted = sync_wait(pass.async_accept());
        assert_eq!(accepted.error().as_deref(), Some("boom"));
        assert_eq!(thrower.join().unwrap().value(), Some(()));
    }

    /// An error produced inside the deferred call body reaches the acceptor
    #[test]
    fn test_throw_during_call() {
        let pass: Arc<Pass<u32, String>> = Arc::new(Pass::new());
        let caller = {
            let pass = pass.clone();
            std::thread::spawn(move || {
                sync_wait(pass.async_call_with(|| Err("mid-call".to_string())))
            })
        };

        while !pass.is_expecting_accept() {
            std::thread::yield_now();
        }
        assert_eq!(pass.try_accept(), Some(Err("mid-call".to_string())));
        assert_eq!(caller.join().unwrap().value(), Some(()));
    }

    /// Sync accept picks up an async throw
    #[test]
    fn test_sync_accept_async_throw() {
        let pass: Arc<Pass<u32, String>> = Arc::new(Pass::new());
        let thrower = {
            let pass = pass.clone();
            std::thread::spawn(move || sync_wait(pass.async_throw("late".to_string())))
        };
        while !pass.is_expecting_accept() {
            std::thread::yield_now();
        }
        assert_eq!(pass.try_accept(), Some(Err("late".to_string())));
        assert_eq!(thrower.join().unwrap().value(), Some(()));
    }

    /// Cancelling a parked acceptor completes it with done and clears the slot
    #[test]
    fn test_cancel_parked_acceptor() {
        let pass: Arc<Pass<u32>> = Arc::new(Pass::new());
        let source = StopSource::new();

        let acceptor = {
            let pass = pass.clone();
            let token = source.token();
            std::thread::spawn(move || sync_wait_with(pass.async_accept(), token))
        };

        while !pass.is_expecting_call() {
            std::thread::yield_now();
        }
        source.request_stop();
        assert!(acceptor.join().unwrap().is_done());
        // no waiter left behind
        assert_eq!(pass.try_call(1), Err(1));
        assert!(pass.is_idle());
    }

    /// Cancelling a parked caller completes it with done and clears the slot
    #[test]
    fn test_cancel_parked_caller() {
        let pass: Arc<Pass<u32>> = Arc::new(Pass::new());
        let source = StopSource::new();

        let caller = {
            let pass = pass.clone();
            let token = source.token();
            std::thread::spawn(move || sync_wait_with(pass.async_call(3), token))
        };

        while !pass.is_expecting_accept() {
            std::thread::yield_now();
        }
        source.request_stop();
        assert!(caller.join().unwrap().is_done());
        assert_eq!(pass.try_accept(), None);
        assert!(pass.is_idle());
    }

    /// A stop requested before start completes the operation with done
    /// without ever parking
    #[test]
    fn test_prior_stop_never_parks() {
        let pass: Pass<u32> = Pass::new();
        let source = StopSource::new();
        source.request_stop();
        let out = sync_wait_with(pass.async_accept(), source.token());
        assert!(out.is_done());
        assert!(pass.is_idle());
    }

    /// A recorded completion beats a late stop request
    #[test]
    fn test_recorded_completion_wins_over_stop() {
        let pass: Arc<Pass<u32>> = Arc::new(Pass::new());
        let source = StopSource::new();

        let acceptor = {
            let pass = pass.clone();
            let token = source.token();
            std::thread::spawn(move || sync_wait_with(pass.async_accept(), token))
        };
        while !pass.is_expecting_call() {
            std::thread::yield_now();
        }
        // rendezvous first, then stop: the value must still arrive
        assert_eq!(pass.try_call(11), Ok(()));
        source.request_stop();
        assert_eq!(acceptor.join().unwrap().value(), Some(11));
    }

    /// Completions are delivered on the receiver's declared scheduler
    #[test]
    fn test_scheduler_affine_delivery() {
        use crate::receiver::Receiver;
        use crate::sched::SingleThreadContext;
        use crate::sender::{OperationState, Sender};
        use parking_lot::{Condvar, Mutex};

        struct AffineReceiver {
            sched: AnyScheduler,
            state: Arc<(Mutex<Option<std::thread::ThreadId>>, Condvar)>,
        }

        impl Receiver for AffineReceiver {
            type Value = u32;
            type Error = std::convert::Infallible;

            fn set_value(self, _: u32) {
                *self.state.0.lock() = Some(std::thread::current().id());
                self.state.1.notify_all();
            }
            fn set_error(self, error: Self::Error) {
                match error {}
            }
            fn set_done(self) {
                unreachable!("rendezvous completed with done");
            }
            fn scheduler(&self) -> AnyScheduler {
                self.sched.clone()
            }
        }

        let ctx = SingleThreadContext::new();
        let pass: Pass<u32> = Pass::new();
        let state = Arc::new((Mutex::new(None), Condvar::new()));

        let receiver = AffineReceiver {
            sched: ctx.scheduler(),
            state: state.clone(),
        };
        let mut op = std::pin::pin!(pass.async_accept().connect(receiver));
        op.as_mut().start();

        // rendezvous on this thread; delivery must hop to the context
        assert_eq!(pass.try_call(5), Ok(()));

        let mut delivered = state.0.lock();
        while delivered.is_none() {
            state.1.wait(&mut delivered);
        }
        assert_eq!(delivered.take(), Some(ctx.thread_id()));
    }

    /// Payload parked with a cancelled caller is dropped with the operation
    #[test]
    fn test_cancelled_caller_drops_payload() {
        use std::sync::atomic::AtomicUsize;

        struct Payload(Arc<AtomicUsize>);
        impl Drop for Payload {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let pass: Arc<Pass<Payload>> = Arc::new(Pass::new());
        let source = StopSource::new();

        let caller = {
            let pass = pass.clone();
            let token = source.token();
            let payload = Payload(drops.clone());
            std::thread::spawn(move || sync_wait_with(pass.async_call(payload), token))
        };
        while !pass.is_expecting_accept() {
            std::thread::yield_now();
        }
        source.request_stop();
        assert!(caller.join().unwrap().is_done());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    /// Exercise many rendezvous from both directions concurrently
    #[test]
    fn test_rendezvous_stress() {
        let pass: Arc<Pass<usize>> = Arc::new(Pass::new());
        const ROUNDS: usize = 200;

        let caller = {
            let pass = pass.clone();
            std::thread::spawn(move || {
                for i in 0..ROUNDS {
                    assert!(sync_wait(pass.async_call(i)).value().is_some());
                }
            })
        };

        let mut sum = 0;
        for _ in 0..ROUNDS {
            sum += sync_wait(pass.async_accept()).value().unwrap();
        }
        caller.join().unwrap();
        assert_eq!(sum, ROUNDS * (ROUNDS - 1) / 2);
        assert!(pass.is_idle());
    }

    /// The pass reports which side it is expecting
    #[test]
    fn test_expecting_queries() {
        let pass: Arc<Pass<u32>> = Arc::new(Pass::new());
        assert!(!pass.is_expecting_call());
        assert!(!pass.is_expecting_accept());

        let done = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let pass = pass.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let out = sync_wait(pass.async_accept());
                done.store(true, Ordering::SeqCst);
                out
            })
        };
        while !pass.is_expecting_call() {
            std::thread::yield_now();
        }
        assert!(!done.load(Ordering::SeqCst));
        assert_eq!(pass.try_call(1), Ok(()));
        assert_eq!(acceptor.join().unwrap().value(), Some(1));
    }
}
