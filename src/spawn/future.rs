use std::cell::UnsafeCell;
use std::marker::PhantomPinned;
use std::mem::ManuallyDrop;
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{SpawnHeader, state};
use crate::blocking::Blocking;
use crate::event::Waiter;
use crate::receiver::Receiver;
use crate::scope::ScopeRef;
use crate::sender::{OperationState, Sender};

/// Sender-shaped handle to an eagerly started operation.
///
/// The future models a sender with the spawned sender's completion
/// signature plus done: connect and start it to subscribe to the
/// operation's one-shot event, upon which the recorded completion is
/// forwarded to the receiver.
///
/// Dropping the future without running it requests stop on the spawned
/// operation and discards its eventual result. Cancelling a running
/// future (through its receiver's stop token) also requests stop, and
/// completes the future with done without waiting for the operation to
/// wind down.
#[must_use = "dropping a spawned future abandons the spawned operation"]
pub struct SpawnedFuture<V, E> {
    header: Option<NonNull<SpawnHeader<V, E>>>,
    /// The future's own scope reservation: the scope also waits for the
    /// handle itself to be consumed or dropped.
    slot: Option<ScopeRef>,
}

// Safe: the header is shared, refcounted state; the payload types cross
// threads when the result is forwarded.
unsafe impl<V: Send, E: Send> Send for SpawnedFuture<V, E> {}

impl<V, E> SpawnedFuture<V, E> {
    pub(super) fn new(header: NonNull<SpawnHeader<V, E>>, slot: Option<ScopeRef>) -> Self {
        Self {
            header: Some(header),
            slot,
        }
    }
}

impl<V, E> Drop for SpawnedFuture<V, E> {
    fn drop(&mut self) {
        if let Some(header) = self.header.take() {
            // request stop and hand the result slot back to the operation
            unsafe { header.as_ref() }.drop_handle();
        }
    }
}

impl<V, E> Sender for SpawnedFuture<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    type Value = V;
    type Error = E;

    const SENDS_DONE: bool = true;

    type Operation<R>
        = FutureOp<V, E, R>
    where
        R: Receiver<Value = V, Error = E>;

    fn connect<R>(mut self, receiver: R) -> FutureOp<V, E, R>
    where
        R: Receiver<Value = V, Error = E>,
    {
        FutureOp {
            core: UnsafeCell::new(FutureCore {
                header: self.header.take(),
                slot: self.slot.take(),
                receiver: Some(receiver),
                guard: None,
            }),
            waiter: UnsafeCell::new(Waiter::empty()),
            started: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            _pin: PhantomPinned,
        }
    }

    fn blocking(&self) -> Blocking {
        Blocking::Maybe
    }
}

struct FutureCore<V, E, R> {
    header: Option<NonNull<SpawnHeader<V, E>>>,
    slot: Option<ScopeRef>,
    receiver: Option<R>,
    guard: Option<crate::stop::StopCallback>,
}

/// Operation produced by connecting a [`SpawnedFuture`].
pub struct FutureOp<V, E, R> {
    /// Exclusively owned by the starting thread until the waiter is
    /// enqueued, then by whichever thread resumes it.
    core: UnsafeCell<FutureCore<V, E, R>>,
    waiter: UnsafeCell<Waiter>,
    started: AtomicBool,
    completed: AtomicBool,
    _pin: PhantomPinned,
}

// Safe: moved between threads only before start; afterwards pinned, with
// cell access handed over through the event's ordering.
unsafe impl<V: Send, E: Send, R: Send> Send for FutureOp<V, E, R> {}

struct HeaderPtr<V, E>(NonNull<SpawnHeader<V, E>>);

impl<V, E> HeaderPtr<V, E> {
    // Calling this (rather than projecting `.0` directly) keeps closures
    // that capture a `HeaderPtr` from using disjoint-field capture to grab
    // the inner `NonNull` instead of the `Send`-asserting wrapper.
    fn into_inner(self) -> NonNull<SpawnHeader<V, E>> {
        self.0
    }
}

// Safe: the stop-callback guard is dropped before the future releases
// its reference, so the pointer outlives every possible invocation.
unsafe impl<V: Send, E: Send> Send for HeaderPtr<V, E> {}

// Safety: after enqueueing its waiter the operation does not touch
// itself; the resume path drains the core exactly once and stops
// touching the op before completing its receiver.
unsafe impl<V, E, R> OperationState for FutureOp<V, E, R>
where
    V: Send + 'static,
    E: Send + 'static,
    R: Receiver<Value = V, Error = E>,
{
    fn start(self: Pin<&mut Self>) {
        // Safety: pinned from here on; the enqueued waiter records this
        // address.
        let this = unsafe { self.get_unchecked_mut() };
        if this.started.swap(true, Ordering::Relaxed) {
            debug_assert!(false, "operation started twice");
            return;
        }

        let data: *mut Self = this;
        let core = this.core.get();

        let Some(header) = (unsafe { (*core).header }) else {
            debug_assert!(false, "spawned future connected twice");
            return;
        };

        // a stop request on the receiver abandons the spawned operation;
        // registration may fire inline if stop was already requested, in
        // which case the event below is already set
        let token = unsafe { (*core).receiver.as_ref() }.map(|r| r.stop_token());
        if let Some(token) = token {
            let target = HeaderPtr(header);
            let guard = token.register(move || {
                unsafe { target.into_inner().as_ref() }.abandon();
            });
            unsafe { (*core).guard = Some(guard) };
        }

        unsafe {
            *this.waiter.get() = Waiter::new(Self::resume, data.cast());
            let node = NonNull::new_unchecked(this.waiter.get());
            if !header.as_ref().evt.try_enqueue(node) {
                // result already recorded; forward it inline
                Self::resume(data.cast());
            }
        }
    }
}

impl<V, E, R> FutureOp<V, E, R>
where
    V: Send + 'static,
    E: Send + 'static,
    R: Receiver<Value = V, Error = E>,
{
    unsafe fn resume(data: *mut ()) {
        let this = data.cast::<Self>();
        unsafe {
            let core = &mut *(*this).core.get();

            // dropping the guard synchronizes with an in-flight
            // cancellation callback; after this no abandon can race us
            core.guard = None;

            let Some(header) = core.header.take() else {
                debug_assert!(false, "future operation resumed twice");
                return;
            };
            let Some(receiver) = core.receiver.take() else {
                debug_assert!(false, "future operation resumed twice");
                return;
            };
            let slot = core.slot.take();

            (*this).completed.store(true, Ordering::Release);
            // the owner may reclaim the op once the receiver observes the
            // completion below; no further access to `this`

            Self::consume(header, receiver);
            drop(slot);
        }
    }

    /// Forwards the recorded completion and releases the future's
    /// reference on the spawned operation.
    fn consume(header: NonNull<SpawnHeader<V, E>>, receiver: R) {
        let hdr = unsafe { header.as_ref() };

        // we were woken through the event, so this read is ordered after
        // the operation's (or the abandoning callback's) writes
        let mut observed = hdr.state.load(Ordering::Relaxed);

        if observed == state::ABANDONED {
            // we cancelled and won: mark terminal so the still-running
            // operation knows nothing was stored
            hdr.state.store(state::COMPLETE, Ordering::Release);
            observed = state::COMPLETE;
        }

        match observed {
            state::VALUE => {
                // Safety: the state tag says the union holds a value and
                // only we consume it
                let value = unsafe {
                    ManuallyDrop::into_inner(ptr::read(&raw const (*hdr.result.get()).value))
                };
                // the deleter must not reclaim the moved-out value
                hdr.state.store(state::COMPLETE, Ordering::Relaxed);
                hdr.decref();
                receiver.set_value(value);
            }
            state::ERROR => {
                // Safety: as above, for the error member
                let error = unsafe {
                    ManuallyDrop::into_inner(ptr::read(&raw const (*hdr.result.get()).error))
                };
                hdr.state.store(state::COMPLETE, Ordering::Relaxed);
                hdr.decref();
                receiver.set_error(error);
            }
            state::DONE | state::COMPLETE => {
                hdr.decref();
                receiver.set_done();
            }
            _ => {
                debug_assert!(false, "spawned operation resumed while incomplete");
                hdr.decref();
                receiver.set_done();
            }
        }
    }
}

impl<V, E, R> Drop for FutureOp<V, E, R> {
    fn drop(&mut self) {
        if self.started.load(Ordering::Relaxed) {
            // a started operation may only be dropped after completion
            debug_assert!(
                self.completed.load(Ordering::Acquire),
                "dropped a started but incomplete operation"
            );
            return;
        }
        // connected but never started: behave like a dropped future
        let core = self.core.get_mut();
        core.guard = None;
        if let Some(header) = core.header.take() {
            unsafe { header.as_ref() }.drop_handle();
        }
    }
}
