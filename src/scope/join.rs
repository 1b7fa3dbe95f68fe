use std::cell::UnsafeCell;
use std::convert::Infallible;
use std::marker::PhantomPinned;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::Arc;

use super::ScopeState;
use crate::event::Waiter;
use crate::receiver::Receiver;
use crate::sender::{OperationState, Sender};

/// Sender returned by [`Scope::join`](crate::Scope::join).
///
/// Starting it closes the scope (idempotently) and completes with
/// `set_value(())` when the use count drains to zero. Every started join
/// operation is woken by the drain, so joining twice — or from several
/// clones at once — is fine.
#[derive(Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct Join {
    scope: Arc<ScopeState>,
}

impl Join {
    pub(super) fn new(scope: Arc<ScopeState>) -> Self {
        Self { scope }
    }
}

impl Sender for Join {
    type Value = ();
    type Error = Infallible;

    const SENDS_DONE: bool = false;

    type Operation<R>
        = JoinOp<R>
    where
        R: Receiver<Value = (), Error = Infallible>;

    fn connect<R>(self, receiver: R) -> JoinOp<R>
    where
        R: Receiver<Value = (), Error = Infallible>,
    {
        JoinOp {
            scope: self.scope,
            receiver: UnsafeCell::new(Some(receiver)),
            waiter: UnsafeCell::new(Waiter::empty()),
            _pin: PhantomPinned,
        }
    }
}

pub struct JoinOp<R> {
    scope: Arc<ScopeState>,
    /// Taken by `resume`, which may run on whichever thread empties the
    /// scope. Exclusive access hands over at enqueue time.
    receiver: UnsafeCell<Option<R>>,
    waiter: UnsafeCell<Waiter>,
    _pin: PhantomPinned,
}

// Safe: the owner may move the op between threads before start; after
// start the op is pinned and only the resume path touches the cells.
unsafe impl<R: Send> Send for JoinOp<R> {}

// Safety: after enqueueing its waiter the operation does not touch
// itself; the resume path takes the receiver exactly once and stops
// touching the op before completing it.
unsafe impl<R> OperationState for JoinOp<R>
where
    R: Receiver<Value = (), Error = Infallible>,
{
    fn start(self: Pin<&mut Self>) {
        // Safety: pinned; the waiter node we publish records this
        // address and stays valid until resumed.
        let this = unsafe { self.get_unchecked_mut() };
        this.scope.close();

        let data: *mut Self = this;
        unsafe {
            *this.waiter.get() = Waiter::new(Self::resume, data.cast());
            let node = NonNull::new_unchecked(this.waiter.get());
            if !this.scope.event().try_enqueue(node) {
                // already drained; complete inline
                Self::resume(data.cast());
            }
        }
    }
}

impl<R> JoinOp<R>
where
    R: Receiver<Value = (), Error = Infallible>,
{
    unsafe fn resume(data: *mut ()) {
        let this = data.cast::<Self>();
        unsafe {
            // synchronize with the release decrements performed by every
            // completed operation before observing the drain
            (*this).scope.synchronize();
            let receiver = (*(*this).receiver.get()).take();
            // the owner may reclaim the op as soon as the completion
            // lands; no further access to `this`
            if let Some(receiver) = receiver {
                receiver.set_value(());
            }
        }
    }
}
