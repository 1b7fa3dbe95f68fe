use std::cell::UnsafeCell;
use std::marker::{PhantomData, PhantomPinned};
use std::pin::Pin;
use std::ptr::NonNull;

use super::{AcceptWaiter, Forward, Pass, PassCore, PassPtr, RawOp};
use crate::blocking::Blocking;
use crate::completion::Completion;
use crate::receiver::Receiver;
use crate::sender::{OperationState, Sender};

/// Sender returned by [`Pass::async_accept`].
///
/// Completes with the caller's payload, with the caller's thrown error,
/// or with done if cancelled before a caller arrived.
#[must_use = "senders do nothing unless connected and started"]
pub struct AcceptSender<'a, T, E> {
    pass: &'a Pass<T, E>,
}

impl<'a, T, E> AcceptSender<'a, T, E> {
    pub(super) fn new(pass: &'a Pass<T, E>) -> Self {
        Self { pass }
    }
}

impl<'a, T, E> Sender for AcceptSender<'a, T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Value = T;
    type Error = E;

    const SENDS_DONE: bool = true;

    type Operation<R>
        = AcceptOp<'a, T, E, R>
    where
        R: Receiver<Value = T, Error = E>;

    fn connect<R>(self, receiver: R) -> AcceptOp<'a, T, E, R>
    where
        R: Receiver<Value = T, Error = E>,
    {
        AcceptOp {
            pass: NonNull::from(self.pass),
            core: UnsafeCell::new(PassCore {
                claimed: false,
                completion: None,
                sched: receiver.scheduler(),
                receiver: Some(receiver),
                guard: None,
            }),
            _pin: PhantomPinned,
            _borrow: PhantomData,
        }
    }

    fn blocking(&self) -> Blocking {
        Blocking::Maybe
    }
}

/// The acceptor side's pinned operation.
pub struct AcceptOp<'a, T, E, R> {
    pass: NonNull<Pass<T, E>>,
    core: UnsafeCell<PassCore<Completion<T, E>, R>>,
    _pin: PhantomPinned,
    _borrow: PhantomData<&'a Pass<T, E>>,
}

// Safe: moved between threads only before start; all shared access runs
// under the pass lock or after the claim handoff.
unsafe impl<T: Send, E: Send, R: Send> Send for AcceptOp<'_, T, E, R> {}

// Safety: after registering in the pass the operation does not touch
// itself; the forwarder drains the core exactly once and stops touching
// the op before completing its receiver.
unsafe impl<T, E, R> OperationState for AcceptOp<'_, T, E, R>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Receiver<Value = T, Error = E>,
{
    fn start(self: Pin<&mut Self>) {
        // Safety: pinned; the pass records this address until the
        // rendezvous or cancellation removes it.
        let this = unsafe { self.get_unchecked_mut() };
        let op = NonNull::from(&mut *this).cast::<()>();
        let pass = this.pass;
        let core = this.core.get();

        // arm cancellation first; an already-stopped token fires inline
        // and claims the slot before we look at it
        let token = unsafe { (*core).receiver.as_ref() }.map(|r| r.stop_token());
        let guard = token.map(|token| {
            let pass = PassPtr(pass);
            let op = RawOp(op);
            token.register(move || unsafe {
                accept_cancel::<T, E, R>(pass.into_inner(), op.into_inner())
            })
        });

        let mut forwards = (None, None);
        {
            let mut waiting = unsafe { pass.as_ref() }.waiting.lock();
            if unsafe { (*core).claimed } {
                // cancelled while registering; the callback already
                // recorded done and submitted our forwarder. The guard
                // stays local: dropping it waits out the callback.
                return;
            }
            match waiting.call.take() {
                Some(caller) => {
                    // second arrival: perform the rendezvous under the
                    // lock, then forward both completions outside it
                    let payload = unsafe { (caller.produce)(caller.op) };
                    forwards.0 = Some(unsafe { (caller.resume)(caller.op) });
                    unsafe {
                        (*core).claimed = true;
                        (*core).guard = guard;
                        (*core).completion = Some(Completion::from(payload));
                    }
                    forwards.1 = Some(Forward {
                        sched: unsafe { (*core).sched.clone() },
                        run: accept_forward::<T, E, R>,
                        op,
                    });
                }
                None => {
                    debug_assert!(waiting.accept.is_none(), "an acceptor is already parked");
                    unsafe { (*core).guard = guard };
                    waiting.accept = Some(AcceptWaiter {
                        op,
                        complete: accept_complete::<T, E, R>,
                    });
                }
            }
        }
        if let Some(forward) = forwards.0 {
            forward.submit();
        }
        if let Some(forward) = forwards.1 {
            forward.submit();
        }
    }
}

impl<T, E, R> Drop for AcceptOp<'_, T, E, R> {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        // a parked operation must not be dropped; by the time the owner
        // may drop us, either we never ran or the forwarder consumed the
        // receiver
        debug_assert!(
            core.guard.is_none() || core.receiver.is_none(),
            "dropped a parked rendezvous operation"
        );
    }
}

/// Records the rendezvous outcome into a parked acceptor. Runs with the
/// pass lock held; the returned forwarder must be submitted after it is
/// released.
unsafe fn accept_complete<T, E, R>(op: NonNull<()>, completion: Completion<T, E>) -> Forward
where
    T: Send + 'static,
    E: Send + 'static,
    R: Receiver<Value = T, Error = E>,
{
    let this = op.cast::<AcceptOp<T, E, R>>();
    unsafe {
        let core = (*this.as_ptr()).core.get();
        debug_assert!(!(*core).claimed);
        (*core).claimed = true;
        (*core).completion = Some(completion);
        Forward {
            sched: (*core).sched.clone(),
            run: accept_forward::<T, E, R>,
            op,
        }
    }
}

/// Stop-callback path: claim the acceptor with done and deregister it.
unsafe fn accept_cancel<T, E, R>(pass: NonNull<Pass<T, E>>, op: NonNull<()>)
where
    T: Send + 'static,
    E: Send + 'static,
    R: Receiver<Value = T, Error = E>,
{
    let forward;
    {
        let mut waiting = unsafe { pass.as_ref() }.waiting.lock();
        let this = op.cast::<AcceptOp<T, E, R>>();
        let core = unsafe { (*this.as_ptr()).core.get() };
        if unsafe { (*core).claimed } {
            // lost the race to a rendezvous; the recorded completion wins
            return;
        }
        unsafe {
            (*core).claimed = true;
            (*core).completion = Some(Completion::Done);
        }
        if waiting.accept.as_ref().is_some_and(|w| w.op == op) {
            waiting.accept = None;
        }
        forward = Forward {
            sched: unsafe { (*core).sched.clone() },
            run: accept_forward::<T, E, R>,
            op,
        };
    }
    forward.submit();
}

/// Runs on the acceptor's declared scheduler: tear down the stop guard,
/// then deliver the recorded completion.
unsafe fn accept_forward<T, E, R>(op: NonNull<()>)
where
    T: Send + 'static,
    E: Send + 'static,
    R: Receiver<Value = T, Error = E>,
{
    let this = op.cast::<AcceptOp<T, E, R>>();
    unsafe {
        let core = &mut *(*this.as_ptr()).core.get();
        // synchronizes with an in-flight cancellation callback
        core.guard = None;
        let Some(receiver) = core.receiver.take() else {
            debug_assert!(false, "rendezvous forwarder ran twice");
            return;
        };
        let completion = core.completion.take().unwrap_or(Completion::Done);
        // no further access to the op once the receiver is invoked
        completion.forward(receiver);
    }
}
