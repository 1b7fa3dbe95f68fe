use std::cell::UnsafeCell;
use std::convert::Infallible;
use std::marker::{PhantomData, PhantomPinned};
use std::pin::Pin;
use std::ptr::NonNull;

use super::{CallWaiter, Forward, Pass, PassCore, PassPtr, RawOp};
use crate::blocking::Blocking;
use crate::completion::Completion;
use crate::receiver::Receiver;
use crate::sender::{OperationState, Sender};

/// Sender returned by [`Pass::async_call`], [`Pass::async_call_with`]
/// and [`Pass::async_throw`].
///
/// The payload body runs at rendezvous time, on the second arriver's
/// thread; its `Ok` goes to the acceptor's value channel, its `Err` to
/// the acceptor's error channel. The caller completes with
/// `set_value(())` either way, or with done if cancelled before an
/// acceptor arrived.
#[must_use = "senders do nothing unless connected and started"]
pub struct CallSender<'a, T, E, F> {
    pass: &'a Pass<T, E>,
    body: F,
}

impl<'a, T, E, F> CallSender<'a, T, E, F> {
    pub(super) fn new(pass: &'a Pass<T, E>, body: F) -> Self {
        Self { pass, body }
    }
}

impl<'a, T, E, F> Sender for CallSender<'a, T, E, F>
where
    T: Send + 'static,
    E: Send + 'static,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    type Value = ();
    type Error = Infallible;

    const SENDS_DONE: bool = true;

    type Operation<R>
        = CallOp<'a, T, E, R, F>
    where
        R: Receiver<Value = (), Error = Infallible>;

    fn connect<R>(self, receiver: R) -> CallOp<'a, T, E, R, F>
    where
        R: Receiver<Value = (), Error = Infallible>,
    {
        CallOp {
            pass: NonNull::from(self.pass),
            body: UnsafeCell::new(Some(self.body)),
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

/// The caller side's pinned operation. Holds the deferred payload body
/// until the rendezvous consumes it (or the operation is cancelled, in
/// which case the body is dropped unrun).
pub struct CallOp<'a, T, E, R, F> {
    pass: NonNull<Pass<T, E>>,
    body: UnsafeCell<Option<F>>,
    core: UnsafeCell<PassCore<Completion<(), Infallible>, R>>,
    _pin: PhantomPinned,
    _borrow: PhantomData<&'a Pass<T, E>>,
}

// Safe: moved between threads only before start; all shared access runs
// under the pass lock or after the claim handoff.
unsafe impl<T: Send, E: Send, R: Send, F: Send> Send for CallOp<'_, T, E, R, F> {}

// Safety: after registering in the pass the operation does not touch
// itself; the forwarder drains the core exactly once and stops touching
// the op before completing its receiver.
unsafe impl<T, E, R, F> OperationState for CallOp<'_, T, E, R, F>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Receiver<Value = (), Error = Infallible>,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    fn start(self: Pin<&mut Self>) {
        // Safety: pinned; the pass records this address until the
        // rendezvous or cancellation removes it.
        let this = unsafe { self.get_unchecked_mut() };
        let op = NonNull::from(&mut *this).cast::<()>();
        let pass = this.pass;
        let core = this.core.get();

        let token = unsafe { (*core).receiver.as_ref() }.map(|r| r.stop_token());
        let guard = token.map(|token| {
            let pass = PassPtr(pass);
            let op = RawOp(op);
            token.register(move || unsafe {
                call_cancel::<T, E, R, F>(pass.into_inner(), op.into_inner())
            })
        });

        let mut forwards = (None, None);
        {
            let mut waiting = unsafe { pass.as_ref() }.waiting.lock();
            if unsafe { (*core).claimed } {
                // cancelled while registering; our forwarder is already
                // on its way with done
                return;
            }
            match waiting.accept.take() {
                Some(acceptor) => {
                    // second arrival: run the body and hand its outcome
                    // to the acceptor, both under the lock
                    let payload = unsafe { call_produce::<T, E, R, F>(op) };
                    forwards.0 =
                        Some(unsafe { (acceptor.complete)(acceptor.op, Completion::from(payload)) });
                    unsafe {
                        (*core).claimed = true;
                        (*core).guard = guard;
                        (*core).completion = Some(Completion::Value(()));
                    }
                    forwards.1 = Some(Forward {
                        sched: unsafe { (*core).sched.clone() },
                        run: call_forward::<T, E, R, F>,
                        op,
                    });
                }
                None => {
                    debug_assert!(waiting.call.is_none(), "a caller is already parked");
                    unsafe { (*core).guard = guard };
                    waiting.call = Some(CallWaiter {
                        op,
                        produce: call_produce::<T, E, R, F>,
                        resume: call_resume::<T, E, R, F>,
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

impl<T, E, R, F> Drop for CallOp<'_, T, E, R, F> {
    fn drop(&mut self) {
        let core = self.core.get_mut();
        debug_assert!(
            core.guard.is_none() || core.receiver.is_none(),
            "dropped a parked rendezvous operation"
        );
    }
}

/// Runs the deferred payload body. Called exactly once, with the pass
/// lock held, on the second arriver's thread.
unsafe fn call_produce<T, E, R, F>(op: NonNull<()>) -> Result<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Receiver<Value = (), Error = Infallible>,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    let this = op.cast::<CallOp<T, E, R, F>>();
    let body = unsafe { (*(*this.as_ptr()).body.get()).take() };
    body.expect("rendezvous payload already consumed")()
}

/// Marks a parked caller complete. Runs with the pass lock held; the
/// returned forwarder must be submitted after it is released.
unsafe fn call_resume<T, E, R, F>(op: NonNull<()>) -> Forward
where
    T: Send + 'static,
    E: Send + 'static,
    R: Receiver<Value = (), Error = Infallible>,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    let this = op.cast::<CallOp<T, E, R, F>>();
    unsafe {
        let core = (*this.as_ptr()).core.get();
        debug_assert!(!(*core).claimed);
        (*core).claimed = true;
        (*core).completion = Some(Completion::Value(()));
        Forward {
            sched: (*core).sched.clone(),
            run: call_forward::<T, E, R, F>,
            op,
        }
    }
}

/// Stop-callback path: claim the caller with done and deregister it.
/// The unrun payload body stays in the operation and drops with it.
unsafe fn call_cancel<T, E, R, F>(pass: NonNull<Pass<T, E>>, op: NonNull<()>)
where
    T: Send + 'static,
    E: Send + 'static,
    R: Receiver<Value = (), Error = Infallible>,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    let forward;
    {
        let mut waiting = unsafe { pass.as_ref() }.waiting.lock();
        let this = op.cast::<CallOp<T, E, R, F>>();
        let core = unsafe { (*this.as_ptr()).core.get() };
        if unsafe { (*core).claimed } {
            // lost the race to a rendezvous; the recorded completion wins
            return;
        }
        unsafe {
            (*core).claimed = true;
            (*core).completion = Some(Completion::Done);
        }
        if waiting.call.as_ref().is_some_and(|w| w.op == op) {
            waiting.call = None;
        }
        forward = Forward {
            sched: unsafe { (*core).sched.clone() },
            run: call_forward::<T, E, R, F>,
            op,
        };
    }
    forward.submit();
}

/// Runs on the caller's declared scheduler: tear down the stop guard,
/// then deliver the recorded completion.
unsafe fn call_forward<T, E, R, F>(op: NonNull<()>)
where
    T: Send + 'static,
    E: Send + 'static,
    R: Receiver<Value = (), Error = Infallible>,
    F: FnOnce() -> Result<T, E> + Send + 'static,
{
    let this = op.cast::<CallOp<T, E, R, F>>();
    unsafe {
        let core = &mut *(*this.as_ptr()).core.get();
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
