use std::pin::Pin;
use std::sync::Arc;

use super::{ScopeRef, ScopeState};
use crate::blocking::Blocking;
use crate::receiver::Receiver;
use crate::sched::AnyScheduler;
use crate::sender::{OperationState, Sender};
use crate::stop::{StopCallback, StopSource, StopToken};

/// Sender returned by [`Scope::nest`](crate::Scope::nest).
///
/// Wraps a sender so that running it is tracked by a scope. The
/// reservation is taken when the nest sender is built and travels with
/// it: into the operation on connect, released on completion — or
/// released by the sender's own drop if it is never run. A nest sender
/// built (or cloned) after the scope closed carries no reservation and
/// completes with done on start.
#[must_use = "senders do nothing unless connected and started"]
pub struct Nest<S> {
    sender: S,
    slot: Option<ScopeRef>,
}

impl<S> Nest<S>
where
    S: Sender,
{
    pub(super) fn new(sender: S, scope: &Arc<ScopeState>) -> Self {
        Self {
            sender,
            slot: ScopeState::try_record_start(scope),
        }
    }
}

impl<S> Clone for Nest<S>
where
    S: Sender + Clone,
{
    /// Cloning re-attempts admission: the clone gets its own reservation,
    /// or none if the scope has closed since.
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            slot: self
                .slot
                .as_ref()
                .and_then(|slot| ScopeState::try_record_start(&slot.scope)),
        }
    }
}

impl<S> Sender for Nest<S>
where
    S: Sender,
{
    type Value = S::Value;
    type Error = S::Error;

    /// The scope may reject the sender, so done is always on the table.
    const SENDS_DONE: bool = true;

    type Operation<R>
        = NestOp<S, R>
    where
        R: Receiver<Value = S::Value, Error = S::Error>;

    fn connect<R>(self, receiver: R) -> NestOp<S, R>
    where
        R: Receiver<Value = S::Value, Error = S::Error>,
    {
        let inner = match self.slot {
            Some(slot) => {
                // every operation in the scope observes the scope's stop
                // source combined with its own receiver's; both are
                // funnelled into one per-operation source
                let stop = StopSource::new();
                let on_receiver = stop.forward_from(&receiver.stop_token());
                let on_scope = stop.forward_from(&slot.scope.stop.token());

                NestInner::Attached(self.sender.connect(NestReceiver {
                    receiver,
                    slot,
                    stop,
                    guards: Some((on_receiver, on_scope)),
                }))
            }
            None => NestInner::Rejected(Some(receiver)),
        };
        NestOp { inner }
    }

    fn blocking(&self) -> Blocking {
        self.sender.blocking()
    }
}

pub struct NestOp<S, R>
where
    S: Sender,
    R: Receiver<Value = S::Value, Error = S::Error>,
{
    inner: NestInner<S, R>,
}

enum NestInner<S, R>
where
    S: Sender,
    R: Receiver<Value = S::Value, Error = S::Error>,
{
    Attached(S::Operation<NestReceiver<R>>),
    Rejected(Option<R>),
}

// Safety: the attached child is structurally pinned and drives the whole
// lifecycle; the rejected path completes inline from start.
unsafe impl<S, R> OperationState for NestOp<S, R>
where
    S: Sender,
    R: Receiver<Value = S::Value, Error = S::Error>,
{
    fn start(self: Pin<&mut Self>) {
        // Safety: we never move the child once pinned.
        let this = unsafe { self.get_unchecked_mut() };
        match &mut this.inner {
            NestInner::Attached(child) => unsafe { Pin::new_unchecked(child) }.start(),
            NestInner::Rejected(receiver) => {
                if let Some(receiver) = receiver.take() {
                    receiver.set_done();
                } else {
                    debug_assert!(false, "operation started twice");
                }
            }
        }
    }
}

/// The receiver wrapped around a nested operation.
///
/// Owns everything the scope needs back: the reservation, the combined
/// stop source and the two callback guards feeding it. On any completion
/// it drops the guards first (synchronizing with in-flight stop
/// callbacks), forwards the completion, and releases the reservation
/// last — also on unwind, since the reservation is an RAII local by then.
pub struct NestReceiver<R> {
    receiver: R,
    slot: ScopeRef,
    stop: StopSource,
    guards: Option<(StopCallback, StopCallback)>,
}

impl<R> NestReceiver<R>
where
    R: Receiver,
{
    fn finish(self, deliver: impl FnOnce(R)) {
        let NestReceiver {
            receiver,
            slot,
            stop,
            guards,
        } = self;
        drop(guards);
        drop(stop);
        deliver(receiver);
        drop(slot);
    }
}

impl<R> Receiver for NestReceiver<R>
where
    R: Receiver,
{
    type Value = R::Value;
    type Error = R::Error;

    fn set_value(self, value: R::Value) {
        self.finish(|receiver| receiver.set_value(value));
    }

    fn set_error(self, error: R::Error) {
        self.finish(|receiver| receiver.set_error(error));
    }

    fn set_done(self) {
        self.finish(Receiver::set_done);
    }

    fn stop_token(&self) -> StopToken {
        self.stop.token()
    }

    fn scheduler(&self) -> AnyScheduler {
        self.receiver.scheduler()
    }
}
