//! Leaf senders and composition helpers.
//!
//! The crate deliberately ships only the handful of algorithms needed to
//! compose and exercise the structured primitives; it is a protocol core,
//! not an algorithm library.
//!
//! | sender | completion |
//! |--------|------------|
//! | [`just`] | `set_value(v)`, inline |
//! | [`just_error`] | `set_error(e)`, inline |
//! | [`just_done`] | `set_done()`, inline |
//! | [`then`] | maps the predecessor's value |
//! | [`never`] | `set_done()`, only once stop is requested |
//! | [`create`] | whatever the wrapped callback API delivers |

mod create;

pub use create::{Completer, Create, CreateOp, create};

use std::convert::Infallible;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blocking::Blocking;
use crate::receiver::Receiver;
use crate::sched::AnyScheduler;
use crate::sender::{OperationState, Sender};
use crate::stop::{StopCallback, StopToken};

/// Extension methods on every sender.
pub trait SenderExt: Sender + Sized {
    /// Maps this sender's value through `map`.
    fn then<F, U>(self, map: F) -> Then<Self, F>
    where
        F: FnOnce(Self::Value) -> U + Send + 'static,
    {
        then(self, map)
    }

    /// Adapts this sender into a [`std::future::Future`].
    #[cfg(feature = "async")]
    fn into_future(self) -> crate::SenderFuture<Self>
    where
        Self::Value: Send + 'static,
        Self::Error: Send + 'static,
    {
        crate::SenderFuture::new(self)
    }
}

impl<S: Sender> SenderExt for S {}

/// A sender that completes inline with `value`.
pub fn just<V>(value: V) -> Just<V> {
    Just { value }
}

#[derive(Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct Just<V> {
    value: V,
}

impl<V> Sender for Just<V> {
    type Value = V;
    type Error = Infallible;

    const SENDS_DONE: bool = false;

    type Operation<R>
        = JustOp<V, R>
    where
        R: Receiver<Value = V, Error = Infallible>;

    fn connect<R>(self, receiver: R) -> JustOp<V, R>
    where
        R: Receiver<Value = V, Error = Infallible>,
    {
        JustOp {
            cell: Some((self.value, receiver)),
        }
    }

    fn blocking(&self) -> Blocking {
        Blocking::AlwaysInline
    }
}

pub struct JustOp<V, R> {
    cell: Option<(V, R)>,
}

// Safety: completes inline from start and never touches itself afterwards.
unsafe impl<V, R> OperationState for JustOp<V, R>
where
    R: Receiver<Value = V, Error = Infallible>,
{
    fn start(self: Pin<&mut Self>) {
        // Safety: no field is structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };
        if let Some((value, receiver)) = this.cell.take() {
            receiver.set_value(value);
        } else {
            debug_assert!(false, "operation started twice");
        }
    }
}

/// A sender that completes inline with `error`.
pub fn just_error<V, E>(error: E) -> JustError<V, E> {
    JustError {
        error,
        _value: PhantomData,
    }
}

#[must_use = "senders do nothing unless connected and started"]
pub struct JustError<V, E> {
    error: E,
    _value: PhantomData<fn() -> V>,
}

impl<V, E> Sender for JustError<V, E> {
    type Value = V;
    type Error = E;

    const SENDS_DONE: bool = false;

    type Operation<R>
        = JustErrorOp<E, R>
    where
        R: Receiver<Value = V, Error = E>;

    fn connect<R>(self, receiver: R) -> JustErrorOp<E, R>
    where
        R: Receiver<Value = V, Error = E>,
    {
        JustErrorOp {
            cell: Some((self.error, receiver)),
        }
    }

    fn blocking(&self) -> Blocking {
        Blocking::AlwaysInline
    }
}

pub struct JustErrorOp<E, R> {
    cell: Option<(E, R)>,
}

// Safety: completes inline from start and never touches itself afterwards.
unsafe impl<V, E, R> OperationState for JustErrorOp<E, R>
where
    R: Receiver<Value = V, Error = E>,
{
    fn start(self: Pin<&mut Self>) {
        // Safety: no field is structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };
        if let Some((error, receiver)) = this.cell.take() {
            receiver.set_error(error);
        } else {
            debug_assert!(false, "operation started twice");
        }
    }
}

/// A sender that completes inline with done.
pub fn just_done<V, E>() -> JustDone<V, E> {
    JustDone {
        _marker: PhantomData,
    }
}

#[derive(Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct JustDone<V, E> {
    _marker: PhantomData<fn() -> (V, E)>,
}

impl<V, E> Sender for JustDone<V, E> {
    type Value = V;
    type Error = E;

    const SENDS_DONE: bool = true;

    type Operation<R>
        = JustDoneOp<R>
    where
        R: Receiver<Value = V, Error = E>;

    fn connect<R>(self, receiver: R) -> JustDoneOp<R>
    where
        R: Receiver<Value = V, Error = E>,
    {
        JustDoneOp {
            receiver: Some(receiver),
        }
    }

    fn blocking(&self) -> Blocking {
        Blocking::AlwaysInline
    }
}

pub struct JustDoneOp<R> {
    receiver: Option<R>,
}

// Safety: completes inline from start and never touches itself afterwards.
unsafe impl<V, E, R> OperationState for JustDoneOp<R>
where
    R: Receiver<Value = V, Error = E>,
{
    fn start(self: Pin<&mut Self>) {
        // Safety: no field is structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };
        if let Some(receiver) = this.receiver.take() {
            receiver.set_done();
        } else {
            debug_assert!(false, "operation started twice");
        }
    }
}

/// Maps `sender`'s value through `map`; errors and done pass through
/// unchanged.
pub fn then<S, F, U>(sender: S, map: F) -> Then<S, F>
where
    S: Sender,
    F: FnOnce(S::Value) -> U + Send + 'static,
{
    Then { sender, map }
}

#[derive(Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct Then<S, F> {
    sender: S,
    map: F,
}

impl<S, F, U> Sender for Then<S, F>
where
    S: Sender,
    S::Value: 'static,
    F: FnOnce(S::Value) -> U + Send + 'static,
{
    type Value = U;
    type Error = S::Error;

    const SENDS_DONE: bool = S::SENDS_DONE;

    type Operation<R>
        = S::Operation<ThenReceiver<S::Value, F, R>>
    where
        R: Receiver<Value = U, Error = S::Error>;

    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = U, Error = S::Error>,
    {
        self.sender.connect(ThenReceiver {
            map: self.map,
            next: receiver,
            _input: PhantomData,
        })
    }

    fn blocking(&self) -> Blocking {
        // the map runs inline in the predecessor's completion
        self.sender.blocking().seq(Blocking::AlwaysInline)
    }
}

pub struct ThenReceiver<V, F, R> {
    map: F,
    next: R,
    _input: PhantomData<fn(V)>,
}

impl<V, U, F, R> Receiver for ThenReceiver<V, F, R>
where
    V: 'static,
    F: FnOnce(V) -> U + Send + 'static,
    R: Receiver<Value = U>,
{
    type Value = V;
    type Error = R::Error;

    fn set_value(self, value: V) {
        self.next.set_value((self.map)(value));
    }

    fn set_error(self, error: Self::Error) {
        self.next.set_error(error);
    }

    fn set_done(self) {
        self.next.set_done();
    }

    fn stop_token(&self) -> StopToken {
        self.next.stop_token()
    }

    fn scheduler(&self) -> AnyScheduler {
        self.next.scheduler()
    }
}

/// A sender that never produces a value: it suspends until its receiver's
/// stop token fires and then completes with done.
///
/// This is the canonical cancellation probe; spawning it keeps a scope
/// open until somebody requests stop.
pub fn never<V, E>() -> Never<V, E> {
    Never {
        _marker: PhantomData,
    }
}

#[derive(Clone)]
#[must_use = "senders do nothing unless connected and started"]
pub struct Never<V, E> {
    _marker: PhantomData<fn() -> (V, E)>,
}

impl<V, E> Sender for Never<V, E>
where
    V: 'static,
    E: 'static,
{
    type Value = V;
    type Error = E;

    const SENDS_DONE: bool = true;

    type Operation<R>
        = NeverOp<R>
    where
        R: Receiver<Value = V, Error = E>;

    fn connect<R>(self, receiver: R) -> NeverOp<R>
    where
        R: Receiver<Value = V, Error = E>,
    {
        NeverOp {
            receiver: Arc::new(Mutex::new(Some(receiver))),
            guard: None,
        }
    }

    fn blocking(&self) -> Blocking {
        Blocking::Never
    }
}

pub struct NeverOp<R> {
    receiver: Arc<Mutex<Option<R>>>,
    guard: Option<StopCallback>,
}

// Safety: completion happens at most once (the slot is emptied under the
// mutex) and the operation is never touched from the callback afterwards.
unsafe impl<R> OperationState for NeverOp<R>
where
    R: Receiver,
{
    fn start(self: Pin<&mut Self>) {
        // Safety: no field is structurally pinned; the stop callback
        // holds the receiver slot by Arc, not by address.
        let this = unsafe { self.get_unchecked_mut() };
        let token = match this.receiver.lock().as_ref() {
            Some(receiver) => receiver.stop_token(),
            None => {
                debug_assert!(false, "operation started twice");
                return;
            }
        };
        let slot = this.receiver.clone();
        this.guard = Some(token.register(move || {
            if let Some(receiver) = slot.lock().take() {
                receiver.set_done();
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;
    use crate::stop::StopSource;
    use crate::sync_wait::{sync_wait, sync_wait_with};

    /// just produces its value inline
    #[test]
    fn test_just() {
        assert_eq!(sync_wait(just(42)).value(), Some(42));
        assert_eq!(just(42).blocking(), Blocking::AlwaysInline);
    }

    /// then maps the value and forwards errors untouched
    #[test]
    fn test_then() {
        let out = sync_wait(just(20).then(|v| v * 2 + 2));
        assert_eq!(out.value(), Some(42));

        let out = sync_wait(just_error::<i32, &str>("boom").then(|v| v + 1));
        assert_eq!(out.error(), Some("boom"));
    }

    /// then chains keep composing
    #[test]
    fn test_then_chain() {
        let out = sync_wait(just(1).then(|v| v + 1).then(|v| format!("v={v}")));
        assert_eq!(out.value().as_deref(), Some("v=2"));
    }

    /// just_done completes with done, not value
    #[test]
    fn test_just_done() {
        let out = sync_wait(just_done::<i32, Infallible>());
        assert!(out.is_done());
    }

    /// never completes with done once stop is requested
    #[test]
    fn test_never_honours_stop() {
        let source = StopSource::new();
        let waiter = {
            let token = source.token();
            std::thread::spawn(move || {
                sync_wait_with(never::<i32, Infallible>(), token)
            })
        };
        source.request_stop();
        assert!(matches!(waiter.join().unwrap(), Completion::Done));
    }

    /// a stop requested before start completes never immediately
    #[test]
    fn test_never_with_prior_stop() {
        let source = StopSource::new();
        source.request_stop();
        let out = sync_wait_with(never::<i32, Infallible>(), source.token());
        assert!(out.is_done());
    }
}
