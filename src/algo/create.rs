use std::marker::PhantomData;
use std::pin::Pin;

use crate::blocking::Blocking;
use crate::completion::Completion;
use crate::receiver::Receiver;
use crate::sender::{OperationState, Sender};
use crate::stop::StopToken;

/// Bridges a callback-style API into the sender protocol.
///
/// `init` runs when the operation starts and receives a [`Completer`]: a
/// one-shot, sendable handle that delivers the eventual completion.
/// Stash it in your callback registration, a queue, another thread —
/// whatever the wrapped API wants — and fire exactly one channel when
/// the result is known.
///
/// ```
/// use telaio::{create, sync_wait};
///
/// let sender = create::<u32, std::convert::Infallible, _>(|completer| {
///     std::thread::spawn(move || completer.set_value(42));
/// });
/// assert_eq!(sync_wait(sender).value(), Some(42));
/// ```
pub fn create<V, E, F>(init: F) -> Create<V, E, F>
where
    F: FnOnce(Completer<V, E>) + Send + 'static,
{
    Create {
        init,
        _marker: PhantomData,
    }
}

#[must_use = "senders do nothing unless connected and started"]
pub struct Create<V, E, F> {
    init: F,
    _marker: PhantomData<fn() -> (V, E)>,
}

impl<V, E, F> Sender for Create<V, E, F>
where
    V: Send + 'static,
    E: Send + 'static,
    F: FnOnce(Completer<V, E>) + Send + 'static,
{
    type Value = V;
    type Error = E;

    const SENDS_DONE: bool = true;

    type Operation<R>
        = CreateOp<V, E, F, R>
    where
        R: Receiver<Value = V, Error = E>;

    fn connect<R>(self, receiver: R) -> CreateOp<V, E, F, R>
    where
        R: Receiver<Value = V, Error = E>,
    {
        CreateOp {
            cell: Some((self.init, receiver)),
            _marker: PhantomData,
        }
    }

    fn blocking(&self) -> Blocking {
        Blocking::Maybe
    }
}

pub struct CreateOp<V, E, F, R> {
    cell: Option<(F, R)>,
    _marker: PhantomData<fn() -> (V, E)>,
}

// Safety: start hands the receiver to the completer and keeps nothing;
// the completer is used at most once, from wherever `init` put it.
unsafe impl<V, E, F, R> OperationState for CreateOp<V, E, F, R>
where
    V: Send + 'static,
    E: Send + 'static,
    F: FnOnce(Completer<V, E>) + Send + 'static,
    R: Receiver<Value = V, Error = E>,
{
    fn start(self: Pin<&mut Self>) {
        // Safety: no field is structurally pinned.
        let this = unsafe { self.get_unchecked_mut() };
        let Some((init, receiver)) = this.cell.take() else {
            debug_assert!(false, "operation started twice");
            return;
        };
        let token = receiver.stop_token();
        let deliver = Box::new(move |completion: Completion<V, E>| {
            completion.forward(receiver);
        });
        init(Completer { deliver, token });
    }
}

/// One-shot completion handle given to [`create`]'s init function.
///
/// Exactly one of the three channels must be invoked; dropping the
/// completer without completing delivers done (the operation reports
/// "nothing happened" rather than hanging its owner forever).
#[must_use = "dropping a completer without completing delivers done"]
pub struct Completer<V, E> {
    deliver: Box<dyn FnOnce(Completion<V, E>) + Send>,
    token: StopToken,
}

impl<V, E> Completer<V, E> {
    pub fn set_value(self, value: V) {
        self.finish(Completion::Value(value));
    }

    pub fn set_error(self, error: E) {
        self.finish(Completion::Error(error));
    }

    pub fn set_done(self) {
        self.finish(Completion::Done);
    }

    /// The operation's stop token, so the wrapped API can observe
    /// cancellation (for example to deregister a callback early).
    pub fn stop_token(&self) -> StopToken {
        self.token.clone()
    }

    fn finish(mut self, completion: Completion<V, E>) {
        let deliver = std::mem::replace(&mut self.deliver, Box::new(|_| {}));
        deliver(completion);
    }
}

impl<V, E> Drop for Completer<V, E> {
    fn drop(&mut self) {
        // finish replaces the closure with an inert one before this runs
        let deliver = std::mem::replace(&mut self.deliver, Box::new(|_| {}));
        deliver(Completion::Done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::StopSource;
    use crate::sync_wait::{sync_wait, sync_wait_with};
    use std::convert::Infallible;

    /// Completion delivered inline from the init function
    #[test]
    fn test_create_inline() {
        let out = sync_wait(create::<u32, Infallible, _>(|completer| {
            completer.set_value(1)
        }));
        assert_eq!(out.value(), Some(1));
    }

    /// Completion delivered later, from another thread
    #[test]
    fn test_create_cross_thread() {
        let out = sync_wait(create::<String, Infallible, _>(|completer| {
            std::thread::spawn(move || completer.set_value("late".into()));
        }));
        assert_eq!(out.value().as_deref(), Some("late"));
    }

    /// Errors travel the error channel
    #[test]
    fn test_create_error() {
        let out = sync_wait(create::<u32, &str, _>(|completer| {
            completer.set_error("broken")
        }));
        assert_eq!(out.error(), Some("broken"));
    }

    /// A dropped completer completes with done instead of hanging
    #[test]
    fn test_dropped_completer_is_done() {
        let out = sync_wait(create::<u32, Infallible, _>(|completer| {
            drop(completer);
        }));
        assert!(out.is_done());
    }

    /// The wrapped API can observe cancellation through the completer
    #[test]
    fn test_completer_sees_stop() {
        let source = StopSource::new();
        let token = source.token();
        source.request_stop();

        let out = sync_wait_with(
            create::<u32, Infallible, _>(|completer| {
                if completer.stop_token().stop_requested() {
                    completer.set_done();
                } else {
                    completer.set_value(5);
                }
            }),
            token,
        );
        assert!(out.is_done());
    }
}
