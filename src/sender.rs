use std::pin::Pin;

use crate::blocking::Blocking;
use crate::receiver::Receiver;

/// Lazy description of an asynchronous operation.
///
/// Constructing a sender has no side effect beyond building the
/// description; work begins only when the sender is [`connect`]ed to a
/// [`Receiver`] and the resulting [`OperationState`] is started.
///
/// A sender advertises its completion signature at the type level:
/// `Value` and `Error` are the payloads of the corresponding receiver
/// channels, and [`SENDS_DONE`](Sender::SENDS_DONE) records whether the
/// sender may complete with `set_done`. For composed senders
/// `SENDS_DONE` is the logical OR of the stages. A sender that cannot
/// fail uses `Error = Infallible`.
pub trait Sender {
    type Value;
    type Error;

    /// Whether this sender may complete with `set_done`.
    const SENDS_DONE: bool;

    /// The operation produced by connecting this sender to `R`.
    type Operation<R>: OperationState
    where
        R: Receiver<Value = Self::Value, Error = Self::Error>;

    /// Binds this description to its continuation. Ownership of the
    /// sender passes into the returned operation; no work starts yet.
    fn connect<R>(self, receiver: R) -> Self::Operation<R>
    where
        R: Receiver<Value = Self::Value, Error = Self::Error>;

    /// A hint describing how `start` relates to completion delivery.
    fn blocking(&self) -> Blocking {
        Blocking::Maybe
    }
}

/// The pinned object that owns an in-flight operation.
///
/// An operation state exists from [`connect`] until its receiver has been
/// completed; its address is captured by child operations, stop
/// callbacks, and rendezvous registrations, which is why it is pinned.
///
/// # Safety
///
/// Implementations promise, and owners rely on, the following:
///
/// - `start` is called at most once, after which the operation stays
///   pinned in place until its receiver has been completed.
/// - Once the operation has invoked a completion channel on its receiver
///   it no longer accesses `self` in any way. The owner is allowed to
///   reclaim the operation's storage from inside the completion call
///   itself (eagerly spawned operations are destroyed exactly there).
/// - Dropping an operation that has been started but has not completed
///   its receiver is a contract violation by the owner; implementations
///   may `debug_assert` against it but need not defend further.
pub unsafe trait OperationState {
    /// Initiates the operation. The eventual completion may be delivered
    /// inline, before `start` returns, or later from another thread.
    fn start(self: Pin<&mut Self>);
}

/// Binds `sender` to `receiver`, producing an operation the caller must
/// pin and keep alive until it completes. Free-function spelling of
/// [`Sender::connect`].
pub fn connect<S, R>(sender: S, receiver: R) -> S::Operation<R>
where
    S: Sender,
    R: Receiver<Value = S::Value, Error = S::Error>,
{
    sender.connect(receiver)
}

/// Starts a pinned operation. Free-function spelling of
/// [`OperationState::start`].
pub fn start<O>(op: Pin<&mut O>)
where
    O: OperationState,
{
    O::start(op);
}
