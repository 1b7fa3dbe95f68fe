use crate::sched::AnyScheduler;
use crate::stop::StopToken;

/// Consumer of an operation's single completion.
///
/// A receiver is the continuation of an asynchronous operation. It exposes
/// three completion channels and a query surface through which the
/// operation discovers receiver-scoped context (its stop token and its
/// declared scheduler).
///
/// ## Contract
///
/// - Exactly one of [`set_value`](Receiver::set_value),
///   [`set_error`](Receiver::set_error), [`set_done`](Receiver::set_done)
///   is invoked per connected operation. Each channel consumes the
///   receiver, so invoking more than one is already unrepresentable; a
///   receiver dropped without any channel means its operation was
///   abandoned without completing, which is a contract violation on the
///   operation's side.
/// - `set_done` must not panic. `set_value` and `set_error` may.
/// - Completions may be delivered on any thread, which is why receivers
///   are `Send + 'static`.
///
/// Wrapping receivers (the internals of every composed sender) forward
/// the query methods to the receiver they wrap, so context flows from the
/// outermost operation to the leaves unchanged unless a layer explicitly
/// replaces it.
pub trait Receiver: Send + 'static {
    type Value;
    type Error;

    /// Completes the operation with a value.
    fn set_value(self, value: Self::Value);

    /// Completes the operation with an error.
    fn set_error(self, error: Self::Error);

    /// Completes the operation with "nothing happened": cancellation, or
    /// a closed scope. Must not panic.
    fn set_done(self);

    /// The stop token this operation should observe. Defaults to a token
    /// that can never be stopped.
    fn stop_token(&self) -> StopToken {
        StopToken::never()
    }

    /// The scheduler on which this receiver expects its completion.
    /// Senders that declare scheduler affinity deliver through it.
    /// Defaults to the inline scheduler (complete wherever you are).
    fn scheduler(&self) -> AnyScheduler {
        AnyScheduler::inline()
    }
}
