use crate::receiver::Receiver;

/// A recorded completion: exactly one of the three receiver channels.
///
/// Wherever a completion has to be stored before it can be delivered (a
/// rendezvous slot waiting for its forwarder, a parked [`sync_wait`]
/// caller, a pending future adapter), it is recorded as one of these and
/// later replayed onto the receiver with [`Completion::forward`].
///
/// [`sync_wait`]: crate::sync_wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion<V, E> {
    /// The operation succeeded with a value.
    Value(V),
    /// The operation failed with an error.
    Error(E),
    /// The operation was cancelled, or there was nothing left to do.
    /// Not an error.
    Done,
}

impl<V, E> Completion<V, E> {
    /// Delivers this completion to `receiver`, invoking the matching
    /// channel.
    pub fn forward<R>(self, receiver: R)
    where
        R: Receiver<Value = V, Error = E>,
    {
        match self {
            Completion::Value(value) => receiver.set_value(value),
            Completion::Error(error) => receiver.set_error(error),
            Completion::Done => receiver.set_done(),
        }
    }

    /// Returns the value, discarding the other outcomes.
    pub fn value(self) -> Option<V> {
        match self {
            Completion::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the error, discarding the other outcomes.
    pub fn error(self) -> Option<E> {
        match self {
            Completion::Error(error) => Some(error),
            _ => None,
        }
    }

    /// Returns true if the operation was cancelled.
    pub fn is_done(&self) -> bool {
        matches!(self, Completion::Done)
    }
}

impl<V, E> From<Result<V, E>> for Completion<V, E> {
    fn from(result: Result<V, E>) -> Self {
        match result {
            Ok(value) => Completion::Value(value),
            Err(error) => Completion::Error(error),
        }
    }
}
