use std::pin::pin;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::completion::Completion;
use crate::receiver::Receiver;
use crate::sender::{OperationState, Sender};
use crate::stop::StopToken;

struct WaitState<V, E> {
    recorded: Mutex<Option<Completion<V, E>>>,
    delivered: Condvar,
}

struct WaitReceiver<V, E> {
    state: Arc<WaitState<V, E>>,
    token: StopToken,
}

impl<V, E> WaitReceiver<V, E> {
    fn record(self, completion: Completion<V, E>) {
        *self.state.recorded.lock() = Some(completion);
        self.state.delivered.notify_one();
    }
}

impl<V, E> Receiver for WaitReceiver<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    type Value = V;
    type Error = E;

    fn set_value(self, value: V) {
        self.record(Completion::Value(value));
    }

    fn set_error(self, error: E) {
        self.record(Completion::Error(error));
    }

    fn set_done(self) {
        self.record(Completion::Done);
    }

    fn stop_token(&self) -> StopToken {
        self.token.clone()
    }
}

/// Connects `sender` on the stack, starts it, and parks the calling
/// thread until the completion arrives.
///
/// The receiver handed to the sender declares the inline scheduler, so
/// scheduler-affine senders deliver on whichever thread recorded the
/// completion; the recorded result is observed here through the condvar.
pub fn sync_wait<S>(sender: S) -> Completion<S::Value, S::Error>
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
{
    sync_wait_with(sender, StopToken::never())
}

/// [`sync_wait`] with an externally supplied stop token, so the parked
/// operation can be cancelled from another thread.
pub fn sync_wait_with<S>(sender: S, token: StopToken) -> Completion<S::Value, S::Error>
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
{
    let state = Arc::new(WaitState {
        recorded: Mutex::new(None),
        delivered: Condvar::new(),
    });

    let receiver = WaitReceiver {
        state: state.clone(),
        token,
    };
    let mut op = pin!(sender.connect(receiver));
    op.as_mut().start();

    let mut recorded = state.recorded.lock();
    loop {
        if let Some(completion) = recorded.take() {
            return completion;
        }
        state.delivered.wait(&mut recorded);
    }
}
