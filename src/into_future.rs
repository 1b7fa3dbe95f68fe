use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};

use crate::completion::Completion;
use crate::receiver::Receiver;
use crate::sched::AnyScheduler;
use crate::sender::{OperationState, Sender};
use crate::stop::{StopSource, StopToken};

struct Shared<V, E> {
    recorded: Mutex<Option<Completion<V, E>>>,
    delivered: Condvar,
    waker: AtomicWaker,
    stop: StopSource,
}

struct AdapterReceiver<V, E> {
    shared: Arc<Shared<V, E>>,
}

impl<V, E> AdapterReceiver<V, E> {
    fn record(self, completion: Completion<V, E>) {
        *self.shared.recorded.lock() = Some(completion);
        self.shared.waker.wake();
        self.shared.delivered.notify_all();
    }
}

impl<V, E> Receiver for AdapterReceiver<V, E>
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
        self.shared.stop.token()
    }

    fn scheduler(&self) -> AnyScheduler {
        AnyScheduler::inline()
    }
}

enum AdapterState<S>
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
{
    Idle(Option<S>),
    Running(S::Operation<AdapterReceiver<S::Value, S::Error>>),
    Finished,
}

/// Adapts a [`Sender`] into a [`std::future::Future`], bridging the
/// protocol into async fns and runtimes.
///
/// The first poll connects and starts the operation in place; the
/// recorded completion is handed out as a [`Completion`].
///
/// # Cancel Safety
///
/// Dropping the future before completion requests stop on the operation
/// and then **blocks the dropping thread** until the operation
/// acknowledges, because the operation state lives inside the future and
/// must outlive the work it owns. Prefer driving it to completion.
#[must_use = "futures do nothing unless polled"]
pub struct SenderFuture<S>
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
{
    state: AdapterState<S>,
    shared: Arc<Shared<S::Value, S::Error>>,
}

impl<S> SenderFuture<S>
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
{
    pub fn new(sender: S) -> Self {
        Self {
            state: AdapterState::Idle(Some(sender)),
            shared: Arc::new(Shared {
                recorded: Mutex::new(None),
                delivered: Condvar::new(),
                waker: AtomicWaker::new(),
                stop: StopSource::new(),
            }),
        }
    }
}

impl<S> Future for SenderFuture<S>
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
{
    type Output = Completion<S::Value, S::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Safety: `state` is structurally pinned; a Running operation is
        // never moved, only dropped in place after it has completed.
        let this = unsafe { self.get_unchecked_mut() };

        if let AdapterState::Idle(sender) = &mut this.state {
            let sender = sender.take().expect("polled after completion");
            this.shared.waker.register(cx.waker());
            let op = sender.connect(AdapterReceiver {
                shared: this.shared.clone(),
            });
            // Idle holds no pinned data, so replacing the variant is fine;
            // the operation is pinned from here on
            this.state = AdapterState::Running(op);
            if let AdapterState::Running(op) = &mut this.state {
                unsafe { Pin::new_unchecked(op) }.start();
            }
        }

        match &this.state {
            AdapterState::Finished => panic!("polled after completion"),
            _ => {}
        }

        if let Some(completion) = this.shared.recorded.lock().take() {
            // completed; the operation may be reclaimed now
            this.state = AdapterState::Finished;
            return Poll::Ready(completion);
        }

        // we store the waker for future polls, then double-check: the
        // completion may have been recorded concurrently, and the wake
        // for it may have happened before the registration
        this.shared.waker.register(cx.waker());
        if let Some(completion) = this.shared.recorded.lock().take() {
            this.state = AdapterState::Finished;
            return Poll::Ready(completion);
        }
        Poll::Pending
    }
}

impl<S> Drop for SenderFuture<S>
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
{
    fn drop(&mut self) {
        if let AdapterState::Running(_) = &self.state {
            // cancelled mid-flight: hurry the operation and wait for its
            // acknowledgement before the state is torn down. The request
            // runs stop callbacks inline, and those may record the
            // completion, so it must happen before taking the lock.
            self.shared.stop.request_stop();
            let mut recorded = self.shared.recorded.lock();
            while recorded.is_none() {
                self.shared.delivered.wait(&mut recorded);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{SenderExt, just, just_error, never};
    use crate::pass::Pass;
    use crate::scope::Scope;
    use std::convert::Infallible;

    /// Await a value through the adapter
    #[tokio::test]
    async fn test_await_value() {
        let out = just(5).then(|v| v + 1).into_future().await;
        assert_eq!(out.value(), Some(6));
    }

    /// Errors come out as Completion::Error
    #[tokio::test]
    async fn test_await_error() {
        let out = just_error::<u32, &str>("nope").into_future().await;
        assert_eq!(out.error(), Some("nope"));
    }

    /// Await an eagerly spawned operation
    #[tokio::test]
    async fn test_await_spawned_future() {
        let scope = Scope::new();
        let future = scope.spawn_future(just(11));
        assert_eq!(future.into_future().await.value(), Some(11));
        assert_eq!(scope.join().into_future().await.value(), Some(()));
    }

    /// Await a rendezvous fed from a plain thread
    #[tokio::test]
    async fn test_await_rendezvous() {
        let pass: Arc<Pass<u32, Infallible>> = Arc::new(Pass::new());
        let feeder = {
            let pass = pass.clone();
            std::thread::spawn(move || {
                while pass.try_call(23).is_err() {
                    std::thread::yield_now();
                }
            })
        };
        let out = pass.async_accept().into_future().await;
        assert_eq!(out.value(), Some(23));
        feeder.join().unwrap();
    }

    /// Dropping the adapter cancels the operation and waits for done
    #[tokio::test]
    async fn test_drop_cancels() {
        let scope = Scope::new();
        {
            let fut = scope
                .spawn_future(never::<u32, Infallible>())
                .into_future();
            // poll it once so the operation starts, then drop it
            futures::future::select(Box::pin(fut), Box::pin(std::future::ready(()))).await;
        }
        assert_eq!(scope.join().into_future().await.value(), Some(()));
    }
}
