//! Schedulers and the completion-forwarding boundary.
//!
//! The crate is agnostic to execution contexts: a *scheduler* is anything
//! that can run a job on its context. Two layers expose that:
//!
//! - [`RawScheduler`] is the type-erased boundary — `submit` a boxed job.
//!   [`AnyScheduler`] is a cheap-clone handle over it, and is what
//!   travels through the receiver query channel.
//! - [`Scheduler::schedule`] is the sender-shaped surface: a sender that
//!   completes with `()` on the scheduler's context, or with done if its
//!   receiver's stop token fired before the job ran.
//!
//! Scheduler-affine senders (the pass, notably) never complete their
//! receiver from whichever thread happened to finish the work; they
//! record the completion and submit a *forwarder* job on the receiver's
//! declared scheduler, which performs the real `set_*` call.

mod thread;

pub use thread::SingleThreadContext;

use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};

use crate::blocking::Blocking;
use crate::receiver::Receiver;
use crate::sender::{OperationState, Sender};

/// A unit of work handed across the scheduler boundary.
pub type Job = Box<dyn FnOnce() + Send>;

/// The type-erased execution-context boundary.
///
/// Implementations run submitted jobs on their context, each at most
/// once, in submission order for jobs submitted from one thread.
pub trait RawScheduler: Send + Sync + 'static {
    fn submit(&self, job: Job);
}

/// A cheap-clone, type-erased scheduler handle.
///
/// This is the currency of the receiver query channel: receivers answer
/// [`Receiver::scheduler`] with one of these, and affine senders deliver
/// completions through it.
#[derive(Clone)]
pub struct AnyScheduler {
    raw: Arc<dyn RawScheduler>,
}

impl AnyScheduler {
    pub fn new(raw: Arc<dyn RawScheduler>) -> Self {
        Self { raw }
    }

    /// The degenerate scheduler: jobs run immediately on the submitting
    /// thread.
    pub fn inline() -> Self {
        static INLINE: LazyLock<AnyScheduler> = LazyLock::new(|| AnyScheduler {
            raw: Arc::new(InlineScheduler),
        });
        INLINE.clone()
    }

    pub fn submit(&self, job: Job) {
        self.raw.submit(job);
    }
}

impl fmt::Debug for AnyScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyScheduler").finish_non_exhaustive()
    }
}

struct InlineScheduler;

impl RawScheduler for InlineScheduler {
    fn submit(&self, job: Job) {
        job();
    }
}

/// Types whose `schedule()` yields a sender completing on their context.
pub trait Scheduler: Clone + Send + 'static {
    type Schedule: Sender<Value = (), Error = Infallible>;

    fn schedule(&self) -> Self::Schedule;
}

impl Scheduler for AnyScheduler {
    type Schedule = ScheduleSender;

    fn schedule(&self) -> ScheduleSender {
        ScheduleSender {
            sched: self.clone(),
        }
    }
}

/// Sender that completes with `()` on its scheduler's context.
///
/// The stop token is observed at execution time: if stop was requested
/// before the job runs, the operation completes with done instead.
#[must_use = "senders do nothing unless connected and started"]
pub struct ScheduleSender {
    sched: AnyScheduler,
}

impl Sender for ScheduleSender {
    type Value = ();
    type Error = Infallible;

    const SENDS_DONE: bool = true;

    type Operation<R>
        = ScheduleOp<R>
    where
        R: Receiver<Value = (), Error = Infallible>;

    fn connect<R>(self, receiver: R) -> ScheduleOp<R>
    where
        R: Receiver<Value = (), Error = Infallible>,
    {
        ScheduleOp {
            sched: self.sched,
            receiver: Some(receiver),
        }
    }

    fn blocking(&self) -> Blocking {
        Blocking::Maybe
    }
}

pub struct ScheduleOp<R> {
    sched: AnyScheduler,
    receiver: Option<R>,
}

// Safety: start consumes the receiver into a heap job; nothing here is
// address-sensitive and the receiver is used at most once.
unsafe impl<R> OperationState for ScheduleOp<R>
where
    R: Receiver<Value = (), Error = Infallible>,
{
    fn start(self: Pin<&mut Self>) {
        // Safety: no field is structurally pinned; we only move owned
        // parts out.
        let this = unsafe { self.get_unchecked_mut() };
        let Some(receiver) = this.receiver.take() else {
            debug_assert!(false, "operation started twice");
            return;
        };
        let token = receiver.stop_token();
        this.sched.submit(Box::new(move || {
            if token.stop_requested() {
                receiver.set_done();
            } else {
                receiver.set_value(());
            }
        }));
    }
}
