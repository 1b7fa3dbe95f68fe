//! Structured asynchronous composition primitives
//!
//! `telaio` is a small protocol core for describing, composing and
//! executing asynchronous work without committing to any runtime. Work
//! is described by [`Sender`]s (lazy descriptions), consumed by
//! [`Receiver`]s (three completion channels plus a query surface), and
//! owned by pinned operation states in between:
//!
//! ```text
//!   sender ── connect(receiver) ──▶ operation ── start ──▶ ... ──▶ set_value
//!   (lazy)                         (pinned, owns              or set_error
//!                                   the work)                 or set_done
//! ```
//!
//! Exactly one completion channel fires per operation; `done` is the
//! cancellation/"nothing happened" channel and is not an error.
//!
//! ## Modules
//!
//! | module | what lives there |
//! |--------|------------------|
//! | [`scope`] | [`Scope`]: refcounted lifetime anchor with a single join point |
//! | [`spawn`] | eager [`Scope::spawn_future`] / [`Scope::spawn_detached`] and the [`SpawnedFuture`] handle |
//! | [`pass`]  | [`Pass`]: single-slot caller/acceptor rendezvous |
//! | [`sched`] | scheduler boundary, inline scheduler, a worker-thread context |
//! | [`algo`]  | the few leaf senders needed to compose the above |
//! | [`stop`]  | stop sources/tokens/callbacks (cancellation is a request) |
//!
//! ## Cancellation
//!
//! Every operation can observe a [`StopToken`] through its receiver.
//! Scopes and spawned operations funnel their own stop sources into the
//! operations they own; a stop request asks the work to finish soon
//! (usually with `done`), it never tears anything down by force.
//!
//! ## Async Support
//!
//! With the `async` feature (default), any sender can be awaited from an
//! async fn via [`SenderExt::into_future`]. The core itself never needs
//! a runtime: [`sync_wait`] drives any sender to completion by parking
//! the calling thread.
//!
//! ## Example
//!
//! ```
//! use telaio::{Scope, SenderExt, just, sync_wait};
//!
//! let scope = Scope::new();
//! let future = scope.spawn_future(just(40).then(|v| v + 2));
//!
//! assert_eq!(sync_wait(future).value(), Some(42));
//! assert_eq!(sync_wait(scope.join()).value(), Some(()));
//! assert_eq!(scope.use_count(), 0);
//! ```

pub mod algo;
mod blocking;
mod completion;
mod event;
pub mod pass;
mod receiver;
pub mod sched;
pub mod scope;
mod sender;
mod slot;
pub mod spawn;
pub mod stop;
mod sync_wait;

#[cfg(feature = "async")]
mod into_future;

pub use algo::{Completer, SenderExt, create, just, just_done, just_error, never, then};
pub use blocking::Blocking;
pub use completion::Completion;
pub use pass::Pass;
pub use receiver::Receiver;
pub use sched::{AnyScheduler, RawScheduler, Scheduler, SingleThreadContext};
pub use scope::Scope;
pub use sender::{OperationState, Sender, connect, start};
pub use spawn::{Global, RawAllocator, SpawnedFuture};
pub use stop::{StopCallback, StopSource, StopToken};
pub use sync_wait::{sync_wait, sync_wait_with};

#[cfg(feature = "async")]
pub use into_future::SenderFuture;
