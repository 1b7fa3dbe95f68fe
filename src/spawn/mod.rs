//! Eagerly started operations owned by a scope.
//!
//! [`Scope::spawn_future`] connects and starts a sender immediately,
//! heap-allocating a self-owned operation and handing back a
//! [`SpawnedFuture`] through which the result can be observed, cancelled
//! or abandoned. [`Scope::spawn_detached`] is the same machinery with no
//! handle at all.
//!
//! ## Allocation layout
//!
//! One allocation per spawn, laid out allocator first:
//!
//! ```text
//! [ allocator  ]
//! [ header     ]  state, refcount, event, stop source, result union,
//!                 type-erased destroy/delete fn pointers
//! [ nested op  ]  the operation produced by connect(sender, ...)
//! ```
//!
//! The receiver embedded in the nested operation only knows the header's
//! address; the two fn pointers stored there recover the full allocation
//! (and the allocator inside it) by fixed offset, so the header stays
//! independent of the sender's concrete type.
//!
//! ## Lifecycle
//!
//! The header's atomic state moves through
//! `init → {value, error, done, abandoned} → complete`; who performs
//! each edge and who ends up deleting the allocation is governed by a
//! refcount: two owners while a future is attached (operation + future),
//! one when detached. The final decrement runs the type-erased deleter
//! and then releases the scope reservation.

mod future;

pub use future::{FutureOp, SpawnedFuture};

use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::mem::{self, ManuallyDrop, offset_of};
use std::pin::Pin;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::event::Event;
use crate::receiver::Receiver;
use crate::scope::{Scope, ScopeRef, ScopeState};
use crate::sender::{OperationState, Sender};
use crate::slot::ManualSlot;
use crate::stop::{StopCallback, StopSource, StopToken};

/// Byte-oriented allocation boundary for spawned operations.
///
/// The user-facing spawn entry points rebind whatever allocator they are
/// given to this byte interface, so the whole spawn machinery is
/// instantiated once per (sender, allocator) pair and the header stays
/// allocator-agnostic.
pub trait RawAllocator: Send + 'static {
    /// Allocates `layout`; never returns null (abort on exhaustion is
    /// acceptable, and is what the global allocator does).
    fn allocate(&self, layout: Layout) -> NonNull<u8>;

    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `layout`.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The global allocator as a [`RawAllocator`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Global;

impl RawAllocator for Global {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        // Safety: spawn layouts are never zero-sized (the header alone
        // is not)
        let ptr = unsafe { alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// Lifecycle states of a spawned operation. The atomic state field is
/// also the tag for the result union in the header.
pub(crate) mod state {
    /// Constructed, possibly running.
    pub const INIT: u8 = 0;
    /// The attached future was cancelled before the operation completed.
    pub const ABANDONED: u8 = 1;
    /// Completed with a value; the union holds it.
    pub const VALUE: u8 = 2;
    /// Completed with an error; the union holds it.
    pub const ERROR: u8 = 3;
    /// Completed with done; nothing stored.
    pub const DONE: u8 = 4;
    /// Terminal: the side that observes this owes nothing further; the
    /// union is empty (never filled, or already consumed).
    pub const COMPLETE: u8 = 5;
}

pub(crate) union SpawnResult<V, E> {
    pub(crate) value: ManuallyDrop<V>,
    pub(crate) error: ManuallyDrop<E>,
    pub(crate) empty: (),
}

/// The sender-independent part of a spawned operation.
pub(crate) struct SpawnHeader<V, E> {
    /// See [`state`]; tags the result union.
    pub(crate) state: AtomicU8,
    /// Written before start, read-only afterwards.
    detached: bool,
    /// Two while a future is attached, one when detached; zero deletes.
    refcount: AtomicUsize,
    /// Fired once the result (or abandonment) is recorded.
    pub(crate) evt: Event,
    /// Stop source for the spawned work; fed by the scope's source and by
    /// the attached future's cancellation.
    pub(crate) stop: StopSource,
    /// The operation's scope reservation; released by the deleter.
    slot: UnsafeCell<Option<ScopeRef>>,
    /// Guard for the scope-level stop propagation, armed at start.
    scope_guard: UnsafeCell<Option<StopCallback>>,
    pub(crate) result: UnsafeCell<SpawnResult<V, E>>,
    /// Drops the nested operation in place.
    destroy_child: unsafe fn(NonNull<SpawnHeader<V, E>>),
    /// Reclaims the result per the given state, then frees the whole
    /// allocation through the stored allocator.
    delete: unsafe fn(NonNull<SpawnHeader<V, E>>, u8),
}

impl<V, E> SpawnHeader<V, E> {
    /// Operation-side completion: try to claim the result slot, store,
    /// reclaim the nested operation, wake the future, release the
    /// operation's reference.
    pub(crate) fn complete(&self, desired: u8, store: impl FnOnce(*mut SpawnResult<V, E>)) {
        match self.state.compare_exchange(
            state::INIT,
            desired,
            // success: the event set below publishes our writes
            Ordering::Relaxed,
            // failure: observe the future's writes before the deleter can
            // possibly run under our feet
            Ordering::Acquire,
        ) {
            Ok(_) => {
                store(self.result.get());
                // reclaim the nested operation before waking the future,
                // which may free the whole allocation from another thread
                // the moment the event fires
                unsafe { (self.destroy_child)(NonNull::from(self)) };
                self.evt.set();
            }
            Err(observed) => {
                // the future abandoned us (or was dropped) first; nothing
                // to store
                debug_assert!(observed == state::ABANDONED || observed == state::COMPLETE);
                unsafe { (self.destroy_child)(NonNull::from(self)) };
            }
        }
        self.decref();
    }

    /// Future-side cancellation of a started, attached operation:
    /// `init → abandoned`, hurry the work along, wake the future so it
    /// can complete with done in parallel with a slow cancellation.
    pub(crate) fn abandon(&self) {
        if self
            .state
            .compare_exchange(
                state::INIT,
                state::ABANDONED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            self.stop.request_stop();
            self.evt.set();
        }
        // on failure the operation already completed; the future will
        // consume that result as if the stop request never happened
    }

    /// Invoked when a future handle goes away without consuming the
    /// result: request stop, hand the result slot to the operation, drop
    /// our reference.
    pub(crate) fn drop_handle(&self) {
        let observed = self.state.load(Ordering::Relaxed);
        // any completion signal was published through the event
        debug_assert!(observed == state::INIT || self.evt.is_set());
        if observed == state::INIT {
            self.stop.request_stop();
            let _ = self.state.compare_exchange(
                state::INIT,
                state::COMPLETE,
                // success: publish the stop request to the operation
                Ordering::Release,
                // failure: the operation completed; the final decref
                // below synchronizes with its writes
                Ordering::Relaxed,
            );
        }
        self.decref();
    }

    /// The scope rejected the spawn: record done so an attached future
    /// completes immediately, and release the operation's reference.
    fn start_failed(&self) {
        self.state.store(state::DONE, Ordering::Relaxed);
        self.evt.set();
        self.decref();
    }

    pub(crate) fn decref(&self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            // sole owner; the acq_rel chain above makes every other
            // side's writes visible before we reclaim
            let observed = self.state.load(Ordering::Relaxed);
            unsafe { (self.delete)(NonNull::from(self), observed) };
        }
    }
}

/// The receiver connected under every spawned sender. Knows only the
/// header.
pub(crate) struct SpawnReceiver<V, E> {
    header: NonNull<SpawnHeader<V, E>>,
}

// Safe: the header outlives the receiver (the operation holds a
// reference until after its completion call returns).
unsafe impl<V: Send, E: Send> Send for SpawnReceiver<V, E> {}

impl<V, E> Receiver for SpawnReceiver<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    type Value = V;
    type Error = E;

    fn set_value(self, value: V) {
        let header = unsafe { self.header.as_ref() };
        header.complete(state::VALUE, move |result| {
            // Safety: the claimed state gives us exclusive access to the
            // union; the state tag now says `value`
            unsafe { (*result).value = ManuallyDrop::new(value) };
        });
    }

    fn set_error(self, error: E) {
        let header = unsafe { self.header.as_ref() };
        if header.detached {
            // nowhere to deliver a detached failure
            std::process::abort();
        }
        header.complete(state::ERROR, move |result| {
            // Safety: as in set_value
            unsafe { (*result).error = ManuallyDrop::new(error) };
        });
    }

    fn set_done(self) {
        let header = unsafe { self.header.as_ref() };
        header.complete(state::DONE, |_| {});
    }

    fn stop_token(&self) -> StopToken {
        unsafe { self.header.as_ref() }.stop.token()
    }
}

/// The full allocation. The allocator leads so the deleter can always
/// find it; the header follows at a fixed offset from the start.
#[repr(C)]
struct SpawnOp<S, A>
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
    A: RawAllocator,
{
    alloc: A,
    header: SpawnHeader<S::Value, S::Error>,
    child: ManualSlot<S::Operation<SpawnReceiver<S::Value, S::Error>>>,
}

/// Recovers the allocation from the header embedded in it.
unsafe fn container_of<S, A>(
    header: NonNull<SpawnHeader<S::Value, S::Error>>,
) -> *mut SpawnOp<S, A>
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
    A: RawAllocator,
{
    unsafe {
        header
            .as_ptr()
            .byte_sub(offset_of!(SpawnOp<S, A>, header))
            .cast::<SpawnOp<S, A>>()
    }
}

unsafe fn destroy_child<S, A>(header: NonNull<SpawnHeader<S::Value, S::Error>>)
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
    A: RawAllocator,
{
    let op = unsafe { container_of::<S, A>(header) };
    // Safety: called exactly once, only on the paths where the nested
    // operation was constructed
    unsafe { (*op).child.drop_in_place() };
}

unsafe fn delete<S, A>(header: NonNull<SpawnHeader<S::Value, S::Error>>, observed: u8)
where
    S: Sender,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
    A: RawAllocator,
{
    let op = unsafe { container_of::<S, A>(header) };
    unsafe {
        let hdr: *mut SpawnHeader<S::Value, S::Error> = &raw mut (*op).header;

        // reclaim whatever the state tag says is live in the union
        match observed {
            state::VALUE => ManuallyDrop::drop(&mut (*(*hdr).result.get()).value),
            state::ERROR => ManuallyDrop::drop(&mut (*(*hdr).result.get()).error),
            _ => {}
        }

        // the reservation is released only after the memory is gone
        let slot = (*(*hdr).slot.get()).take();
        let alloc = ptr::read(&raw const (*op).alloc);

        // the nested operation was reclaimed earlier (or never built);
        // this drops the stop source and deregisters the scope callback
        ptr::drop_in_place(hdr);
        alloc.deallocate(
            NonNull::new_unchecked(op.cast::<u8>()),
            Layout::new::<SpawnOp<S, A>>(),
        );
        drop(slot);
        drop(alloc);
    }
}

/// Frees a partially constructed spawn if connecting the sender panics,
/// restoring the scope accounting (strong guarantee).
struct ConstructionGuard<V, E> {
    header: NonNull<SpawnHeader<V, E>>,
}

impl<V, E> Drop for ConstructionGuard<V, E> {
    fn drop(&mut self) {
        unsafe {
            let header = self.header.as_ref();
            (header.delete)(self.header, state::COMPLETE);
        }
    }
}

/// Allocates, constructs and starts the spawned operation. Returns the
/// header with the caller's (future's) reference already counted in when
/// `detached` is false; for a detached spawn the returned pointer must
/// not be used (the operation may already be gone).
fn spawn_raw<S, A>(
    scope: &Arc<ScopeState>,
    sender: S,
    alloc: A,
    detached: bool,
) -> NonNull<SpawnHeader<S::Value, S::Error>>
where
    S: Sender + Send + 'static,
    S::Value: Send + 'static,
    S::Error: Send + 'static,
    A: RawAllocator,
{
    let layout = Layout::new::<SpawnOp<S, A>>();
    let op = alloc.allocate(layout).cast::<SpawnOp<S, A>>().as_ptr();

    let op_slot = ScopeState::try_record_start(scope);
    let admitted = op_slot.is_some();

    // allocator and header construction cannot unwind
    unsafe {
        (&raw mut (*op).alloc).write(alloc);
        (&raw mut (*op).header).write(SpawnHeader {
            state: AtomicU8::new(state::INIT),
            detached,
            refcount: AtomicUsize::new(if detached { 1 } else { 2 }),
            evt: Event::new(),
            stop: StopSource::new(),
            slot: UnsafeCell::new(op_slot),
            scope_guard: UnsafeCell::new(None),
            result: UnsafeCell::new(SpawnResult { empty: () }),
            destroy_child: destroy_child::<S, A>,
            delete: delete::<S, A>,
        });
    }

    let header = unsafe { NonNull::from(&(*op).header) };

    if !admitted {
        // the scope is closed; there is nothing to run. An attached
        // future observes done; a detached spawn is deleted on the spot.
        unsafe { header.as_ref() }.start_failed();
        return header;
    }

    // connecting runs user code and may unwind; until start we own the
    // rollback
    let guard = ConstructionGuard { header };
    unsafe {
        (*op).child.write(sender.connect(SpawnReceiver { header }));
    }
    mem::forget(guard);

    unsafe {
        // propagate scope-level stop into the operation's own source
        let scope_guard = header.as_ref().stop.forward_from(&scope.stop.token());
        *header.as_ref().scope_guard.get() = Some(scope_guard);

        // Safety: the child is pinned inside the allocation for its whole
        // life and started exactly once; after its completion the
        // machinery above reclaims it
        Pin::new_unchecked(&mut *(*op).child.as_mut_ptr()).start();
    }

    header
}

impl Scope {
    /// Eagerly connects and starts `sender` inside this scope, returning
    /// a future through which the result can be observed.
    ///
    /// If the scope is already closed the sender is not started and the
    /// returned future completes with done.
    pub fn spawn_future<S>(&self, sender: S) -> SpawnedFuture<S::Value, S::Error>
    where
        S: Sender + Send + 'static,
        S::Value: Send + 'static,
        S::Error: Send + 'static,
    {
        self.spawn_future_in(sender, Global)
    }

    /// [`spawn_future`](Scope::spawn_future) with an explicit allocator
    /// for the spawned operation.
    pub fn spawn_future_in<S, A>(&self, sender: S, alloc: A) -> SpawnedFuture<S::Value, S::Error>
    where
        S: Sender + Send + 'static,
        S::Value: Send + 'static,
        S::Error: Send + 'static,
        A: RawAllocator,
    {
        // the future itself is tracked by the scope: reserve its slot
        // first so a close between the two reservations can only strand
        // an operation that completes done, never an unobservable result
        let future_slot = ScopeState::try_record_start(&self.state);
        let header = spawn_raw(&self.state, sender, alloc, false);
        SpawnedFuture::new(header, future_slot)
    }

    /// Eagerly connects and starts `sender` with no way to observe the
    /// result. An error completion aborts the process; value and done
    /// are discarded.
    pub fn spawn_detached<S>(&self, sender: S)
    where
        S: Sender + Send + 'static,
        S::Value: Send + 'static,
        S::Error: Send + 'static,
    {
        self.spawn_detached_in(sender, Global);
    }

    /// [`spawn_detached`](Scope::spawn_detached) with an explicit
    /// allocator.
    pub fn spawn_detached_in<S, A>(&self, sender: S, alloc: A)
    where
        S: Sender + Send + 'static,
        S::Value: Send + 'static,
        S::Error: Send + 'static,
        A: RawAllocator,
    {
        let _ = spawn_raw(&self.state, sender, alloc, true);
    }
}
