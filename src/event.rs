//! One-shot, multi-waiter manual-reset event.
//!
//! The entire event is a single atomic pointer with three meanings:
//!
//! | value                | meaning                         |
//! |----------------------|---------------------------------|
//! | null                 | unset, no waiters               |
//! | the event's own address | set                          |
//! | anything else        | unset, head of the waiter stack |
//!
//! Waiters are intrusive: a [`Waiter`] node lives inside a pinned
//! operation state, and resuming it hands control back to that operation
//! through a raw function pointer. `set()` publishes every write made
//! before it (release on the swap) to every waiter it resumes and to
//! every later [`try_enqueue`](Event::try_enqueue) that observes the set
//! state.

use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

/// An intrusive continuation registered with an [`Event`].
///
/// `resume` is invoked exactly once, with `data`, either by the thread
/// that sets the event or inline by the enqueuer when the event was
/// already set. It may free the node.
pub(crate) struct Waiter {
    resume: unsafe fn(*mut ()),
    data: *mut (),
    next: UnsafeCell<*mut Waiter>,
}

impl Waiter {
    pub(crate) fn new(resume: unsafe fn(*mut ()), data: *mut ()) -> Self {
        Self {
            resume,
            data,
            next: UnsafeCell::new(ptr::null_mut()),
        }
    }

    /// Placeholder for nodes built before the operation knows its own
    /// address; overwritten at start.
    pub(crate) fn empty() -> Self {
        unsafe fn unreachable_resume(_: *mut ()) {
            debug_assert!(false, "resumed a waiter that was never armed");
        }
        Self::new(unreachable_resume, ptr::null_mut())
    }
}

pub(crate) struct Event {
    state: AtomicPtr<Waiter>,
}

impl Event {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The event uses its own address as the "set" sentinel; it can never
    /// collide with a real waiter node.
    fn set_sentinel(&self) -> *mut Waiter {
        (self as *const Event as *mut Event).cast()
    }

    /// Whether the event has been set. Acquire: observing `true` also
    /// observes every write made before the corresponding `set()`.
    pub(crate) fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire) == self.set_sentinel()
    }

    /// Sets the event and resumes every registered waiter, on this
    /// thread, in LIFO registration order. Idempotent.
    pub(crate) fn set(&self) {
        let prev = self.state.swap(self.set_sentinel(), Ordering::AcqRel);
        if prev == self.set_sentinel() {
            return;
        }

        let mut node = prev;
        while !node.is_null() {
            // read the link first: resuming may free the node
            unsafe {
                let next = *(*node).next.get();
                ((*node).resume)((*node).data);
                node = next;
            }
        }
    }

    /// Registers `waiter`, returning false if the event is already set
    /// (in which case the caller resumes itself inline and the node is
    /// not touched).
    ///
    /// # Safety
    ///
    /// On success the event owns the node until `set()` runs; the node
    /// (and the operation it points into) must stay pinned and live for
    /// at least that long.
    pub(crate) unsafe fn try_enqueue(&self, waiter: NonNull<Waiter>) -> bool {
        let mut head = self.state.load(Ordering::Acquire);
        loop {
            if head == self.set_sentinel() {
                return false;
            }
            unsafe { *waiter.as_ref().next.get() = head };
            match self.state.compare_exchange_weak(
                head,
                waiter.as_ptr(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => head = observed,
            }
        }
    }
}
