use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;

/// Manually managed storage for a value whose lifetime is driven by an
/// operation's state machine rather than by scope.
///
/// The slot itself never tracks whether it is initialized; the state
/// variable of the surrounding operation is the tag. It is the wrapper's
/// responsibility to call [`drop_in_place`](ManualSlot::drop_in_place) for
/// exactly the slots its state says are live.
pub(crate) struct ManualSlot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> ManualSlot<T> {
    pub(crate) const fn new() -> Self {
        Self {
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Writes a value into the slot.
    ///
    /// # Safety
    /// - Caller must ensure no concurrent access to the slot
    /// - Will overwrite any existing value without dropping it
    #[inline]
    pub(crate) unsafe fn write(&self, value: T) {
        unsafe { ptr::write((*self.value.get()).as_mut_ptr(), value) };
    }

    /// Drops the value in place.
    ///
    /// # Safety
    /// - Caller must ensure the slot contains initialized data
    #[inline]
    pub(crate) unsafe fn drop_in_place(&self) {
        unsafe { ptr::drop_in_place((*self.value.get()).as_mut_ptr()) };
    }

    /// Returns a raw pointer to the (possibly uninitialized) value.
    #[inline]
    pub(crate) fn as_mut_ptr(&self) -> *mut T {
        unsafe { (*self.value.get()).as_mut_ptr() }
    }
}

// Safe: access discipline is enforced by the wrapper's state machine
unsafe impl<T: Send> Send for ManualSlot<T> {}
unsafe impl<T: Send> Sync for ManualSlot<T> {}

#[cfg(test)]
mod slot_test {
    use super::*;

    /// Test read and write in the slot
    #[test]
    fn test_rw() {
        let slot = ManualSlot::<i32>::new();
        let val = 28392;
        unsafe {
            slot.write(val);
            let out = ptr::read(slot.as_mut_ptr());
            assert_eq!(out, val)
        };
    }

    /// Overwriting without reading must not touch the previous value
    #[test]
    fn test_overwrite_does_not_drop() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counter(Arc<AtomicUsize>);
        impl Drop for Counter {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let slot = ManualSlot::new();
        unsafe {
            slot.write(Counter(drops.clone()));
            slot.write(Counter(drops.clone()));
            assert_eq!(drops.load(Ordering::SeqCst), 0);
            slot.drop_in_place();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
