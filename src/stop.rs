//! Stop sources, tokens and callbacks.
//!
//! Cancellation in this crate is a *request*, never a force: a stop
//! source flips a flag and runs the registered callbacks; operations
//! decide how to honour it, with the contract that they complete (with
//! any of value, error, done) in bounded time once requested.
//!
//! A token has three observable states:
//!
//! | state | meaning |
//! |-------|---------|
//! | `stop_possible() == false` | detached token, no stop will ever come |
//! | possible, not requested    | a source exists and has not fired |
//! | `stop_requested()`         | the source fired; callbacks have run or are running |
//!
//! The subtle part is callback teardown: dropping a [`StopCallback`]
//! guard synchronizes with any in-flight invocation of its callback.
//! After the drop returns, the callback is guaranteed not to run and not
//! to be running, with one deliberate exception: a callback may tear down
//! its *own* guard from inside its invocation (the typical pattern is a
//! callback that completes an operation, and completing the operation
//! drops the guard). Re-entrant self-teardown returns immediately instead
//! of deadlocking.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

type Callback = Box<dyn FnOnce() + Send>;

struct Entry {
    id: u64,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
    next_id: u64,
    /// The callback currently being invoked, and by which thread.
    running: Option<(u64, ThreadId)>,
}

struct Shared {
    stopped: AtomicBool,
    registry: Mutex<Registry>,
    /// Signalled whenever `running` is cleared.
    unblock: Condvar,
}

/// The requesting side of a cancellation channel.
///
/// Cloning a source yields another handle to the same underlying state;
/// any handle may request stop. The source is typically owned by the
/// entity that decides cancellation (a scope, a spawned operation) while
/// its tokens travel to the operations that observe it.
#[derive(Clone)]
pub struct StopSource {
    shared: Arc<Shared>,
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSource {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                stopped: AtomicBool::new(false),
                registry: Mutex::new(Registry::default()),
                unblock: Condvar::new(),
            }),
        }
    }

    /// Requests stop. Returns true if this call was the transition;
    /// subsequent calls are no-ops.
    ///
    /// The transitioning call runs every registered callback, one at a
    /// time, on the calling thread, outside the registration lock.
    pub fn request_stop(&self) -> bool {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mut registry = self.shared.registry.lock();
        while let Some(entry) = registry.entries.pop() {
            registry.running = Some((entry.id, thread::current().id()));
            drop(registry);

            (entry.callback)();

            registry = self.shared.registry.lock();
            registry.running = None;
            self.shared.unblock.notify_all();
        }
        true
    }

    /// Whether stop has been requested on this source.
    pub fn stop_requested(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// A token observing this source.
    pub fn token(&self) -> StopToken {
        StopToken {
            shared: Some(self.shared.clone()),
        }
    }

    /// Funnels stop requests observed through `token` into this source.
    ///
    /// This is how per-operation sources combine several upstream
    /// cancellation channels (a scope's, a receiver's) into the one token
    /// the operation actually watches. The returned guard keeps the
    /// forwarding alive.
    #[must_use]
    pub fn forward_from(&self, token: &StopToken) -> StopCallback {
        let stop = self.clone();
        token.register(move || {
            stop.request_stop();
        })
    }
}

/// The observing side of a cancellation channel, obtained from a
/// [`StopSource`] or via a receiver query.
#[derive(Clone)]
pub struct StopToken {
    shared: Option<Arc<Shared>>,
}

impl StopToken {
    /// A token with no source behind it. `stop_possible()` is false and
    /// registration is a no-op.
    pub fn never() -> Self {
        Self { shared: None }
    }

    /// Whether a stop request can ever be observed through this token.
    pub fn stop_possible(&self) -> bool {
        self.shared.is_some()
    }

    /// Whether stop has been requested.
    pub fn stop_requested(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.stopped.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Registers `callback` to run when stop is requested, returning a
    /// guard that deregisters it on drop.
    ///
    /// If stop has already been requested, `callback` runs synchronously
    /// on this thread before `register` returns, and the returned guard
    /// is inert.
    #[must_use]
    pub fn register<F>(&self, callback: F) -> StopCallback
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(shared) = &self.shared else {
            return StopCallback { shared: None, id: 0 };
        };

        if shared.stopped.load(Ordering::Acquire) {
            callback();
            return StopCallback { shared: None, id: 0 };
        }

        let mut registry = shared.registry.lock();
        // the source may have fired while we waited for the lock, in
        // which case the list has already been drained and our entry
        // would never run
        if shared.stopped.load(Ordering::Acquire) {
            drop(registry);
            callback();
            return StopCallback { shared: None, id: 0 };
        }

        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push(Entry {
            id,
            callback: Box::new(callback),
        });
        StopCallback {
            shared: Some(shared.clone()),
            id,
        }
    }
}

/// RAII registration of a stop callback.
///
/// Dropping the guard removes the callback if it has not run. If the
/// callback is being invoked on another thread at that moment, the drop
/// blocks until the invocation returns; dropping from inside the
/// callback's own invocation returns immediately.
pub struct StopCallback {
    shared: Option<Arc<Shared>>,
    id: u64,
}

impl Drop for StopCallback {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };

        let mut registry = shared.registry.lock();
        if let Some(pos) = registry.entries.iter().position(|e| e.id == self.id) {
            registry.entries.swap_remove(pos);
            return;
        }

        // not in the list: the callback either finished already or is
        // running right now
        loop {
            match registry.running {
                Some((id, tid)) if id == self.id => {
                    if tid == thread::current().id() {
                        // self-teardown from inside the callback
                        return;
                    }
                    shared.unblock.wait(&mut registry);
                }
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Callbacks registered before the request run exactly once
    #[test]
    fn test_runs_on_request() {
        let fired = Arc::new(AtomicUsize::new(0));
        let source = StopSource::new();
        let f = fired.clone();
        let _guard = source.token().register(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!source.token().stop_requested());
        assert!(source.request_stop());
        assert!(!source.request_stop());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    /// Registering on an already-stopped token runs the callback inline
    #[test]
    fn test_inline_when_already_stopped() {
        let source = StopSource::new();
        source.request_stop();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let _guard = source.token().register(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    /// A dropped guard must prevent its callback from ever running
    #[test]
    fn test_deregistered_never_runs() {
        let fired = Arc::new(AtomicUsize::new(0));
        let source = StopSource::new();
        let f = fired.clone();
        let guard = source.token().register(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        drop(guard);
        source.request_stop();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    /// Requests forwarded between sources reach the downstream token
    #[test]
    fn test_forward_from() {
        let upstream = StopSource::new();
        let combined = StopSource::new();
        let _guard = combined.forward_from(&upstream.token());

        assert!(!combined.stop_requested());
        upstream.request_stop();
        assert!(combined.stop_requested());
    }

    /// Dropping the forwarding guard severs the link
    #[test]
    fn test_forward_from_severed() {
        let upstream = StopSource::new();
        let combined = StopSource::new();
        drop(combined.forward_from(&upstream.token()));

        upstream.request_stop();
        assert!(!combined.stop_requested());
    }

    /// The never token observes nothing and registration is inert
    #[test]
    fn test_never_token() {
        let token = StopToken::never();
        assert!(!token.stop_possible());
        assert!(!token.stop_requested());
        let _guard = token.register(|| panic!("must not run"));
    }

    /// Guard teardown must wait for an in-flight invocation on another thread
    #[test]
    fn test_drop_synchronizes_with_invocation() {
        let source = StopSource::new();
        let entered = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let (e, f) = (entered.clone(), finished.clone());
        let guard = source.token().register(move || {
            e.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            f.store(true, Ordering::SeqCst);
        });

        let requester = {
            let source = source.clone();
            std::thread::spawn(move || {
                source.request_stop();
            })
        };

        while !entered.load(Ordering::SeqCst) {
            std::hint::spin_loop();
        }

        // the callback is running; this drop must block until it returns
        drop(guard);
        assert!(finished.load(Ordering::SeqCst));

        requester.join().unwrap();
    }

    /// Cross-thread visibility: writes before request_stop are visible in the callback
    #[test]
    fn test_release_acquire_pairing() {
        let source = StopSource::new();
        let data = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(AtomicUsize::new(0));

        let (d, s) = (data.clone(), seen.clone());
        let _guard = source.token().register(move || {
            s.store(d.load(Ordering::Relaxed), Ordering::SeqCst);
        });

        let handle = {
            let source = source.clone();
            let data = data.clone();
            std::thread::spawn(move || {
                data.store(7, Ordering::Relaxed);
                source.request_stop();
            })
        };
        handle.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
