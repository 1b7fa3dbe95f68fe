use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use super::{AnyScheduler, Job, RawScheduler};

struct WorkerState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Worker {
    state: Mutex<WorkerState>,
    available: Condvar,
}

impl Worker {
    fn run(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        break job;
                    }
                    if state.shutdown {
                        return;
                    }
                    self.available.wait(&mut state);
                }
            };
            job();
        }
    }
}

impl RawScheduler for Worker {
    fn submit(&self, job: Job) {
        let mut state = self.state.lock();
        state.jobs.push_back(job);
        self.available.notify_one();
    }
}

/// A single dedicated worker thread draining a job queue, exposed as a
/// scheduler.
///
/// This is the reference execution context used throughout the tests:
/// everything submitted through [`scheduler`](SingleThreadContext::scheduler)
/// runs on the one worker thread, in order.
///
/// Dropping the context stops the worker after the already-queued jobs
/// have drained and joins the thread. Jobs submitted through a scheduler
/// handle that outlives the context are silently dropped.
pub struct SingleThreadContext {
    worker: Arc<Worker>,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl Default for SingleThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadContext {
    pub fn new() -> Self {
        let worker = Arc::new(Worker {
            state: Mutex::new(WorkerState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let runner = worker.clone();
        let handle = thread::Builder::new()
            .name("telaio-worker".into())
            .spawn(move || runner.run())
            .expect("failed to spawn scheduler thread");
        let thread_id = handle.thread().id();
        Self {
            worker,
            thread_id,
            handle: Some(handle),
        }
    }

    /// A scheduler handle submitting onto this context's thread.
    pub fn scheduler(&self) -> AnyScheduler {
        AnyScheduler::new(self.worker.clone())
    }

    /// The worker thread's id, for affinity assertions.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl Drop for SingleThreadContext {
    fn drop(&mut self) {
        {
            let mut state = self.worker.state.lock();
            state.shutdown = true;
            self.worker.available.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
