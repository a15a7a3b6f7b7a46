use crate::job::{self, Job};
use crate::queue::SpinQueue;
use crate::JobSystem;
use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

thread_local! {
    /// `None` until a thread becomes worker 0 (via `join_as_worker` or
    /// `run_job`) or is spawned by `JobSystem::new` as one of the background
    /// workers. Used to pick which global queue `Schedule` targets and which
    /// local queue `ScheduleForThread` can reach without a round trip.
    static THREAD_INDEX: Cell<Option<usize>> = Cell::new(None);

    /// The job currently executing on this thread, if any. Drives implicit
    /// parenting for `Schedule`/`Continuation` calls made from inside a
    /// functor.
    static RUNNING_JOB: Cell<*mut Job> = Cell::new(std::ptr::null_mut());
}

pub(crate) fn thread_index() -> Option<usize> {
    THREAD_INDEX.with(Cell::get)
}

pub(crate) fn set_thread_index(index: usize) {
    THREAD_INDEX.with(|cell| cell.set(Some(index)));
}

pub(crate) fn running_job() -> Option<*mut Job> {
    RUNNING_JOB.with(|cell| {
        let ptr = cell.get();
        if ptr.is_null() {
            None
        } else {
            Some(ptr)
        }
    })
}

pub(crate) fn set_running_job(ptr: *mut Job) {
    RUNNING_JOB.with(|cell| cell.set(ptr));
}

pub(crate) fn clear_running_job() {
    RUNNING_JOB.with(|cell| cell.set(std::ptr::null_mut()));
}

/// A worker's two queues: `local` only ever receives jobs explicitly
/// affinitized to this worker via `ScheduleForThread` and is never stolen
/// from; `global` receives ordinary scheduled work and is fair game for
/// every worker's steal scan, including its own.
pub(crate) struct WorkerQueues {
    pub(crate) local: SpinQueue,
    pub(crate) global: SpinQueue,
}

impl WorkerQueues {
    pub(crate) fn new() -> Self {
        Self {
            local: SpinQueue::new(),
            global: SpinQueue::new(),
        }
    }
}

pub(crate) enum WorkResult {
    Executed,
    Housekeeping,
    Idle,
}

/// Runs a job popped off a queue with a panic boundary around it: a
/// poisoned job graph (a counter decremented only partway through the
/// completion protocol) cannot be recovered into a valid state, so a
/// functor panic here is logged and turns into a process abort rather than
/// unwinding past `execute`. A job driven directly by `run_job` (never
/// queued) does not go through this path; its panics propagate normally to
/// the caller.
fn run_caught(job: crate::job::JobHandle, jobsystem: &JobSystem) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        job::execute(job, jobsystem);
    }));

    if result.is_err() {
        crate::js_error!("job functor panicked; aborting");
        std::process::abort();
    }
}

impl JobSystem {
    /// One pass of the work-stealing algorithm for worker `index` (spec
    /// §4.4): local queue first, then each worker's global queue in
    /// round-robin order starting from this worker's own, then a bounded
    /// delete-list drain, else idle.
    pub(crate) fn work_as(&self, index: usize) -> WorkResult {
        if let Some(job) = self.queues[index].local.pop() {
            run_caught(job, self);
            return WorkResult::Executed;
        }

        let worker_count = self.queues.len();
        for offset in 0..worker_count {
            let target = (index + offset) % worker_count;
            if let Some(job) = self.queues[target].global.pop() {
                run_caught(job, self);
                return WorkResult::Executed;
            }
        }

        if self.cache.drain_delete_list(&self.pool) {
            return WorkResult::Housekeeping;
        }

        WorkResult::Idle
    }

    /// Blocks the calling thread for at most ~1ms, or until woken by a
    /// scheduling call, whichever is first (spec §4.6).
    pub(crate) fn cooperative_sleep(&self) {
        let mut guard = self.sleep_mutex.lock();
        self.sleep_condvar.wait_for(&mut guard, Self::SLEEP_QUANTUM);
    }

    /// Runs worker `index`'s main loop until `stop()` is called. Shared by
    /// spawned background workers and by `join_as_worker`, which runs this
    /// on the calling thread as worker 0.
    pub(crate) fn run_worker_loop(&self, index: usize) {
        while !self.stopped.load(Ordering::Acquire) {
            if let WorkResult::Idle = self.work_as(index) {
                self.cooperative_sleep();
            }
        }
    }
}

/// A spawned background worker thread (workers 1..worker_count; worker 0 is
/// always the thread that calls `join_as_worker` or `run_job`).
pub(crate) struct WorkerThread {
    thread: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub(crate) fn spawn(index: usize, jobsystem: Arc<JobSystem>) -> Self {
        let name = format!("Worker Thread {}", index);
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                crate::thread::set_thread_name(thread::current().id(), name);
                set_thread_index(index);
                jobsystem.run_worker_loop(index);
            })
            .expect("failed to spawn job system worker thread");

        Self { thread: Some(thread) }
    }

    pub(crate) fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
