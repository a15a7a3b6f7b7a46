//! A fork-join job scheduler for soft-realtime workloads: a fixed pool of
//! worker threads pulling from per-worker spinlocked queues, work-stealing
//! across workers, implicit parent/child dependency tracking, deferred
//! continuations, and a pooled allocator for the job records themselves.
//!
//! Jobs are scheduled with [`JobSystem::schedule`] (and its
//! [`JobSystem::schedule_detached`] / [`JobSystem::schedule_for_thread`]
//! variants); a job may register a [`JobSystem::continuation`] while it
//! runs, and a thread that needs to drive one job (and its continuation
//! chain) to completion without blocking calls [`JobSystem::run_job`].

pub mod allocator;
pub mod job;
pub mod logger;
mod queue;
mod thread;
mod worker;

#[cfg(test)]
mod tests;

use crate::allocator::{JobCache, Pool};
use crate::job::{JobHandle, FUNCTOR_CAPACITY};
use crate::worker::{WorkResult, WorkerQueues, WorkerThread};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::fmt::{self, Debug, Formatter};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

static GLOBAL_JOBSYSTEM: OnceCell<Arc<JobSystem>> = OnceCell::new();

/// Returns the process-wide job system installed by [`initialize_global`].
///
/// # Panics
/// Panics if no global job system has been initialized yet.
pub fn global() -> &'static Arc<JobSystem> {
    GLOBAL_JOBSYSTEM
        .get()
        .unwrap_or_else(|| js_fatal!("global job system was not initialized"))
}

/// Installs `jobsystem` as the process-wide instance returned by [`global`].
///
/// # Panics
/// Panics if a global job system has already been installed.
pub fn initialize_global(jobsystem: Arc<JobSystem>) {
    if GLOBAL_JOBSYSTEM.set(jobsystem).is_err() {
        js_fatal!("global job system was already initialized");
    }
}

/// Like [`initialize_global`], but returns the rejected instance instead of
/// panicking if one was already installed.
pub fn try_initialize_global(jobsystem: Arc<JobSystem>) -> Result<(), Arc<JobSystem>> {
    GLOBAL_JOBSYSTEM.set(jobsystem)
}

/// A fixed-size pool of worker threads sharing one set of per-worker queues,
/// one job allocator, and one sleep/wake condvar.
pub struct JobSystem {
    queues: Vec<WorkerQueues>,
    cache: JobCache,
    pool: Pool,
    sleep_mutex: Mutex<()>,
    sleep_condvar: Condvar,
    stopped: AtomicBool,
    workers: Mutex<Option<Vec<WorkerThread>>>,
    worker_count: usize,
}

impl Debug for JobSystem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSystem")
            .field("worker_count", &self.worker_count)
            .field("blocks_allocated", &self.pool.blocks_allocated())
            .finish()
    }
}

impl JobSystem {
    const SLEEP_QUANTUM: Duration = Duration::from_millis(1);

    /// Creates a job system with `worker_count` workers (clamped to at
    /// least 1) and immediately spawns `worker_count - 1` background
    /// worker threads; the calling thread (or whichever thread later calls
    /// [`JobSystem::join_as_worker`] or [`JobSystem::run_job`] first)
    /// becomes worker 0.
    pub fn new(worker_count: usize) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        js_info!("starting job system with {} workers", worker_count);

        let queues = (0..worker_count).map(|_| WorkerQueues::new()).collect();

        let jobsystem = Arc::new(Self {
            queues,
            cache: JobCache::new(),
            pool: Pool::new(),
            sleep_mutex: Mutex::new(()),
            sleep_condvar: Condvar::new(),
            stopped: AtomicBool::new(false),
            workers: Mutex::new(None),
            worker_count,
        });

        let spawned = (1..worker_count)
            .map(|index| WorkerThread::spawn(index, Arc::clone(&jobsystem)))
            .collect();
        *jobsystem.workers.lock() = Some(spawned);

        jobsystem
    }

    /// Number of logical CPUs available, for callers sizing their worker
    /// count; mirrors the reference scheduler's own `cpu_thread_count`.
    pub fn cpu_thread_count() -> usize {
        num_cpus::get()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// The calling thread's worker index, if it has one (a spawned worker,
    /// or a thread that has called `join_as_worker`/`run_job`).
    pub fn current_worker_index(&self) -> Option<usize> {
        crate::worker::thread_index()
    }

    fn current_worker_or_zero(&self) -> usize {
        crate::worker::thread_index().unwrap_or(0)
    }

    /// Runs the calling thread as worker 0 until [`JobSystem::stop`] is
    /// called, processing jobs exactly like a spawned background worker.
    pub fn join_as_worker(&self) {
        if crate::worker::thread_index().is_none() {
            crate::worker::set_thread_index(0);
        }
        self.run_worker_loop(0);
    }

    /// Signals every worker to exit its loop after its current unit of
    /// work. Does not block for them to exit; `Drop` joins them.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.sleep_condvar.notify_all();
    }

    fn push_global(&self, worker: usize, job: JobHandle) {
        self.queues[worker].global.push(job);
        self.sleep_condvar.notify_all();
    }

    /// Materializes a functor into a job record: allocates (or reuses) a
    /// `Job`, writes the functor into its inline storage, and wires up the
    /// parent link if one was supplied. Shared by every submission API.
    fn materialize<F>(&self, f: F, parent: Option<JobHandle>, pinned: bool) -> JobHandle
    where
        F: FnOnce(&JobSystem, &JobHandle) + Send + 'static,
    {
        if mem::size_of::<F>() > FUNCTOR_CAPACITY {
            js_fatal!(
                "functor of {} bytes exceeds the {}-byte inline job capacity",
                mem::size_of::<F>(),
                FUNCTOR_CAPACITY
            );
        }

        let ptr = self.cache.allocate(&self.pool, self as *const JobSystem);

        unsafe {
            let job = &mut *ptr;
            job.parent = None;
            job.continuation = None;
            job.jobs_left = AtomicU32::new(1);
            job.refcount = AtomicU32::new(0);
            job.pinned = pinned;

            let userdata_ptr = job.userdata.as_mut_ptr() as *mut F;
            userdata_ptr.write(f);
            job.functor_active = true;

            job.function = Some(|handle: &JobHandle| unsafe {
                let job = &mut *handle.ptr;
                let userdata_ptr = job.userdata.as_mut_ptr() as *mut F;
                job.functor_active = false;
                let func = userdata_ptr.read();
                let jobsystem = &*job.jobsystem;
                func(jobsystem, handle);
            });
        }

        let handle = JobHandle::new(ptr);

        if let Some(parent) = parent {
            parent.jobs_left.fetch_add(1, Ordering::AcqRel);
            unsafe {
                (*ptr).parent = Some(parent);
            }
        }

        handle
    }

    /// Schedules `f` as a new job on the current worker's global queue,
    /// implicitly parented to the ambient running job if one exists (spec
    /// §4.2's `Schedule`).
    pub fn schedule<F>(&self, f: F) -> JobHandle
    where
        F: FnOnce(&JobSystem, &JobHandle) + Send + 'static,
    {
        let parent = crate::worker::running_job().map(JobHandle::new);
        let job = self.materialize(f, parent, false);
        self.push_global(self.current_worker_or_zero(), job.clone());
        job
    }

    /// Like [`JobSystem::schedule`], but never inherits the ambient running
    /// job as a parent, even if one exists.
    pub fn schedule_detached<F>(&self, f: F) -> JobHandle
    where
        F: FnOnce(&JobSystem, &JobHandle) + Send + 'static,
    {
        let job = self.materialize(f, None, false);
        self.push_global(self.current_worker_or_zero(), job.clone());
        job
    }

    /// Schedules `f` onto `worker`'s local queue, which only that worker
    /// ever pops from. Still inherits the ambient running job as a parent.
    ///
    /// # Panics
    /// Panics if `worker` is out of range.
    pub fn schedule_for_thread<F>(&self, worker: usize, f: F) -> JobHandle
    where
        F: FnOnce(&JobSystem, &JobHandle) + Send + 'static,
    {
        assert!(
            worker < self.worker_count,
            "worker index {} out of range (0..{})",
            worker,
            self.worker_count
        );

        let parent = crate::worker::running_job().map(JobHandle::new);
        let job = self.materialize(f, parent, false);
        self.queues[worker].local.push(job.clone());
        self.sleep_condvar.notify_all();
        job
    }

    /// Registers `f` as the ambient running job's continuation: once the
    /// running job and all of its children finish, `f` runs next, inheriting
    /// the running job's parent.
    ///
    /// Calling this more than once for the same running job overwrites the
    /// previously registered continuation without freeing it; debug builds
    /// assert against this rather than silently leaking it.
    ///
    /// # Panics
    /// Panics if called with no ambient running job.
    pub fn continuation<F>(&self, f: F)
    where
        F: FnOnce(&JobSystem, &JobHandle) + Send + 'static,
    {
        let ambient = crate::worker::running_job()
            .unwrap_or_else(|| js_fatal!("continuation() called with no ambient running job"));

        debug_assert!(
            unsafe { (*ambient).continuation.is_none() },
            "continuation() called more than once on the same job; only the last one is kept"
        );

        let pinned = unsafe { (*ambient).pinned };
        let continuation = self.materialize(f, None, pinned);
        unsafe {
            (*ambient).continuation = Some(continuation);
        }
    }

    /// Used by the completion protocol to push a spliced continuation onto
    /// a queue once it has been wired to its new parent.
    pub(crate) fn schedule_materialized(&self, job: JobHandle) {
        self.push_global(self.current_worker_or_zero(), job);
    }

    /// Runs `f` as a job on the calling thread, helping the pool with other
    /// work (via cooperative `Work()` calls) while waiting for it and any
    /// children it schedules to finish, then follows its continuation chain
    /// the same way until the chain ends.
    ///
    /// Unlike an ordinarily scheduled job, `f` (and every continuation
    /// reached through it) always runs on the calling thread; it is never
    /// pushed onto a queue, so no other worker can ever steal it out from
    /// under this call.
    ///
    /// # Panics
    /// Panics if a job is already running on the calling thread.
    pub fn run_job<F>(&self, f: F) -> JobHandle
    where
        F: FnOnce(&JobSystem, &JobHandle) + Send + 'static,
    {
        if crate::worker::running_job().is_some() {
            js_fatal!("run_job called while a job is already running on this thread");
        }
        if crate::worker::thread_index().is_none() {
            crate::worker::set_thread_index(0);
        }

        let mut job = self.materialize(f, None, true);

        loop {
            job::invoke(&job);
            job::finish(job.clone(), self);

            while !job.is_finished() {
                let index = self.current_worker_or_zero();
                if let WorkResult::Idle = self.work_as(index) {
                    self.cooperative_sleep();
                }
            }

            match job.continuation.take() {
                Some(next) => job = next,
                None => break,
            }
        }

        job
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.stop();
        if let Some(workers) = self.workers.lock().take() {
            for worker in workers {
                worker.join();
            }
        }
    }
}
