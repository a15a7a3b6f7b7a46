use crate::JobSystem;
use std::fmt::{self, Debug, Formatter};
use std::mem::MaybeUninit;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

/// Capacity in bytes of a job's inline functor storage.
///
/// The reference implementation hardcodes this rather than consulting a
/// per-instance size, and callers whose captures do not fit simply cannot
/// submit them. This crate keeps that tradeoff but makes it loud: an
/// oversized functor is rejected at submission time with a fatal log instead
/// of silently corrupting adjacent memory.
pub const FUNCTOR_CAPACITY: usize = 56;

pub(crate) type Trampoline = unsafe fn(&JobHandle);

/// A single unit of scheduled work: a type-erased functor plus the
/// parent/continuation links and outstanding-children counter that drive
/// the completion protocol.
#[repr(align(64))]
pub(crate) struct Job {
    /// Used only to reach back into the owning scheduler from the
    /// completion protocol and from `JobHandle`'s `Drop`; never touched by
    /// functor code, which receives a `&JobSystem` argument directly.
    pub(crate) jobsystem: *const JobSystem,

    pub(crate) refcount: AtomicU32,
    pub(crate) parent: Option<JobHandle>,
    pub(crate) continuation: Option<JobHandle>,

    /// Starts at 1 (the job's own body); incremented once per child
    /// scheduled while this job was the ambient running job, and once more
    /// if a continuation is spliced in ahead of this job's own parent.
    pub(crate) jobs_left: AtomicU32,

    /// Set on a `RunJob` root and on every continuation reached through its
    /// chain; tells the generic completion protocol in [`finish`] to leave
    /// the continuation splice to the caller driving that chain instead of
    /// pushing it onto a worker queue. Never set on an ordinary scheduled
    /// job or on any of its children.
    pub(crate) pinned: bool,

    pub(crate) functor_active: bool,
    pub(crate) functor_size: usize,
    pub(crate) function: Option<Trampoline>,
    pub(crate) userdata: [MaybeUninit<u8>; FUNCTOR_CAPACITY],
}

impl Debug for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("refcount", &self.refcount)
            .field("jobs_left", &self.jobs_left)
            .field("has_continuation", &self.continuation.is_some())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

unsafe impl Send for Job {}

impl Job {
    /// A blank record suitable for sitting in the pool's free list before
    /// its first use; every field that matters is overwritten when the job
    /// is materialized for a functor.
    pub(crate) fn blank(jobsystem: *const JobSystem) -> Self {
        Self {
            jobsystem,
            refcount: AtomicU32::new(0),
            parent: None,
            continuation: None,
            jobs_left: AtomicU32::new(0),
            pinned: false,
            functor_active: false,
            functor_size: FUNCTOR_CAPACITY,
            function: None,
            userdata: [MaybeUninit::uninit(); FUNCTOR_CAPACITY],
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.jobs_left.load(Ordering::Acquire) == 0
    }
}

/// A shared handle to a [`Job`].
///
/// Cloning bumps a refcount on the underlying record; the last drop (once
/// the job has actually finished) hands the record back to the owning
/// scheduler's thread-local cache for reuse. Holding a handle past the
/// job's completion is therefore safe, unlike holding a raw index into the
/// pool would be.
#[derive(Eq, PartialEq)]
pub struct JobHandle {
    pub(crate) ptr: *mut Job,
}

impl Debug for JobHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle").field("job", &**self).finish()
    }
}

impl JobHandle {
    pub(crate) fn new(ptr: *mut Job) -> Self {
        unsafe {
            (*ptr).refcount.fetch_add(1, Ordering::AcqRel);
        }
        Self { ptr }
    }

    /// Returns `true` once the job's functor and all of its children and
    /// spliced continuation have completed.
    pub fn is_finished(&self) -> bool {
        self.jobs_left.load(Ordering::Acquire) == 0
    }
}

impl Clone for JobHandle {
    fn clone(&self) -> Self {
        unsafe {
            (*self.ptr).refcount.fetch_add(1, Ordering::AcqRel);
        }
        Self { ptr: self.ptr }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        let job = unsafe { &*self.ptr };
        if job.refcount.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug_assert!(
                job.is_finished(),
                "job record recycled while children are still outstanding"
            );
            let jobsystem = unsafe { &*job.jobsystem };
            unsafe { crate::allocator::recycle(self.ptr, jobsystem) };
        }
    }
}

impl Deref for JobHandle {
    type Target = Job;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.ptr }
    }
}

impl DerefMut for JobHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.ptr }
    }
}

unsafe impl Send for JobHandle {}

/// Runs `job`'s functor on the calling thread.
///
/// The ambient running-job thread-local is set for the duration of the
/// functor call and cleared immediately after, so that a continuation
/// scheduled as part of completing `job` is never accidentally parented to
/// `job` itself (see `crate::worker::set_running_job`).
pub(crate) fn invoke(job: &JobHandle) {
    crate::worker::set_running_job(job.ptr);

    let trampoline = job.function.expect("job scheduled with no functor");
    unsafe {
        trampoline(job);
    }

    crate::worker::clear_running_job();
}

/// Runs `job`'s functor, then drives the completion protocol. Used by
/// worker threads pulling jobs off a queue; `RunJob`'s own loop calls
/// [`invoke`] and [`finish`] separately so it can drive a pinned job's
/// continuation chain inline instead of handing it back to the queue.
pub(crate) fn execute(job: JobHandle, jobsystem: &JobSystem) {
    invoke(&job);
    finish(job, jobsystem);
}

/// The decrement/bubble-up/continuation-splice sequence run when a job's
/// `jobs_left` counter reaches zero (spec §4.5).
///
/// A pinned job (a `RunJob` root or a continuation reached through its
/// chain) never has its continuation scheduled here — the caller driving
/// that chain owns the splice and runs it directly, so two threads can
/// never race to execute the same continuation.
pub(crate) fn finish(mut job: JobHandle, jobsystem: &JobSystem) {
    debug_assert!(
        !job.functor_active,
        "finish() called while the job's functor is still live"
    );

    let prev = job.jobs_left.fetch_sub(1, Ordering::AcqRel);
    if prev != 1 {
        // Still has outstanding children; a later sibling's completion
        // will observe `jobs_left == 1` and carry this job across the line.
        return;
    }

    if !job.pinned {
        if let Some(mut continuation) = job.continuation.take() {
            if let Some(parent) = job.parent.clone() {
                parent.jobs_left.fetch_add(1, Ordering::AcqRel);
                continuation.parent = Some(parent);
            }
            jobsystem.schedule_materialized(continuation);
        }
    }

    if let Some(parent) = job.parent.take() {
        finish(parent, jobsystem);
    }

    // `job` drops here. If no external `JobHandle` is keeping this record
    // alive, `Drop` hands it back to the allocator's thread-local cache.
}
