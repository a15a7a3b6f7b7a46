use crate::job::Job;
use crate::JobSystem;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::Ordering;
use thread_local::ThreadLocal;

/// Above this many records, a thread's free list starts diverting reclaimed
/// jobs to its delete list instead, bounding per-thread memory growth under
/// bursty fan-out (spec §4.1).
const FREE_LIST_HIGH_WATER: usize = 100;

/// Upper bound on how many delete-list records a single `Work()` call folds
/// back into the central pool; keeps housekeeping from starving real work.
const DELETE_DRAIN_BATCH: usize = 32;

/// Process-wide, mutex-guarded source of last resort for `Job` records.
///
/// Touched only when a thread's own free list is empty (cold allocation
/// path) or when a thread's delete list is drained back into circulation;
/// the hot allocate/reclaim path lives entirely in [`JobCache`].
pub(crate) struct Pool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    free: Vec<*mut Job>,
    blocks_allocated: usize,
}

unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                blocks_allocated: 0,
            }),
        }
    }

    fn allocate(&self, jobsystem: *const JobSystem) -> *mut Job {
        let mut inner = self.inner.lock();
        if let Some(ptr) = inner.free.pop() {
            return ptr;
        }
        inner.blocks_allocated += 1;
        Box::into_raw(Box::new(Job::blank(jobsystem)))
    }

    fn reclaim_batch(&self, ptrs: &mut Vec<*mut Job>) {
        self.inner.lock().free.append(ptrs);
    }

    /// Number of `Job` records ever carved out of the heap; exposed for the
    /// allocator's own tests, which check this stays bounded under a
    /// schedule/recycle stress loop rather than growing without limit.
    pub(crate) fn blocks_allocated(&self) -> usize {
        self.inner.lock().blocks_allocated
    }
}

/// Per-thread cache of free and pending-delete `Job` pointers sitting in
/// front of [`Pool`]. Mirrors the teacher's thread-local bump allocator, but
/// as a free-list cache over fixed-size records rather than a bump region,
/// since records here are reused indefinitely rather than allocated once
/// per frame.
pub(crate) struct JobCache {
    free_list: ThreadLocal<RefCell<Vec<*mut Job>>>,
    delete_list: ThreadLocal<RefCell<Vec<*mut Job>>>,
}

impl JobCache {
    pub(crate) fn new() -> Self {
        Self {
            free_list: ThreadLocal::new(),
            delete_list: ThreadLocal::new(),
        }
    }

    pub(crate) fn allocate(&self, pool: &Pool, jobsystem: *const JobSystem) -> *mut Job {
        let free_list = self.free_list.get_or(|| RefCell::new(Vec::new()));
        let popped = free_list.borrow_mut().pop();
        match popped {
            Some(ptr) => ptr,
            None => pool.allocate(jobsystem),
        }
    }

    pub(crate) fn reclaim(&self, ptr: *mut Job) {
        let free_list = self.free_list.get_or(|| RefCell::new(Vec::new()));
        let mut free = free_list.borrow_mut();
        if free.len() >= FREE_LIST_HIGH_WATER {
            drop(free);
            let delete_list = self.delete_list.get_or(|| RefCell::new(Vec::new()));
            delete_list.borrow_mut().push(ptr);
        } else {
            free.push(ptr);
        }
    }

    /// Folds up to [`DELETE_DRAIN_BATCH`] overflowed records back into the
    /// central pool. Returns `true` if there was anything to drain, so
    /// `Work()` can report housekeeping separately from idling.
    pub(crate) fn drain_delete_list(&self, pool: &Pool) -> bool {
        let delete_list = self.delete_list.get_or(|| RefCell::new(Vec::new()));
        let mut delete = delete_list.borrow_mut();
        if delete.is_empty() {
            return false;
        }

        let drain_count = delete.len().min(DELETE_DRAIN_BATCH);
        let mut batch: Vec<*mut Job> = delete.drain(..drain_count).collect();
        drop(delete);
        pool.reclaim_batch(&mut batch);
        true
    }
}

/// Resets a finished job's fields and hands the record back to the calling
/// thread's cache. Called from [`crate::job::JobHandle`]'s `Drop` once the
/// last reference to a finished job goes away.
pub(crate) unsafe fn recycle(ptr: *mut Job, jobsystem: &JobSystem) {
    let job = &mut *ptr;
    job.parent = None;
    job.continuation = None;
    job.function = None;
    job.functor_active = false;
    job.pinned = false;
    job.refcount.store(0, Ordering::Relaxed);
    job.jobs_left.store(0, Ordering::Relaxed);
    jobsystem.cache.reclaim(ptr);
}
