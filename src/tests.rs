use crate::JobSystem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn small_pool() -> Arc<JobSystem> {
    JobSystem::new(4)
}

/// S1 (scaled down): fan-out/fan-in. A root job submits a batch of children,
/// each writing its index into a shared slot; `run_job` only returns once
/// every child has landed its write.
#[test]
fn fan_out_fan_in_writes_every_slot() {
    let jobsystem = small_pool();
    const COUNT: usize = 200;
    let results: Arc<Vec<AtomicUsize>> = Arc::new((0..COUNT).map(|_| AtomicUsize::new(usize::MAX)).collect());

    {
        let results = results.clone();
        jobsystem.run_job(move |jobsystem, _root| {
            for i in 0..COUNT {
                let results = results.clone();
                jobsystem.schedule(move |_, _| {
                    results[i].store(i, Ordering::SeqCst);
                });
            }
        });
    }

    for (i, slot) in results.iter().enumerate() {
        assert_eq!(slot.load(Ordering::SeqCst), i);
    }
}

/// S2: a continuation chain A -> B -> C, each appending a letter to a
/// shared string under a lock. `run_job` must not return until C has run.
#[test]
fn continuation_chain_runs_in_order() {
    let jobsystem = small_pool();
    let log = Arc::new(Mutex::new(String::new()));

    {
        let log_a = log.clone();
        jobsystem.run_job(move |jobsystem, _a| {
            log_a.lock().unwrap().push('A');

            let log_b = log_a.clone();
            jobsystem.continuation(move |jobsystem, _b| {
                log_b.lock().unwrap().push('B');

                let log_c = log_b.clone();
                jobsystem.continuation(move |_, _c| {
                    log_c.lock().unwrap().push('C');
                });
            });
        });
    }

    assert_eq!(log.lock().unwrap().as_str(), "ABC");
}

/// S3: nested parenting. Root schedules X, X schedules grandchild Y.
/// `run_job` only returns once the whole tree (root, X, Y) has finished --
/// checked via independent counters rather than asserting an interleaving
/// order, since siblings (here, X's own post-schedule code and Y, which
/// another worker may run concurrently) have no ordering guarantee between
/// them (spec: "no ordering is guaranteed between sibling jobs").
#[test]
fn nested_children_keep_parent_alive_until_reclaimed() {
    let jobsystem = small_pool();
    let counter = Arc::new(AtomicUsize::new(0));

    {
        let counter = counter.clone();
        jobsystem.run_job(move |jobsystem, _root| {
            let counter_x = counter.clone();
            jobsystem.schedule(move |jobsystem, _x| {
                let counter_y = counter_x.clone();
                jobsystem.schedule(move |_, _y| {
                    counter_y.fetch_add(1, Ordering::SeqCst);
                });
                counter_x.fetch_add(1, Ordering::SeqCst);
            });
        });
    }

    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

/// S4: a root that schedules a detached job must not wait for it.
#[test]
fn schedule_detached_does_not_block_run_job() {
    let jobsystem = small_pool();
    let detached_ran = Arc::new(AtomicUsize::new(0));

    {
        let detached_ran = detached_ran.clone();
        jobsystem.run_job(move |jobsystem, _root| {
            let detached_ran = detached_ran.clone();
            jobsystem.schedule_detached(move |_, _| {
                detached_ran.store(1, Ordering::SeqCst);
            });
        });
    }

    // Give the detached job a bounded window to land; this only checks it
    // eventually runs, not that `run_job` waited for it.
    for _ in 0..1000 {
        if detached_ran.load(Ordering::SeqCst) == 1 {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    assert_eq!(detached_ran.load(Ordering::SeqCst), 1);
}

/// S5: every job submitted via `schedule_for_thread(2, ..)` must observe
/// worker index 2, never any other worker.
#[test]
fn schedule_for_thread_pins_to_worker() {
    let jobsystem = JobSystem::new(4);
    let observed: Arc<Mutex<Vec<Option<usize>>>> = Arc::new(Mutex::new(Vec::new()));

    {
        let observed = observed.clone();
        jobsystem.run_job(move |jobsystem, _root| {
            for _ in 0..100 {
                let observed = observed.clone();
                jobsystem.schedule_for_thread(2, move |jobsystem, _| {
                    observed.lock().unwrap().push(jobsystem.current_worker_index());
                });
            }
        });
    }

    let observed = observed.lock().unwrap();
    assert_eq!(observed.len(), 100);
    assert!(observed.iter().all(|index| *index == Some(2)));
}

/// S6 (bounded): repeatedly round-tripping jobs through `run_job` must not
/// grow the pool without bound -- the free list should absorb almost all of
/// it after an initial warm-up.
#[test]
fn stress_recycling_stays_bounded() {
    let jobsystem = small_pool();
    const ITERATIONS: usize = 5_000;

    for _ in 0..ITERATIONS {
        jobsystem.run_job(|_, _| {});
    }

    assert!(
        jobsystem.pool.blocks_allocated() < ITERATIONS / 10,
        "expected the free list to dominate after warm-up, allocated {} blocks for {} iterations",
        jobsystem.pool.blocks_allocated(),
        ITERATIONS,
    );
}

#[test]
fn schedule_without_ambient_job_has_no_parent() {
    let jobsystem = small_pool();
    let ran = Arc::new(AtomicUsize::new(0));

    {
        let ran = ran.clone();
        let job = jobsystem.schedule(move |_, _| {
            ran.store(1, Ordering::SeqCst);
        });

        while !job.is_finished() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
#[should_panic(expected = "run_job called while a job is already running")]
fn nested_run_job_on_same_thread_panics() {
    let jobsystem = small_pool();
    jobsystem.run_job(move |jobsystem, _root| {
        jobsystem.run_job(|_, _| {});
    });
}

#[test]
fn oversized_functor_is_rejected() {
    let jobsystem = small_pool();
    let oversized = [0u8; crate::job::FUNCTOR_CAPACITY + 1];

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        jobsystem.schedule_detached(move |_, _| {
            let _ = oversized.len();
        });
    }));

    assert!(result.is_err());
}
