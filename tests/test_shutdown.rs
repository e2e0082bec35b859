use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use taskpool::{PoolConfig, Priority, TaskPool, WorkerHooks};

fn pool(threads: i32) -> TaskPool {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    TaskPool::new(PoolConfig {
        thread_count: threads,
        ..PoolConfig::default()
    })
}

#[test]
fn test_phase1_drains_all_queued_work() {
    let pool = pool(4);
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..500 {
        let c = counter.clone();
        pool.submit_task(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
    }
    pool.begin_shutdown_phase1();
    assert_eq!(counter.load(Ordering::SeqCst), 500);
    pool.shutdown();
}

#[test]
fn test_low_priority_work_is_drained_too() {
    let pool = pool(2);
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let c = counter.clone();
        pool.submit_task_with(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            Priority::Low,
            "",
        );
    }
    pool.begin_shutdown_phase1();
    assert_eq!(counter.load(Ordering::SeqCst), 50);
    pool.shutdown();
}

#[test]
fn test_phase1_waits_for_continuation_work() {
    // One worker goes idle during the drain while the other still runs a
    // task that submits follow-up work. Phase 1 must not return until that
    // follow-up has also run, even though the idle worker picks it up.
    let pool = Arc::new(pool(2));
    let finished = Arc::new(AtomicBool::new(false));
    let pool2 = pool.clone();
    let finished2 = finished.clone();
    pool.submit_task(move || {
        // Give the other worker time to report idle first.
        thread::sleep(Duration::from_millis(50));
        let flag = finished2.clone();
        pool2.submit_task(move || {
            thread::sleep(Duration::from_millis(100));
            flag.store(true, Ordering::SeqCst);
        });
    });
    thread::sleep(Duration::from_millis(10));
    pool.begin_shutdown_phase1();
    assert!(
        finished.load(Ordering::SeqCst),
        "phase 1 returned with work still in flight"
    );
    pool.shutdown();
}

#[test]
#[should_panic(expected = "shutdown")]
fn test_submission_after_phase1_panics() {
    let pool = pool(2);
    pool.begin_shutdown_phase1();
    pool.submit_task(|| {});
}

#[test]
fn test_detach_hook_runs_once_per_worker() {
    let started = Arc::new(AtomicUsize::new(0));
    let detached = Arc::new(AtomicUsize::new(0));
    let started2 = started.clone();
    let detached2 = detached.clone();
    let pool = TaskPool::with_hooks(
        PoolConfig {
            thread_count: 3,
            ..PoolConfig::default()
        },
        WorkerHooks {
            on_start: Some(Arc::new(move |_| {
                started2.fetch_add(1, Ordering::SeqCst);
            })),
            on_detach: Some(Arc::new(move |_| {
                detached2.fetch_add(1, Ordering::SeqCst);
            })),
        },
    );
    let id = pool.submit_task(|| {});
    pool.wait_task(id).unwrap();
    assert_eq!(detached.load(Ordering::SeqCst), 0);
    pool.begin_shutdown_phase2();
    assert_eq!(detached.load(Ordering::SeqCst), 3);
    pool.shutdown();
    assert_eq!(started.load(Ordering::SeqCst), 3);
    assert_eq!(detached.load(Ordering::SeqCst), 3);
}

#[test]
fn test_shutdown_is_idempotent() {
    let pool = pool(2);
    pool.shutdown();
    pool.shutdown();
}

#[test]
fn test_shutdown_runs_missing_phases() {
    // Never calling the explicit phases still shuts down cleanly.
    let pool = pool(2);
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let c = counter.clone();
        pool.submit_task(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
    }
    pool.shutdown();
    assert_eq!(counter.load(Ordering::SeqCst), 20);
}

#[test]
fn test_drop_shuts_down() {
    let counter = Arc::new(AtomicUsize::new(0));
    {
        let pool = pool(2);
        for _ in 0..20 {
            let c = counter.clone();
            pool.submit_task(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
    }
    assert_eq!(counter.load(Ordering::SeqCst), 20);
}
