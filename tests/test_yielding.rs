use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use taskpool::{PoolConfig, TaskPool};

fn pool(threads: i32) -> Arc<TaskPool> {
    Arc::new(TaskPool::new(PoolConfig {
        thread_count: threads,
        ..PoolConfig::default()
    }))
}

#[test]
fn test_yield_until_externally_resumed() {
    let pool = pool(1);
    let pool2 = pool.clone();
    let reached_yield = Arc::new(AtomicBool::new(false));
    let resumed = Arc::new(AtomicBool::new(false));

    let reached = reached_yield.clone();
    let resumed2 = resumed.clone();
    let id = pool.submit_task(move || {
        reached.store(true, Ordering::SeqCst);
        pool2.yield_current_task();
        resumed2.store(true, Ordering::SeqCst);
    });

    while !reached_yield.load(Ordering::SeqCst) {
        thread::yield_now();
    }
    assert!(!resumed.load(Ordering::SeqCst));
    pool.resume_yielded_task(id);
    pool.wait_task(id).unwrap();
    assert!(resumed.load(Ordering::SeqCst));
}

#[test]
fn test_resume_before_yield_is_not_lost() {
    let pool = pool(1);
    let pool2 = pool.clone();
    let go = Arc::new(AtomicBool::new(false));

    let go2 = go.clone();
    let id = pool.submit_task(move || {
        while !go2.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        // The resume below already happened; this returns immediately.
        pool2.yield_current_task();
    });

    pool.resume_yielded_task(id);
    go.store(true, Ordering::SeqCst);
    pool.wait_task(id).unwrap();
}

#[test]
fn test_yielded_worker_runs_other_tasks() {
    // One thread: while the first task is yielded, the worker must pick up
    // the second task, which resumes the first.
    let pool = pool(1);
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let pool2 = pool.clone();
    let e = events.clone();
    let yielder = pool.submit_task(move || {
        e.lock().push("yielder:before");
        pool2.yield_current_task();
        e.lock().push("yielder:after");
    });

    let pool3 = pool.clone();
    let e = events.clone();
    pool.submit_task(move || {
        e.lock().push("resumer");
        pool3.resume_yielded_task(yielder);
    });

    pool.wait_task(yielder).unwrap();
    let events = events.lock();
    assert_eq!(
        *events,
        vec!["yielder:before", "resumer", "yielder:after"]
    );
}
