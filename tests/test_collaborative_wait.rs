use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use taskpool::{enter_unlock_allowance_zone, PoolConfig, TaskPool};

fn pool(threads: i32) -> Arc<TaskPool> {
    Arc::new(TaskPool::new(PoolConfig {
        thread_count: threads,
        ..PoolConfig::default()
    }))
}

#[test]
fn test_external_wait() {
    let pool = pool(2);
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    let id = pool.submit_task(move || {
        thread::sleep(Duration::from_millis(10));
        ran2.store(true, Ordering::SeqCst);
    });
    pool.wait_task(id).unwrap();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn test_nested_wait_on_single_thread_pool() {
    // The only worker waits on a task it must itself execute; the
    // collaborative wait dispatches it instead of deadlocking.
    let pool = pool(1);
    let pool2 = pool.clone();
    let inner_ran = Arc::new(AtomicBool::new(false));
    let inner_ran2 = inner_ran.clone();
    let outer = pool.submit_task(move || {
        let flag = inner_ran2.clone();
        let inner = pool2.submit_task(move || flag.store(true, Ordering::SeqCst));
        pool2.wait_task(inner).unwrap();
        assert!(inner_ran2.load(Ordering::SeqCst));
    });
    pool.wait_task(outer).unwrap();
    assert!(inner_ran.load(Ordering::SeqCst));
}

#[test]
fn test_deep_nested_waits() {
    let pool = pool(1);
    let depth_reached = Arc::new(AtomicUsize::new(0));

    fn recurse(pool: Arc<TaskPool>, depth: usize, reached: Arc<AtomicUsize>) {
        reached.fetch_max(depth, Ordering::SeqCst);
        if depth == 8 {
            return;
        }
        let p = pool.clone();
        let r = reached.clone();
        let id = pool.submit_task(move || recurse(p.clone(), depth + 1, r));
        pool.wait_task(id).unwrap();
    }

    let p = pool.clone();
    let r = depth_reached.clone();
    let id = pool.submit_task(move || recurse(p.clone(), 1, r));
    pool.wait_task(id).unwrap();
    assert_eq!(depth_reached.load(Ordering::SeqCst), 8);
}

#[test]
fn test_thread_identity_inside_task() {
    let pool = pool(2);
    let pool2 = pool.clone();
    let id = pool.submit_task(move || {
        let index = pool2.current_thread_index().expect("runs on a pool thread");
        assert!(index < pool2.thread_count());
        assert!(pool2.current_task_id().is_some());
    });
    pool.wait_task(id).unwrap();
    assert_eq!(pool.current_thread_index(), None);
}

#[test]
fn test_unlock_allowance_zone_releases_held_lock() {
    let pool = pool(1);
    let pool2 = pool.clone();
    let shared = Arc::new(Mutex::new(0));
    let shared2 = shared.clone();

    let mut guard = shared.lock();
    // Registered, the lock is released while this thread parks in
    // wait_task, so the task can take it.
    let zone = unsafe { enter_unlock_allowance_zone(&shared) };
    let id = pool2.submit_task(move || {
        *shared2.lock() = 42;
    });
    pool.wait_task(id).unwrap();
    drop(zone);
    assert_eq!(*guard, 42);
    *guard = 0;
}

#[test]
fn test_thousand_tasks_each_run_once() {
    let pool = pool(4);
    let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..1000).map(|_| AtomicUsize::new(0)).collect());
    let ids: Vec<_> = (0..1000)
        .map(|i| {
            let hits = hits.clone();
            pool.submit_task(move || {
                hits[i].fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    let last = *ids.last().unwrap();
    pool.wait_task(last).unwrap();
    for id in &ids[..ids.len() - 1] {
        pool.wait_task(*id).unwrap();
    }
    for (i, cell) in hits.iter().enumerate() {
        assert_eq!(cell.load(Ordering::SeqCst), 1, "task {i}");
    }
}

#[test]
fn test_waiting_twice_consumes_the_id() {
    let pool = pool(2);
    let id = pool.submit_task(|| {});
    pool.wait_task(id).unwrap();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pool.wait_task(id)));
    assert!(result.is_err(), "a waited-on id must be unknown");
}
