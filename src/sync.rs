//! Small blocking primitives used by the pool.

use parking_lot::{Condvar, Mutex};

/// Counting semaphore backing the "external thread waits on a unit" path.
///
/// The executing worker posts one permit per registered waiter when a task or
/// group completes, so every waiter unblocks exactly once.
pub(crate) struct Semaphore {
    count: Mutex<u32>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Semaphore {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn post(&self, permits: u32) {
        if permits == 0 {
            return;
        }
        let mut count = self.count.lock();
        *count += permits;
        if permits == 1 {
            self.cv.notify_one();
        } else {
            self.cv.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cv.wait(&mut count);
        }
        *count -= 1;
    }
}
