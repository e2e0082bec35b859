//! Task and group records: the data model the worker pool schedules.
//!
//! A `Task` is one schedulable unit, either free-standing or one slice of a
//! data-parallel group submission. A `Group` holds the shared progress state
//! for an "N elements split across K slices" submission; slices claim element
//! indices from its atomic counter so each index runs exactly once.

use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::arena::SlotId;
use crate::sync::Semaphore;

/// Identifier of a submitted task. Monotonically increasing, never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TaskId(pub(crate) u64);

/// Identifier of a submitted group task. Monotonically increasing, never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct GroupId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Native task entry point: a plain function pointer plus an opaque context.
pub type NativeTaskFn = fn(*mut c_void);

/// Native group entry point, invoked once per claimed element index.
pub type NativeGroupFn = fn(*mut c_void, u32);

/// Wrapper that lets an opaque context pointer cross thread boundaries.
///
/// # Safety
///
/// The caller asserts that whatever the pointer refers to outlives the task
/// and is safe to access from the worker thread that ends up running it.
#[derive(Clone, Copy, Debug)]
pub struct SendPtr(pub *mut c_void);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl SendPtr {
    /// A null context, for native functions that take no state.
    pub fn null() -> Self {
        SendPtr(std::ptr::null_mut())
    }
}

/// Failure recorded against a task or group whose payload panicked.
///
/// The dispatch loop survives payload panics; the error is handed to whoever
/// waits on the unit.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The submitted work panicked while executing.
    #[error("task `{description}` panicked: {message}")]
    Panicked {
        /// Diagnostic description given at submission.
        description: String,
        /// Stringified panic payload.
        message: String,
    },
}

/// Extracts a printable message from a caught panic payload.
pub(crate) fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// The invocable target of a task.
pub(crate) enum Work {
    Closure(Box<dyn FnOnce() + Send + 'static>),
    Native { func: NativeTaskFn, userdata: SendPtr },
    /// One slice of a group; the actual target lives in the shared
    /// [`GroupState`].
    Slice,
    /// Payload already moved out for execution.
    Taken,
}

/// Group targets, shared by every slice of one submission.
pub(crate) enum GroupWork {
    PerElement(Arc<dyn Fn(u32) + Send + Sync + 'static>),
    /// Range-aware target: invoked once per claimed chunk `[begin, end)`.
    PerRange(Arc<dyn Fn(u32, u32) + Send + Sync + 'static>),
    Native { func: NativeGroupFn, userdata: SendPtr },
}

/// Lock-free progress state of a group submission.
///
/// Slices mutate these counters on the hot path without touching the pool
/// mutex; the invariant `completed_count <= total` always holds, and
/// `completed` flips exactly when `finished == tasks_used`.
pub(crate) struct GroupState {
    next_index: AtomicU32,
    completed_count: AtomicU32,
    finished: AtomicU32,
    completed: AtomicBool,
    total: u32,
    tasks_used: u32,
    chunk: u32,
    work: GroupWork,
}

impl GroupState {
    pub fn new(work: GroupWork, total: u32, tasks_used: u32, chunk: u32) -> Self {
        GroupState {
            next_index: AtomicU32::new(0),
            completed_count: AtomicU32::new(0),
            finished: AtomicU32::new(0),
            completed: AtomicBool::new(total == 0),
            total,
            tasks_used,
            chunk: chunk.max(1),
            work,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn processed_count(&self) -> u32 {
        self.completed_count.load(Ordering::Acquire).min(self.total)
    }

    /// Runs one slice: claims element indices (or chunks) until the group is
    /// drained, then retires the slice.
    ///
    /// Returns whether this slice was the last one, which makes the group
    /// complete, and the panic message if the payload panicked. A panicking
    /// slice stops claiming; elements it never claimed are picked up by the
    /// remaining slices, so no element runs twice.
    pub fn run_slice(&self) -> (bool, Option<String>) {
        let result = catch_unwind(AssertUnwindSafe(|| match &self.work {
            GroupWork::PerElement(f) => loop {
                let index = self.next_index.fetch_add(1, Ordering::Relaxed);
                if index >= self.total {
                    break;
                }
                f(index);
                self.completed_count.fetch_add(1, Ordering::Release);
            },
            GroupWork::Native { func, userdata } => loop {
                let index = self.next_index.fetch_add(1, Ordering::Relaxed);
                if index >= self.total {
                    break;
                }
                func(userdata.0, index);
                self.completed_count.fetch_add(1, Ordering::Release);
            },
            GroupWork::PerRange(f) => loop {
                let begin = self.next_index.fetch_add(self.chunk, Ordering::Relaxed);
                if begin >= self.total {
                    break;
                }
                let end = (begin + self.chunk).min(self.total);
                f(begin, end);
                self.completed_count.fetch_add(end - begin, Ordering::Release);
            },
        }));
        let message = result.err().map(|payload| describe_panic(payload.as_ref()));
        let finished = self.finished.fetch_add(1, Ordering::AcqRel) + 1;
        let group_done = finished == self.tasks_used;
        if group_done {
            self.completed.store(true, Ordering::Release);
        }
        (group_done, message)
    }
}

/// Back-reference from a slice task to its owning group.
#[derive(Clone)]
pub(crate) struct GroupRef {
    pub id: GroupId,
    pub slot: SlotId,
    pub state: Arc<GroupState>,
}

/// One schedulable unit, as stored in the pool registry.
pub(crate) struct Task {
    pub work: Work,
    pub description: String,
    pub completed: bool,
    pub group: Option<GroupRef>,
    /// Pool threads currently blocked in a collaborative wait on this task.
    pub waiting_pool: u32,
    /// External threads currently blocked on `done_sem`.
    pub waiting_user: u32,
    pub low_priority: bool,
    /// Index of the pool thread running this task, -1 when not running.
    pub pool_thread_index: i32,
    /// Set when `resume_yielded_task` arrived before the task reached its
    /// yield point (or before it started running).
    pub pending_yield_over: bool,
    pub done_sem: Arc<Semaphore>,
    pub error: Option<TaskError>,
}

impl Task {
    pub fn new(work: Work, low_priority: bool, description: String) -> Self {
        Task {
            work,
            description,
            completed: false,
            group: None,
            waiting_pool: 0,
            waiting_user: 0,
            low_priority,
            pool_thread_index: -1,
            pending_yield_over: false,
            done_sem: Arc::new(Semaphore::new()),
            error: None,
        }
    }
}

/// Registry record for a group submission.
pub(crate) struct Group {
    pub state: Arc<GroupState>,
    pub done_sem: Arc<Semaphore>,
    pub waiting_user: u32,
    pub waiting_pool: u32,
    pub error: Option<TaskError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn slice_claims_each_index_once() {
        let hits: Arc<Vec<AtomicUsize>> = Arc::new((0..100).map(|_| AtomicUsize::new(0)).collect());
        let hits2 = hits.clone();
        let state = GroupState::new(
            GroupWork::PerElement(Arc::new(move |i| {
                hits2[i as usize].fetch_add(1, Ordering::SeqCst);
            })),
            100,
            3,
            1,
        );
        // Run the three slices sequentially; claiming is still atomic.
        assert_eq!(state.run_slice(), (false, None));
        assert_eq!(state.run_slice(), (false, None));
        assert_eq!(state.run_slice(), (true, None));
        assert!(state.is_completed());
        assert_eq!(state.processed_count(), 100);
        for cell in hits.iter() {
            assert_eq!(cell.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn range_slices_cover_all_elements() {
        let sum = Arc::new(AtomicUsize::new(0));
        let sum2 = sum.clone();
        let state = GroupState::new(
            GroupWork::PerRange(Arc::new(move |begin, end| {
                sum2.fetch_add((end - begin) as usize, Ordering::SeqCst);
            })),
            10,
            2,
            4,
        );
        state.run_slice();
        let (done, err) = state.run_slice();
        assert!(done);
        assert!(err.is_none());
        assert_eq!(sum.load(Ordering::SeqCst), 10);
        assert_eq!(state.processed_count(), 10);
    }

    #[test]
    fn panicking_slice_reports_and_group_still_completes() {
        let state = GroupState::new(
            GroupWork::PerElement(Arc::new(|i| {
                if i == 0 {
                    panic!("boom");
                }
            })),
            4,
            2,
            1,
        );
        let (done, err) = state.run_slice();
        assert!(!done);
        assert_eq!(err.as_deref(), Some("boom"));
        let (done, err) = state.run_slice();
        assert!(done);
        assert!(err.is_none());
        assert!(state.is_completed());
        // The panicked element was claimed but not counted.
        assert_eq!(state.processed_count(), 3);
    }

    #[test]
    fn zero_element_group_is_born_complete() {
        let state = GroupState::new(GroupWork::PerElement(Arc::new(|_| {})), 0, 0, 1);
        assert!(state.is_completed());
        assert_eq!(state.processed_count(), 0);
    }
}
