//! The worker pool: submission, dispatch, collaborative waiting, cooperative
//! yield and the controlled-shutdown state machine.
//!
//! A fixed set of long-lived worker threads shares one coarse mutex covering
//! the ready queues, the task/group registries and the per-thread await
//! state. Hot-path progress counters inside group records are lock-free
//! atomics (see [`crate::task::GroupState`]); per-thread condition variables
//! and per-unit semaphores do the actual blocking and waking.
//!
//! The central invariant: a pool thread that has to wait for another task
//! does not park. It re-enters the dispatch loop and keeps executing other
//! ready work, recursively, truly blocking on its condition variable only
//! when the queue is empty. This keeps the pool from starving itself when
//! tasks await tasks, down to a pool of a single thread.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Condvar, Mutex, MutexGuard, RawMutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::arena::{SlotArena, SlotId};
use crate::span::{RunSpan, SpanRecorder};
use crate::task::{
    describe_panic, Group, GroupId, GroupRef, GroupState, GroupWork, NativeGroupFn, NativeTaskFn,
    SendPtr, Task, TaskError, TaskId, Work,
};

const TASKS_PAGE_SIZE: usize = 1024;
const GROUPS_PAGE_SIZE: usize = 256;

/// Scheduling priority of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Runs as soon as a thread is free.
    #[default]
    Normal,
    /// Runs only when no normal-priority work is ready and spare low-priority
    /// thread capacity remains.
    Low,
}

/// Configuration for a [`TaskPool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker threads; any value `<= 0` means one per available
    /// CPU.
    pub thread_count: i32,
    /// Fraction of the pool allowed to run promoted low-priority tasks
    /// concurrently. At least one thread always may, so low-priority work
    /// cannot starve outright.
    pub low_priority_ratio: f32,
    /// Prefix for worker thread names.
    pub thread_name: String,
    /// Whether the job-graph layer records per-slice run spans from the
    /// start.
    pub capture_run_spans: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            thread_count: -1,
            low_priority_ratio: 0.3,
            thread_name: "taskpool".to_string(),
            capture_run_spans: false,
        }
    }
}

/// Optional callbacks run on each worker thread.
///
/// `on_detach` models the "detach from external runtime thread-local state"
/// step of shutdown phase 2: it runs exactly once per worker, after the
/// queues have drained and before the thread is joined.
#[derive(Clone, Default)]
pub struct WorkerHooks {
    /// Runs on each worker right after it starts, before it takes any task.
    pub on_start: Option<Arc<dyn Fn(usize) + Send + Sync>>,
    /// Runs on each worker during shutdown phase 2.
    pub on_detach: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

/// Shutdown runlevels. Transitions only ever move forward, and each phase's
/// transition counter lives in its variant, so phase-1 code cannot touch
/// phase-2 state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Runlevel {
    Normal,
    /// New external submissions are rejected; workers drain the queues and
    /// report idle.
    PreExitLanguages { num_idle_threads: u32 },
    /// Workers run the detach hook and report done.
    ExitLanguages { num_exited_threads: u32 },
    Exit,
}

impl Runlevel {
    fn rank(&self) -> u8 {
        match self {
            Runlevel::Normal => 0,
            Runlevel::PreExitLanguages { .. } => 1,
            Runlevel::ExitLanguages { .. } => 2,
            Runlevel::Exit => 3,
        }
    }
}

/// What a worker thread is currently blocked on (or about to block on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Await {
    /// Not blocked; running or between tasks.
    Inactive,
    /// Parked waiting for new queued work.
    QueueWork,
    /// Collaboratively waiting for a specific task to complete.
    Task(TaskId),
    /// Collaboratively waiting for a group to complete.
    Group(GroupId),
    /// Collaboratively waiting for an externally-signaled condition
    /// (job-graph handles).
    Condition,
    /// Inside `yield_current_task`, waiting for `resume_yielded_task`.
    Yielding,
}

struct ThreadState {
    awaited: Await,
    signaled: bool,
    yield_is_over: bool,
    pre_exited: bool,
    exited: bool,
    current_task: Option<TaskId>,
}

impl ThreadState {
    fn new() -> Self {
        ThreadState {
            awaited: Await::Inactive,
            signaled: false,
            yield_is_over: false,
            pre_exited: false,
            exited: false,
            current_task: None,
        }
    }
}

/// Everything guarded by the pool-wide mutex.
struct PoolState {
    runlevel: Runlevel,
    ready: VecDeque<TaskId>,
    low_priority: VecDeque<TaskId>,
    tasks: SlotArena<Task>,
    task_index: HashMap<TaskId, SlotId>,
    groups: SlotArena<Group>,
    group_index: HashMap<GroupId, SlotId>,
    threads: Vec<ThreadState>,
    low_priority_used: u32,
    notify_index: usize,
    next_id: u64,
}

pub(crate) struct Shared {
    state: Mutex<PoolState>,
    /// Signals runlevel transition progress to whoever drives shutdown.
    /// Distinct from the per-thread condvars.
    control_cv: Condvar,
    worker_cvs: Box<[Condvar]>,
    max_low_priority: u32,
    hooks: WorkerHooks,
    spans: SpanRecorder,
}

#[derive(Clone, Copy)]
struct PoolThreadRef {
    pool: *const Shared,
    index: usize,
}

thread_local! {
    /// Set once at worker start; lets waits tell pool threads from external
    /// callers so they can pick the collaborative strategy.
    static POOL_THREAD: Cell<Option<PoolThreadRef>> = const { Cell::new(None) };
}

const MAX_UNLOCKABLE_LOCKS: usize = 2;

#[derive(Clone, Copy)]
struct UnlockableLock {
    raw: *const RawMutex,
    rc: u32,
}

thread_local! {
    static UNLOCKABLE_LOCKS: RefCell<[Option<UnlockableLock>; MAX_UNLOCKABLE_LOCKS]> =
        const { RefCell::new([None; MAX_UNLOCKABLE_LOCKS]) };
}

/// Active registration in the unlock allowance zone. Dropping it deregisters
/// the lock, on every exit path.
pub struct UnlockZoneGuard {
    slot: usize,
    // Registrations are thread-local; the guard must not cross threads.
    _not_send: PhantomData<*mut ()>,
}

impl Drop for UnlockZoneGuard {
    fn drop(&mut self) {
        UNLOCKABLE_LOCKS.with(|locks| {
            let mut locks = locks.borrow_mut();
            let entry = locks[self.slot].as_mut().expect("zone registration is live");
            entry.rc -= 1;
            if entry.rc == 0 {
                locks[self.slot] = None;
            }
        });
    }
}

/// Registers a currently-held lock so the pool may release and reacquire it
/// while this thread is parked inside one of the pool's waits.
///
/// A thread that holds a lock and then waits on the pool can deadlock if the
/// awaited work needs that same lock; registering it lets the pool drop it
/// for the duration of the park. At most [`MAX_UNLOCKABLE_LOCKS`] distinct
/// locks may be registered per thread; exceeding that is a configuration
/// error and panics.
///
/// # Safety
///
/// The mutex must be locked by the calling thread, must outlive the
/// returned guard, and the caller must not
/// touch anything borrowed from its guard until the wait it is about to
/// enter returns: while the thread is parked the lock is genuinely released
/// and other threads may mutate the protected data.
pub unsafe fn enter_unlock_allowance_zone<T>(mutex: &Mutex<T>) -> UnlockZoneGuard {
    let raw = unsafe { mutex.raw() } as *const RawMutex;
    UNLOCKABLE_LOCKS.with(|locks| {
        let mut locks = locks.borrow_mut();
        for (slot, entry) in locks.iter_mut().enumerate() {
            if let Some(entry) = entry.as_mut() {
                if entry.raw == raw {
                    entry.rc += 1;
                    return UnlockZoneGuard {
                        slot,
                        _not_send: PhantomData,
                    };
                }
            }
        }
        for (slot, entry) in locks.iter_mut().enumerate() {
            if entry.is_none() {
                *entry = Some(UnlockableLock { raw, rc: 1 });
                return UnlockZoneGuard {
                    slot,
                    _not_send: PhantomData,
                };
            }
        }
        panic!("unlock allowance zone capacity ({MAX_UNLOCKABLE_LOCKS}) exceeded");
    })
}

fn unlock_registered_locks() {
    UNLOCKABLE_LOCKS.with(|locks| {
        for entry in locks.borrow().iter().flatten() {
            // The registering thread holds these locks; see the safety
            // contract of `enter_unlock_allowance_zone`.
            unsafe { (*entry.raw).unlock() };
        }
    });
}

fn relock_registered_locks() {
    UNLOCKABLE_LOCKS.with(|locks| {
        for entry in locks.borrow().iter().flatten() {
            unsafe { (*entry.raw).lock() };
        }
    });
}

impl Shared {
    pub(crate) fn local_thread_index(&self) -> Option<usize> {
        POOL_THREAD
            .with(|slot| slot.get())
            .and_then(|r| std::ptr::eq(r.pool, self as *const Shared).then_some(r.index))
    }

    pub(crate) fn spans_enabled(&self) -> bool {
        self.spans.is_enabled()
    }

    pub(crate) fn record_span(&self, span: RunSpan) {
        self.spans.record(span);
    }

    fn submissions_allowed(&self, state: &PoolState) -> bool {
        match state.runlevel {
            Runlevel::Normal => true,
            // Continuation work submitted by a draining worker is still
            // admitted; external callers are not.
            Runlevel::PreExitLanguages { .. } => self.local_thread_index().is_some(),
            _ => false,
        }
    }

    pub(crate) fn add_task_internal(
        &self,
        work: Work,
        priority: Priority,
        description: &str,
    ) -> TaskId {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        assert!(
            self.submissions_allowed(state),
            "task submitted after shutdown began"
        );
        let id = TaskId(state.next_id);
        state.next_id += 1;
        let low_priority = priority == Priority::Low;
        let task = Task::new(work, low_priority, description.to_string());
        let slot = state.tasks.insert(task);
        state.task_index.insert(id, slot);
        if low_priority {
            state.low_priority.push_back(id);
            if self.try_promote_low_priority(state) {
                self.notify_threads(state, 1);
            }
        } else {
            state.ready.push_back(id);
            self.notify_threads(state, 1);
        }
        trace!(%id, ?priority, "task submitted");
        id
    }

    pub(crate) fn add_group_internal(
        &self,
        work: GroupWork,
        elements: i32,
        tasks: i32,
        chunk: Option<u32>,
        priority: Priority,
        description: &str,
    ) -> GroupId {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        assert!(
            self.submissions_allowed(state),
            "group task submitted after shutdown began"
        );
        let id = GroupId(state.next_id);
        state.next_id += 1;

        if elements <= 0 {
            // Born complete: zero slices, zero progress.
            let group = Group {
                state: Arc::new(GroupState::new(work, 0, 0, 1)),
                done_sem: Arc::new(crate::sync::Semaphore::new()),
                waiting_user: 0,
                waiting_pool: 0,
                error: None,
            };
            let slot = state.groups.insert(group);
            state.group_index.insert(id, slot);
            return id;
        }

        let elements = elements as u32;
        let tasks_used = if tasks <= 0 {
            // Roughly one slice per pool thread; a tunable, not a contract.
            self.worker_cvs.len() as u32
        } else {
            tasks as u32
        }
        .clamp(1, elements);
        let chunk = chunk.unwrap_or_else(|| elements.div_ceil(tasks_used));
        let group_state = Arc::new(GroupState::new(work, elements, tasks_used, chunk));
        let group = Group {
            state: group_state.clone(),
            done_sem: Arc::new(crate::sync::Semaphore::new()),
            waiting_user: 0,
            waiting_pool: 0,
            error: None,
        };
        let group_slot = state.groups.insert(group);
        state.group_index.insert(id, group_slot);

        let low_priority = priority == Priority::Low;
        for _ in 0..tasks_used {
            let task_id = TaskId(state.next_id);
            state.next_id += 1;
            let mut task = Task::new(Work::Slice, low_priority, description.to_string());
            task.group = Some(GroupRef {
                id,
                slot: group_slot,
                state: group_state.clone(),
            });
            let slot = state.tasks.insert(task);
            state.task_index.insert(task_id, slot);
            if low_priority {
                state.low_priority.push_back(task_id);
            } else {
                state.ready.push_back(task_id);
            }
        }
        let mut to_wake = tasks_used;
        if low_priority {
            to_wake = 0;
            for _ in 0..tasks_used {
                if !self.try_promote_low_priority(state) {
                    break;
                }
                to_wake += 1;
            }
        }
        self.notify_threads(state, to_wake);
        trace!(%id, elements, tasks_used, ?priority, "group task submitted");
        id
    }

    /// Moves the head of the low-priority queue onto the ready queue if the
    /// concurrency cap allows it. During the phase-1 drain the cap is
    /// ignored so low-priority work cannot wedge shutdown.
    fn try_promote_low_priority(&self, state: &mut PoolState) -> bool {
        let capacity_ok = state.low_priority_used < self.max_low_priority
            || matches!(state.runlevel, Runlevel::PreExitLanguages { .. });
        if !capacity_ok {
            return false;
        }
        if let Some(id) = state.low_priority.pop_front() {
            state.low_priority_used += 1;
            state.ready.push_back(id);
            trace!(%id, "low-priority task promoted");
            true
        } else {
            false
        }
    }

    /// Wakes up to `count` blocked threads, rotating through the pool from a
    /// cursor. Round-robin, not load-aware.
    fn notify_threads(&self, state: &mut PoolState, mut count: u32) {
        let n = state.threads.len();
        for offset in 0..n {
            if count == 0 {
                break;
            }
            let i = (state.notify_index + offset) % n;
            let th = &mut state.threads[i];
            if th.awaited != Await::Inactive && !th.signaled {
                th.signaled = true;
                self.worker_cvs[i].notify_one();
                count -= 1;
            }
        }
        state.notify_index = (state.notify_index + 1) % n;
    }

    /// Wakes threads blocked on the given completed unit, plus every
    /// condition waiter (they re-check their predicates).
    fn wake_completion_waiters(&self, state: &mut PoolState, completed: Await) {
        for i in 0..state.threads.len() {
            let th = &mut state.threads[i];
            let hit = match (th.awaited, completed) {
                (Await::Task(a), Await::Task(b)) => a == b,
                (Await::Group(a), Await::Group(b)) => a == b,
                (Await::Condition, _) => true,
                _ => false,
            };
            if hit && !th.signaled {
                th.signaled = true;
                self.worker_cvs[i].notify_one();
            }
        }
    }

    pub(crate) fn wake_condition_waiters(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for i in 0..state.threads.len() {
            let th = &mut state.threads[i];
            if th.awaited == Await::Condition && !th.signaled {
                th.signaled = true;
                self.worker_cvs[i].notify_one();
            }
        }
    }

    fn next_ready_task(&self, guard: &mut MutexGuard<'_, PoolState>) -> Option<TaskId> {
        let state = &mut **guard;
        if let Some(id) = state.ready.pop_front() {
            return Some(id);
        }
        if self.try_promote_low_priority(state) {
            return state.ready.pop_front();
        }
        None
    }

    /// Parks the calling worker on its condition variable until signaled.
    /// Locks registered in the unlock allowance zone are released for the
    /// duration of the park and reacquired (with the pool mutex dropped, to
    /// avoid lock-order inversion) before returning.
    fn park_worker(&self, guard: &mut MutexGuard<'_, PoolState>, index: usize, marker: Await) {
        {
            let th = &mut guard.threads[index];
            th.awaited = marker;
            th.signaled = false;
        }
        unlock_registered_locks();
        while !guard.threads[index].signaled {
            self.worker_cvs[index].wait(guard);
        }
        MutexGuard::unlocked(guard, relock_registered_locks);
        let th = &mut guard.threads[index];
        th.signaled = false;
        th.awaited = Await::Inactive;
    }

    /// The collaborative wait at the heart of the scheduler: instead of
    /// parking, keep dispatching other ready tasks until `done` holds,
    /// parking only when the queue is empty.
    fn wait_collaboratively(
        &self,
        guard: &mut MutexGuard<'_, PoolState>,
        index: usize,
        marker: Await,
        done: impl Fn(&PoolState) -> bool,
    ) {
        loop {
            // Nested dispatch may have overwritten the marker; refresh it
            // before re-checking so completion signals find this thread.
            guard.threads[index].awaited = marker;
            if done(&**guard) {
                break;
            }
            if let Some(id) = self.next_ready_task(guard) {
                self.process_task(guard, index, id);
            } else {
                self.park_worker(guard, index, marker);
            }
        }
        guard.threads[index].awaited = Await::Inactive;
    }

    /// Runs other ready work on the calling pool thread until `predicate`
    /// holds. Used by the job-graph layer; the predicate is re-checked after
    /// every completion event.
    pub(crate) fn cooperate_until(&self, predicate: impl Fn() -> bool) {
        let index = self
            .local_thread_index()
            .expect("cooperate_until requires a pool thread");
        let mut guard = self.state.lock();
        self.wait_collaboratively(&mut guard, index, Await::Condition, |_| predicate());
    }

    /// Executes one dequeued task on the calling worker. The pool mutex is
    /// released around the payload and reacquired for completion
    /// bookkeeping.
    fn process_task(&self, guard: &mut MutexGuard<'_, PoolState>, index: usize, id: TaskId) {
        let (work, group, description, low_priority) = {
            let state = &mut **guard;
            let slot = state.task_index[&id];
            let task = state.tasks.get_mut(slot).expect("queued task is live");
            task.pool_thread_index = index as i32;
            (
                std::mem::replace(&mut task.work, Work::Taken),
                task.group.clone(),
                task.description.clone(),
                task.low_priority,
            )
        };
        let prev_task = std::mem::replace(&mut guard.threads[index].current_task, Some(id));
        trace!(worker = index, %id, "executing task");

        let mut group_finished = false;
        let mut panic_message: Option<String> = None;
        MutexGuard::unlocked(guard, || match work {
            Work::Closure(f) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                    panic_message = Some(describe_panic(payload.as_ref()));
                }
            }
            Work::Native { func, userdata } => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| func(userdata.0))) {
                    panic_message = Some(describe_panic(payload.as_ref()));
                }
            }
            Work::Slice => {
                let group = group.as_ref().expect("slice task has a group");
                let (finished, message) = group.state.run_slice();
                group_finished = finished;
                panic_message = message;
            }
            Work::Taken => unreachable!("task payload already taken"),
        });

        if let Some(message) = &panic_message {
            warn!(%id, description = %description, message = %message, "task payload panicked");
        }

        {
            let state = &mut **guard;
            if let Some(group) = group {
                // Slice records are internal (no public id is handed out for
                // them); they retire as soon as they have run.
                let slot = state
                    .task_index
                    .remove(&id)
                    .expect("slice is still registered");
                state.tasks.remove(slot);
                if let Some(message) = panic_message {
                    if let Some(record) = state.groups.get_mut(group.slot) {
                        record.error.get_or_insert(TaskError::Panicked {
                            description,
                            message,
                        });
                    }
                }
                if group_finished {
                    if let Some(record) = state.groups.get_mut(group.slot) {
                        record.done_sem.post(record.waiting_user);
                    }
                    self.wake_completion_waiters(state, Await::Group(group.id));
                }
            } else {
                {
                    let slot = state.task_index[&id];
                    let task = state.tasks.get_mut(slot).expect("task is live");
                    task.completed = true;
                    task.pool_thread_index = -1;
                    task.pending_yield_over = false;
                    if let Some(message) = panic_message {
                        task.error = Some(TaskError::Panicked {
                            description,
                            message,
                        });
                    }
                    task.done_sem.post(task.waiting_user);
                }
                self.wake_completion_waiters(state, Await::Task(id));
            }
            if low_priority {
                state.low_priority_used -= 1;
                if self.try_promote_low_priority(state) {
                    self.notify_threads(state, 1);
                }
            }
        }
        guard.threads[index].current_task = prev_task;
    }

    pub(crate) fn is_task_complete(&self, id: TaskId) -> bool {
        let guard = self.state.lock();
        let slot = *guard
            .task_index
            .get(&id)
            .unwrap_or_else(|| panic!("{id} is unknown (never submitted or already waited on)"));
        guard.tasks.get(slot).expect("registered task is live").completed
    }

    pub(crate) fn wait_task(&self, id: TaskId) -> Result<(), TaskError> {
        let mut guard = self.state.lock();
        let slot = *guard
            .task_index
            .get(&id)
            .unwrap_or_else(|| panic!("{id} is unknown (never submitted or already waited on)"));
        if let Some(index) = self.local_thread_index() {
            assert!(
                guard.threads[index].current_task != Some(id),
                "a task cannot wait on its own completion"
            );
            let completed = guard.tasks.get(slot).expect("registered task is live").completed;
            if !completed {
                guard.tasks.get_mut(slot).unwrap().waiting_pool += 1;
                self.wait_collaboratively(&mut guard, index, Await::Task(id), move |state| {
                    state.tasks.get(slot).map(|t| t.completed).unwrap_or(true)
                });
                guard.tasks.get_mut(slot).unwrap().waiting_pool -= 1;
            }
        } else {
            let sem = {
                let task = guard.tasks.get_mut(slot).expect("registered task is live");
                if task.completed {
                    None
                } else {
                    task.waiting_user += 1;
                    Some(task.done_sem.clone())
                }
            };
            if let Some(sem) = sem {
                drop(guard);
                unlock_registered_locks();
                sem.wait();
                relock_registered_locks();
                guard = self.state.lock();
                guard.tasks.get_mut(slot).unwrap().waiting_user -= 1;
            }
        }
        // Last observer out reclaims the record; the id is spent.
        let state = &mut *guard;
        let task = state.tasks.get(slot).expect("task record is still live");
        debug_assert!(task.completed);
        let error = task.error.clone();
        if task.waiting_pool == 0 && task.waiting_user == 0 {
            state.tasks.remove(slot);
            state.task_index.remove(&id);
        }
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn group_slot(&self, guard: &MutexGuard<'_, PoolState>, id: GroupId) -> SlotId {
        *guard
            .group_index
            .get(&id)
            .unwrap_or_else(|| panic!("{id} is unknown (never submitted or already waited on)"))
    }

    pub(crate) fn is_group_complete(&self, id: GroupId) -> bool {
        let guard = self.state.lock();
        let slot = self.group_slot(&guard, id);
        guard.groups.get(slot).expect("registered group is live").state.is_completed()
    }

    pub(crate) fn group_progress(&self, id: GroupId) -> u32 {
        let guard = self.state.lock();
        let slot = self.group_slot(&guard, id);
        guard
            .groups
            .get(slot)
            .expect("registered group is live")
            .state
            .processed_count()
    }

    pub(crate) fn wait_group(&self, id: GroupId) -> Result<(), TaskError> {
        let mut guard = self.state.lock();
        let slot = self.group_slot(&guard, id);
        let group_state = guard
            .groups
            .get(slot)
            .expect("registered group is live")
            .state
            .clone();
        if let Some(index) = self.local_thread_index() {
            if !group_state.is_completed() {
                guard.groups.get_mut(slot).unwrap().waiting_pool += 1;
                let gs = group_state.clone();
                self.wait_collaboratively(&mut guard, index, Await::Group(id), move |_| {
                    gs.is_completed()
                });
                guard.groups.get_mut(slot).unwrap().waiting_pool -= 1;
            }
        } else {
            let sem = {
                let record = guard.groups.get_mut(slot).unwrap();
                if record.state.is_completed() {
                    None
                } else {
                    record.waiting_user += 1;
                    Some(record.done_sem.clone())
                }
            };
            if let Some(sem) = sem {
                drop(guard);
                unlock_registered_locks();
                sem.wait();
                relock_registered_locks();
                guard = self.state.lock();
                guard.groups.get_mut(slot).unwrap().waiting_user -= 1;
            }
        }
        let state = &mut *guard;
        let record = state.groups.get(slot).expect("group record is still live");
        let error = record.error.clone();
        if record.waiting_pool == 0 && record.waiting_user == 0 {
            state.groups.remove(slot);
            state.group_index.remove(&id);
        }
        match error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub(crate) fn yield_current(&self) {
        let index = self
            .local_thread_index()
            .expect("yield_current_task must be called from a pool thread");
        let mut guard = self.state.lock();
        let id = guard.threads[index]
            .current_task
            .expect("yield_current_task must be called from inside a running task");
        let slot = guard.task_index[&id];
        {
            let task = guard.tasks.get_mut(slot).expect("running task is live");
            if task.pending_yield_over {
                // The resume arrived before we got here.
                task.pending_yield_over = false;
                return;
            }
        }
        trace!(worker = index, %id, "task yielded");
        self.wait_collaboratively(&mut guard, index, Await::Yielding, move |state| {
            state.threads[index].yield_is_over
        });
        guard.threads[index].yield_is_over = false;
        if let Some(task) = guard.tasks.get_mut(slot) {
            task.pending_yield_over = false;
        }
    }

    pub(crate) fn notify_yield_over(&self, id: TaskId) {
        let mut guard = self.state.lock();
        let slot = *guard
            .task_index
            .get(&id)
            .unwrap_or_else(|| panic!("{id} is unknown (never submitted or already waited on)"));
        let state = &mut *guard;
        let task = state.tasks.get_mut(slot).expect("registered task is live");
        if task.completed {
            return;
        }
        if task.pool_thread_index < 0 {
            // Not on a thread yet; its yield point will observe the flag.
            task.pending_yield_over = true;
            return;
        }
        let index = task.pool_thread_index as usize;
        let th = &mut state.threads[index];
        th.yield_is_over = true;
        if !th.signaled {
            th.signaled = true;
            self.worker_cvs[index].notify_one();
        }
    }

    fn switch_runlevel(&self, guard: &mut MutexGuard<'_, PoolState>, new: Runlevel) {
        let state = &mut **guard;
        assert_eq!(
            new.rank(),
            state.runlevel.rank() + 1,
            "runlevels only advance forward"
        );
        debug!(from = ?state.runlevel, to = ?new, "runlevel switch");
        state.runlevel = new;
        for i in 0..state.threads.len() {
            let th = &mut state.threads[i];
            if th.awaited != Await::Inactive && !th.signaled {
                th.signaled = true;
                self.worker_cvs[i].notify_one();
            }
        }
        self.control_cv.notify_all();
    }

    /// Worker-side runlevel handling; returns true when the worker must
    /// exit. In the drain and detach phases the worker parks here between
    /// phase transitions.
    fn handle_runlevel(&self, guard: &mut MutexGuard<'_, PoolState>, index: usize) -> bool {
        loop {
            match guard.runlevel {
                Runlevel::Normal => return false,
                Runlevel::Exit => return true,
                Runlevel::PreExitLanguages { .. } => {
                    if !guard.ready.is_empty() || !guard.low_priority.is_empty() {
                        // Going back to work: a pre-exited thread no longer
                        // counts as idle until the queues are empty again.
                        if guard.threads[index].pre_exited {
                            guard.threads[index].pre_exited = false;
                            if let Runlevel::PreExitLanguages { num_idle_threads } =
                                &mut guard.runlevel
                            {
                                *num_idle_threads -= 1;
                            }
                        }
                        return false;
                    }
                    if !guard.threads[index].pre_exited {
                        guard.threads[index].pre_exited = true;
                        if let Runlevel::PreExitLanguages { num_idle_threads } = &mut guard.runlevel
                        {
                            *num_idle_threads += 1;
                        }
                        self.control_cv.notify_all();
                    }
                    self.park_worker(guard, index, Await::QueueWork);
                }
                Runlevel::ExitLanguages { .. } => {
                    if !guard.threads[index].exited {
                        guard.threads[index].exited = true;
                        if let Some(hook) = self.hooks.on_detach.clone() {
                            MutexGuard::unlocked(guard, || hook(index));
                        }
                        if let Runlevel::ExitLanguages { num_exited_threads } = &mut guard.runlevel
                        {
                            *num_exited_threads += 1;
                        }
                        self.control_cv.notify_all();
                    }
                    self.park_worker(guard, index, Await::QueueWork);
                }
            }
        }
    }

    fn begin_shutdown_phase1(&self) {
        assert!(
            self.local_thread_index().is_none(),
            "shutdown must be driven from outside the pool"
        );
        let mut guard = self.state.lock();
        if matches!(guard.runlevel, Runlevel::Normal) {
            self.switch_runlevel(&mut guard, Runlevel::PreExitLanguages { num_idle_threads: 0 });
        }
        loop {
            match guard.runlevel {
                Runlevel::PreExitLanguages { num_idle_threads } => {
                    // Draining workers may submit continuation work, so the
                    // queues must be re-checked along with the idle count.
                    if num_idle_threads as usize == self.worker_cvs.len()
                        && guard.ready.is_empty()
                        && guard.low_priority.is_empty()
                    {
                        break;
                    }
                    self.control_cv.wait(&mut guard);
                }
                // A concurrent caller advanced past this phase already.
                _ => break,
            }
        }
    }

    fn begin_shutdown_phase2(&self) {
        self.begin_shutdown_phase1();
        let mut guard = self.state.lock();
        if matches!(guard.runlevel, Runlevel::PreExitLanguages { .. }) {
            self.switch_runlevel(&mut guard, Runlevel::ExitLanguages { num_exited_threads: 0 });
        }
        loop {
            match guard.runlevel {
                Runlevel::ExitLanguages { num_exited_threads } => {
                    if num_exited_threads as usize == self.worker_cvs.len() {
                        break;
                    }
                    self.control_cv.wait(&mut guard);
                }
                _ => break,
            }
        }
    }
}

fn worker_main(shared: Arc<Shared>, index: usize) {
    POOL_THREAD.with(|slot| {
        slot.set(Some(PoolThreadRef {
            pool: Arc::as_ptr(&shared),
            index,
        }))
    });
    if let Some(hook) = &shared.hooks.on_start {
        hook(index);
    }
    debug!(worker = index, "worker started");
    let mut guard = shared.state.lock();
    loop {
        if shared.handle_runlevel(&mut guard, index) {
            break;
        }
        if let Some(id) = shared.next_ready_task(&mut guard) {
            shared.process_task(&mut guard, index, id);
        } else {
            shared.park_worker(&mut guard, index, Await::QueueWork);
        }
    }
    drop(guard);
    debug!(worker = index, "worker exited");
}

/// A fixed-size worker-thread pool executing ad-hoc tasks and data-parallel
/// group tasks, with a job-graph layer on top (see [`crate::JobHandle`]).
///
/// Identifier lifecycle: `wait_task` / `wait_group` are consuming. Once the
/// last waiter has observed completion the record is reclaimed and the id
/// becomes unknown. Polling (`is_task_complete`, `group_progress`) works any
/// time before that.
pub struct TaskPool {
    shared: Arc<Shared>,
    join_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Creates a pool from `config` with no worker hooks.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_hooks(config, WorkerHooks::default())
    }

    /// Creates a pool, installing the given per-worker hooks.
    pub fn with_hooks(config: PoolConfig, hooks: WorkerHooks) -> Self {
        let thread_count = if config.thread_count <= 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            config.thread_count as usize
        };
        let max_low_priority =
            ((thread_count as f32 * config.low_priority_ratio) as u32).clamp(1, thread_count as u32);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                runlevel: Runlevel::Normal,
                ready: VecDeque::new(),
                low_priority: VecDeque::new(),
                tasks: SlotArena::with_page_size(TASKS_PAGE_SIZE),
                task_index: HashMap::new(),
                groups: SlotArena::with_page_size(GROUPS_PAGE_SIZE),
                group_index: HashMap::new(),
                threads: (0..thread_count).map(|_| ThreadState::new()).collect(),
                low_priority_used: 0,
                notify_index: 0,
                next_id: 1,
            }),
            control_cv: Condvar::new(),
            worker_cvs: (0..thread_count).map(|_| Condvar::new()).collect(),
            max_low_priority,
            hooks,
            spans: SpanRecorder::new(config.capture_run_spans),
        });
        let mut join_handles = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, index))
                .spawn(move || worker_main(shared, index))
                .expect("failed to spawn worker thread");
            join_handles.push(handle);
        }
        info!(
            threads = thread_count,
            max_low_priority, "task pool started"
        );
        TaskPool {
            shared,
            join_handles: Mutex::new(join_handles),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Submits a closure as a normal-priority task. Never blocks.
    pub fn submit_task<F>(&self, work: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared
            .add_task_internal(Work::Closure(Box::new(work)), Priority::Normal, "")
    }

    /// Submits a closure with an explicit priority and diagnostic
    /// description.
    pub fn submit_task_with<F>(&self, work: F, priority: Priority, description: &str) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared
            .add_task_internal(Work::Closure(Box::new(work)), priority, description)
    }

    /// Submits a native function pointer plus opaque context as a task.
    pub fn submit_native_task(&self, func: NativeTaskFn, userdata: SendPtr) -> TaskId {
        self.shared
            .add_task_internal(Work::Native { func, userdata }, Priority::Normal, "")
    }

    /// Submits a data-parallel group task: `work` is invoked exactly once
    /// for every index in `[0, elements)`, split across `tasks` slices
    /// (`tasks <= 0` picks roughly one slice per pool thread; `tasks` is
    /// clamped to `elements`). `elements <= 0` yields an immediately
    /// complete group.
    pub fn submit_group_task<F>(&self, work: F, elements: i32, tasks: i32) -> GroupId
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.shared.add_group_internal(
            GroupWork::PerElement(Arc::new(work)),
            elements,
            tasks,
            None,
            Priority::Normal,
            "",
        )
    }

    /// [`Self::submit_group_task`] with explicit priority and description.
    pub fn submit_group_task_with<F>(
        &self,
        work: F,
        elements: i32,
        tasks: i32,
        priority: Priority,
        description: &str,
    ) -> GroupId
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.shared.add_group_internal(
            GroupWork::PerElement(Arc::new(work)),
            elements,
            tasks,
            None,
            priority,
            description,
        )
    }

    /// Group task whose target is range-aware: `work` receives whole claimed
    /// chunks `[begin, end)` instead of single indices.
    pub fn submit_range_group_task<F>(&self, work: F, elements: i32, tasks: i32) -> GroupId
    where
        F: Fn(u32, u32) + Send + Sync + 'static,
    {
        self.shared.add_group_internal(
            GroupWork::PerRange(Arc::new(work)),
            elements,
            tasks,
            None,
            Priority::Normal,
            "",
        )
    }

    /// Native-function variant of [`Self::submit_group_task`].
    pub fn submit_native_group_task(
        &self,
        func: NativeGroupFn,
        userdata: SendPtr,
        elements: i32,
        tasks: i32,
    ) -> GroupId {
        self.shared.add_group_internal(
            GroupWork::Native { func, userdata },
            elements,
            tasks,
            None,
            Priority::Normal,
            "",
        )
    }

    /// Non-blocking completion poll. Panics on an unknown (or already
    /// reclaimed) id.
    pub fn is_task_complete(&self, id: TaskId) -> bool {
        self.shared.is_task_complete(id)
    }

    /// Blocks until the task completes and returns its payload outcome.
    ///
    /// External threads park on the task's semaphore. A pool thread instead
    /// keeps executing other ready work until the task completes, so waiting
    /// on a dependency from inside a task cannot deadlock the pool.
    pub fn wait_task(&self, id: TaskId) -> Result<(), TaskError> {
        self.shared.wait_task(id)
    }

    /// Non-blocking group completion poll.
    pub fn is_group_complete(&self, id: GroupId) -> bool {
        self.shared.is_group_complete(id)
    }

    /// Number of group elements processed so far.
    pub fn group_progress(&self, id: GroupId) -> u32 {
        self.shared.group_progress(id)
    }

    /// Blocks until every slice of the group has finished. Same
    /// collaborative strategy as [`Self::wait_task`].
    pub fn wait_group(&self, id: GroupId) -> Result<(), TaskError> {
        self.shared.wait_group(id)
    }

    /// Suspends the current task pending [`Self::resume_yielded_task`],
    /// freeing the worker to run other queued work meanwhile. Must be called
    /// from inside a running task.
    ///
    /// No stack is captured: the call simply does not return until the
    /// resume arrives, while the thread runs other tasks underneath.
    pub fn yield_current_task(&self) {
        self.shared.yield_current();
    }

    /// Flags a yielded task as ready to resume. May be called from any
    /// thread, including before the task reached its yield point (the yield
    /// then returns immediately). Every call must pair with one yield.
    pub fn resume_yielded_task(&self, id: TaskId) {
        self.shared.notify_yield_over(id);
    }

    /// Number of worker threads.
    pub fn thread_count(&self) -> usize {
        self.shared.worker_cvs.len()
    }

    /// Index of the calling pool thread, or `None` for external threads.
    pub fn current_thread_index(&self) -> Option<usize> {
        self.shared.local_thread_index()
    }

    /// Id of the task the calling pool thread is currently running.
    pub fn current_task_id(&self) -> Option<TaskId> {
        let index = self.shared.local_thread_index()?;
        self.shared.state.lock().threads[index].current_task
    }

    /// Toggles job-graph run-span capture.
    pub fn set_capture_spans(&self, enabled: bool) {
        self.shared.spans.set_enabled(enabled);
    }

    /// Drains the recorded run spans.
    pub fn take_run_spans(&self) -> Vec<RunSpan> {
        self.shared.spans.take()
    }

    /// Shutdown phase 1: stop accepting external submissions and block until
    /// every worker has drained the queues and gone idle. Must not be called
    /// from a pool thread.
    pub fn begin_shutdown_phase1(&self) {
        self.shared.begin_shutdown_phase1();
    }

    /// Shutdown phase 2: run the detach hook on every worker and block until
    /// all have done so. Runs phase 1 first if it has not happened yet.
    pub fn begin_shutdown_phase2(&self) {
        self.shared.begin_shutdown_phase2();
    }

    /// Runs any missing shutdown phases, then joins all workers. Idempotent.
    pub fn shutdown(&self) {
        self.shared.begin_shutdown_phase2();
        {
            let mut guard = self.shared.state.lock();
            if !matches!(guard.runlevel, Runlevel::Exit) {
                self.shared.switch_runlevel(&mut guard, Runlevel::Exit);
            }
        }
        let handles: Vec<_> = self.join_handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked outside a task payload");
            }
        }
        {
            // Records still registered here finished but were never waited
            // on; their ids died with the pool.
            let guard = self.shared.state.lock();
            if guard.tasks.len() != 0 || guard.groups.len() != 0 {
                debug!(
                    tasks = guard.tasks.len(),
                    groups = guard.groups.len(),
                    "unclaimed records at shutdown"
                );
            }
        }
        info!("task pool stopped");
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        if !self.join_handles.get_mut().is_empty() {
            self.shutdown();
        }
    }
}
