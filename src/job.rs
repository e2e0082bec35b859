//! Job-graph layer: named, ref-counted handles with dependencies on top of
//! the raw pool.
//!
//! A [`JobHandle`] tracks one scheduled unit of work (a single closure or a
//! data-parallel sweep) plus the handles it depends on. Scheduling a job
//! enqueues a small launcher task; if any dependency is still unfinished,
//! the launcher does not block the worker but parks itself as a completion
//! continuation on that dependency and is re-run when it finishes. Only
//! once every dependency is complete does the payload fan out as a group
//! submission. Completion is counted in work units so a handle flips to
//! complete exactly when its last element has run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::pool::{Priority, Shared, TaskPool};
use crate::span::RunSpan;
use crate::task::{describe_panic, GroupWork, NativeGroupFn, SendPtr, Work};

/// Deferred work re-run when a handle completes.
type Continuation = Box<dyn FnOnce() + Send>;

struct JobInner {
    name: Arc<str>,
    pool: Arc<Shared>,
    deps: Mutex<Vec<JobHandle>>,
    /// Once set, the dependency list is immutable.
    frozen: AtomicBool,
    /// Total work units; one per element, and 1 for a plain closure job.
    target_units: u32,
    completed_units: AtomicU32,
    completed: AtomicBool,
    is_error: AtomicBool,
    error_message: Mutex<Option<String>>,
    /// False for combined handles, which carry no work of their own and
    /// complete when their dependencies do.
    has_payload: bool,
    /// Continuations fired by `mark_completed`; launches blocked on this
    /// handle wait here instead of occupying a worker.
    waiters: Mutex<Vec<Continuation>>,
    done_lock: Mutex<()>,
    done_cv: Condvar,
}

/// Shareable handle to a scheduled (or combined) job.
///
/// Clones refer to the same job. Handles may be held long after the job
/// finished; completion state and the error flag stay readable for as long
/// as any clone lives.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobInner>,
}

impl JobHandle {
    fn new(pool: Arc<Shared>, name: &str, target_units: u32, has_payload: bool) -> Self {
        JobHandle {
            inner: Arc::new(JobInner {
                name: Arc::from(name),
                pool,
                deps: Mutex::new(Vec::new()),
                frozen: AtomicBool::new(false),
                target_units,
                completed_units: AtomicU32::new(0),
                completed: AtomicBool::new(false),
                is_error: AtomicBool::new(false),
                error_message: Mutex::new(None),
                has_payload,
                waiters: Mutex::new(Vec::new()),
                done_lock: Mutex::new(()),
                done_cv: Condvar::new(),
            }),
        }
    }

    /// Diagnostic name given at scheduling.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Adds a dependency. Only valid while the handle is still mutable: a
    /// scheduled job's dependency list is frozen, as is a combined handle
    /// once it has been waited on or polled. Panics otherwise, and on
    /// self-dependency.
    pub fn push_depend(&self, other: &JobHandle) {
        assert!(
            !self.inner.frozen.load(Ordering::Acquire),
            "cannot add a dependency to `{}` after it was scheduled",
            self.name()
        );
        assert!(
            !Arc::ptr_eq(&self.inner, &other.inner),
            "job `{}` cannot depend on itself",
            self.name()
        );
        self.inner.deps.lock().push(other.clone());
    }

    /// Non-blocking completion poll. Polling a combined handle freezes it.
    pub fn is_completed(&self) -> bool {
        if self.inner.completed.load(Ordering::Acquire) {
            return true;
        }
        if !self.inner.has_payload {
            self.freeze();
            if self.dependencies().iter().all(|dep| dep.is_completed()) {
                self.mark_completed();
                return true;
            }
        }
        false
    }

    /// Blocks until the job (and, for combined handles, every dependency)
    /// has completed. On a pool thread this keeps executing other ready
    /// work instead of parking.
    pub fn wait_completion(&self) {
        if self.inner.completed.load(Ordering::Acquire) {
            return;
        }
        self.freeze();
        if !self.inner.has_payload {
            for dep in self.dependencies() {
                dep.wait_completion();
            }
            self.mark_completed();
            return;
        }
        if self.inner.pool.local_thread_index().is_some() {
            let inner = self.inner.clone();
            self.inner
                .pool
                .cooperate_until(move || inner.completed.load(Ordering::Acquire));
        } else {
            // Most handles are awaited moments before they finish; spin
            // briefly before committing to a park.
            let backoff = Backoff::new();
            while !backoff.is_completed() {
                if self.inner.completed.load(Ordering::Acquire) {
                    return;
                }
                backoff.snooze();
            }
            let mut guard = self.inner.done_lock.lock();
            while !self.inner.completed.load(Ordering::Acquire) {
                self.inner.done_cv.wait(&mut guard);
            }
        }
    }

    /// Whether any element of the job panicked.
    pub fn is_error(&self) -> bool {
        self.inner.is_error.load(Ordering::Acquire)
    }

    /// First recorded failure message, if any.
    pub fn error_message(&self) -> Option<String> {
        self.inner.error_message.lock().clone()
    }

    fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::Release);
    }

    fn dependencies(&self) -> Vec<JobHandle> {
        self.inner.deps.lock().clone()
    }

    /// Runs `continuation` once this handle is complete: immediately if it
    /// already is, otherwise when `mark_completed` fires. For payload-less
    /// handles the continuation is chained onto the first unfinished
    /// dependency and re-evaluates this handle when that one finishes.
    fn when_completed(&self, continuation: Continuation) {
        if self.is_completed() {
            continuation();
            return;
        }
        if !self.inner.has_payload {
            self.freeze();
            let pending = self
                .dependencies()
                .into_iter()
                .find(|dep| !dep.is_completed());
            match pending {
                Some(dep) => {
                    let this = self.clone();
                    dep.when_completed(Box::new(move || this.when_completed(continuation)));
                }
                None => {
                    self.mark_completed();
                    continuation();
                }
            }
            return;
        }
        {
            let mut waiters = self.inner.waiters.lock();
            // Re-check under the waiters lock; mark_completed sets the flag
            // before draining, so a push seen here is always drained.
            if !self.inner.completed.load(Ordering::Acquire) {
                waiters.push(continuation);
                return;
            }
        }
        continuation();
    }

    fn add_completed_units(&self, units: u32) {
        let done = self.inner.completed_units.fetch_add(units, Ordering::AcqRel) + units;
        if done >= self.inner.target_units {
            self.mark_completed();
        }
    }

    fn mark_completed(&self) {
        if self.inner.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        trace!(job = %self.inner.name, "job completed");
        {
            let _guard = self.inner.done_lock.lock();
            self.inner.done_cv.notify_all();
        }
        self.inner.pool.wake_condition_waiters();
        let waiters = std::mem::take(&mut *self.inner.waiters.lock());
        for continuation in waiters {
            continuation();
        }
    }

    fn record_error(&self, message: String) {
        self.inner.is_error.store(true, Ordering::Release);
        self.inner.error_message.lock().get_or_insert(message);
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("name", &self.inner.name)
            .field("completed", &self.inner.completed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Fans the job out as a group submission once every dependency is
/// complete. Never blocks: with an unfinished dependency it re-registers
/// itself as that dependency's completion continuation and returns, so a
/// worker can never strand an unlaunched producer beneath a consumer on
/// its own stack.
fn launch_when_ready(handle: JobHandle, work: Arc<dyn Fn(u32) + Send + Sync>, batch: u32) {
    if let Some(dep) = handle
        .dependencies()
        .into_iter()
        .find(|dep| !dep.is_completed())
    {
        dep.when_completed(Box::new(move || launch_when_ready(handle, work, batch)));
        return;
    }
    let total = handle.inner.target_units;
    if total == 0 {
        handle.mark_completed();
        return;
    }
    let slices = total.div_ceil(batch);
    let pool = handle.inner.pool.clone();
    let span_name = handle.inner.name.clone();
    let runner_handle = handle.clone();
    let runner_pool = pool.clone();
    let runner = move |begin: u32, end: u32| {
        let capture = runner_pool.spans_enabled();
        let started = Instant::now();
        for index in begin..end {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| work(index))) {
                runner_handle.record_error(describe_panic(payload.as_ref()));
            }
        }
        if capture {
            runner_pool.record_span(RunSpan {
                thread_index: runner_pool
                    .local_thread_index()
                    .expect("job slices run on pool threads"),
                name: span_name.clone(),
                begin,
                end,
                started,
                finished: Instant::now(),
            });
        }
        // Panicked elements still count: the unit tally must reach the
        // target or the handle never completes.
        runner_handle.add_completed_units(end - begin);
    };
    pool.add_group_internal(
        GroupWork::PerRange(Arc::new(runner)),
        total as i32,
        slices as i32,
        Some(batch),
        Priority::Normal,
        &handle.inner.name,
    );
}

impl TaskPool {
    /// Schedules `work` to run once per element index in `[0, elements)`,
    /// in batches of `batch_size`, after `depends_on` (if given) has
    /// completed. The returned handle is already scheduled and frozen.
    pub fn submit_group_job<F>(
        &self,
        name: &str,
        work: F,
        elements: i32,
        batch_size: i32,
        depends_on: Option<&JobHandle>,
    ) -> JobHandle
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.submit_group_job_inner(name, Arc::new(work), elements, batch_size, depends_on)
    }

    /// Native-function variant of [`Self::submit_group_job`].
    pub fn submit_native_group_job(
        &self,
        name: &str,
        func: NativeGroupFn,
        userdata: SendPtr,
        elements: i32,
        batch_size: i32,
        depends_on: Option<&JobHandle>,
    ) -> JobHandle {
        self.submit_group_job_inner(
            name,
            Arc::new(move |index| {
                // Rebind so the closure captures the whole wrapper, not the
                // raw pointer field.
                let userdata = userdata;
                func(userdata.0, index)
            }),
            elements,
            batch_size,
            depends_on,
        )
    }

    /// Schedules a single closure as a one-unit job.
    pub fn submit_job<F>(&self, name: &str, work: F, depends_on: Option<&JobHandle>) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let cell = Mutex::new(Some(work));
        self.submit_group_job_inner(
            name,
            Arc::new(move |_| {
                if let Some(work) = cell.lock().take() {
                    work();
                }
            }),
            1,
            1,
            depends_on,
        )
    }

    /// Returns an unscheduled handle that completes when every handle in
    /// `handles` has completed. Carries no payload; more dependencies may be
    /// pushed until it is first waited on or polled.
    pub fn combine(&self, handles: &[JobHandle]) -> JobHandle {
        let combined = JobHandle::new(self.shared().clone(), "combined", 0, false);
        combined.inner.deps.lock().extend(handles.iter().cloned());
        combined
    }

    fn submit_group_job_inner(
        &self,
        name: &str,
        work: Arc<dyn Fn(u32) + Send + Sync>,
        elements: i32,
        batch_size: i32,
        depends_on: Option<&JobHandle>,
    ) -> JobHandle {
        let target_units = elements.max(0) as u32;
        let handle = JobHandle::new(self.shared().clone(), name, target_units, true);
        if let Some(dep) = depends_on {
            handle.inner.deps.lock().push(dep.clone());
        }
        handle.freeze();

        let batch = batch_size.max(1) as u32;
        let launcher_handle = handle.clone();
        let description = format!("job:{name}");
        self.shared().add_task_internal(
            Work::Closure(Box::new(move || {
                launch_when_ready(launcher_handle, work, batch)
            })),
            Priority::Normal,
            &description,
        );
        handle
    }
}
