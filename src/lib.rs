//! # taskpool - Worker-Thread Pool with Collaborative Waiting
//!
//! A fixed-size pool of long-lived worker threads executing ad-hoc tasks and
//! data-parallel group tasks, with a dependency-aware job-graph layer on top.
//! Key components include:
//!
//! - **Tasks**: One-shot closures or native function pointers, in a
//!   normal-priority and a throughput-capped low-priority queue
//! - **Group tasks**: "Run this for every index in `[0, N)`" submissions,
//!   split into slices that claim indices from a shared atomic counter
//! - **Collaborative waiting**: A pool thread waiting on other work keeps
//!   executing queued tasks instead of parking, so dependent waits cannot
//!   starve the pool, down to a single thread
//! - **Job graph**: Ref-counted [`JobHandle`]s with dependency lists,
//!   fan-in combination and per-element failure capture
//!
//! ## Example
//!
//! ```no_run
//! use taskpool::{PoolConfig, TaskPool};
//!
//! let pool = TaskPool::new(PoolConfig::default());
//!
//! let id = pool.submit_task(|| {
//!     println!("hello from a worker");
//! });
//! pool.wait_task(id).unwrap();
//!
//! let group = pool.submit_group_task(|i| { let _ = i * 2; }, 1024, -1);
//! pool.wait_group(group).unwrap();
//! ```

mod arena;
mod job;
mod pool;
mod span;
mod sync;
mod task;

pub use job::JobHandle;
pub use pool::{
    enter_unlock_allowance_zone, PoolConfig, Priority, TaskPool, UnlockZoneGuard, WorkerHooks,
};
pub use span::RunSpan;
pub use task::{GroupId, NativeGroupFn, NativeTaskFn, SendPtr, TaskError, TaskId};
