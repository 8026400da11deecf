//! Cooperative coroutine layer.
//!
//! Rust futures are the coroutine substrate. A suspended unit of work lives
//! in the manager's continuation table; its waker schedules a
//! `ContinuableEvent` back onto the owning loop's queue at the coroutine
//! priority, so resumption always flows through normal event dispatch.

mod events;
mod mutex;
mod task;
pub(crate) mod waker;

pub use events::{AsyncAutoResetEvent, AsyncManualResetEvent, AutoResetWait, ManualResetWait};
pub use mutex::{AsyncMutexGuard, AsyncSingleThreadedMutex, MutexLockFuture};
pub use task::Task;

pub(crate) use task::TaskCompletion;
