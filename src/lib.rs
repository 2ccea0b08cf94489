#![deny(missing_docs)]

//! A supervised, in-process worker pool.
//!
//! Callers submit work to a named [`WorkQueue`]. A fixed number of worker
//! threads run a user-supplied processor over each item. Work that cannot
//! be dispatched right away waits in a pluggable [`BacklogStore`]. A
//! single supervisor thread owns all pool state and processes events one
//! at a time; when a processor panics, the supervisor reports the failure
//! through a [`FailureReporter`] and spawns a replacement worker.
//!
//! ```no_run
//! use workq::WorkQueue;
//!
//! let queue = WorkQueue::builder("doubler").size(2).build(|n: u64| n * 2)?;
//! queue.submit_with(21, |r| println!("{}", r))?;
//! let status = queue.shutdown_and_wait()?;
//! assert_eq!(status.busy, 0);
//! # Ok::<(), workq::QueueError>(())
//! ```

mod common;
mod error;
mod queue;
mod reporter;
/// Backlog store implementations.
pub mod store;
mod supervisor;
mod worker;

pub use common::{Callback, Failure, FailureKind, PoolStatus, WorkItem, WorkerId};
pub use error::{QueueError, Result};
pub use queue::{Builder, WorkQueue, DEFAULT_SIZE};
pub use reporter::{FailureReporter, LogReporter};
pub use store::{BacklogStore, MemoryStore, SledStore};
