use std::any::Any;
use std::fmt;

use serde::Serialize;

/// Completion callback invoked with the processor's result.
pub type Callback<R> = Box<dyn FnOnce(R) + Send + 'static>;

/// Identity of one worker thread. Respawned workers get fresh ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// One unit of work: a payload plus an optional completion callback.
pub struct WorkItem<P, R> {
    payload: P,
    callback: Option<Callback<R>>,
}

impl<P, R> WorkItem<P, R> {
    /// Creates a work item without a completion callback.
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            callback: None,
        }
    }

    /// Creates a work item whose callback receives the processor's result.
    pub fn with_callback<F>(payload: P, callback: F) -> Self
    where
        F: FnOnce(R) + Send + 'static,
    {
        Self {
            payload,
            callback: Some(Box::new(callback)),
        }
    }

    /// Reassembles an item from its parts, e.g. after a durable store round trip.
    pub fn from_parts(payload: P, callback: Option<Callback<R>>) -> Self {
        Self { payload, callback }
    }

    /// Returns the payload.
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Returns `true` if a completion callback is attached.
    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Splits the item into its payload and callback.
    pub fn into_parts(self) -> (P, Option<Callback<R>>) {
        (self.payload, self.callback)
    }
}

impl<P: fmt::Debug, R> fmt::Debug for WorkItem<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("payload", &self.payload)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    /// The processing function panicked; the worker was replaced.
    Processing,
    /// A worker thread died outside the processor, or could not be reached.
    Worker,
    /// A per-item completion callback panicked.
    Callback,
    /// The shutdown completion callback panicked.
    ShutdownCallback,
    /// The backlog store returned an error.
    Store,
    /// A replacement worker thread could not be spawned.
    Spawn,
}

/// A failure reason handed to the [`FailureReporter`](crate::FailureReporter).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Name of the queue the failure happened in.
    pub queue: String,
    /// The worker involved, if any.
    pub worker: Option<WorkerId>,
    /// Category of the failure.
    pub kind: FailureKind,
    /// Panic message or error text.
    pub reason: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.worker {
            Some(id) => write!(
                f,
                "[{}] {:?} failure in {}: {}",
                self.queue, self.kind, id, self.reason
            ),
            None => write!(f, "[{}] {:?} failure: {}", self.queue, self.kind, self.reason),
        }
    }
}

/// Point-in-time snapshot of a pool, as returned by `status()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Process id hosting the pool.
    pub pid: u32,
    /// Configured number of workers.
    pub pool_size: usize,
    /// Idle workers.
    pub ready: usize,
    /// Workers executing an item.
    pub busy: usize,
    /// Items waiting in the backlog store.
    pub backlog: usize,
    /// Total items submitted.
    pub total_queued: u64,
    /// Total items that finished processing.
    pub total_processed: u64,
    /// Total processing failures.
    pub total_errors: u64,
    /// Seconds since the pool was started.
    pub uptime: u64,
    /// Unix timestamp (seconds) of pool start.
    pub started_at: u64,
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
