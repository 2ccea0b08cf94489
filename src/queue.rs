use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};
use log::debug;

use crate::common::{PoolStatus, WorkItem};
use crate::reporter::{FailureReporter, LogReporter};
use crate::store::{BacklogStore, MemoryStore};
use crate::supervisor::{Event, Supervisor};
use crate::{QueueError, Result};

/// Number of workers used when the builder is not given a size.
pub const DEFAULT_SIZE: usize = 5;

/// A named, supervised pool of worker threads.
///
/// `WorkQueue` is a cheap handle: clones talk to the same supervisor.
/// It never touches pool state itself; every call becomes an event on
/// the supervisor's channel. When the last handle is dropped the
/// supervisor stops, idle workers exit, and busy workers exit after
/// their current item.
///
/// Delivery is at most once: an item whose processor panics is lost,
/// and items still in the backlog when the queue is dropped are never
/// processed (a durable store keeps them for the next run).
pub struct WorkQueue<P, R> {
    inner: Arc<Inner<P, R>>,
}

struct Inner<P, R> {
    name: String,
    events: Sender<Event<P, R>>,
}

impl<P, R> Drop for Inner<P, R> {
    fn drop(&mut self) {
        debug!("Last handle to '{}' dropped", self.name);
        let _ = self.events.send(Event::Terminate);
    }
}

impl<P, R> Clone for WorkQueue<P, R> {
    fn clone(&self) -> Self {
        WorkQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<P, R> WorkQueue<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Starts a queue with the default size, store and reporter.
    pub fn new<F>(name: impl Into<String>, processor: F) -> Result<Self>
    where
        F: Fn(P) -> R + Send + Sync + 'static,
    {
        Self::builder(name).build(processor)
    }

    /// Returns a builder for a queue called `name`.
    pub fn builder(name: impl Into<String>) -> Builder<P, R> {
        Builder::new(name)
    }

    /// Returns the queue's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Submits a payload without a completion callback.
    ///
    /// Never waits for a worker. Fails only if the supervisor has stopped.
    pub fn submit(&self, payload: P) -> Result<()> {
        self.push(WorkItem::new(payload))
    }

    /// Submits a payload; `callback` receives the processor's result.
    ///
    /// The callback runs on the worker thread. It is never called if the
    /// processor panics for this payload.
    pub fn submit_with<F>(&self, payload: P, callback: F) -> Result<()>
    where
        F: FnOnce(R) + Send + 'static,
    {
        self.push(WorkItem::with_callback(payload, callback))
    }

    /// Submits a prepared work item.
    pub fn push(&self, item: WorkItem<P, R>) -> Result<()> {
        self.send(Event::Submit(item))
    }

    /// Returns a snapshot keyed by queue name.
    pub fn status(&self) -> Result<HashMap<String, PoolStatus>> {
        let mut status = HashMap::with_capacity(1);
        status.insert(self.inner.name.clone(), self.stats()?);
        Ok(status)
    }

    /// Returns this queue's snapshot, consistent with the supervisor's view.
    ///
    /// Blocks until the supervisor answers, so it must not be called from
    /// a shutdown callback.
    pub fn stats(&self) -> Result<PoolStatus> {
        let (tx, rx) = channel::bounded(1);
        self.send(Event::Status(tx))?;
        rx.recv().map_err(|_| self.unavailable())
    }

    /// Asks the queue to stop dispatching and drain busy workers.
    ///
    /// Work submitted afterwards is kept in the backlog and not processed.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Event::Shutdown(None))
    }

    /// Like [`shutdown`](Self::shutdown); `callback` runs once on the
    /// supervisor thread after the last busy item has finished, or right
    /// away if nothing is busy.
    pub fn shutdown_with<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(&PoolStatus) + Send + 'static,
    {
        self.send(Event::Shutdown(Some(Box::new(callback))))
    }

    /// Requests shutdown and blocks until the queue has drained.
    ///
    /// Returns the status at the moment the pool drained.
    pub fn shutdown_and_wait(&self) -> Result<PoolStatus> {
        let (tx, rx) = channel::bounded(1);
        self.shutdown_with(move |status| {
            let _ = tx.send(status.clone());
        })?;
        rx.recv().map_err(|_| self.unavailable())
    }

    fn send(&self, event: Event<P, R>) -> Result<()> {
        self.inner.events.send(event).map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> QueueError {
        QueueError::SupervisorUnavailable(self.inner.name.clone())
    }
}

/// Configures and starts a [`WorkQueue`].
pub struct Builder<P, R> {
    name: String,
    size: usize,
    store: Option<Box<dyn BacklogStore<WorkItem<P, R>>>>,
    reporter: Box<dyn FailureReporter>,
}

impl<P, R> Builder<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn new(name: impl Into<String>) -> Self {
        Builder {
            name: name.into(),
            size: DEFAULT_SIZE,
            store: None,
            reporter: Box::new(LogReporter),
        }
    }

    /// Sets the number of workers. Must be at least 1.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Uses `store` for the backlog instead of an in-memory FIFO.
    pub fn store<S>(mut self, store: S) -> Self
    where
        S: BacklogStore<WorkItem<P, R>>,
    {
        self.store = Some(Box::new(store));
        self
    }

    /// Uses `reporter` for failures instead of logging them.
    pub fn reporter<E: FailureReporter>(mut self, reporter: E) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    /// Spawns the workers and the supervisor thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the size is 0 or a thread cannot be spawned.
    pub fn build<F>(self, processor: F) -> Result<WorkQueue<P, R>>
    where
        F: Fn(P) -> R + Send + Sync + 'static,
    {
        if self.size == 0 {
            return Err(QueueError::InvalidSize(self.size));
        }

        let (tx, rx) = channel::unbounded();
        let store: Box<dyn BacklogStore<WorkItem<P, R>>> = match self.store {
            Some(store) => store,
            None => Box::new(MemoryStore::new()),
        };
        let mut supervisor = Supervisor::new(
            self.name.clone(),
            self.size,
            Arc::new(processor),
            store,
            self.reporter,
            tx.clone(),
        );
        supervisor.start_workers()?;

        thread::Builder::new()
            .name(format!("{}-supervisor", self.name))
            .spawn(move || supervisor.run(rx))?;

        Ok(WorkQueue {
            inner: Arc::new(Inner {
                name: self.name,
                events: tx,
            }),
        })
    }
}
