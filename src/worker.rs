use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Receiver, SendError, Sender};
use log::debug;

use crate::common::{panic_message, FailureKind, WorkItem, WorkerId};
use crate::supervisor::Event;

/// The user-supplied processing function shared by every worker of a pool.
pub(crate) type Processor<P, R> = Arc<dyn Fn(P) -> R + Send + Sync + 'static>;

/// The supervisor's side of one worker: its id and its dispatch channel.
pub(crate) struct WorkerHandle<P, R> {
    id: WorkerId,
    tx: Sender<WorkItem<P, R>>,
}

impl<P, R> WorkerHandle<P, R> {
    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    /// Hands an item to the worker without waiting for it to be picked up.
    pub(crate) fn dispatch(
        &self,
        item: WorkItem<P, R>,
    ) -> Result<(), SendError<WorkItem<P, R>>> {
        self.tx.send(item)
    }

    /// A handle whose worker thread is already gone.
    #[cfg(test)]
    pub(crate) fn detached(id: WorkerId) -> Self {
        let (tx, _) = channel::unbounded();
        WorkerHandle { id, tx }
    }
}

/// Reports the worker as failed if its thread unwinds past the catch points.
struct Sentinel<P, R> {
    id: WorkerId,
    events: Sender<Event<P, R>>,
}

impl<P, R> Drop for Sentinel<P, R> {
    fn drop(&mut self) {
        if thread::panicking() {
            let _ = self.events.send(Event::Failed(
                self.id,
                FailureKind::Worker,
                "worker thread panicked".to_owned(),
            ));
        }
    }
}

/// Spawns a worker thread that reports back on `events`.
///
/// The worker runs one item at a time. A panic in the processor is
/// caught, sent to the supervisor as `Event::Failed`, and ends the
/// thread. A panic in the completion callback is reported as
/// `Event::CallbackFailed` and the worker carries on. Any other panic on
/// the thread, such as a result whose `Drop` panics, is caught by a
/// sentinel and reported as a `Worker` failure.
pub(crate) fn spawn_worker<P, R>(
    queue: &str,
    id: WorkerId,
    processor: Processor<P, R>,
    events: Sender<Event<P, R>>,
) -> std::io::Result<WorkerHandle<P, R>>
where
    P: Send + 'static,
    R: Send + 'static,
{
    let (tx, rx) = channel::unbounded();
    thread::Builder::new()
        .name(format!("{queue}-worker-{}", id.0))
        .spawn(move || run(id, rx, processor, events))?;
    Ok(WorkerHandle { id, tx })
}

fn run<P, R>(
    id: WorkerId,
    rx: Receiver<WorkItem<P, R>>,
    processor: Processor<P, R>,
    events: Sender<Event<P, R>>,
) {
    let _sentinel = Sentinel {
        id,
        events: events.clone(),
    };
    for item in rx.iter() {
        let (payload, callback) = item.into_parts();
        debug!("{id} processing item");

        let result = match panic::catch_unwind(AssertUnwindSafe(|| processor(payload))) {
            Ok(result) => result,
            Err(e) => {
                let reason = panic_message(e.as_ref());
                let _ = events.send(Event::Failed(id, FailureKind::Processing, reason));
                return;
            }
        };

        if let Some(callback) = callback {
            if let Err(e) = panic::catch_unwind(AssertUnwindSafe(move || callback(result))) {
                let _ = events.send(Event::CallbackFailed(id, panic_message(e.as_ref())));
            }
        } else {
            // Dropped while still busy, so a panicking `Drop` is charged to this item.
            drop(result);
        }

        if events.send(Event::Ready(id)).is_err() {
            debug!("{id}: supervisor gone, shutting down");
            return;
        }
    }
    debug!("{id}: channel closed, shutting down");
}
