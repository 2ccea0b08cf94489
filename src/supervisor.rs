use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Receiver, SendError, Sender};
use log::{debug, error, info, warn};

use crate::common::{panic_message, Failure, FailureKind, PoolStatus, WorkItem, WorkerId};
use crate::reporter::FailureReporter;
use crate::store::BacklogStore;
use crate::worker::{spawn_worker, Processor, WorkerHandle};
use crate::Result;

/// Callback run once the pool has drained after a shutdown request.
pub(crate) type ShutdownCallback = Box<dyn FnOnce(&PoolStatus) + Send + 'static>;

/// Everything the supervisor reacts to, delivered on one channel.
pub(crate) enum Event<P, R> {
    /// A caller submitted work.
    Submit(WorkItem<P, R>),
    /// A worker finished its item and wants more.
    Ready(WorkerId),
    /// A worker's thread has exited abnormally.
    Failed(WorkerId, FailureKind, String),
    /// A completion callback panicked; the worker is still alive.
    CallbackFailed(WorkerId, String),
    /// A caller asked the pool to drain.
    Shutdown(Option<ShutdownCallback>),
    /// A caller wants a status snapshot.
    Status(Sender<PoolStatus>),
    /// The last facade handle was dropped.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownState {
    Running,
    Draining,
    Drained,
}

/// Sole owner of pool state. Runs on its own thread and handles one
/// event at a time, so none of its fields need locking.
pub(crate) struct Supervisor<P, R> {
    name: String,
    size: usize,
    started: Instant,
    started_at: u64,
    processor: Processor<P, R>,
    events: Sender<Event<P, R>>,
    /// Stack: the most recently idle worker is dispatched first.
    idle: Vec<WorkerHandle<P, R>>,
    busy: HashMap<WorkerId, WorkerHandle<P, R>>,
    store: Box<dyn BacklogStore<WorkItem<P, R>>>,
    reporter: Box<dyn FailureReporter>,
    next_worker: u64,
    state: ShutdownState,
    on_drained: Vec<ShutdownCallback>,
    total_queued: u64,
    total_processed: u64,
    total_errors: u64,
}

impl<P, R> Supervisor<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(
        name: String,
        size: usize,
        processor: Processor<P, R>,
        store: Box<dyn BacklogStore<WorkItem<P, R>>>,
        reporter: Box<dyn FailureReporter>,
        events: Sender<Event<P, R>>,
    ) -> Self {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            name,
            size,
            started: Instant::now(),
            started_at,
            processor,
            events,
            idle: Vec::with_capacity(size),
            busy: HashMap::with_capacity(size),
            store,
            reporter,
            next_worker: 0,
            state: ShutdownState::Running,
            on_drained: Vec::new(),
            total_queued: 0,
            total_processed: 0,
            total_errors: 0,
        }
    }

    /// Spawns the initial `size` workers into the idle set.
    pub(crate) fn start_workers(&mut self) -> Result<()> {
        for _ in 0..self.size {
            let worker = self.spawn()?;
            self.idle.push(worker);
        }
        info!("Started queue '{}' with {} workers", self.name, self.size);
        // A durable store may hold work from a previous run.
        self.drain();
        Ok(())
    }

    /// Runs the event loop until `Terminate` arrives or every sender is gone.
    ///
    /// A panic inside event handling is fatal for the pool: it is logged
    /// and the loop is not restarted. Dropping the receiver makes later
    /// submissions fail with `SupervisorUnavailable`.
    pub(crate) fn run(mut self, rx: Receiver<Event<P, R>>) {
        let name = self.name.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
            for event in rx.iter() {
                if !self.handle(event) {
                    break;
                }
            }
            info!("Supervisor for '{}' stopped", self.name);
        }));
        if let Err(e) = outcome {
            error!(
                "Fatal error in work queue: supervisor for '{}' died: {}",
                name,
                panic_message(e.as_ref())
            );
        }
    }

    /// Processes one event. Returns `false` when the loop should stop.
    pub(crate) fn handle(&mut self, event: Event<P, R>) -> bool {
        match event {
            Event::Submit(item) => self.on_submit(item),
            Event::Ready(id) => self.on_ready(id),
            Event::Failed(id, kind, reason) => self.on_failed(id, kind, reason),
            Event::CallbackFailed(id, reason) => {
                self.report(FailureKind::Callback, Some(id), reason)
            }
            Event::Shutdown(callback) => self.on_shutdown(callback),
            Event::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Event::Terminate => return false,
        }
        true
    }

    fn on_submit(&mut self, item: WorkItem<P, R>) {
        self.total_queued += 1;
        if self.state == ShutdownState::Running {
            if let Some(worker) = self.idle.pop() {
                self.assign(worker, item);
                self.drain();
                return;
            }
        }
        self.enqueue(item);
    }

    fn on_ready(&mut self, id: WorkerId) {
        let worker = match self.busy.remove(&id) {
            Some(worker) => worker,
            None => {
                warn!("Ready from unknown {} in '{}'", id, self.name);
                return;
            }
        };
        self.total_processed += 1;

        if self.state == ShutdownState::Running {
            if let Some(item) = self.dequeue() {
                self.assign(worker, item);
                self.drain();
                return;
            }
        }

        self.idle.push(worker);
        self.check_drained();
    }

    fn on_failed(&mut self, id: WorkerId, kind: FailureKind, reason: String) {
        if !self.retire(id, kind, reason) {
            return;
        }
        if self.state == ShutdownState::Running {
            self.drain();
        } else {
            self.check_drained();
        }
    }

    fn on_shutdown(&mut self, callback: Option<ShutdownCallback>) {
        match self.state {
            ShutdownState::Running => {
                info!(
                    "Shutdown requested for '{}', {} busy",
                    self.name,
                    self.busy.len()
                );
                self.state = ShutdownState::Draining;
                self.on_drained.extend(callback);
                self.check_drained();
            }
            ShutdownState::Draining => {
                debug!("'{}' is already draining", self.name);
                self.on_drained.extend(callback);
            }
            ShutdownState::Drained => {
                debug!("'{}' is already drained", self.name);
                if let Some(callback) = callback {
                    let status = self.status();
                    self.run_shutdown_callback(callback, &status);
                }
            }
        }
    }

    /// Removes a dead worker from whichever set holds it, counts the
    /// failure, spawns a replacement into the idle set and reports.
    ///
    /// Returns `false` if the worker was already retired.
    fn retire(&mut self, id: WorkerId, kind: FailureKind, reason: String) -> bool {
        // The item a busy worker held is gone with it.
        let known = self.busy.remove(&id).is_some() || {
            let before = self.idle.len();
            self.idle.retain(|w| w.id() != id);
            self.idle.len() != before
        };
        if !known {
            debug!("{} in '{}' was already replaced", id, self.name);
            return false;
        }

        self.total_errors += 1;
        match self.spawn() {
            Ok(worker) => {
                info!("Replaced {} with {} in '{}'", id, worker.id(), self.name);
                self.idle.push(worker);
            }
            Err(e) => self.report(FailureKind::Spawn, None, e.to_string()),
        }
        self.report(kind, Some(id), reason);
        true
    }

    /// Matches idle workers with backlog items until one side runs out.
    fn drain(&mut self) {
        while !self.idle.is_empty() && self.store.size() > 0 {
            let Some(worker) = self.idle.pop() else { break };
            match self.dequeue() {
                Some(item) => self.assign(worker, item),
                None => {
                    self.idle.push(worker);
                    break;
                }
            }
        }
    }

    fn assign(&mut self, worker: WorkerHandle<P, R>, item: WorkItem<P, R>) {
        let id = worker.id();
        debug!("Dispatching to {} in '{}'", id, self.name);
        let dispatched = worker.dispatch(item);
        self.busy.insert(id, worker);
        if let Err(SendError(item)) = dispatched {
            // Its thread is gone; hand the undelivered item to the replacement.
            self.retire(id, FailureKind::Worker, "worker thread exited".to_owned());
            self.enqueue(item);
        }
    }

    fn enqueue(&mut self, item: WorkItem<P, R>) {
        debug!("Backlogging item in '{}'", self.name);
        if let Err(e) = self.store.push(item) {
            self.report(FailureKind::Store, None, e.to_string());
        }
    }

    fn dequeue(&mut self) -> Option<WorkItem<P, R>> {
        match self.store.pop() {
            Ok(item) => item,
            Err(e) => {
                self.report(FailureKind::Store, None, e.to_string());
                None
            }
        }
    }

    fn check_drained(&mut self) {
        if self.state != ShutdownState::Draining || !self.busy.is_empty() {
            return;
        }
        self.state = ShutdownState::Drained;
        info!(
            "Queue '{}' drained, {} left in backlog",
            self.name,
            self.store.size()
        );
        let status = self.status();
        for callback in std::mem::take(&mut self.on_drained) {
            self.run_shutdown_callback(callback, &status);
        }
    }

    fn run_shutdown_callback(&mut self, callback: ShutdownCallback, status: &PoolStatus) {
        if let Err(e) = panic::catch_unwind(AssertUnwindSafe(move || callback(status))) {
            self.report(FailureKind::ShutdownCallback, None, panic_message(e.as_ref()));
        }
    }

    /// Hands a failure to the reporter, falling back to the log if it panics.
    fn report(&mut self, kind: FailureKind, worker: Option<WorkerId>, reason: String) {
        let failure = Failure {
            queue: self.name.clone(),
            worker,
            kind,
            reason,
        };
        let reporter = &mut self.reporter;
        if let Err(e) = panic::catch_unwind(AssertUnwindSafe(|| reporter.handle(&failure))) {
            error!(
                "Failure reporter panicked ({}) while handling: {}",
                panic_message(e.as_ref()),
                failure
            );
        }
    }

    fn spawn(&mut self) -> std::io::Result<WorkerHandle<P, R>> {
        let id = WorkerId(self.next_worker);
        self.next_worker += 1;
        spawn_worker(&self.name, id, self.processor.clone(), self.events.clone())
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            pid: process::id(),
            pool_size: self.size,
            ready: self.idle.len(),
            busy: self.busy.len(),
            backlog: self.store.size(),
            total_queued: self.total_queued,
            total_processed: self.total_processed,
            total_errors: self.total_errors,
            uptime: self.started.elapsed().as_secs(),
            started_at: self.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crossbeam::channel::{self, Receiver};

    use super::*;
    use crate::store::MemoryStore;
    use crate::QueueError;

    type Failures = Arc<Mutex<Vec<Failure>>>;
    type Harness = (Supervisor<u32, u32>, Receiver<Event<u32, u32>>, Failures);

    /// Builds a supervisor driven by hand: the test owns the event receiver
    /// and feeds worker events back in with `pump`.
    fn supervisor<F>(size: usize, processor: F) -> Harness
    where
        F: Fn(u32) -> u32 + Send + Sync + 'static,
    {
        supervisor_with(size, Box::new(MemoryStore::new()), processor)
    }

    fn supervisor_with<F>(
        size: usize,
        store: Box<dyn BacklogStore<WorkItem<u32, u32>>>,
        processor: F,
    ) -> Harness
    where
        F: Fn(u32) -> u32 + Send + Sync + 'static,
    {
        let (tx, rx) = channel::unbounded();
        let failures: Failures = Arc::default();
        let sink = failures.clone();
        let mut sup = Supervisor::new(
            "test".to_owned(),
            size,
            Arc::new(processor),
            store,
            Box::new(move |f: &Failure| sink.lock().unwrap().push(f.clone())),
            tx,
        );
        sup.start_workers().unwrap();
        (sup, rx, failures)
    }

    fn pump(sup: &mut Supervisor<u32, u32>, rx: &Receiver<Event<u32, u32>>) {
        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(sup.handle(event));
    }

    fn submit(sup: &mut Supervisor<u32, u32>, n: u32) {
        sup.handle(Event::Submit(WorkItem::new(n)));
    }

    #[test]
    fn overflow_goes_to_backlog_then_drains() {
        let (mut sup, rx, _) = supervisor(2, |n| n * 2);
        for n in [5, 7, 9, 11] {
            submit(&mut sup, n);
        }
        let s = sup.status();
        assert_eq!((s.ready, s.busy, s.backlog, s.total_queued), (0, 2, 2, 4));

        // Each ready worker takes the next backlog item and stays busy.
        pump(&mut sup, &rx);
        assert_eq!((sup.status().busy, sup.status().backlog), (2, 1));
        pump(&mut sup, &rx);
        assert_eq!((sup.status().busy, sup.status().backlog), (2, 0));
        pump(&mut sup, &rx);
        pump(&mut sup, &rx);

        let s = sup.status();
        assert_eq!((s.ready, s.busy, s.backlog, s.total_processed), (2, 0, 0, 4));
    }

    #[test]
    fn most_recently_idle_worker_is_reused() {
        let (mut sup, rx, _) = supervisor(3, |n| n);
        let top = sup.idle.last().unwrap().id();
        submit(&mut sup, 1);
        assert!(sup.busy.contains_key(&top));
        pump(&mut sup, &rx);
        assert_eq!(sup.idle.last().unwrap().id(), top);
    }

    #[test]
    fn crashed_worker_is_replaced_and_reported() {
        let (mut sup, rx, failures) = supervisor(2, |n| {
            if n == 0 {
                panic!("zero");
            }
            n
        });
        let before: Vec<WorkerId> = sup.idle.iter().map(|w| w.id()).collect();
        submit(&mut sup, 0);
        pump(&mut sup, &rx);

        let s = sup.status();
        assert_eq!((s.ready, s.busy, s.total_errors, s.total_processed), (2, 0, 1, 0));
        assert!(sup.idle.iter().any(|w| !before.contains(&w.id())));

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Processing);
        assert_eq!(failures[0].reason, "zero");
    }

    #[test]
    fn respawned_worker_picks_up_backlog() {
        let (mut sup, rx, _) = supervisor(1, |n| {
            if n == 0 {
                panic!("zero");
            }
            n
        });
        submit(&mut sup, 0);
        submit(&mut sup, 1);
        assert_eq!(sup.status().backlog, 1);
        pump(&mut sup, &rx);
        let s = sup.status();
        assert_eq!((s.busy, s.backlog), (1, 0));
        pump(&mut sup, &rx);
        assert_eq!(sup.status().total_processed, 1);
    }

    #[test]
    fn shutdown_on_idle_pool_fires_immediately() {
        let (mut sup, _rx, _) = supervisor(2, |n| n);
        let fired = Arc::new(Mutex::new(None));
        let slot = fired.clone();
        sup.handle(Event::Shutdown(Some(Box::new(move |s: &PoolStatus| {
            *slot.lock().unwrap() = Some(s.ready);
        }))));
        assert_eq!(*fired.lock().unwrap(), Some(2));
        assert_eq!(sup.state, ShutdownState::Drained);
    }

    #[test]
    fn work_after_shutdown_is_stranded() {
        let (mut sup, rx, _) = supervisor(1, |n| n);
        submit(&mut sup, 1);
        sup.handle(Event::Shutdown(None));
        assert_eq!(sup.state, ShutdownState::Draining);
        submit(&mut sup, 2);
        submit(&mut sup, 3);
        pump(&mut sup, &rx);

        let s = sup.status();
        assert_eq!(sup.state, ShutdownState::Drained);
        assert_eq!((s.ready, s.busy, s.backlog), (1, 0, 2));
    }

    #[test]
    fn shutdown_completes_when_last_busy_worker_crashes() {
        let (mut sup, rx, _) = supervisor(1, |_| panic!("always"));
        submit(&mut sup, 1);
        sup.handle(Event::Shutdown(None));
        pump(&mut sup, &rx);
        assert_eq!(sup.state, ShutdownState::Drained);
        assert_eq!(sup.status().ready, 1);
    }

    #[test]
    fn panicking_reporter_does_not_stop_supervisor() {
        let (tx, _rx) = channel::unbounded();
        let mut sup: Supervisor<u32, u32> = Supervisor::new(
            "test".to_owned(),
            1,
            Arc::new(|n: u32| n),
            Box::new(MemoryStore::new()),
            Box::new(|_: &Failure| panic!("reporter broke")),
            tx,
        );
        sup.start_workers().unwrap();
        sup.handle(Event::Shutdown(Some(Box::new(|_: &PoolStatus| panic!("cb")))));
        assert!(sup.handle(Event::CallbackFailed(WorkerId(0), "x".into())));
        assert_eq!(sup.state, ShutdownState::Drained);
    }

    #[test]
    fn stray_ready_is_not_counted() {
        let (mut sup, _rx, _) = supervisor(1, |n| n);
        assert!(sup.handle(Event::Ready(WorkerId(99))));
        let s = sup.status();
        assert_eq!((s.total_processed, s.ready, s.busy), (0, 1, 0));
    }

    #[test]
    fn dead_idle_worker_is_replaced_once() {
        let (mut sup, _rx, failures) = supervisor(2, |n| n);
        let dead = sup.idle[0].id();
        let failed = || Event::Failed(dead, FailureKind::Worker, "gone".to_owned());

        sup.handle(failed());
        let s = sup.status();
        assert_eq!((s.ready, s.busy, s.total_errors), (2, 0, 1));
        assert!(sup.idle.iter().all(|w| w.id() != dead));

        // A second notice for the same worker changes nothing.
        sup.handle(failed());
        assert_eq!(sup.status().total_errors, 1);
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, FailureKind::Worker);
        assert_eq!(failures[0].worker, Some(dead));
    }

    #[test]
    fn unreachable_worker_is_retired_and_item_redispatched() {
        let (mut sup, rx, failures) = supervisor(1, |n| n + 1);
        sup.idle.clear();
        sup.idle.push(WorkerHandle::detached(WorkerId(99)));

        submit(&mut sup, 7);
        let s = sup.status();
        assert_eq!((s.total_errors, s.busy, s.ready, s.backlog), (1, 1, 0, 0));
        assert!(!sup.busy.contains_key(&WorkerId(99)));
        {
            let failures = failures.lock().unwrap();
            assert_eq!(failures[0].kind, FailureKind::Worker);
            assert_eq!(failures[0].worker, Some(WorkerId(99)));
        }

        pump(&mut sup, &rx);
        let s = sup.status();
        assert_eq!((s.total_processed, s.ready, s.busy), (1, 1, 0));
    }

    /// A backlog whose writes always fail.
    struct FullStore;

    impl BacklogStore<WorkItem<u32, u32>> for FullStore {
        fn push(&mut self, _item: WorkItem<u32, u32>) -> Result<()> {
            Err(QueueError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }

        fn pop(&mut self) -> Result<Option<WorkItem<u32, u32>>> {
            Ok(None)
        }

        fn size(&self) -> usize {
            0
        }
    }

    #[test]
    fn store_errors_are_reported_and_loop_continues() {
        let (mut sup, rx, failures) = supervisor_with(1, Box::new(FullStore), |n| n);
        submit(&mut sup, 1);
        submit(&mut sup, 2);
        {
            let failures = failures.lock().unwrap();
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].kind, FailureKind::Store);
            assert_eq!(failures[0].reason, "IO error: disk full");
        }

        pump(&mut sup, &rx);
        let s = sup.status();
        assert_eq!((s.total_queued, s.total_processed, s.ready), (2, 1, 1));
    }

    #[test]
    fn terminate_stops_the_loop() {
        let (mut sup, _rx, _) = supervisor(1, |n| n);
        assert!(!sup.handle(Event::Terminate));
    }
}
