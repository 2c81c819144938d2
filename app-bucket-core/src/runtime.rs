//! # runtime: a small scheduler for running reconcilers in-process
//!
//! A [`Controller`] owns a work queue of [`ObjectKey`]s and drives one
//! [`Reconcile`] implementation:
//!
//! - at most `workers` reconciles run at once (semaphore permits);
//! - a key is never reconciled concurrently with itself: a key that is
//!   enqueued while running is marked dirty and run once more afterwards;
//! - `Action::requeue` schedules a delayed pass, superseding any earlier timer
//!   for the same key;
//! - errors follow [`ReconcileError::retry_after`]: conflicts are requeued at
//!   once, storage failures back off for a bounded number of attempts before
//!   falling back to the resync interval, dependency waits rely on watches.
//!
//! Watch feeds ([`Controller::owns`], [`Controller::watches`]) turn broadcast
//! events into keys.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::contract::WatchEvent;
use crate::controllers::{Action, Reconcile};
use crate::error::ReconcileError;
use crate::records::{ObjectKey, Record};

/// Attempts with exponential backoff before a failing key falls back to resync.
pub const MAX_RETRIES: u32 = 5;

pub struct Controller {
    name: String,
    reconciler: Arc<dyn Reconcile>,
    workers: usize,
    resync: Duration,
    tx: mpsc::UnboundedSender<ObjectKey>,
    rx: mpsc::UnboundedReceiver<ObjectKey>,
    feeds: Vec<BoxFuture<'static, ()>>,
}

impl Controller {
    pub fn new(
        name: impl Into<String>,
        reconciler: Arc<dyn Reconcile>,
        workers: usize,
        resync: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            reconciler,
            workers: workers.max(1),
            resync,
            tx,
            rx,
            feeds: Vec::new(),
        }
    }

    /// Enqueues the key of every record this controller reconciles when it changes.
    pub fn owns<R: Record>(self, events: broadcast::Receiver<WatchEvent<R>>) -> Self {
        self.watches(events, |event: WatchEvent<R>| async move { vec![event.record().key()] })
    }

    /// Enqueues the keys `mapper` derives from each event of a related record.
    pub fn watches<S, F, Fut>(mut self, events: broadcast::Receiver<S>, mapper: F) -> Self
    where
        S: Clone + Send + 'static,
        F: Fn(S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Vec<ObjectKey>> + Send + 'static,
    {
        let feed = forward(self.name.clone(), events, mapper, self.tx.clone());
        self.feeds.push(Box::pin(feed));
        self
    }

    /// Enqueues `keys` for an initial pass.
    pub fn seed(&self, keys: impl IntoIterator<Item = ObjectKey>) {
        for key in keys {
            // The receiver lives as long as `self`.
            let _ = self.tx.send(key);
        }
    }

    /// Runs until `cancel` fires, then waits for in-flight reconciles to return.
    pub async fn run(self, cancel: CancellationToken) {
        let Controller {
            name,
            reconciler,
            workers,
            resync,
            tx,
            mut rx,
            feeds,
        } = self;
        info!(controller = %name, workers, "[RUNTIME] controller started");

        let mut feed_tasks = JoinSet::new();
        for feed in feeds {
            let cancel = cancel.clone();
            feed_tasks.spawn(async move {
                tokio::select! {
                    _ = feed => {}
                    _ = cancel.cancelled() => {}
                }
            });
        }

        let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();
        let mut scheduler = Scheduler {
            name: name.clone(),
            reconciler,
            permits: Arc::new(Semaphore::new(workers)),
            cancel: cancel.clone(),
            resync,
            tasks: JoinSet::new(),
            running: HashSet::new(),
            dirty: HashSet::new(),
            attempts: HashMap::new(),
            timers: HashMap::new(),
            next_timer: 0,
            timer_tx,
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(key) = rx.recv() => scheduler.enqueue(key),
                Some((key, token)) = timer_rx.recv() => scheduler.fire(key, token),
                Some(joined) = scheduler.tasks.join_next() => match joined {
                    Ok((key, outcome)) => scheduler.complete(key, outcome),
                    Err(e) => error!(controller = %name, error = ?e, "[RUNTIME][ERROR] reconcile task aborted"),
                },
            }
        }

        drop(tx);
        while scheduler.tasks.join_next().await.is_some() {}
        while feed_tasks.join_next().await.is_some() {}
        info!(controller = %name, "[RUNTIME] controller stopped");
    }
}

async fn forward<S, F, Fut>(
    name: String,
    mut events: broadcast::Receiver<S>,
    mapper: F,
    tx: mpsc::UnboundedSender<ObjectKey>,
) where
    S: Clone,
    F: Fn(S) -> Fut,
    Fut: Future<Output = Vec<ObjectKey>>,
{
    loop {
        match events.recv().await {
            Ok(event) => {
                for key in mapper(event).await {
                    if tx.send(key).is_err() {
                        return;
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(controller = %name, skipped, "[RUNTIME] watch lagged, relying on resync");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

type Outcome = Result<Result<Action, ReconcileError>, String>;

struct Scheduler {
    name: String,
    reconciler: Arc<dyn Reconcile>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    resync: Duration,
    tasks: JoinSet<(ObjectKey, Outcome)>,
    running: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    attempts: HashMap<ObjectKey, u32>,
    /// Latest timer token per key; older timers are ignored when they fire.
    timers: HashMap<ObjectKey, u64>,
    next_timer: u64,
    timer_tx: mpsc::UnboundedSender<(ObjectKey, u64)>,
}

impl Scheduler {
    fn enqueue(&mut self, key: ObjectKey) {
        if self.running.contains(&key) {
            self.dirty.insert(key);
            return;
        }
        self.running.insert(key.clone());

        let reconciler = self.reconciler.clone();
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return (key, Ok(Ok(Action::await_change())));
            };
            let outcome = AssertUnwindSafe(reconciler.reconcile(&key, &cancel))
                .catch_unwind()
                .await
                .map_err(panic_message);
            (key, outcome)
        });
    }

    fn fire(&mut self, key: ObjectKey, token: u64) {
        if self.timers.get(&key) == Some(&token) {
            self.timers.remove(&key);
            self.enqueue(key);
        }
    }

    fn schedule(&mut self, key: ObjectKey, after: Duration) {
        self.next_timer += 1;
        let token = self.next_timer;
        self.timers.insert(key.clone(), token);

        let tx = self.timer_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    let _ = tx.send((key, token));
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    fn complete(&mut self, key: ObjectKey, outcome: Outcome) {
        self.running.remove(&key);
        match outcome {
            Ok(Ok(action)) => {
                self.attempts.remove(&key);
                if let Some(after) = action.requeue_after {
                    self.schedule(key.clone(), after);
                }
            }
            Ok(Err(e)) => self.failed(&key, e),
            Err(panic) => {
                error!(controller = %self.name, key = %key, panic = %panic, "[RUNTIME][ERROR] reconcile panicked");
                self.schedule(key.clone(), self.resync);
            }
        }
        if self.dirty.remove(&key) {
            self.enqueue(key);
        }
    }

    fn failed(&mut self, key: &ObjectKey, e: ReconcileError) {
        match &e {
            ReconcileError::Conflict(_) => {
                debug!(controller = %self.name, key = %key, "[RUNTIME] conflict, requeueing");
                self.attempts.remove(key);
                self.dirty.insert(key.clone());
            }
            ReconcileError::TransientDependency(_) | ReconcileError::Cancelled => {
                debug!(controller = %self.name, key = %key, error = %e, "[RUNTIME] waiting for a watch event");
                self.attempts.remove(key);
            }
            ReconcileError::TransientStorage(_) | ReconcileError::Record(_) => {
                let attempt = self.attempts.entry(key.clone()).or_insert(0);
                *attempt += 1;
                if *attempt <= MAX_RETRIES {
                    let delay = e.retry_after(*attempt - 1).unwrap_or(self.resync);
                    warn!(controller = %self.name, key = %key, attempt = *attempt, delay = ?delay, error = %e, "[RUNTIME] retrying");
                    self.schedule(key.clone(), delay);
                } else {
                    error!(controller = %self.name, key = %key, error = %e, "[RUNTIME][ERROR] retries exhausted, waiting for resync");
                    self.attempts.remove(key);
                    self.schedule(key.clone(), self.resync);
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
