//! In-process record store.
//!
//! [`MemoryRecords`] gives the reconcilers the semantics they expect from a
//! declarative store: optimistic concurrency on `resource_version`, generation
//! bumps on spec changes, split spec/status writes, soft deletion gated by
//! finalizers and a broadcast watch.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::contract::{Records, WatchEvent};
use crate::error::RecordError;
use crate::records::{ObjectKey, Record};

const WATCH_CAPACITY: usize = 1024;

struct State<R> {
    records: BTreeMap<ObjectKey, R>,
    last_version: u64,
}

pub struct MemoryRecords<R: Record> {
    state: Mutex<State<R>>,
    events: broadcast::Sender<WatchEvent<R>>,
}

impl<R: Record> Default for MemoryRecords<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> MemoryRecords<R> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Mutex::new(State {
                records: BTreeMap::new(),
                last_version: 0,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<R>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: WatchEvent<R>) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Every record, across namespaces, in key order.
    pub fn snapshot(&self) -> Vec<R> {
        self.lock().records.values().cloned().collect()
    }

    fn not_found(key: &ObjectKey) -> RecordError {
        RecordError::NotFound {
            kind: R::KIND,
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        }
    }

    fn check_version(existing: &R, record: &R) -> Result<(), RecordError> {
        let expected = record.meta().resource_version;
        let actual = existing.meta().resource_version;
        if expected != actual {
            let key = existing.key();
            return Err(RecordError::Conflict {
                kind: R::KIND,
                namespace: key.namespace,
                name: key.name,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Stores `next`, or removes it when deletion was requested and no
    /// finalizer remains.
    fn commit(&self, state: &mut State<R>, mut next: R) -> R {
        let key = next.key();
        if next.meta().deletion_requested && next.meta().finalizers.is_empty() {
            state.records.remove(&key);
            self.emit(WatchEvent::Deleted(next.clone()));
            return next;
        }
        state.last_version += 1;
        next.meta_mut().resource_version = state.last_version;
        state.records.insert(key, next.clone());
        self.emit(WatchEvent::Applied(next.clone()));
        next
    }
}

#[async_trait]
impl<R: Record> Records<R> for MemoryRecords<R> {
    async fn get(&self, key: &ObjectKey) -> Result<R, RecordError> {
        self.lock()
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))
    }

    /// An empty namespace lists every namespace.
    async fn list(&self, namespace: &str) -> Result<Vec<R>, RecordError> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|r| namespace.is_empty() || r.meta().namespace == namespace)
            .cloned()
            .collect())
    }

    async fn create(&self, mut record: R) -> Result<R, RecordError> {
        let mut state = self.lock();
        let key = record.key();
        if state.records.contains_key(&key) {
            return Err(RecordError::AlreadyExists {
                kind: R::KIND,
                namespace: key.namespace,
                name: key.name,
            });
        }
        let meta = record.meta_mut();
        meta.generation = 1;
        meta.deletion_requested = false;
        Ok(self.commit(&mut state, record))
    }

    async fn update(&self, record: &R) -> Result<R, RecordError> {
        let mut state = self.lock();
        let key = record.key();
        let existing = state
            .records
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(&existing, record)?;

        let mut next = record.clone();
        next.take_status_from(&existing);
        {
            let meta = next.meta_mut();
            meta.deletion_requested = existing.meta().deletion_requested;
            meta.generation = existing.meta().generation;
        }
        if !existing.same_spec(record) {
            next.meta_mut().generation += 1;
        }
        if next.meta() == existing.meta() && next.same_spec(&existing) {
            return Ok(existing);
        }
        Ok(self.commit(&mut state, next))
    }

    async fn update_status(&self, record: &R) -> Result<R, RecordError> {
        let mut state = self.lock();
        let key = record.key();
        let existing = state
            .records
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(&key))?;
        Self::check_version(&existing, record)?;

        let mut next = existing.clone();
        next.take_status_from(record);
        if next == existing {
            return Ok(existing);
        }
        Ok(self.commit(&mut state, next))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), RecordError> {
        let mut state = self.lock();
        let existing = state
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))?;
        if existing.meta().deletion_requested {
            return Ok(());
        }
        let mut next = existing;
        next.meta_mut().deletion_requested = true;
        self.commit(&mut state, next);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<R>> {
        self.events.subscribe()
    }
}
