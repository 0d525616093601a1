//! Read-through, write-back entity cache
//!
//! Entities are loaded from the store on first access and kept in memory.
//! Mutations replace the in-memory copy and mark its key dirty; a periodic
//! [`flush`](WriteBackCache::flush) persists every dirty entity. For any
//! dirty key the cached copy is at least as fresh as the stored one, and a
//! failed save leaves the key dirty so the next flush retries it.

use crate::error::StoreError;
use crate::store::{Entity, EntityKey, EntityStore};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;

/// Counts from one flush pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub saved: usize,
    pub failed: usize,
}

struct Entries<E> {
    entities: HashMap<EntityKey, E>,
    dirty: HashSet<EntityKey>,
}

pub struct WriteBackCache<E, S> {
    store: S,
    entries: Mutex<Entries<E>>,
    /// Held for a whole flush pass so saves of one key never reorder
    flushing: Mutex<()>,
    _entity: PhantomData<fn() -> E>,
}

impl<E, S> WriteBackCache<E, S>
where
    E: Entity,
    S: EntityStore<E>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            entries: Mutex::new(Entries {
                entities: HashMap::new(),
                dirty: HashSet::new(),
            }),
            flushing: Mutex::new(()),
            _entity: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the cached entity, loading it from the store on a miss
    ///
    /// Misses are not cached. A load that races with a concurrent `mark`
    /// never overwrites the marked copy.
    pub fn get(&self, key: EntityKey) -> Result<Option<E>, StoreError> {
        if let Some(entity) = self.entries.lock().entities.get(&key) {
            return Ok(Some(entity.clone()));
        }

        let Some(loaded) = self.store.load(key)? else {
            return Ok(None);
        };

        let mut entries = self.entries.lock();
        let cached = entries.entities.entry(key).or_insert(loaded);
        Ok(Some(cached.clone()))
    }

    /// Replaces the cached entity and schedules it for the next flush
    pub fn mark(&self, key: EntityKey, entity: E) {
        let mut entries = self.entries.lock();
        entries.entities.insert(key, entity);
        entries.dirty.insert(key);
    }

    /// Applies `change` to the cached entity and marks it dirty
    ///
    /// The entity is loaded first if it is not cached yet. The change runs
    /// under the cache lock, so concurrent updates of one key never lose
    /// each other's writes. Returns the updated copy, or `None` when the
    /// key does not exist.
    pub fn update<F>(&self, key: EntityKey, change: F) -> Result<Option<E>, StoreError>
    where
        F: FnOnce(&mut E),
    {
        if self.get(key)?.is_none() {
            return Ok(None);
        }

        let mut entries = self.entries.lock();
        let Some(entity) = entries.entities.get_mut(&key) else {
            return Ok(None);
        };
        change(entity);
        let updated = entity.clone();
        entries.dirty.insert(key);
        Ok(Some(updated))
    }

    /// Saves a new entity immediately and caches the stored result
    pub fn create(&self, entity: E) -> Result<E, StoreError> {
        let saved = self.store.save(entity)?;
        if let Some(key) = saved.key() {
            self.entries.lock().entities.insert(key, saved.clone());
        }
        Ok(saved)
    }

    /// Persists every dirty entity
    ///
    /// The dirty set is taken up front so that marks arriving during the
    /// flush are kept for the next pass. Keys whose save fails are marked
    /// dirty again. Concurrent calls run one after another.
    pub fn flush(&self) -> FlushReport {
        let _pass = self.flushing.lock();
        let batch: Vec<(EntityKey, E)> = {
            let mut entries = self.entries.lock();
            let dirty = std::mem::take(&mut entries.dirty);
            dirty
                .into_iter()
                .filter_map(|key| entries.entities.get(&key).cloned().map(|e| (key, e)))
                .collect()
        };

        if batch.is_empty() {
            return FlushReport::default();
        }

        let mut report = FlushReport::default();
        let mut failed = Vec::new();
        for (key, entity) in batch {
            match self.store.save(entity) {
                Ok(_) => report.saved += 1,
                Err(e) => {
                    warn!("failed to persist entity {}: {}", key, e);
                    failed.push(key);
                }
            }
        }

        report.failed = failed.len();
        if !failed.is_empty() {
            self.entries.lock().dirty.extend(failed);
        }
        debug!("flushed {} entit(ies), {} failed", report.saved, report.failed);
        report
    }

    pub fn is_dirty(&self, key: EntityKey) -> bool {
        self.entries.lock().dirty.contains(&key)
    }

    pub fn dirty_len(&self) -> usize {
        self.entries.lock().dirty.len()
    }

    /// Number of entities held in memory
    pub fn len(&self) -> usize {
        self.entries.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().entities.is_empty()
    }
}
