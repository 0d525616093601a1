//! Durable entity storage behind the write-back cache
//!
//! The cache only needs two operations from storage: load an entity by key
//! and save an entity, assigning a key when it has none. [`MemoryStore`]
//! keeps everything in process; [`FileStore`] writes one bincode file per
//! entity into a data directory.

use crate::error::StoreError;
use log::debug;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::NamedTempFile;

/// Key of a stored entity
pub type EntityKey = i64;

/// Something the store can persist
pub trait Entity: Clone + Send + Sync + 'static {
    fn key(&self) -> Option<EntityKey>;

    fn set_key(&mut self, key: EntityKey);
}

pub trait EntityStore<E: Entity>: Send + Sync {
    fn load(&self, key: EntityKey) -> Result<Option<E>, StoreError>;

    /// Persists the entity, assigning the next free key if it has none
    fn save(&self, entity: E) -> Result<E, StoreError>;
}

impl<E: Entity, S: EntityStore<E> + ?Sized> EntityStore<E> for Box<S> {
    fn load(&self, key: EntityKey) -> Result<Option<E>, StoreError> {
        (**self).load(key)
    }

    fn save(&self, entity: E) -> Result<E, StoreError> {
        (**self).save(entity)
    }
}

struct Rows<E> {
    rows: HashMap<EntityKey, E>,
    next_key: EntityKey,
}

/// In-process store; contents are lost when the process exits
pub struct MemoryStore<E> {
    inner: Mutex<Rows<E>>,
    saves: AtomicUsize,
}

impl<E: Entity> MemoryStore<E> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Rows {
                rows: HashMap::new(),
                next_key: 1,
            }),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of save calls served so far
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().rows.is_empty()
    }
}

impl<E: Entity> Default for MemoryStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> EntityStore<E> for MemoryStore<E> {
    fn load(&self, key: EntityKey) -> Result<Option<E>, StoreError> {
        Ok(self.inner.lock().rows.get(&key).cloned())
    }

    fn save(&self, mut entity: E) -> Result<E, StoreError> {
        let mut inner = self.inner.lock();
        let key = match entity.key() {
            Some(key) => key,
            None => {
                let key = inner.next_key;
                entity.set_key(key);
                key
            }
        };
        inner.next_key = inner.next_key.max(key.saturating_add(1));
        inner.rows.insert(key, entity.clone());
        self.saves.fetch_add(1, Ordering::Relaxed);
        Ok(entity)
    }
}

/// Stores each entity as `<key>.bin` inside a directory
///
/// Writes go to a uniquely named temp file first and are renamed into place.
pub struct FileStore {
    dir: PathBuf,
    next_key: Mutex<EntityKey>,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `dir`
    ///
    /// The next key handed out continues after the highest key on disk.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut highest = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("bin") {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<EntityKey>().ok())
            {
                highest = highest.max(key);
            }
        }
        debug!("opened file store at {} (highest key {})", dir.display(), highest);

        Ok(Self {
            dir,
            next_key: Mutex::new(highest.saturating_add(1)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: EntityKey) -> PathBuf {
        self.dir.join(format!("{}.bin", key))
    }
}

impl<E> EntityStore<E> for FileStore
where
    E: Entity + Serialize + DeserializeOwned,
{
    fn load(&self, key: EntityKey) -> Result<Option<E>, StoreError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, mut entity: E) -> Result<E, StoreError> {
        let key = {
            let mut next_key = self.next_key.lock();
            let key = match entity.key() {
                Some(key) => key,
                None => {
                    entity.set_key(*next_key);
                    *next_key
                }
            };
            *next_key = (*next_key).max(key.saturating_add(1));
            key
        };

        let bytes = bincode::serialize(&entity)?;
        let mut staging = NamedTempFile::new_in(&self.dir)?;
        staging.write_all(&bytes)?;
        staging
            .persist(self.path_for(key))
            .map_err(|e| StoreError::Io(e.error))?;

        Ok(entity)
    }
}
