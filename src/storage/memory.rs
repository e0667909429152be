//! In-memory primary store

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{glob_to_regex, PrimaryStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Entry {
    Value(String),
    Hash(BTreeMap<String, String>),
}

/// Process-local store, used for tests and ephemeral runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held
    pub fn len(&self) -> usize {
        self.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, BTreeMap<String, Entry>>> {
        self.entries
            .read()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, BTreeMap<String, Entry>>> {
        self.entries
            .write()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl PrimaryStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match self.read()?.get(key) {
            None => Ok(None),
            Some(Entry::Value(v)) => Ok(Some(v.clone())),
            Some(Entry::Hash(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.write()?
            .insert(key.to_string(), Entry::Value(value.to_string()));
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.read()?.contains_key(key))
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<usize> {
        let mut entries = self.write()?;
        Ok(keys.iter().filter(|k| entries.remove(k.as_str()).is_some()).count())
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let re = glob_to_regex(pattern)?;
        Ok(self
            .read()?
            .keys()
            .filter(|k| re.is_match(k))
            .cloned()
            .collect())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut entries = self.write()?;
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(BTreeMap::new()))
        {
            Entry::Hash(h) => {
                h.insert(field.to_string(), value.to_string());
                Ok(())
            }
            Entry::Value(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        match self.read()?.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Hash(h)) => Ok(h.keys().cloned().collect()),
            Some(Entry::Value(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        match self.read()?.get(key) {
            None => Ok(false),
            Some(Entry::Hash(h)) => Ok(h.contains_key(field)),
            Some(Entry::Value(_)) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut entries = self.write()?;
        let (removed, now_empty) = match entries.get_mut(key) {
            None => return Ok(false),
            Some(Entry::Hash(h)) => (h.remove(field).is_some(), h.is_empty()),
            Some(Entry::Value(_)) => return Err(StoreError::WrongType(key.to_string())),
        };
        // An emptied hash no longer exists
        if now_empty {
            entries.remove(key);
        }
        Ok(removed)
    }
}
