//! FileStore - a primary store kept as one file per key
//!
//! String values live in `{key}.val`, hashes in `{key}.hash` (a JSON object).
//! Characters outside `[A-Za-z0-9._-]` are escaped as `%XX` so every key maps
//! to a single flat file name.
//!
//! Directory structure:
//! ```text
//! /store/
//!   p1.val
//!   membercostshare%3Acs1.val
//!   etag%3A5f1c....val
//!   etags%3Ap1.hash
//! ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use super::{glob_to_regex, PrimaryStore, StoreError, StoreResult};

const VALUE_EXT: &str = "val";
const HASH_EXT: &str = "hash";

/// A directory of key files
#[derive(Debug)]
pub struct FileStore {
    /// Path to the store directory
    pub path: PathBuf,
    /// Serializes read-modify-write of hash files
    hash_lock: Mutex<()>,
}

impl FileStore {
    /// Open a store in `store/` under the given base path
    pub fn open(base_path: &Path) -> Self {
        Self {
            path: base_path.join("store"),
            hash_lock: Mutex::new(()),
        }
    }

    /// Create the store directory if it doesn't exist
    pub async fn ensure_exists(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.path).await.map_err(|source| StoreError::Io {
            key: self.path.display().to_string(),
            source,
        })
    }

    fn value_path(&self, key: &str) -> PathBuf {
        self.path.join(format!("{}.{}", encode_key(key), VALUE_EXT))
    }

    fn hash_path(&self, key: &str) -> PathBuf {
        self.path.join(format!("{}.{}", encode_key(key), HASH_EXT))
    }

    async fn read_hash(&self, key: &str) -> StoreResult<Option<BTreeMap<String, String>>> {
        let path = self.hash_path(key);
        if !path.exists() {
            if self.value_path(key).exists() {
                return Err(StoreError::WrongType(key.to_string()));
            }
            return Ok(None);
        }
        let content = read_file(key, &path).await?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl PrimaryStore for FileStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let path = self.value_path(key);
        if !path.exists() {
            if self.hash_path(key).exists() {
                return Err(StoreError::WrongType(key.to_string()));
            }
            return Ok(None);
        }
        read_file(key, &path).await.map(Some)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.ensure_exists().await?;
        let hash_path = self.hash_path(key);
        if hash_path.exists() {
            remove_file(key, &hash_path).await?;
        }
        fs::write(self.value_path(key), value)
            .await
            .map_err(|source| StoreError::Io {
                key: key.to_string(),
                source,
            })?;
        tracing::debug!(key, "Saved value to file store");
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.value_path(key).exists() || self.hash_path(key).exists())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<usize> {
        let mut removed = 0;
        for key in keys {
            let mut found = false;
            for path in [self.value_path(key), self.hash_path(key)] {
                if path.exists() {
                    remove_file(key, &path).await?;
                    found = true;
                }
            }
            if found {
                removed += 1;
            }
        }
        tracing::debug!(requested = keys.len(), removed, "Deleted keys from file store");
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let re = glob_to_regex(pattern)?;
        let mut keys = Vec::new();

        if !self.path.exists() {
            return Ok(keys);
        }

        for entry in WalkDir::new(&self.path)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let name = entry.file_name().to_string_lossy();
            let Some((stem, ext)) = name.rsplit_once('.') else {
                continue;
            };
            if ext != VALUE_EXT && ext != HASH_EXT {
                continue;
            }
            if let Some(key) = decode_key(stem) {
                if re.is_match(&key) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        self.ensure_exists().await?;
        let _guard = self.hash_lock.lock().await;
        let mut hash = self.read_hash(key).await?.unwrap_or_default();
        hash.insert(field.to_string(), value.to_string());
        let content = serde_json::to_string(&hash).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        fs::write(self.hash_path(key), content)
            .await
            .map_err(|source| StoreError::Io {
                key: key.to_string(),
                source,
            })
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .read_hash(key)
            .await?
            .map(|h| h.into_keys().collect())
            .unwrap_or_default())
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        Ok(self
            .read_hash(key)
            .await?
            .map(|h| h.contains_key(field))
            .unwrap_or(false))
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let _guard = self.hash_lock.lock().await;
        let Some(mut hash) = self.read_hash(key).await? else {
            return Ok(false);
        };
        if hash.remove(field).is_none() {
            return Ok(false);
        }
        let path = self.hash_path(key);
        if hash.is_empty() {
            remove_file(key, &path).await?;
            return Ok(true);
        }
        let content = serde_json::to_string(&hash).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        fs::write(path, content)
            .await
            .map_err(|source| StoreError::Io {
                key: key.to_string(),
                source,
            })?;
        Ok(true)
    }
}

async fn read_file(key: &str, path: &Path) -> StoreResult<String> {
    fs::read_to_string(path).await.map_err(|source| StoreError::Io {
        key: key.to_string(),
        source,
    })
}

async fn remove_file(key: &str, path: &Path) -> StoreResult<()> {
    fs::remove_file(path).await.map_err(|source| StoreError::Io {
        key: key.to_string(),
        source,
    })
}

/// Escape a key into a flat file name
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
