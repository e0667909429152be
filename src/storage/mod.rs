//! Primary store for plansync
//!
//! A namespaced key/value store holding the normalized plan records and the
//! ETag side namespace. Adapters carry no business logic.
//!
//! Key layout:
//! ```text
//! p1                        root plan record
//! membercostshare:cs1       owned sub-object record
//! etag:<token>              ETag -> owning plan and snapshot
//! etags:p1                  hash of every live token for plan p1
//! ```

pub mod file;
pub mod memory;
pub mod record;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use record::{Linked, Record};

use async_trait::async_trait;
use regex::Regex;
use thiserror::Error;

/// Errors raised by a primary store adapter
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Unavailable(String),

    #[error("I/O error on '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Key '{0}' holds the wrong kind of value")]
    WrongType(String),

    #[error("Entry '{key}' is unreadable: {message}")]
    Corrupt { key: String, message: String },

    #[error("Invalid scan pattern '{0}'")]
    InvalidPattern(String),
}

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key/value store with string values and string hashes
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Get a string value
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a string value, replacing whatever the key held
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Check whether a key holds any value
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> StoreResult<usize>;

    /// List keys matching a glob pattern (`*`, `?`)
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Set one field of a hash
    async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    /// List the fields of a hash
    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Check whether a hash has a field
    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Remove one field of a hash, returning whether it was present
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;
}

/// Compile a `SCAN MATCH` style glob into an anchored regex
pub fn glob_to_regex(pattern: &str) -> StoreResult<Regex> {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|_| StoreError::InvalidPattern(pattern.to_string()))
}
