//! ETag issuing and validation
//!
//! A token is the SHA-256 of a response body's canonical JSON. Tokens live in
//! a side namespace of the primary store:
//!
//! ```text
//! etag:<token>    -> owner id
//! etags:<owner>   -> hash of token -> snapshot
//! ```
//!
//! The owner is a plan id, or [`ALL_PLANS`] for the list of every plan.
//! Identifiers cannot start with `_`, so the reserved owner never collides.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::PrimaryStore;

/// Owner of the token issued for the list of all plans
pub const ALL_PLANS: &str = "_all";

const TOKEN_PREFIX: &str = "etag:";
const OWNER_PREFIX: &str = "etags:";

/// A parsed `If-Match` / `If-None-Match` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EtagCondition {
    /// `*`
    Any,
    Tokens(Vec<String>),
}

impl EtagCondition {
    /// Parse a header value
    ///
    /// Quotes and weak `W/` prefixes are stripped; comma-separated lists are
    /// accepted.
    pub fn parse(header: &str) -> Self {
        let header = header.trim();
        if header == "*" {
            return EtagCondition::Any;
        }
        let tokens = header
            .split(',')
            .map(|t| {
                let t = t.trim();
                let t = t.strip_prefix("W/").unwrap_or(t);
                t.trim_matches('"').to_string()
            })
            .filter(|t| !t.is_empty())
            .collect();
        EtagCondition::Tokens(tokens)
    }

    /// Tokens as listed, for error reporting
    pub fn display(&self) -> String {
        match self {
            EtagCondition::Any => "*".to_string(),
            EtagCondition::Tokens(tokens) => tokens.join(", "),
        }
    }
}

/// Render a token as a header value
pub fn quote(token: &str) -> String {
    format!("\"{}\"", token)
}

/// Issues, checks and invalidates tokens
#[derive(Clone)]
pub struct EtagManager {
    store: Arc<dyn PrimaryStore>,
}

impl EtagManager {
    pub fn new(store: Arc<dyn PrimaryStore>) -> Self {
        Self { store }
    }

    /// Token for a body, without storing it
    pub fn token_for(body: &Value) -> Result<String> {
        let bytes = serde_json::to_vec(body)?;
        let digest = Sha256::digest(&bytes);
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest.iter() {
            let _ = write!(&mut out, "{:02x}", b);
        }
        Ok(out)
    }

    /// Issue a token for `owner` and record the snapshot it validates
    pub async fn issue(&self, owner: &str, body: &Value) -> Result<String> {
        let token = Self::token_for(body)?;
        let snapshot = serde_json::to_string(body)?;
        self.store.set(&token_key(&token), owner).await?;
        self.store.hset(&owner_key(owner), &token, &snapshot).await?;
        tracing::debug!(owner, token = %token, "Issued ETag");
        Ok(token)
    }

    /// Whether a token is live for any owner
    pub async fn exists(&self, token: &str) -> Result<bool> {
        Ok(self.store.exists(&token_key(token)).await?)
    }

    /// Whether a token is live for this owner
    pub async fn is_current_for(&self, owner: &str, token: &str) -> Result<bool> {
        Ok(self.store.hexists(&owner_key(owner), token).await?)
    }

    /// Whether a parsed header matches a live token of this owner
    ///
    /// `*` matches when the owner has any live token.
    pub async fn matches(&self, owner: &str, condition: &EtagCondition) -> Result<bool> {
        match condition {
            EtagCondition::Any => Ok(!self.store.hkeys(&owner_key(owner)).await?.is_empty()),
            EtagCondition::Tokens(tokens) => {
                for token in tokens {
                    if self.is_current_for(owner, token).await? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Every store key belonging to this owner's tokens
    pub async fn keys_for(&self, owner: &str) -> Result<Vec<String>> {
        let hash = owner_key(owner);
        let mut keys: Vec<String> = self
            .store
            .hkeys(&hash)
            .await?
            .iter()
            .map(|t| token_key(t))
            .collect();
        if !keys.is_empty() {
            keys.push(hash);
        }
        Ok(keys)
    }

    /// Drop one token of this owner
    pub async fn revoke(&self, owner: &str, token: &str) -> Result<()> {
        self.store.hdel(&owner_key(owner), token).await?;
        let key = token_key(token);
        if self.store.get(&key).await?.as_deref() == Some(owner) {
            self.store.delete(&[key]).await?;
        }
        tracing::debug!(owner, token, "Revoked ETag");
        Ok(())
    }

    /// Drop every token of this owner, returning how many keys were removed
    pub async fn invalidate_all(&self, owner: &str) -> Result<usize> {
        let keys = self.keys_for(owner).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.delete(&keys).await?;
        tracing::debug!(owner, removed, "Invalidated ETags");
        Ok(removed)
    }
}

fn token_key(token: &str) -> String {
    format!("{}{}", TOKEN_PREFIX, token)
}

fn owner_key(owner: &str) -> String {
    format!("{}{}", OWNER_PREFIX, owner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn manager() -> (Arc<MemoryStore>, EtagManager) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), EtagManager::new(store))
    }

    #[test]
    fn test_token_is_stable() {
        let a = EtagManager::token_for(&json!({"objectId": "p1", "b": 1, "a": 2})).unwrap();
        let b = EtagManager::token_for(&json!({"a": 2, "objectId": "p1", "b": 1})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let c = EtagManager::token_for(&json!({"objectId": "p1", "b": 2, "a": 2})).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(EtagCondition::parse(" * "), EtagCondition::Any);
        assert_eq!(
            EtagCondition::parse("W/\"abc\", \"def\",ghi"),
            EtagCondition::Tokens(vec!["abc".into(), "def".into(), "ghi".into()])
        );
        assert_eq!(EtagCondition::parse(""), EtagCondition::Tokens(vec![]));
    }

    #[tokio::test]
    async fn test_issue_and_invalidate() {
        let (store, etags) = manager();
        let t1 = etags.issue("p1", &json!({"objectId": "p1", "v": 1})).await.unwrap();
        let t2 = etags.issue("p1", &json!({"objectId": "p1", "v": 2})).await.unwrap();
        let other = etags.issue("p2", &json!({"objectId": "p2"})).await.unwrap();

        assert!(etags.exists(&t1).await.unwrap());
        assert!(etags.is_current_for("p1", &t2).await.unwrap());
        assert!(!etags.is_current_for("p1", &other).await.unwrap());
        assert_eq!(etags.keys_for("p1").await.unwrap().len(), 3);

        assert_eq!(etags.invalidate_all("p1").await.unwrap(), 3);
        assert!(!etags.exists(&t1).await.unwrap());
        assert!(!etags.exists(&t2).await.unwrap());
        assert!(etags.exists(&other).await.unwrap());
        assert_eq!(store.len(), 2);
        assert_eq!(etags.invalidate_all("p1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_revoke_single_token() {
        let (store, etags) = manager();
        let t1 = etags.issue("p1", &json!({"objectId": "p1", "v": 1})).await.unwrap();
        let t2 = etags.issue("p1", &json!({"objectId": "p1", "v": 2})).await.unwrap();

        etags.revoke("p1", &t1).await.unwrap();
        assert!(!etags.exists(&t1).await.unwrap());
        assert!(!etags.is_current_for("p1", &t1).await.unwrap());
        assert!(etags.is_current_for("p1", &t2).await.unwrap());

        etags.revoke("p1", &t2).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_matches_condition() {
        let (_store, etags) = manager();
        assert!(!etags.matches("p1", &EtagCondition::Any).await.unwrap());

        let token = etags.issue("p1", &json!({"objectId": "p1"})).await.unwrap();
        let header = format!("W/\"stale\", {}", quote(&token));
        assert!(etags.matches("p1", &EtagCondition::parse(&header)).await.unwrap());
        assert!(etags.matches("p1", &EtagCondition::Any).await.unwrap());
        assert!(!etags
            .matches("p1", &EtagCondition::parse("\"stale\""))
            .await
            .unwrap());
    }
}
