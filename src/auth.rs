//! Request authentication
//!
//! Callers ask an [`AuthGateway`] to turn an `Authorization` header into a
//! [`Principal`] before touching any plan. The CLI builds the header from its
//! `--token` argument.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Config, Environment};

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

/// Why a request was refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthRejection {
    #[error("Missing Authorization header")]
    MissingCredentials,

    #[error("Authorization header is not a bearer token")]
    Malformed,

    #[error("Bearer token is not accepted")]
    InvalidToken,
}

impl AuthRejection {
    pub fn status(&self) -> u16 {
        401
    }
}

#[async_trait]
pub trait AuthGateway: Send + Sync {
    async fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, AuthRejection>;
}

/// Accepts every request
#[derive(Debug, Default)]
pub struct OpenGateway;

#[async_trait]
impl AuthGateway for OpenGateway {
    async fn authenticate(&self, _authorization: Option<&str>) -> Result<Principal, AuthRejection> {
        Ok(Principal {
            subject: "anonymous".to_string(),
        })
    }
}

/// Accepts bearer tokens from a fixed set
#[derive(Debug, Default)]
pub struct StaticTokenGateway {
    tokens: HashSet<String>,
}

impl StaticTokenGateway {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AuthGateway for StaticTokenGateway {
    async fn authenticate(&self, authorization: Option<&str>) -> Result<Principal, AuthRejection> {
        let header = authorization.ok_or(AuthRejection::MissingCredentials)?;
        let (scheme, token) = header.trim().split_once(' ').ok_or(AuthRejection::Malformed)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(AuthRejection::Malformed);
        }
        let token = token.trim();
        if !self.tokens.contains(token) {
            tracing::warn!("Rejected bearer token");
            return Err(AuthRejection::InvalidToken);
        }
        Ok(Principal {
            subject: format!("token:{}", token.chars().take(4).collect::<String>()),
        })
    }
}

/// Gateway matching a configuration
///
/// Development without tokens is open; anything else checks bearer tokens.
pub fn gateway_for(config: &Config) -> Arc<dyn AuthGateway> {
    if config.auth_tokens.is_empty() && config.environment == Environment::Development {
        Arc::new(OpenGateway)
    } else {
        Arc::new(StaticTokenGateway::new(config.auth_tokens.iter().cloned()))
    }
}
