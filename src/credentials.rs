//! Token source abstraction.
//!
//! The actual provider (OAuth, service account, anonymous) lives in the
//! embedding SDK; the core only needs "give me the current token". Provider
//! callbacks complete on unspecified threads, so results are always
//! marshalled back to the worker queue before touching stream state.

use crate::errors::Result;

/// A token obtained from the credentials provider.
///
/// An empty token string is valid and means "unauthenticated": the
/// `Authorization` header is omitted entirely in that case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetTokenResult {
    token: String,
}

impl GetTokenResult {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn empty() -> Self {
        Self {
            token: String::new(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }
}

/// Asynchronous source of auth tokens.
///
/// Each stream attempt and each unary rpc requests a token without forcing
/// a refresh; refreshing after an auth failure is the provider's business.
#[async_trait::async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_token(&self) -> Result<GetTokenResult>;
}

/// Provider for unauthenticated use: always yields the empty token.
#[derive(Debug, Default, Clone)]
pub struct EmptyCredentialsProvider;

#[async_trait::async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> Result<GetTokenResult> {
        Ok(GetTokenResult::empty())
    }
}
