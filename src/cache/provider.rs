// Token cache storage provider seam

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::types::{CacheAccount, CacheProtection, CacheTokenResponse};
use crate::auth::DeviceCodeCallback;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheProviderErrorKind {
    /// No cached account can serve the request without interaction
    NoMatchingAccount,
    /// The cache exists but is stored unprotected and protection was requested
    UnprotectedCache,
    /// The storage or flow is not supported on this machine
    Unavailable,
    Cancelled,
    Other,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CacheProviderError {
    pub kind: CacheProviderErrorKind,
    pub message: String,
}

impl CacheProviderError {
    pub fn new(kind: CacheProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn no_matching_account(message: impl Into<String>) -> Self {
        Self::new(CacheProviderErrorKind::NoMatchingAccount, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(CacheProviderErrorKind::Unavailable, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(CacheProviderErrorKind::Other, message)
    }
}

/// Parameters for opening one named cache
#[derive(Debug, Clone)]
pub struct CacheOpenOptions {
    pub name: String,
    pub directory: PathBuf,
    pub client_id: String,
    pub authority_tenant: String,
    pub protection: CacheProtection,
}

/// What a cache-bound acquisition asks for
#[derive(Debug, Clone, Default)]
pub struct CacheTokenRequest {
    pub scopes: Vec<String>,
    pub claims: Option<String>,
    pub tenant_id: Option<String>,
    pub username: Option<String>,
}

#[async_trait]
pub trait TokenCacheProvider: Send + Sync {
    async fn open(
        &self,
        options: &CacheOpenOptions,
    ) -> Result<Box<dyn TokenCacheHandle>, CacheProviderError>;
}

/// An opened cache
#[async_trait]
pub trait TokenCacheHandle: Send + Sync {
    async fn accounts(&self) -> Result<Vec<CacheAccount>, CacheProviderError>;

    async fn remove_account(&self, account: &CacheAccount) -> Result<(), CacheProviderError>;

    async fn acquire_silent(
        &self,
        request: &CacheTokenRequest,
        cancel: &CancellationToken,
    ) -> Result<CacheTokenResponse, CacheProviderError>;

    async fn acquire_interactive(
        &self,
        request: &CacheTokenRequest,
        cancel: &CancellationToken,
    ) -> Result<CacheTokenResponse, CacheProviderError>;

    async fn acquire_device_code(
        &self,
        request: &CacheTokenRequest,
        callback: DeviceCodeCallback,
        cancel: &CancellationToken,
    ) -> Result<CacheTokenResponse, CacheProviderError>;

    /// Persist a token acquired outside the cache so silent requests can serve it
    async fn store(&self, _response: &CacheTokenResponse) -> Result<(), CacheProviderError> {
        Err(CacheProviderError::unavailable(
            "This token cache does not accept externally acquired tokens",
        ))
    }

    /// Detach disk persistence; files may remain but hold no usable tokens
    async fn unregister(&self) -> Result<(), CacheProviderError>;
}
