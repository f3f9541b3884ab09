// Plaintext JSON token cache
// Stores `<root>/<name>/<name>.json`; only ever opened when unprotected storage is allowed

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use super::provider::{
    CacheOpenOptions, CacheProviderError, CacheProviderErrorKind, CacheTokenRequest,
    TokenCacheHandle, TokenCacheProvider,
};
use super::types::{CacheAccount, CacheProtection, CacheTokenResponse};
use crate::auth::DeviceCodeCallback;

/// Tokens closer than this to expiry are not served
const EXPIRY_MARGIN_SECONDS: i64 = 300;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    #[serde(default)]
    accounts: Vec<CacheAccount>,
    #[serde(default)]
    tokens: Vec<CachedToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedToken {
    username: String,
    access_token: String,
    scopes: Vec<String>,
    expires_on: DateTime<Utc>,
    tenant_id: Option<String>,
}

/// [`TokenCacheProvider`] that keeps caches as JSON files
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCacheProvider;

#[async_trait]
impl TokenCacheProvider for FileCacheProvider {
    async fn open(
        &self,
        options: &CacheOpenOptions,
    ) -> Result<Box<dyn TokenCacheHandle>, CacheProviderError> {
        let path = options.directory.join(format!("{}.json", options.name));

        if options.protection == CacheProtection::Protected {
            return Err(if path.exists() {
                CacheProviderError::new(
                    CacheProviderErrorKind::UnprotectedCache,
                    format!("Token cache '{}' is stored as plain text", options.name),
                )
            } else {
                CacheProviderError::unavailable(
                    "Protected token caches are not supported by the file cache provider",
                )
            });
        }

        let handle = FileCacheHandle { path };
        handle.ensure_exists().await.map_err(to_provider_error)?;
        Ok(Box::new(handle))
    }
}

/// An opened JSON cache file
#[derive(Debug, Clone)]
pub struct FileCacheHandle {
    path: PathBuf,
}

impl FileCacheHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_exists(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        if !self.path.exists() {
            self.save(&CacheFile::default()).await?;
        }
        Ok(())
    }

    async fn load(&self) -> anyhow::Result<CacheFile> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if bytes.is_empty() {
            return Ok(CacheFile::default());
        }
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    async fn save(&self, file: &CacheFile) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(file).context("Failed to serialize token cache")?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}

#[async_trait]
impl TokenCacheHandle for FileCacheHandle {
    async fn accounts(&self) -> Result<Vec<CacheAccount>, CacheProviderError> {
        Ok(self.load().await.map_err(to_provider_error)?.accounts)
    }

    async fn remove_account(&self, account: &CacheAccount) -> Result<(), CacheProviderError> {
        let mut file = self.load().await.map_err(to_provider_error)?;
        let name = account.display_name().map(str::to_string);
        file.accounts.retain(|a| a != account);
        file.tokens.retain(|t| Some(&t.username) != name.as_ref());
        self.save(&file).await.map_err(to_provider_error)
    }

    async fn acquire_silent(
        &self,
        request: &CacheTokenRequest,
        cancel: &CancellationToken,
    ) -> Result<CacheTokenResponse, CacheProviderError> {
        if cancel.is_cancelled() {
            return Err(CacheProviderError::new(
                CacheProviderErrorKind::Cancelled,
                "The operation was cancelled",
            ));
        }

        let username = request.username.as_deref().unwrap_or_default();
        let file = self.load().await.map_err(to_provider_error)?;
        let account = file
            .accounts
            .iter()
            .find(|a| {
                a.display_name()
                    .is_some_and(|n| n.eq_ignore_ascii_case(username))
            })
            .cloned()
            .ok_or_else(|| {
                CacheProviderError::no_matching_account(format!(
                    "No account '{}' in {}",
                    username,
                    self.path.display()
                ))
            })?;

        let usable_until = Utc::now() + chrono::Duration::seconds(EXPIRY_MARGIN_SECONDS);
        let token = file
            .tokens
            .iter()
            .filter(|t| t.username.eq_ignore_ascii_case(username))
            .filter(|t| t.expires_on > usable_until)
            .filter(|t| request.scopes.iter().all(|s| t.scopes.contains(s)))
            .filter(|t| request.tenant_id.is_none() || t.tenant_id == request.tenant_id)
            .max_by_key(|t| t.expires_on)
            .ok_or_else(|| {
                CacheProviderError::no_matching_account(format!(
                    "No unexpired token for '{}' covers the requested scopes",
                    username
                ))
            })?;

        Ok(CacheTokenResponse {
            access_token: token.access_token.clone(),
            scopes: token.scopes.clone(),
            expires_on: token.expires_on,
            account,
            tenant_id: token.tenant_id.clone(),
        })
    }

    async fn acquire_interactive(
        &self,
        _request: &CacheTokenRequest,
        _cancel: &CancellationToken,
    ) -> Result<CacheTokenResponse, CacheProviderError> {
        Err(CacheProviderError::unavailable(
            "Interactive login is not supported by the file cache provider",
        ))
    }

    async fn acquire_device_code(
        &self,
        _request: &CacheTokenRequest,
        _callback: DeviceCodeCallback,
        _cancel: &CancellationToken,
    ) -> Result<CacheTokenResponse, CacheProviderError> {
        Err(CacheProviderError::unavailable(
            "Device code login is not supported by the file cache provider",
        ))
    }

    /// Replaces any earlier token of the same account and scopes
    async fn store(&self, response: &CacheTokenResponse) -> Result<(), CacheProviderError> {
        let username = response
            .account
            .display_name()
            .ok_or_else(|| CacheProviderError::other("Cached tokens need an account name"))?
            .to_string();

        let mut file = self.load().await.map_err(to_provider_error)?;
        if !file.accounts.iter().any(|a| a == &response.account) {
            file.accounts.push(response.account.clone());
        }
        file.tokens.retain(|t| {
            !(t.username.eq_ignore_ascii_case(&username)
                && t.scopes == response.scopes
                && t.tenant_id == response.tenant_id)
        });
        file.tokens.push(CachedToken {
            username,
            access_token: response.access_token.clone(),
            scopes: response.scopes.clone(),
            expires_on: response.expires_on,
            tenant_id: response.tenant_id.clone(),
        });
        self.save(&file).await.map_err(to_provider_error)
    }

    async fn unregister(&self) -> Result<(), CacheProviderError> {
        tracing::debug!("Detached token cache {}", self.path.display());
        Ok(())
    }
}

fn to_provider_error(err: anyhow::Error) -> CacheProviderError {
    CacheProviderError::other(format!("{:#}", err))
}
