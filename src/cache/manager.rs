// Token cache directory manager
// Opens, enumerates, clears and deletes named caches under one root

use anyhow::Context;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::fs::{CacheFs, DirTimes, StdFs};
use super::provider::{
    CacheOpenOptions, CacheProviderError, CacheProviderErrorKind, CacheTokenRequest,
    TokenCacheHandle, TokenCacheProvider,
};
use super::types::{
    validate_cache_name, CacheAccount, CacheDirectoryInfo, CacheProtection, CacheTarget,
    CacheTokenResponse, CONSUMERS_ENDPOINT_MARKER, DEFAULT_AUTHORITY_TENANT, DEFAULT_CLIENT_ID,
    MAX_CACHE_BYTES, MAX_CACHE_FILES, RESERVED_CACHE_NAME,
};
use crate::auth::{DeviceCodeCallback, TokenClaims, TokenResult};
use crate::error::{AuthError, Result};

/// Manages named token caches stored under a root directory
///
/// Caches are shared with other tools on the same machine, so nothing here
/// assumes exclusive ownership of a cache directory.
pub struct CacheManager {
    provider: Arc<dyn TokenCacheProvider>,
    fs: Arc<dyn CacheFs>,
    root: PathBuf,
}

impl CacheManager {
    pub fn new(provider: Arc<dyn TokenCacheProvider>, root: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            fs: Arc::new(StdFs),
            root: root.into(),
        }
    }

    pub fn with_fs(mut self, fs: Arc<dyn CacheFs>) -> Self {
        self.fs = fs;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Open a named cache, creating its storage when it does not exist yet
    pub async fn create_or_open(
        &self,
        name: &str,
        client_id: Option<&str>,
        tenant_id: Option<&str>,
        protection: CacheProtection,
    ) -> Result<Box<dyn TokenCacheHandle>> {
        validate_cache_name(name)?;

        if name.eq_ignore_ascii_case(RESERVED_CACHE_NAME) {
            tracing::warn!(
                "The token cache name '{}' is also used by the identity library's own cache and may collide with it",
                name
            );
        }
        if protection == CacheProtection::Unprotected {
            tracing::warn!(
                "Token cache '{}' is stored unprotected; its tokens are readable as plain text under {}",
                name,
                self.cache_dir(name).display()
            );
        }

        self.open_raw(name, client_id, tenant_id, protection)
            .await
            .map_err(|e| map_provider_error(name, None, e))
    }

    async fn open_raw(
        &self,
        name: &str,
        client_id: Option<&str>,
        tenant_id: Option<&str>,
        protection: CacheProtection,
    ) -> std::result::Result<Box<dyn TokenCacheHandle>, CacheProviderError> {
        let options = CacheOpenOptions {
            name: name.to_string(),
            directory: self.cache_dir(name),
            client_id: client_id
                .filter(|id| !id.is_empty())
                .unwrap_or(DEFAULT_CLIENT_ID)
                .to_string(),
            authority_tenant: tenant_id
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_AUTHORITY_TENANT)
                .to_string(),
            protection,
        };
        tracing::debug!(cache = name, ?protection, "Opening token cache");
        self.provider.open(&options).await
    }

    /// Open a cache whichever way it was stored
    async fn open_any(&self, name: &str) -> Result<Box<dyn TokenCacheHandle>> {
        match self
            .open_raw(name, None, None, CacheProtection::Protected)
            .await
        {
            Ok(handle) => Ok(handle),
            Err(e)
                if matches!(
                    e.kind,
                    CacheProviderErrorKind::UnprotectedCache | CacheProviderErrorKind::Unavailable
                ) =>
            {
                tracing::debug!(cache = name, "Protected open failed, retrying unprotected: {}", e);
                self.open_raw(name, None, None, CacheProtection::Unprotected)
                    .await
                    .map_err(|e| map_provider_error(name, None, e))
            }
            Err(e) => Err(map_provider_error(name, None, e)),
        }
    }

    /// Token for a known account without any interaction
    pub async fn acquire_silent(
        &self,
        target: &CacheTarget,
        username: &str,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        let handle = self.open_target(target).await?;
        let request = cache_request(target, Some(username));

        let response = handle
            .acquire_silent(&request, cancel)
            .await
            .map_err(|e| map_provider_error(&target.name, Some(username), e))?;

        tracing::info!(cache = %target.name, "Token acquired silently from token cache");
        Ok(token_result(response, target))
    }

    /// Browser login whose account is persisted into the cache
    pub async fn acquire_interactive(
        &self,
        target: &CacheTarget,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        let handle = self.open_target(target).await?;
        let response = handle
            .acquire_interactive(&cache_request(target, None), cancel)
            .await
            .map_err(|e| map_provider_error(&target.name, None, e))?;
        Ok(token_result(response, target))
    }

    /// Device code login whose account is persisted into the cache
    pub async fn acquire_device_code(
        &self,
        target: &CacheTarget,
        callback: DeviceCodeCallback,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        let handle = self.open_target(target).await?;
        let response = handle
            .acquire_device_code(&cache_request(target, None), callback, cancel)
            .await
            .map_err(|e| map_provider_error(&target.name, None, e))?;
        Ok(token_result(response, target))
    }

    /// Save a token acquired by another method into the cache
    ///
    /// Later silent requests for the token's identity can then be served from it.
    pub async fn store(&self, target: &CacheTarget, result: &TokenResult) -> Result<()> {
        let username = result.identity().ok_or_else(|| {
            AuthError::ConfigError(format!(
                "The token carries no account name and cannot be saved to token cache '{}'",
                target.name
            ))
        })?;

        let handle = self.open_target(target).await?;
        // Keyed by what was requested, since `scp` holds short scope names
        let response = CacheTokenResponse {
            access_token: result.token().to_string(),
            scopes: target.scopes.clone(),
            expires_on: result.expires_on(),
            account: CacheAccount {
                username: Some(username.to_string()),
                home_object_id: result.claims().first("oid").map(str::to_string),
                tenant_id: result.tenant_id().map(str::to_string),
            },
            tenant_id: target
                .tenant_id
                .clone()
                .or_else(|| result.tenant_id().map(str::to_string)),
        };

        handle
            .store(&response)
            .await
            .map_err(|e| map_provider_error(&target.name, Some(username), e))?;

        tracing::info!(cache = %target.name, account = username, "Saved token to token cache");
        Ok(())
    }

    async fn open_target(&self, target: &CacheTarget) -> Result<Box<dyn TokenCacheHandle>> {
        self.create_or_open(
            &target.name,
            target.client_id.as_deref(),
            target.tenant_id.as_deref(),
            target.protection,
        )
        .await
    }

    /// Cache directories under the root, sorted by name
    ///
    /// `filter` is a glob supporting `*` and `?`. Account details are read only
    /// when asked for, since opening a protected cache can prompt the user.
    pub async fn list(
        &self,
        filter: Option<&str>,
        include_details: bool,
    ) -> Result<Vec<CacheDirectoryInfo>> {
        if !self.fs.dir_exists(&self.root) {
            tracing::debug!("Cache root {} does not exist", self.root.display());
            return Ok(Vec::new());
        }

        let matcher = filter.map(glob_matcher).transpose()?;
        let dirs = self.fs.list_dirs(&self.root).with_context(|| {
            format!("Failed to list cache directories in {}", self.root.display())
        })?;

        if include_details {
            tracing::warn!(
                "Reading account details opens each cache and may trigger platform permission prompts"
            );
        }

        let mut caches = Vec::new();
        for path in dirs {
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if matcher.as_ref().is_some_and(|m| !m.is_match(&name)) {
                continue;
            }

            let times = self.fs.dir_times(&path).unwrap_or_else(|e| {
                tracing::warn!("Could not read timestamps of {}: {}", path.display(), e);
                DirTimes::default()
            });

            let mut info = CacheDirectoryInfo {
                name,
                path,
                created_at: times.created,
                modified_at: times.modified,
                account_count: None,
                account_names: None,
                details_checked: false,
            };

            if include_details {
                match self.account_names(&info.name).await {
                    Ok(names) => {
                        info.account_count = Some(names.len());
                        info.account_names = Some(names);
                        info.details_checked = true;
                    }
                    Err(e) => {
                        tracing::warn!("Could not read accounts of token cache '{}': {}", info.name, e)
                    }
                }
            }

            caches.push(info);
        }

        caches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(caches)
    }

    async fn account_names(&self, name: &str) -> Result<Vec<String>> {
        let handle = self.open_any(name).await?;
        let accounts = handle
            .accounts()
            .await
            .map_err(|e| map_provider_error(name, None, e))?;
        Ok(accounts
            .iter()
            .filter_map(|a| a.display_name().map(str::to_string))
            .collect())
    }

    /// Remove every account from a cache and detach its persistence
    ///
    /// Returns the number of accounts removed. Files may remain on disk.
    pub async fn clear(&self, name: &str) -> Result<usize> {
        validate_cache_name(name)?;

        let handle = self.open_any(name).await?;
        let accounts = handle
            .accounts()
            .await
            .map_err(|e| map_provider_error(name, None, e))?;

        for account in &accounts {
            handle
                .remove_account(account)
                .await
                .map_err(|e| map_provider_error(name, None, e))?;
            tracing::debug!(
                cache = name,
                account = account.display_name().unwrap_or("<unknown>"),
                "Removed account from token cache"
            );
        }

        handle
            .unregister()
            .await
            .map_err(|e| map_provider_error(name, None, e))?;

        tracing::info!("Cleared {} account(s) from token cache '{}'", accounts.len(), name);
        Ok(accounts.len())
    }

    /// Delete a cache directory from disk
    ///
    /// Every guard runs before anything is deleted. The name must be safe and
    /// the directory must exist and be measurably small enough to be a cache.
    pub async fn remove(&self, name: &str) -> Result<()> {
        validate_cache_name(name)?;

        let path = self.cache_dir(name);
        if !self.fs.dir_exists(&path) {
            return Err(AuthError::CacheNotFound(path));
        }

        let usage = self
            .fs
            .measure(&path)
            .map_err(|e| AuthError::CacheUnmeasurable {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if usage.total_bytes > MAX_CACHE_BYTES {
            return Err(AuthError::CacheTooLarge {
                path,
                bytes: usage.total_bytes,
            });
        }
        if usage.file_count > MAX_CACHE_FILES {
            return Err(AuthError::CacheTooManyFiles {
                path,
                count: usage.file_count,
            });
        }

        // A corrupted cache must still be deletable
        if let Err(e) = self.clear(name).await {
            tracing::warn!(
                "Could not clear token cache '{}' before deleting it: {}",
                name,
                e
            );
        }

        self.fs
            .remove_dir_all(&path)
            .map_err(|e| AuthError::CacheInUse {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!("Removed token cache directory {}", path.display());
        Ok(())
    }
}

fn cache_request(target: &CacheTarget, username: Option<&str>) -> CacheTokenRequest {
    CacheTokenRequest {
        scopes: target.scopes.clone(),
        claims: target.claims.clone(),
        tenant_id: target.tenant_id.clone(),
        username: username.map(str::to_string),
    }
}

fn token_result(response: CacheTokenResponse, target: &CacheTarget) -> TokenResult {
    let claims = TokenClaims::extract(&response.access_token).claims;
    let identity = response.account.display_name().map(str::to_string);
    let tenant_id = response
        .tenant_id
        .clone()
        .or_else(|| response.account.tenant_id.clone())
        .or_else(|| target.tenant_id.clone());
    let scopes = if response.scopes.is_empty() {
        target.scopes.clone()
    } else {
        response.scopes
    };

    TokenResult::new(
        response.access_token,
        scopes,
        response.expires_on,
        identity,
        tenant_id,
        claims,
    )
}

fn map_provider_error(cache: &str, username: Option<&str>, err: CacheProviderError) -> AuthError {
    if err.message.contains(CONSUMERS_ENDPOINT_MARKER) {
        return AuthError::PersonalAccountNeedsTenant;
    }

    match err.kind {
        CacheProviderErrorKind::NoMatchingAccount => AuthError::SilentLoginRequired {
            cache: cache.to_string(),
            username: username.unwrap_or_default().to_string(),
        },
        CacheProviderErrorKind::UnprotectedCache => {
            AuthError::UnprotectedCacheNotAllowed(cache.to_string())
        }
        CacheProviderErrorKind::Cancelled => AuthError::Cancelled,
        CacheProviderErrorKind::Unavailable => AuthError::auth_failed(format!(
            "Token cache '{}' is not available: {}",
            cache, err.message
        )),
        CacheProviderErrorKind::Other => {
            AuthError::ProviderError(format!("Token cache '{}': {}", cache, err.message))
        }
    }
}

fn glob_matcher(pattern: &str) -> Result<Regex> {
    let translated = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("(?i)^{}$", translated))
        .map_err(|e| AuthError::ConfigError(format!("Invalid cache filter '{}': {}", pattern, e)))
}
