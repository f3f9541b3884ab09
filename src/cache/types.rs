// Token cache data types and constants

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::error::{AuthError, Result};

/// Public client id used when a cache is opened without one
pub const DEFAULT_CLIENT_ID: &str = "04b07795-8ddb-461a-bbee-02f9e1bf7b46";

/// Multi-tenant authority used when no tenant is given
pub const DEFAULT_AUTHORITY_TENANT: &str = "organizations";

/// Directory under the user root that holds named caches
pub const CACHE_ROOT_DIR: &str = ".IdentityService";

/// Name of the identity library's own cache file
pub const RESERVED_CACHE_NAME: &str = "msal.cache";

/// Removal refuses directories with more files than this
pub const MAX_CACHE_FILES: u64 = 10;

/// Removal refuses directories larger than this (5 MiB)
pub const MAX_CACHE_BYTES: u64 = 5 * 1024 * 1024;

/// Provider message emitted when a personal account hits the multi-tenant endpoint
pub const CONSUMERS_ENDPOINT_MARKER: &str = "Please do not use the /consumers endpoint";

const DANGEROUS_NAME_PATTERNS: [&str; 9] = ["..", "/", "\\", ":", "*", "?", "<", ">", "|"];

/// How the cache contents are stored at rest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheProtection {
    /// Platform secret store
    Protected,
    /// Plaintext on disk; requires an explicit opt-in
    Unprotected,
}

impl CacheProtection {
    pub fn from_unprotected_flag(use_unprotected: bool) -> Self {
        if use_unprotected {
            CacheProtection::Unprotected
        } else {
            CacheProtection::Protected
        }
    }
}

/// One account found inside a cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheAccount {
    pub username: Option<String>,
    pub home_object_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl CacheAccount {
    /// Username, falling back to the object id
    pub fn display_name(&self) -> Option<&str> {
        self.username
            .as_deref()
            .filter(|u| !u.is_empty())
            .or(self.home_object_id.as_deref())
    }
}

/// Token returned by a cache-bound acquisition
#[derive(Debug, Clone)]
pub struct CacheTokenResponse {
    pub access_token: String,
    pub scopes: Vec<String>,
    pub expires_on: DateTime<Utc>,
    pub account: CacheAccount,
    pub tenant_id: Option<String>,
}

/// A named cache and how to reach it
#[derive(Debug, Clone)]
pub struct CacheTarget {
    pub name: String,
    pub client_id: Option<String>,
    pub tenant_id: Option<String>,
    pub protection: CacheProtection,
    /// Fully-qualified scopes
    pub scopes: Vec<String>,
    pub claims: Option<String>,
}

/// One cache directory as reported by enumeration
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDirectoryInfo {
    pub name: String,
    pub path: PathBuf,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub account_count: Option<usize>,
    pub account_names: Option<Vec<String>>,
    /// Account details were requested and read successfully
    pub details_checked: bool,
}

/// Reject names that could escape the cache root or confuse the filesystem
pub fn validate_cache_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(AuthError::ConfigError(
            "Token cache name cannot be empty".to_string(),
        ));
    }
    if let Some(pattern) = DANGEROUS_NAME_PATTERNS.iter().find(|p| name.contains(*p)) {
        return Err(AuthError::ConfigError(format!(
            "Token cache name '{}' contains the invalid sequence '{}'",
            name, pattern
        )));
    }

    // `.` would resolve to the cache root itself
    let mut components = Path::new(name).components();
    if !matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) {
        return Err(AuthError::ConfigError(format!(
            "Token cache name '{}' must name a single directory under the cache root",
            name
        )));
    }
    Ok(())
}

/// `<home>/.IdentityService`, or the local app data directory on Windows
pub fn default_cache_root() -> PathBuf {
    let base = if cfg!(windows) {
        dirs::data_local_dir()
    } else {
        dirs::home_dir()
    };
    base.unwrap_or_else(|| PathBuf::from(".")).join(CACHE_ROOT_DIR)
}
