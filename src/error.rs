// Error handling module
// Defines the error taxonomy and its mapping to process exit codes

use std::path::PathBuf;
use thiserror::Error;

use crate::auth::CredentialError;

/// Discriminant for [`AuthError`], used by callers that branch on the class of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Authentication,
    Timeout,
    Cancelled,
    SilentLoginRequired,
    PersonalAccountNeedsTenant,
    UnprotectedCacheNotAllowed,
    CacheNotFound,
    CacheTooManyFiles,
    CacheTooLarge,
    CacheUnmeasurable,
    CacheInUse,
    Provider,
    Internal,
}

/// Errors that can occur while acquiring tokens or managing token caches
#[derive(Error, Debug)]
pub enum AuthError {
    /// Invalid input, rejected before any I/O
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Every credential source failed, or a single-purpose credential was rejected
    #[error("{message}")]
    AuthFailed {
        message: String,
        #[source]
        source: Option<CredentialError>,
    },

    /// Interactive or device code login was not completed in time
    #[error("Login timed out after {seconds} seconds, configured by the timeout setting.")]
    LoginTimedOut { seconds: u64 },

    /// The caller aborted the operation
    #[error("Operation was cancelled")]
    Cancelled,

    /// Silent acquisition found no usable account in the named cache
    #[error(
        "No cached login for '{username}' in token cache '{cache}'. Silent acquisition requires a prior interactive or device code login into this exact cache."
    )]
    SilentLoginRequired { cache: String, username: String },

    /// Personal accounts cannot authenticate against the multi-tenant endpoint
    #[error(
        "The account used is a personal account and cannot use a general endpoint. Please specify the tenant."
    )]
    PersonalAccountNeedsTenant,

    /// Cache was created without protection and the caller did not opt in
    #[error(
        "Token cache '{0}' is stored unprotected. Opt in to unprotected token caches to read it."
    )]
    UnprotectedCacheNotAllowed(String),

    #[error("Cache directory '{}' does not exist.", .0.display())]
    CacheNotFound(PathBuf),

    #[error(
        "Directory '{}' contains too many files ({count}) to be a typical cache. Deletion aborted for safety.",
        .path.display()
    )]
    CacheTooManyFiles { path: PathBuf, count: u64 },

    #[error(
        "Directory '{}' is too large ({} MB) to be a typical cache. Deletion aborted for safety.",
        .path.display(),
        .bytes / (1024 * 1024)
    )]
    CacheTooLarge { path: PathBuf, bytes: u64 },

    #[error(
        "Unable to determine the size of cache directory '{}': {reason}. Deletion aborted for safety.",
        .path.display()
    )]
    CacheUnmeasurable { path: PathBuf, reason: String },

    #[error(
        "Unable to delete cache directory '{}': {reason}. The cache may be in use by another process.",
        .path.display()
    )]
    CacheInUse { path: PathBuf, reason: String },

    /// Provider failure that does not fit any other class
    #[error("Credential provider error: {0}")]
    ProviderError(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn auth_failed(message: impl Into<String>) -> Self {
        AuthError::AuthFailed {
            message: message.into(),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::ConfigError(_) => ErrorKind::Configuration,
            AuthError::AuthFailed { .. } => ErrorKind::Authentication,
            AuthError::LoginTimedOut { .. } => ErrorKind::Timeout,
            AuthError::Cancelled => ErrorKind::Cancelled,
            AuthError::SilentLoginRequired { .. } => ErrorKind::SilentLoginRequired,
            AuthError::PersonalAccountNeedsTenant => ErrorKind::PersonalAccountNeedsTenant,
            AuthError::UnprotectedCacheNotAllowed(_) => ErrorKind::UnprotectedCacheNotAllowed,
            AuthError::CacheNotFound(_) => ErrorKind::CacheNotFound,
            AuthError::CacheTooManyFiles { .. } => ErrorKind::CacheTooManyFiles,
            AuthError::CacheTooLarge { .. } => ErrorKind::CacheTooLarge,
            AuthError::CacheUnmeasurable { .. } => ErrorKind::CacheUnmeasurable,
            AuthError::CacheInUse { .. } => ErrorKind::CacheInUse,
            AuthError::ProviderError(_) => ErrorKind::Provider,
            AuthError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// An aborted operation is not a failure
    pub fn is_failure(&self) -> bool {
        !matches!(self, AuthError::Cancelled)
    }

    /// Exit code reported by the command-line surface
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Configuration => 2,
            ErrorKind::Authentication
            | ErrorKind::SilentLoginRequired
            | ErrorKind::PersonalAccountNeedsTenant
            | ErrorKind::UnprotectedCacheNotAllowed => 3,
            ErrorKind::Timeout => 4,
            ErrorKind::CacheNotFound
            | ErrorKind::CacheTooManyFiles
            | ErrorKind::CacheTooLarge
            | ErrorKind::CacheUnmeasurable
            | ErrorKind::CacheInUse => 5,
            ErrorKind::Provider | ErrorKind::Internal => 1,
            ErrorKind::Cancelled => 130,
        }
    }
}

/// Result type alias for token and cache operations
pub type Result<T> = std::result::Result<T, AuthError>;
