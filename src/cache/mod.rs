// Token cache module
// Named on-disk token caches and the guard rails around deleting them

mod file_store;
mod fs;
mod manager;
mod provider;
mod types;

pub use file_store::{FileCacheHandle, FileCacheProvider};
pub use fs::{CacheFs, DirTimes, DirUsage, StdFs};
pub use manager::CacheManager;
pub use provider::{
    CacheOpenOptions, CacheProviderError, CacheProviderErrorKind, CacheTokenRequest,
    TokenCacheHandle, TokenCacheProvider,
};
pub use types::{
    default_cache_root, validate_cache_name, CacheAccount, CacheDirectoryInfo, CacheProtection,
    CacheTarget, CacheTokenResponse, CACHE_ROOT_DIR, DEFAULT_AUTHORITY_TENANT, DEFAULT_CLIENT_ID,
    MAX_CACHE_BYTES, MAX_CACHE_FILES, RESERVED_CACHE_NAME,
};
