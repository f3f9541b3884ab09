use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dialoguer::Confirm;
use std::path::PathBuf;

use crate::auth::{
    parse_precedence, AuthMethod, CertificateSource, CredentialSource, TokenRequest,
    DEFAULT_LOGIN_TIMEOUT_SECONDS, DEFAULT_MANAGED_IDENTITY_TIMEOUT_SECONDS, DEFAULT_RESOURCE,
};
use crate::cache::{default_cache_root, validate_cache_name};
use crate::error::AuthError;

/// azauth - Azure credential acquisition and token cache management
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", global = true)]
    pub log_json: bool,

    /// Directory holding named token caches
    #[arg(long, env = "AZAUTH_CACHE_ROOT", global = true)]
    pub cache_root: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Acquire an access token
    Token(TokenArgs),

    /// Manage named token caches
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// List token cache directories
    List {
        /// Glob over cache names (`*` and `?`)
        #[arg(long)]
        filter: Option<String>,

        /// Read account details (may trigger platform prompts)
        #[arg(long)]
        details: bool,
    },

    /// Sign every account out of a cache
    Clear {
        name: String,

        /// Also delete the cache directory
        #[arg(long)]
        force: bool,

        /// Skip the confirmation prompt for --force
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MethodArg {
    NonInteractive,
    Interactive,
    DeviceCode,
    ManagedIdentity,
    WorkloadIdentity,
    ClientSecret,
    ClientCertificate,
    Cache,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Token,
}

#[derive(Args, Debug, Clone)]
pub struct TokenArgs {
    /// Resource the token is for
    #[arg(long, default_value = DEFAULT_RESOURCE)]
    pub resource: String,

    /// Scope suffix, combined with the resource (repeatable)
    #[arg(long = "scope")]
    pub scopes: Vec<String>,

    #[arg(long = "tenant")]
    pub tenant_id: Option<String>,

    /// Claims challenge returned by a resource
    #[arg(long)]
    pub claims: Option<String>,

    #[arg(long)]
    pub client_id: Option<String>,

    #[arg(long, value_enum, default_value = "non-interactive")]
    pub method: MethodArg,

    #[arg(long, env = "AZURE_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    #[arg(long)]
    pub certificate_path: Option<String>,

    /// Federated token presented for workload identity
    #[arg(long, env = "AZURE_FEDERATED_TOKEN", hide_env_values = true)]
    pub external_token: Option<String>,

    /// Named token cache
    #[arg(long)]
    pub token_cache: Option<String>,

    /// Account to pick from the token cache
    #[arg(long)]
    pub username: Option<String>,

    /// Login timeout; non-interactive only applies it when given
    #[arg(long)]
    pub timeout_seconds: Option<u64>,

    /// Comma separated credential sources, in order
    #[arg(long, value_delimiter = ',')]
    pub credential_precedence: Vec<String>,

    /// Allow token caches stored in plaintext
    #[arg(long)]
    pub use_unprotected_token_cache: bool,

    /// Save the acquired token into this plaintext token cache
    #[arg(long, value_name = "NAME")]
    pub save_to_cache: Option<String>,

    #[arg(long, value_enum, default_value = "json")]
    pub output: OutputFormat,
}

impl TokenArgs {
    /// Check flag combinations and build the request, without any I/O
    pub fn to_request(&self) -> crate::error::Result<TokenRequest> {
        let method = self.method()?;

        let mut request = TokenRequest::new(method).with_resource(self.resource.trim());
        if !self.scopes.is_empty() {
            request = request.with_scopes(self.scopes.iter().map(|s| s.trim()));
        }
        if let Some(tenant_id) = non_empty(&self.tenant_id) {
            request = request.with_tenant(tenant_id);
        }
        if let Some(claims) = non_empty(&self.claims) {
            request = request.with_claims(claims);
        }

        request.validate()?;
        Ok(request)
    }

    fn method(&self) -> crate::error::Result<AuthMethod> {
        let client_id = non_empty(&self.client_id).map(str::to_string);
        let timeout = self.timeout_seconds.unwrap_or(DEFAULT_LOGIN_TIMEOUT_SECONDS);

        let cache_bound = matches!(
            self.method,
            MethodArg::Interactive | MethodArg::DeviceCode | MethodArg::Cache
        );

        if let Some(name) = &self.save_to_cache {
            if cache_bound {
                return Err(AuthError::ConfigError(format!(
                    "Tokens from the {} method cannot be saved to a token cache; use a token cache with the interactive or device-code method instead",
                    self.method_name()
                )));
            }
            if !self.use_unprotected_token_cache {
                return Err(AuthError::ConfigError(
                    "Saved tokens are stored as plain text; pass --use-unprotected-token-cache to allow it"
                        .to_string(),
                ));
            }
            validate_cache_name(name)?;
        } else if self.use_unprotected_token_cache {
            if !cache_bound {
                return Err(AuthError::ConfigError(
                    "Unprotected token caches can only be used with the interactive, device-code and cache methods, or when saving a token"
                        .to_string(),
                ));
            }
            if self.token_cache.is_none() {
                return Err(AuthError::ConfigError(
                    "Unprotected token caches can only be used together with a named token cache"
                        .to_string(),
                ));
            }
        }
        if self.token_cache.is_some() && !cache_bound {
            return Err(AuthError::ConfigError(format!(
                "A token cache cannot be used with the {} method",
                self.method_name()
            )));
        }
        if !self.credential_precedence.is_empty() && self.method != MethodArg::NonInteractive {
            return Err(AuthError::ConfigError(
                "Credential precedence only applies to the non-interactive method".to_string(),
            ));
        }

        let method = match self.method {
            MethodArg::NonInteractive => {
                if client_id.is_some() {
                    return Err(AuthError::ConfigError(
                        "A client id cannot be used with the non-interactive method. Omit it, or pick a method that accepts one"
                            .to_string(),
                    ));
                }
                let credential_precedence = if self.credential_precedence.is_empty() {
                    CredentialSource::DEFAULT_PRECEDENCE.to_vec()
                } else {
                    parse_precedence(&self.credential_precedence)?
                };
                AuthMethod::NonInteractive {
                    credential_precedence,
                    timeout_seconds: self.timeout_seconds,
                    managed_identity_timeout_seconds: self
                        .timeout_seconds
                        .unwrap_or(DEFAULT_MANAGED_IDENTITY_TIMEOUT_SECONDS),
                }
            }
            MethodArg::Interactive => AuthMethod::Interactive {
                client_id,
                token_cache: self.token_cache.clone(),
                timeout_seconds: timeout,
                use_unprotected_cache: self.use_unprotected_token_cache,
            },
            MethodArg::DeviceCode => AuthMethod::DeviceCode {
                client_id,
                token_cache: self.token_cache.clone(),
                timeout_seconds: timeout,
                use_unprotected_cache: self.use_unprotected_token_cache,
            },
            MethodArg::ManagedIdentity => AuthMethod::ManagedIdentity {
                client_id,
                timeout_seconds: self
                    .timeout_seconds
                    .unwrap_or(DEFAULT_MANAGED_IDENTITY_TIMEOUT_SECONDS),
            },
            MethodArg::WorkloadIdentity => AuthMethod::WorkloadIdentity {
                client_id: client_id.unwrap_or_default(),
                external_token: self.external_token.clone().unwrap_or_default(),
            },
            MethodArg::ClientSecret => AuthMethod::ClientSecret {
                client_id: client_id.unwrap_or_default(),
                client_secret: self.client_secret.clone().unwrap_or_default(),
            },
            MethodArg::ClientCertificate => {
                let path = non_empty(&self.certificate_path).ok_or_else(|| {
                    AuthError::ConfigError(
                        "A certificate path is required for client-certificate authentication"
                            .to_string(),
                    )
                })?;
                AuthMethod::ClientCertificate {
                    client_id: client_id.unwrap_or_default(),
                    certificate: CertificateSource::Path(expand_tilde(path)),
                }
            }
            MethodArg::Cache => AuthMethod::Cache {
                client_id,
                token_cache: self.token_cache.clone().ok_or_else(|| {
                    AuthError::ConfigError(
                        "A token cache name is required for the cache method".to_string(),
                    )
                })?,
                username: self.username.clone().unwrap_or_default(),
                use_unprotected_cache: self.use_unprotected_token_cache,
            },
        };

        Ok(method)
    }

    fn method_name(&self) -> String {
        self.method
            .to_possible_value()
            .map(|v| v.get_name().to_string())
            .unwrap_or_default()
    }
}

impl CliArgs {
    /// Parse the command line after loading `.env`
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        CliArgs::parse()
    }

    pub fn cache_root(&self) -> PathBuf {
        self.cache_root
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(default_cache_root)
    }
}

/// Ask before deleting a cache directory
pub fn confirm_remove(name: &str) -> Result<bool> {
    Confirm::new()
        .with_prompt(format!(
            "Delete token cache '{}' and everything in its directory?",
            name
        ))
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&path[2..]);
        }
    }
    PathBuf::from(path)
}
