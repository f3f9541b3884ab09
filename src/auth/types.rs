// Authentication types

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::claims::ClaimsMap;
use crate::error::{AuthError, Result};

/// Resource used when the caller does not name one
pub const DEFAULT_RESOURCE: &str = "https://graph.microsoft.com";

/// Scope suffix used when the caller does not name one
pub const DEFAULT_SCOPE: &str = ".default";

/// Login window for interactive and device code flows
pub const DEFAULT_LOGIN_TIMEOUT_SECONDS: u64 = 120;

/// Managed identity endpoints are absent on most machines, so probing must fail fast
pub const DEFAULT_MANAGED_IDENTITY_TIMEOUT_SECONDS: u64 = 1;

/// Named credential sources that can take part in a credential chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialSource {
    Environment,
    AzurePowerShell,
    AzureCli,
    VisualStudio,
    SharedTokenCache,
    ManagedIdentity,
}

impl CredentialSource {
    /// Order used by the non-interactive flow when the caller gives none
    pub const DEFAULT_PRECEDENCE: [CredentialSource; 6] = [
        CredentialSource::Environment,
        CredentialSource::AzurePowerShell,
        CredentialSource::AzureCli,
        CredentialSource::VisualStudio,
        CredentialSource::SharedTokenCache,
        CredentialSource::ManagedIdentity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CredentialSource::Environment => "Environment",
            CredentialSource::AzurePowerShell => "AzurePowerShell",
            CredentialSource::AzureCli => "AzureCLI",
            CredentialSource::VisualStudio => "VisualStudio",
            CredentialSource::SharedTokenCache => "SharedTokenCache",
            CredentialSource::ManagedIdentity => "ManagedIdentity",
        }
    }

    /// Reference documentation for the credential backing this source
    pub fn documentation_url(&self) -> &'static str {
        match self {
            CredentialSource::Environment => {
                "https://learn.microsoft.com/en-us/dotnet/api/azure.identity.environmentcredential"
            }
            CredentialSource::AzurePowerShell => {
                "https://learn.microsoft.com/en-us/dotnet/api/azure.identity.azurepowershellcredential"
            }
            CredentialSource::AzureCli => {
                "https://learn.microsoft.com/en-us/dotnet/api/azure.identity.azureclicredential"
            }
            CredentialSource::VisualStudio => {
                "https://learn.microsoft.com/en-us/dotnet/api/azure.identity.visualstudiocredential"
            }
            CredentialSource::SharedTokenCache => {
                "https://learn.microsoft.com/en-us/dotnet/api/azure.identity.sharedtokencachecredential"
            }
            CredentialSource::ManagedIdentity => {
                "https://learn.microsoft.com/en-us/dotnet/api/azure.identity.managedidentitycredential"
            }
        }
    }

    pub fn is_managed_identity(&self) -> bool {
        matches!(self, CredentialSource::ManagedIdentity)
    }
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CredentialSource {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        CredentialSource::DEFAULT_PRECEDENCE
            .iter()
            .copied()
            .find(|source| source.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                AuthError::ConfigError(format!(
                    "Invalid credential source '{}', expected one of: {}",
                    s,
                    CredentialSource::DEFAULT_PRECEDENCE
                        .iter()
                        .map(|c| c.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

/// Parse a list of source names, keeping the first occurrence of each
pub fn parse_precedence<S: AsRef<str>>(names: &[S]) -> Result<Vec<CredentialSource>> {
    let sources = names
        .iter()
        .map(|name| name.as_ref().parse())
        .collect::<Result<Vec<CredentialSource>>>()?;
    Ok(dedup_precedence(&sources))
}

/// Remove repeated sources without changing the order of first appearance
pub fn dedup_precedence(sources: &[CredentialSource]) -> Vec<CredentialSource> {
    let mut unique = Vec::with_capacity(sources.len());
    for source in sources {
        if !unique.contains(source) {
            unique.push(*source);
        }
    }
    unique
}

/// Variant tag of the credential held by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Chained,
    Interactive,
    ManagedIdentity,
    DeviceCode,
    ClientSecret,
    ClientCertificate,
    ClientAssertion,
}

/// Client certificate material, either in memory or on disk
#[derive(Clone, PartialEq, Eq)]
pub enum CertificateSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

impl fmt::Debug for CertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertificateSource::Bytes(bytes) => write!(f, "Bytes(<{} bytes>)", bytes.len()),
            CertificateSource::Path(path) => write!(f, "Path({})", path.display()),
        }
    }
}

/// Authentication method and its method-specific parameters
#[derive(Clone)]
pub enum AuthMethod {
    NonInteractive {
        credential_precedence: Vec<CredentialSource>,
        /// Applied to every source when set; the managed identity source always has its own
        timeout_seconds: Option<u64>,
        managed_identity_timeout_seconds: u64,
    },
    Interactive {
        client_id: Option<String>,
        token_cache: Option<String>,
        timeout_seconds: u64,
        use_unprotected_cache: bool,
    },
    DeviceCode {
        client_id: Option<String>,
        token_cache: Option<String>,
        timeout_seconds: u64,
        use_unprotected_cache: bool,
    },
    ManagedIdentity {
        client_id: Option<String>,
        timeout_seconds: u64,
    },
    WorkloadIdentity {
        client_id: String,
        external_token: String,
    },
    ClientSecret {
        client_id: String,
        client_secret: String,
    },
    ClientCertificate {
        client_id: String,
        certificate: CertificateSource,
    },
    Cache {
        client_id: Option<String>,
        token_cache: String,
        username: String,
        use_unprotected_cache: bool,
    },
}

impl AuthMethod {
    pub fn non_interactive() -> Self {
        AuthMethod::NonInteractive {
            credential_precedence: CredentialSource::DEFAULT_PRECEDENCE.to_vec(),
            timeout_seconds: None,
            managed_identity_timeout_seconds: DEFAULT_MANAGED_IDENTITY_TIMEOUT_SECONDS,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::NonInteractive { .. } => "non-interactive",
            AuthMethod::Interactive { .. } => "interactive",
            AuthMethod::DeviceCode { .. } => "device-code",
            AuthMethod::ManagedIdentity { .. } => "managed-identity",
            AuthMethod::WorkloadIdentity { .. } => "workload-identity",
            AuthMethod::ClientSecret { .. } => "client-secret",
            AuthMethod::ClientCertificate { .. } => "client-certificate",
            AuthMethod::Cache { .. } => "cache",
        }
    }

    fn token_cache(&self) -> Option<&str> {
        match self {
            AuthMethod::Interactive { token_cache, .. }
            | AuthMethod::DeviceCode { token_cache, .. } => token_cache.as_deref(),
            AuthMethod::Cache { token_cache, .. } => Some(token_cache),
            _ => None,
        }
    }
}

// Secrets never reach logs through Debug
impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::NonInteractive {
                credential_precedence,
                timeout_seconds,
                managed_identity_timeout_seconds,
            } => f
                .debug_struct("NonInteractive")
                .field("credential_precedence", credential_precedence)
                .field("timeout_seconds", timeout_seconds)
                .field(
                    "managed_identity_timeout_seconds",
                    managed_identity_timeout_seconds,
                )
                .finish(),
            AuthMethod::Interactive {
                client_id,
                token_cache,
                ..
            }
            | AuthMethod::DeviceCode {
                client_id,
                token_cache,
                ..
            } => f
                .debug_struct(self.name())
                .field("client_id", client_id)
                .field("token_cache", token_cache)
                .finish(),
            AuthMethod::ManagedIdentity { client_id, .. } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
            AuthMethod::WorkloadIdentity { client_id, .. }
            | AuthMethod::ClientSecret { client_id, .. }
            | AuthMethod::ClientCertificate { client_id, .. } => f
                .debug_struct(self.name())
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            AuthMethod::Cache {
                token_cache,
                username,
                ..
            } => f
                .debug_struct("Cache")
                .field("token_cache", token_cache)
                .field("username", username)
                .finish(),
        }
    }
}

/// A request for a token against a resource
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub resource: String,
    /// Scope suffixes, combined with the resource to form full scopes
    pub scopes: Vec<String>,
    pub claims: Option<String>,
    pub tenant_id: Option<String>,
    pub method: AuthMethod,
}

impl TokenRequest {
    pub fn new(method: AuthMethod) -> Self {
        Self {
            resource: DEFAULT_RESOURCE.to_string(),
            scopes: vec![DEFAULT_SCOPE.to_string()],
            claims: None,
            tenant_id: None,
            method,
        }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = resource.into();
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_claims(mut self, claims: impl Into<String>) -> Self {
        self.claims = Some(claims.into());
        self
    }

    /// Fully-qualified scopes, in request order
    pub fn full_scopes(&self) -> Vec<String> {
        full_scopes(&self.resource, &self.scopes)
    }

    pub(crate) fn context(&self) -> TokenRequestContext {
        TokenRequestContext {
            scopes: self.full_scopes(),
            claims: self.claims.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }

    /// Reject malformed requests before any I/O happens
    pub fn validate(&self) -> Result<()> {
        if self.resource.trim().is_empty() {
            return Err(AuthError::ConfigError("Resource cannot be empty".to_string()));
        }
        if self.scopes.is_empty() || self.scopes.iter().any(|s| s.trim().is_empty()) {
            return Err(AuthError::ConfigError(
                "At least one non-empty scope is required".to_string(),
            ));
        }

        if let Some(cache) = self.method.token_cache() {
            if cache.trim().is_empty() {
                return Err(AuthError::ConfigError(
                    "The specified token cache cannot be empty".to_string(),
                ));
            }
        }

        match &self.method {
            AuthMethod::NonInteractive {
                credential_precedence,
                ..
            } => {
                if credential_precedence.is_empty() {
                    return Err(AuthError::ConfigError(
                        "At least one credential source is required".to_string(),
                    ));
                }
            }
            AuthMethod::Interactive {
                token_cache,
                timeout_seconds,
                use_unprotected_cache,
                ..
            }
            | AuthMethod::DeviceCode {
                token_cache,
                timeout_seconds,
                use_unprotected_cache,
                ..
            } => {
                if *timeout_seconds == 0 {
                    return Err(AuthError::ConfigError(
                        "Timeout must be at least 1 second".to_string(),
                    ));
                }
                if *use_unprotected_cache && token_cache.is_none() {
                    return Err(AuthError::ConfigError(
                        "Unprotected token caches can only be used together with a named token cache"
                            .to_string(),
                    ));
                }
            }
            AuthMethod::ManagedIdentity {
                timeout_seconds, ..
            } => {
                if *timeout_seconds == 0 {
                    return Err(AuthError::ConfigError(
                        "Timeout must be at least 1 second".to_string(),
                    ));
                }
            }
            AuthMethod::WorkloadIdentity {
                client_id,
                external_token: secret,
            }
            | AuthMethod::ClientSecret {
                client_id,
                client_secret: secret,
            } => {
                self.require_service_principal(client_id)?;
                if secret.is_empty() {
                    return Err(AuthError::ConfigError(format!(
                        "A secret value is required for {} authentication",
                        self.method.name()
                    )));
                }
            }
            AuthMethod::ClientCertificate {
                client_id,
                certificate,
            } => {
                self.require_service_principal(client_id)?;
                if let CertificateSource::Bytes(bytes) = certificate {
                    if bytes.is_empty() {
                        return Err(AuthError::ConfigError(
                            "Client certificate cannot be empty".to_string(),
                        ));
                    }
                }
            }
            AuthMethod::Cache { username, .. } => {
                if username.trim().is_empty() {
                    return Err(AuthError::ConfigError(
                        "A username is required to get a token from a token cache".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    fn require_service_principal(&self, client_id: &str) -> Result<()> {
        if client_id.trim().is_empty() {
            return Err(AuthError::ConfigError(format!(
                "A client id is required for {} authentication",
                self.method.name()
            )));
        }
        if self.tenant_id.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Err(AuthError::ConfigError(format!(
                "A tenant id is required for {} authentication",
                self.method.name()
            )));
        }
        Ok(())
    }
}

/// Combine a resource and scope suffixes into fully-qualified scopes
pub fn full_scopes<S: AsRef<str>>(resource: &str, scopes: &[S]) -> Vec<String> {
    let resource = resource.trim_end_matches('/');
    scopes
        .iter()
        .map(|scope| format!("{}/{}", resource, scope.as_ref()))
        .collect()
}

/// What a credential is asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequestContext {
    pub scopes: Vec<String>,
    pub claims: Option<String>,
    pub tenant_id: Option<String>,
}

/// Raw token returned by a credential
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Token decorated with identity metadata taken from its own claims
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResult {
    token: String,
    scopes: Vec<String>,
    expires_on: DateTime<Utc>,
    identity: Option<String>,
    tenant_id: Option<String>,
    claims: ClaimsMap,
}

impl TokenResult {
    pub(crate) fn new(
        token: String,
        scopes: Vec<String>,
        expires_on: DateTime<Utc>,
        identity: Option<String>,
        tenant_id: Option<String>,
        claims: ClaimsMap,
    ) -> Self {
        Self {
            token,
            scopes,
            expires_on,
            identity,
            tenant_id,
            claims,
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn expires_on(&self) -> DateTime<Utc> {
        self.expires_on
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn claims(&self) -> &ClaimsMap {
        &self.claims
    }
}

impl fmt::Display for TokenResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_scopes_trims_trailing_slash() {
        let scopes = full_scopes("https://example.org/", &[".default", "User.Read"]);
        assert_eq!(
            scopes,
            vec![
                "https://example.org/.default".to_string(),
                "https://example.org/User.Read".to_string()
            ]
        );

        let scopes = full_scopes("https://example.org", &[".default"]);
        assert_eq!(scopes, vec!["https://example.org/.default".to_string()]);
    }

    #[test]
    fn test_request_defaults() {
        let request = TokenRequest::new(AuthMethod::non_interactive());
        assert_eq!(request.resource, DEFAULT_RESOURCE);
        assert_eq!(
            request.full_scopes(),
            vec!["https://graph.microsoft.com/.default".to_string()]
        );
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_parse_credential_source_case_insensitive() {
        assert_eq!(
            "azurecli".parse::<CredentialSource>().unwrap(),
            CredentialSource::AzureCli
        );
        assert_eq!(
            "ManagedIdentity".parse::<CredentialSource>().unwrap(),
            CredentialSource::ManagedIdentity
        );
        assert!("VisualStudioCode".parse::<CredentialSource>().is_err());
    }

    #[test]
    fn test_parse_precedence_dedups_in_order() {
        let sources =
            parse_precedence(&["AzureCLI", "Environment", "azurecli", "Environment"]).unwrap();
        assert_eq!(
            sources,
            vec![CredentialSource::AzureCli, CredentialSource::Environment]
        );
    }

    #[test]
    fn test_parse_precedence_rejects_unknown() {
        let err = parse_precedence(&["Environment", "Keychain"]).unwrap_err();
        assert!(matches!(err, AuthError::ConfigError(_)));
        assert!(err.to_string().contains("Keychain"));
    }

    #[test]
    fn test_validate_rejects_empty_scopes() {
        let request = TokenRequest::new(AuthMethod::non_interactive()).with_scopes(Vec::<String>::new());
        assert!(matches!(request.validate(), Err(AuthError::ConfigError(_))));
    }

    #[test]
    fn test_validate_service_principal_requires_tenant() {
        let request = TokenRequest::new(AuthMethod::ClientSecret {
            client_id: "app".to_string(),
            client_secret: "secret".to_string(),
        });
        let err = request.validate().unwrap_err();
        assert!(err.to_string().contains("tenant id is required"));

        let request = request.with_tenant("T1");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validate_unprotected_cache_requires_cache_name() {
        let request = TokenRequest::new(AuthMethod::Interactive {
            client_id: None,
            token_cache: None,
            timeout_seconds: 120,
            use_unprotected_cache: true,
        });
        assert!(matches!(request.validate(), Err(AuthError::ConfigError(_))));
    }

    #[test]
    fn test_validate_cache_requires_username() {
        let request = TokenRequest::new(AuthMethod::Cache {
            client_id: None,
            token_cache: "mycache".to_string(),
            username: " ".to_string(),
            use_unprotected_cache: false,
        });
        assert!(matches!(request.validate(), Err(AuthError::ConfigError(_))));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let method = AuthMethod::ClientSecret {
            client_id: "app".to_string(),
            client_secret: "super-secret".to_string(),
        };
        let rendered = format!("{:?}", method);
        assert!(rendered.contains("app"));
        assert!(!rendered.contains("super-secret"));
    }
}
