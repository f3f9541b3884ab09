// Credential providers
// Concrete credentials behind the CredentialFactory seam

mod cli;
mod http;

pub use cli::AzureCliCredential;
pub use http::{
    scope_to_resource, ClientCredential, ClientGrant, HttpPolicy, ManagedIdentityCredential,
    DEFAULT_AUTHORITY_HOST, IMDS_ENDPOINT,
};

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::{
    AccessToken, CertificateSource, CredentialError, CredentialFactory, CredentialSource,
    DeviceCodeCallback, SourceOptions, TokenCredential, TokenRequestContext,
};

const AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
const AZURE_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
const AZURE_AUTHORITY_HOST: &str = "AZURE_AUTHORITY_HOST";

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A credential that can never produce a token on this build or machine
pub struct UnavailableCredential {
    name: String,
    message: String,
}

impl UnavailableCredential {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl TokenCredential for UnavailableCredential {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_token(
        &self,
        _context: &TokenRequestContext,
        _cancel: &CancellationToken,
    ) -> Result<AccessToken, CredentialError> {
        Err(CredentialError::unavailable(self.message.clone()))
    }
}

/// Service principal configured through `AZURE_*` environment variables
///
/// Variables are read on every request so a chain built before they are set still sees them.
pub struct EnvironmentCredential {
    options: SourceOptions,
    lookup: EnvLookup,
}

impl EnvironmentCredential {
    pub fn new(options: SourceOptions) -> Self {
        Self {
            options,
            lookup: Arc::new(|key| std::env::var(key).ok().filter(|v| !v.is_empty())),
        }
    }

    pub fn with_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.lookup = Arc::new(lookup);
        self
    }
}

#[async_trait]
impl TokenCredential for EnvironmentCredential {
    fn name(&self) -> &str {
        "EnvironmentCredential"
    }

    async fn get_token(
        &self,
        context: &TokenRequestContext,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, CredentialError> {
        let (tenant_id, client_id, secret) = match (
            (self.lookup)(AZURE_TENANT_ID),
            (self.lookup)(AZURE_CLIENT_ID),
            (self.lookup)(AZURE_CLIENT_SECRET),
        ) {
            (Some(tenant), Some(client), Some(secret)) => (tenant, client, secret),
            _ => {
                return Err(CredentialError::unavailable(format!(
                    "Environment variables are not fully configured ({}, {} and {} are required)",
                    AZURE_TENANT_ID, AZURE_CLIENT_ID, AZURE_CLIENT_SECRET
                )))
            }
        };

        let authority =
            (self.lookup)(AZURE_AUTHORITY_HOST).unwrap_or_else(|| DEFAULT_AUTHORITY_HOST.into());
        let policy = HttpPolicy::new(self.options)
            .map_err(|e| CredentialError::unavailable(format!("{:#}", e)))?;

        tracing::debug!(client_id = %client_id, "Using service principal from environment");
        ClientCredential::new(
            &tenant_id,
            &client_id,
            ClientGrant::Secret(secret),
            &authority,
            policy,
        )
        .get_token(context, cancel)
        .await
    }
}

/// Production factory: real HTTP and process backed credentials
///
/// Browser and device code sign-in need a platform broker, which this build does not ship,
/// so those credentials report themselves unavailable and the chain moves on.
#[derive(Debug, Clone)]
pub struct DefaultCredentialFactory {
    authority_host: String,
}

impl Default for DefaultCredentialFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultCredentialFactory {
    pub fn new() -> Self {
        Self {
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
        }
    }

    pub fn with_authority_host(mut self, authority_host: impl Into<String>) -> Self {
        self.authority_host = authority_host.into();
        self
    }

    fn policy_or_unavailable(
        name: &str,
        options: SourceOptions,
    ) -> Result<HttpPolicy, Arc<dyn TokenCredential>> {
        HttpPolicy::new(options).map_err(|e| {
            tracing::warn!("{} disabled: {:#}", name, e);
            Arc::new(UnavailableCredential::new(name, format!("{:#}", e)))
                as Arc<dyn TokenCredential>
        })
    }

    fn client(
        &self,
        tenant_id: &str,
        client_id: &str,
        grant: ClientGrant,
    ) -> Arc<dyn TokenCredential> {
        let name = match grant {
            ClientGrant::Secret(_) => "ClientSecretCredential",
            ClientGrant::Assertion(_) => "ClientAssertionCredential",
        };
        match Self::policy_or_unavailable(name, SourceOptions::default()) {
            Ok(policy) => Arc::new(ClientCredential::new(
                tenant_id,
                client_id,
                grant,
                &self.authority_host,
                policy,
            )),
            Err(unavailable) => unavailable,
        }
    }
}

impl CredentialFactory for DefaultCredentialFactory {
    fn source(
        &self,
        source: CredentialSource,
        options: SourceOptions,
    ) -> Arc<dyn TokenCredential> {
        match source {
            CredentialSource::Environment => Arc::new(EnvironmentCredential::new(options)),
            CredentialSource::AzureCli => Arc::new(AzureCliCredential::new(options.network_timeout)),
            CredentialSource::ManagedIdentity => self.managed_identity(None, options),
            other => Arc::new(UnavailableCredential::new(
                format!("{}Credential", other.name()),
                format!(
                    "{} is not supported on this platform. See {}",
                    other.name(),
                    other.documentation_url()
                ),
            )),
        }
    }

    fn interactive_browser(
        &self,
        _client_id: Option<&str>,
        _tenant_id: Option<&str>,
    ) -> Arc<dyn TokenCredential> {
        Arc::new(UnavailableCredential::new(
            "InteractiveBrowserCredential",
            "Interactive browser sign-in is not available in this build",
        ))
    }

    fn device_code(
        &self,
        _client_id: Option<&str>,
        _tenant_id: Option<&str>,
        _callback: DeviceCodeCallback,
    ) -> Arc<dyn TokenCredential> {
        Arc::new(UnavailableCredential::new(
            "DeviceCodeCredential",
            "Device code sign-in is not available in this build",
        ))
    }

    fn managed_identity(
        &self,
        client_id: Option<&str>,
        options: SourceOptions,
    ) -> Arc<dyn TokenCredential> {
        match Self::policy_or_unavailable("ManagedIdentityCredential", options) {
            Ok(policy) => Arc::new(ManagedIdentityCredential::new(client_id, policy)),
            Err(unavailable) => unavailable,
        }
    }

    fn client_secret(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Arc<dyn TokenCredential> {
        self.client(tenant_id, client_id, ClientGrant::Secret(client_secret.to_string()))
    }

    fn client_certificate(
        &self,
        _tenant_id: &str,
        _client_id: &str,
        certificate: &CertificateSource,
    ) -> Arc<dyn TokenCredential> {
        Arc::new(UnavailableCredential::new(
            "ClientCertificateCredential",
            format!(
                "Certificate sign-in is not available in this build ({:?})",
                certificate
            ),
        ))
    }

    fn client_assertion(
        &self,
        tenant_id: &str,
        client_id: &str,
        assertion: &str,
    ) -> Arc<dyn TokenCredential> {
        self.client(tenant_id, client_id, ClientGrant::Assertion(assertion.to_string()))
    }
}
