// Credential provider seam
// Token protocols live behind these traits; the orchestrator only selects and reuses credentials

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::types::{AccessToken, CertificateSource, CredentialSource, TokenRequestContext};

/// Class of a credential failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialErrorKind {
    /// The source is not configured or not present on this machine
    Unavailable,
    /// The source was tried and the identity platform rejected it
    AuthenticationFailed,
    /// The cancellation token fired
    Cancelled,
    Other,
}

/// Failure reported by a credential
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CredentialError {
    pub kind: CredentialErrorKind,
    pub message: String,
}

impl CredentialError {
    pub fn new(kind: CredentialErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(CredentialErrorKind::Unavailable, message)
    }

    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::new(CredentialErrorKind::AuthenticationFailed, message)
    }

    pub fn cancelled() -> Self {
        Self::new(CredentialErrorKind::Cancelled, "The operation was cancelled")
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(CredentialErrorKind::Other, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == CredentialErrorKind::Cancelled
    }
}

/// Something that can produce an access token
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Name used in logs and aggregated chain errors
    fn name(&self) -> &str;

    async fn get_token(
        &self,
        context: &TokenRequestContext,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, CredentialError>;
}

/// Network policy for one credential instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceOptions {
    /// Per-attempt network timeout; provider default when unset
    pub network_timeout: Option<Duration>,
    /// Retry budget; provider default when unset
    pub max_retries: Option<u32>,
}

impl SourceOptions {
    /// Bounded timeout, no retries and no retry delay
    pub fn fail_fast(timeout: Duration) -> Self {
        Self {
            network_timeout: Some(timeout),
            max_retries: Some(0),
        }
    }
}

/// Receives the user-facing verification message of a device code flow
pub type DeviceCodeCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Builds credential instances for every supported authentication method
pub trait CredentialFactory: Send + Sync {
    /// One member of a credential chain
    fn source(&self, source: CredentialSource, options: SourceOptions)
        -> Arc<dyn TokenCredential>;

    fn interactive_browser(
        &self,
        client_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Arc<dyn TokenCredential>;

    fn device_code(
        &self,
        client_id: Option<&str>,
        tenant_id: Option<&str>,
        callback: DeviceCodeCallback,
    ) -> Arc<dyn TokenCredential>;

    fn managed_identity(
        &self,
        client_id: Option<&str>,
        options: SourceOptions,
    ) -> Arc<dyn TokenCredential>;

    fn client_secret(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Arc<dyn TokenCredential>;

    fn client_certificate(
        &self,
        tenant_id: &str,
        client_id: &str,
        certificate: &CertificateSource,
    ) -> Arc<dyn TokenCredential>;

    /// Workload identity federation: the external token is presented as a client assertion
    fn client_assertion(
        &self,
        tenant_id: &str,
        client_id: &str,
        assertion: &str,
    ) -> Arc<dyn TokenCredential>;
}
