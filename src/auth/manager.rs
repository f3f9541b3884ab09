use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::chain::ChainBuilder;
use super::claims::TokenClaims;
use super::device_code::{DeviceCodeFlow, DeviceCodeRelay, FlowReporter};
use super::provider::{
    CredentialError, CredentialErrorKind, CredentialFactory, SourceOptions, TokenCredential,
};
use super::session::{ActiveCredential, Session, SessionState};
use super::timeout::with_login_timeout;
use super::types::{
    dedup_precedence, AccessToken, AuthMethod, CredentialKind, TokenRequest, TokenResult,
};
use crate::cache::{CacheManager, CacheProtection, CacheTarget};
use crate::error::{AuthError, Result};

/// Provider detail embedded in verbose identity platform errors
static PROVIDER_DETAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"AADSTS\d+:\s*(?P<message>.+?\.)(?:_x001B_|\s|$)").unwrap());

/// Token acquisition orchestrator
/// Selects, builds and reuses credentials for every authentication method
#[derive(Clone)]
pub struct TokenManager {
    /// Builds credential instances
    factory: Arc<dyn CredentialFactory>,

    /// Named token caches, required by cache-bound methods
    cache: Option<Arc<CacheManager>>,

    /// Credential reuse state shared by every call
    session: Arc<Session>,
}

impl TokenManager {
    pub fn new(factory: Arc<dyn CredentialFactory>, session: Arc<Session>) -> Self {
        Self {
            factory,
            cache: None,
            session,
        }
    }

    pub fn with_cache_manager(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Disregard every earlier authentication in this session
    pub async fn reset(&self) {
        self.session.reset().await;
    }

    /// Get a token using whichever method the request names
    ///
    /// Device code messages are logged as warnings; use
    /// [`TokenManager::get_token_device_code`] to handle them directly.
    pub async fn get_token(
        &self,
        request: &TokenRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        match &request.method {
            AuthMethod::NonInteractive { .. } => {
                self.get_token_non_interactive(request, cancel).await
            }
            AuthMethod::Interactive { .. } => self.get_token_interactive(request, cancel).await,
            AuthMethod::DeviceCode { .. } => {
                self.get_token_device_code(request, cancel)?
                    .run(|message| tracing::warn!("{}", message))
                    .await
            }
            AuthMethod::ManagedIdentity { .. } => {
                self.get_token_managed_identity(request, cancel).await
            }
            AuthMethod::WorkloadIdentity { .. } => {
                self.get_token_workload_identity(request, cancel).await
            }
            AuthMethod::ClientSecret { .. } => self.get_token_client_secret(request, cancel).await,
            AuthMethod::ClientCertificate { .. } => {
                self.get_token_client_certificate(request, cancel).await
            }
            AuthMethod::Cache { .. } => self.get_token_from_cache(request, cancel).await,
        }
    }

    /// Token from the first credential source in the precedence list that can provide one
    pub async fn get_token_non_interactive(
        &self,
        request: &TokenRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        let AuthMethod::NonInteractive {
            credential_precedence,
            timeout_seconds,
            managed_identity_timeout_seconds,
        } = &request.method
        else {
            return Err(method_mismatch("non-interactive", request));
        };
        request.validate()?;

        let precedence = dedup_precedence(credential_precedence);
        tracing::info!(
            "Looking for a token from the following sources: {}",
            precedence
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        for source in &precedence {
            tracing::debug!("{}: {}", source, source.documentation_url());
        }

        let tenant_id = request.tenant_id.as_deref();
        let mut state = self.session.lock().await;

        let credential = match state.reusable_chain(tenant_id, &precedence) {
            Some(chain) => {
                tracing::debug!("Reusing credential chain from the previous request");
                chain
            }
            None => {
                let mut chain = ChainBuilder::new(
                    self.factory.as_ref(),
                    Duration::from_secs(*managed_identity_timeout_seconds),
                )
                .with_timeout(timeout_seconds.map(Duration::from_secs))
                .build(&precedence);

                if let Some(interactive) = state.interactive_for_tenant(tenant_id) {
                    tracing::debug!("Trying the earlier interactive login first");
                    chain.prepend(interactive);
                }

                let chain: Arc<dyn TokenCredential> = Arc::new(chain);
                state.install(
                    ActiveCredential::new(CredentialKind::Chained, chain.clone())
                        .with_tenant(tenant_id)
                        .with_precedence(precedence),
                );
                chain
            }
        };

        match credential.get_token(&request.context(), cancel).await {
            Ok(access) => complete(&mut state, request, access),
            Err(e) if e.is_cancelled() => Err(AuthError::Cancelled),
            Err(e) => {
                tracing::error!("No credential source could provide a token: {}", e);
                Err(describe_chain_failure(e))
            }
        }
    }

    /// Browser login, always with a fresh credential
    pub async fn get_token_interactive(
        &self,
        request: &TokenRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        let AuthMethod::Interactive {
            client_id,
            token_cache,
            timeout_seconds,
            use_unprotected_cache,
        } = &request.method
        else {
            return Err(method_mismatch("interactive", request));
        };
        request.validate()?;

        tracing::info!("Starting interactive login");
        let timeout = Duration::from_secs(*timeout_seconds);
        with_login_timeout(timeout, cancel, |combined| async move {
            if let Some(name) = token_cache {
                let target =
                    cache_target(request, name, client_id.as_deref(), *use_unprotected_cache);
                return self
                    .cache_manager()?
                    .acquire_interactive(&target, &combined)
                    .await;
            }

            let mut state = self.session.lock().await;
            let tenant_id = request.tenant_id.as_deref();
            let credential = self
                .factory
                .interactive_browser(client_id.as_deref(), tenant_id);
            state.install(
                ActiveCredential::new(CredentialKind::Interactive, credential.clone())
                    .with_tenant(tenant_id)
                    .with_client_id(client_id.as_deref()),
            );

            let result = credential.get_token(&request.context(), &combined).await;
            finish(&mut state, request, result)
        })
        .await
    }

    /// Start a device code login
    ///
    /// The acquisition runs in the background on the current Tokio runtime.
    /// Drain the verification message from the returned flow and show it to
    /// the user, then await the token. Outside a runtime this returns an error.
    pub fn get_token_device_code(
        &self,
        request: &TokenRequest,
        cancel: &CancellationToken,
    ) -> Result<DeviceCodeFlow> {
        let AuthMethod::DeviceCode {
            timeout_seconds, ..
        } = &request.method
        else {
            return Err(method_mismatch("device-code", request));
        };
        request.validate()?;
        tokio::runtime::Handle::try_current().map_err(|e| {
            AuthError::Internal(anyhow::anyhow!(
                "Device code login needs a Tokio runtime: {}",
                e
            ))
        })?;

        let timeout = Duration::from_secs(*timeout_seconds);
        let manager = self.clone();
        let request = request.clone();
        let external = cancel.clone();

        tracing::info!("Starting device code login");
        Ok(DeviceCodeFlow::spawn(cancel.clone(), move |reporter| async move {
            with_login_timeout(timeout, &external, |combined| async move {
                manager
                    .acquire_device_code(&request, reporter, &combined)
                    .await
            })
            .await
        }))
    }

    async fn acquire_device_code(
        &self,
        request: &TokenRequest,
        reporter: FlowReporter,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        let AuthMethod::DeviceCode {
            client_id,
            token_cache,
            use_unprotected_cache,
            ..
        } = &request.method
        else {
            return Err(method_mismatch("device-code", request));
        };

        if let Some(name) = token_cache {
            let target =
                cache_target(request, name, client_id.as_deref(), *use_unprotected_cache);
            return self
                .cache_manager()?
                .acquire_device_code(&target, reporter.callback(), cancel)
                .await;
        }

        let client_id = client_id.as_deref();
        let tenant_id = request.tenant_id.as_deref();
        let mut state = self.session.lock().await;

        let reused = state
            .reusable(CredentialKind::DeviceCode, client_id)
            .and_then(|active| {
                active
                    .device_code_relay
                    .clone()
                    .map(|relay| (active.handle.clone(), relay))
            });

        let (credential, relay) = match reused {
            Some(reused) => {
                tracing::debug!("Reusing device code credential from the previous request");
                reused
            }
            None => {
                let relay = DeviceCodeRelay::default();
                let credential = self
                    .factory
                    .device_code(client_id, tenant_id, relay.callback());
                state.install(
                    ActiveCredential::new(CredentialKind::DeviceCode, credential.clone())
                        .with_tenant(tenant_id)
                        .with_client_id(client_id)
                        .with_device_code_relay(relay.clone()),
                );
                (credential, relay)
            }
        };
        relay.attach(reporter);

        let result = credential.get_token(&request.context(), cancel).await;
        finish(&mut state, request, result)
    }

    pub async fn get_token_managed_identity(
        &self,
        request: &TokenRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        let AuthMethod::ManagedIdentity {
            client_id,
            timeout_seconds,
        } = &request.method
        else {
            return Err(method_mismatch("managed-identity", request));
        };
        request.validate()?;

        let options = SourceOptions::fail_fast(Duration::from_secs(*timeout_seconds));
        self.acquire_single(
            request,
            CredentialKind::ManagedIdentity,
            client_id.as_deref(),
            || self.factory.managed_identity(client_id.as_deref(), options),
            cancel,
        )
        .await
    }

    /// Federated login with an externally issued token as the client assertion
    pub async fn get_token_workload_identity(
        &self,
        request: &TokenRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        let AuthMethod::WorkloadIdentity {
            client_id,
            external_token,
        } = &request.method
        else {
            return Err(method_mismatch("workload-identity", request));
        };
        request.validate()?;

        let tenant_id = request.tenant_id.as_deref().unwrap_or_default();
        self.acquire_single(
            request,
            CredentialKind::ClientAssertion,
            Some(client_id),
            || {
                self.factory
                    .client_assertion(tenant_id, client_id, external_token)
            },
            cancel,
        )
        .await
    }

    pub async fn get_token_client_secret(
        &self,
        request: &TokenRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        let AuthMethod::ClientSecret {
            client_id,
            client_secret,
        } = &request.method
        else {
            return Err(method_mismatch("client-secret", request));
        };
        request.validate()?;

        let tenant_id = request.tenant_id.as_deref().unwrap_or_default();
        self.acquire_single(
            request,
            CredentialKind::ClientSecret,
            Some(client_id),
            || self.factory.client_secret(tenant_id, client_id, client_secret),
            cancel,
        )
        .await
    }

    pub async fn get_token_client_certificate(
        &self,
        request: &TokenRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        let AuthMethod::ClientCertificate {
            client_id,
            certificate,
        } = &request.method
        else {
            return Err(method_mismatch("client-certificate", request));
        };
        request.validate()?;

        let tenant_id = request.tenant_id.as_deref().unwrap_or_default();
        self.acquire_single(
            request,
            CredentialKind::ClientCertificate,
            Some(client_id),
            || {
                self.factory
                    .client_certificate(tenant_id, client_id, certificate)
            },
            cancel,
        )
        .await
    }

    /// Silent acquisition from a named token cache
    pub async fn get_token_from_cache(
        &self,
        request: &TokenRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenResult> {
        let AuthMethod::Cache {
            client_id,
            token_cache,
            username,
            use_unprotected_cache,
        } = &request.method
        else {
            return Err(method_mismatch("cache", request));
        };
        request.validate()?;

        let target = cache_target(
            request,
            token_cache,
            client_id.as_deref(),
            *use_unprotected_cache,
        );
        self.cache_manager()?
            .acquire_silent(&target, username, cancel)
            .await
    }

    /// Save a token from any method into a plaintext named token cache
    ///
    /// A later [`AuthMethod::Cache`] request for the token's identity and
    /// scopes is served from it without signing in again.
    pub async fn save_to_cache(
        &self,
        request: &TokenRequest,
        token_cache: &str,
        result: &TokenResult,
    ) -> Result<()> {
        let target = cache_target(request, token_cache, None, true);
        self.cache_manager()?.store(&target, result).await
    }

    /// Reuse the session credential when it matches, else build one, then acquire
    async fn acquire_single<F>(
        &self,
        request: &TokenRequest,
        kind: CredentialKind,
        client_id: Option<&str>,
        build: F,
        cancel: &CancellationToken,
    ) -> Result<TokenResult>
    where
        F: FnOnce() -> Arc<dyn TokenCredential>,
    {
        let tenant_id = request.tenant_id.as_deref();
        let mut state = self.session.lock().await;

        let credential = match state.reusable(kind, client_id) {
            Some(active) => {
                tracing::debug!(?kind, "Reusing credential from the previous request");
                active.handle.clone()
            }
            None => {
                let credential = build();
                state.install(
                    ActiveCredential::new(kind, credential.clone())
                        .with_tenant(tenant_id)
                        .with_client_id(client_id),
                );
                credential
            }
        };

        let result = credential.get_token(&request.context(), cancel).await;
        finish(&mut state, request, result)
    }

    fn cache_manager(&self) -> Result<&CacheManager> {
        self.cache.as_deref().ok_or_else(|| {
            AuthError::ConfigError("No token cache manager is configured".to_string())
        })
    }
}

fn finish(
    state: &mut SessionState,
    request: &TokenRequest,
    result: std::result::Result<AccessToken, CredentialError>,
) -> Result<TokenResult> {
    match result {
        Ok(access) => complete(state, request, access),
        Err(e) => {
            if !e.is_cancelled() {
                tracing::error!("Token acquisition failed: {}", e);
            }
            Err(map_credential_error(e))
        }
    }
}

/// Decorate the token and record what produced it
fn complete(
    state: &mut SessionState,
    request: &TokenRequest,
    access: AccessToken,
) -> Result<TokenResult> {
    let result = build_result(access, request);
    state.record_success(result.tenant_id());
    tracing::info!(
        identity = result.identity().unwrap_or("<unknown>"),
        tenant = result.tenant_id().unwrap_or("<unknown>"),
        "Token acquired, expires {}",
        result.expires_on().to_rfc3339()
    );
    Ok(result)
}

fn build_result(access: AccessToken, request: &TokenRequest) -> TokenResult {
    let extracted = TokenClaims::extract(&access.token);
    TokenResult::new(
        access.token,
        extracted.scopes.unwrap_or_else(|| request.full_scopes()),
        access.expires_on,
        extracted.identity,
        extracted.tenant_id.or_else(|| request.tenant_id.clone()),
        extracted.claims,
    )
}

fn map_credential_error(err: CredentialError) -> AuthError {
    match err.kind {
        CredentialErrorKind::Cancelled => AuthError::Cancelled,
        CredentialErrorKind::Unavailable | CredentialErrorKind::AuthenticationFailed => {
            AuthError::AuthFailed {
                message: err.message.clone(),
                source: Some(err),
            }
        }
        CredentialErrorKind::Other => AuthError::ProviderError(err.message),
    }
}

/// "Could not get a token!" plus the provider detail when one can be found
fn describe_chain_failure(err: CredentialError) -> AuthError {
    let message = match extract_provider_detail(&err.message) {
        Some(detail) => format!("Could not get a token! {}", detail),
        None => "Could not get a token! See inner error for more details.".to_string(),
    };
    AuthError::AuthFailed {
        message,
        source: Some(err),
    }
}

fn extract_provider_detail(message: &str) -> Option<&str> {
    PROVIDER_DETAIL
        .captures(message)
        .and_then(|c| c.name("message"))
        .map(|m| m.as_str())
}

fn cache_target(
    request: &TokenRequest,
    name: &str,
    client_id: Option<&str>,
    use_unprotected_cache: bool,
) -> CacheTarget {
    CacheTarget {
        name: name.to_string(),
        client_id: client_id.map(str::to_string),
        tenant_id: request.tenant_id.clone(),
        protection: CacheProtection::from_unprotected_flag(use_unprotected_cache),
        scopes: request.full_scopes(),
        claims: request.claims.clone(),
    }
}

fn method_mismatch(expected: &str, request: &TokenRequest) -> AuthError {
    AuthError::ConfigError(format!(
        "Expected a {} request but got {}",
        expected,
        request.method.name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::device_code::FlowState;
    use crate::auth::testing::{jwt, Behavior, CountingFactory, DEVICE_CODE_MESSAGE};
    use crate::auth::types::CredentialSource;
    use crate::error::ErrorKind;

    fn manager(factory: &Arc<CountingFactory>) -> TokenManager {
        TokenManager::new(factory.clone(), Arc::new(Session::new()))
    }

    fn non_interactive(tenant: Option<&str>) -> TokenRequest {
        let request = TokenRequest::new(AuthMethod::non_interactive());
        match tenant {
            Some(t) => request.with_tenant(t),
            None => request,
        }
    }

    fn interactive(tenant: &str, timeout_seconds: u64) -> TokenRequest {
        TokenRequest::new(AuthMethod::Interactive {
            client_id: None,
            token_cache: None,
            timeout_seconds,
            use_unprotected_cache: false,
        })
        .with_tenant(tenant)
    }

    fn device_code(client_id: Option<&str>) -> TokenRequest {
        TokenRequest::new(AuthMethod::DeviceCode {
            client_id: client_id.map(str::to_string),
            token_cache: None,
            timeout_seconds: 120,
            use_unprotected_cache: false,
        })
    }

    fn managed_identity(client_id: Option<&str>) -> TokenRequest {
        TokenRequest::new(AuthMethod::ManagedIdentity {
            client_id: client_id.map(str::to_string),
            timeout_seconds: 1,
        })
    }

    #[tokio::test]
    async fn test_non_interactive_reuses_chain() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager(&factory);
        let cancel = CancellationToken::new();

        manager
            .get_token(&non_interactive(Some("T1")), &cancel)
            .await
            .unwrap();
        manager
            .get_token(&non_interactive(Some("T1")), &cancel)
            .await
            .unwrap();

        assert_eq!(factory.sources_built(), CredentialSource::DEFAULT_PRECEDENCE.len());
    }

    #[tokio::test]
    async fn test_tenant_or_precedence_change_rebuilds_once() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager(&factory);
        let cancel = CancellationToken::new();
        let per_chain = CredentialSource::DEFAULT_PRECEDENCE.len();

        manager
            .get_token(&non_interactive(Some("T1")), &cancel)
            .await
            .unwrap();
        manager
            .get_token(&non_interactive(Some("T2")), &cancel)
            .await
            .unwrap();
        manager
            .get_token(&non_interactive(Some("T2")), &cancel)
            .await
            .unwrap();
        assert_eq!(factory.sources_built(), 2 * per_chain);

        let reordered = TokenRequest::new(AuthMethod::NonInteractive {
            credential_precedence: vec![CredentialSource::AzureCli, CredentialSource::Environment],
            timeout_seconds: None,
            managed_identity_timeout_seconds: 1,
        })
        .with_tenant("T2");
        manager.get_token(&reordered, &cancel).await.unwrap();
        manager.get_token(&reordered, &cancel).await.unwrap();
        assert_eq!(factory.sources_built(), 2 * per_chain + 2);
    }

    #[tokio::test]
    async fn test_duplicate_sources_are_built_once() {
        let factory = Arc::new(CountingFactory::new());
        let request = TokenRequest::new(AuthMethod::NonInteractive {
            credential_precedence: vec![
                CredentialSource::AzureCli,
                CredentialSource::AzureCli,
                CredentialSource::Environment,
            ],
            timeout_seconds: Some(30),
            managed_identity_timeout_seconds: 1,
        });

        let manager = manager(&factory);
        let cancel = CancellationToken::new();
        manager.get_token(&request, &cancel).await.unwrap();

        assert_eq!(factory.sources_built(), 2);
        assert_eq!(
            factory.options_seen(CredentialSource::AzureCli),
            Some(SourceOptions::fail_fast(Duration::from_secs(30)))
        );

        // Same sources once duplicates are dropped, so the chain is reused
        let deduplicated = TokenRequest::new(AuthMethod::NonInteractive {
            credential_precedence: vec![CredentialSource::AzureCli, CredentialSource::Environment],
            timeout_seconds: Some(30),
            managed_identity_timeout_seconds: 1,
        });
        manager.get_token(&deduplicated, &cancel).await.unwrap();
        assert_eq!(factory.sources_built(), 2);
    }

    #[tokio::test]
    async fn test_saved_token_serves_cache_requests() {
        let root = tempfile::tempdir().unwrap();
        let factory = Arc::new(CountingFactory::new());
        let cache = CacheManager::new(Arc::new(crate::cache::FileCacheProvider), root.path());
        let manager = manager(&factory).with_cache_manager(Arc::new(cache));
        let cancel = CancellationToken::new();

        let request = non_interactive(None);
        let acquired = manager.get_token(&request, &cancel).await.unwrap();
        manager
            .save_to_cache(&request, "team", &acquired)
            .await
            .unwrap();

        let from_cache = TokenRequest::new(AuthMethod::Cache {
            client_id: None,
            token_cache: "team".to_string(),
            username: "u@example.org".to_string(),
            use_unprotected_cache: true,
        });
        let served = manager.get_token(&from_cache, &cancel).await.unwrap();

        assert_eq!(served.token(), acquired.token());
        assert_eq!(served.identity(), Some("u@example.org"));
        assert_eq!(factory.sources_built(), CredentialSource::DEFAULT_PRECEDENCE.len());
    }

    #[test]
    fn test_device_code_outside_runtime_is_an_error() {
        let factory = Arc::new(CountingFactory::new());

        let Err(err) = manager(&factory)
            .get_token_device_code(&device_code(None), &CancellationToken::new())
        else {
            panic!("device code flow started without a runtime");
        };

        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("Tokio runtime"));
    }

    #[tokio::test]
    async fn test_managed_identity_reuse_follows_client_id() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager(&factory);
        let cancel = CancellationToken::new();

        manager
            .get_token(&managed_identity(Some("app-a")), &cancel)
            .await
            .unwrap();
        manager
            .get_token(&managed_identity(Some("app-a")), &cancel)
            .await
            .unwrap();
        assert_eq!(factory.count("managed_identity"), 1);

        manager
            .get_token(&managed_identity(Some("app-b")), &cancel)
            .await
            .unwrap();
        assert_eq!(factory.count("managed_identity"), 2);
        assert_eq!(
            factory.options_seen(CredentialSource::ManagedIdentity),
            Some(SourceOptions::fail_fast(Duration::from_secs(1)))
        );
    }

    #[tokio::test]
    async fn test_variant_change_rebuilds() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager(&factory);
        let cancel = CancellationToken::new();
        let secret = TokenRequest::new(AuthMethod::ClientSecret {
            client_id: "app-a".to_string(),
            client_secret: "secret".to_string(),
        })
        .with_tenant("T1");

        manager.get_token(&secret, &cancel).await.unwrap();
        manager
            .get_token(&managed_identity(Some("app-a")), &cancel)
            .await
            .unwrap();
        manager.get_token(&secret, &cancel).await.unwrap();

        assert_eq!(factory.count("client_secret"), 2);
        assert_eq!(factory.count("managed_identity"), 1);
    }

    #[tokio::test]
    async fn test_interactive_is_always_fresh() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager(&factory);
        let cancel = CancellationToken::new();

        manager.get_token(&interactive("T1", 120), &cancel).await.unwrap();
        manager.get_token(&interactive("T1", 120), &cancel).await.unwrap();

        assert_eq!(factory.count("interactive"), 2);
    }

    #[tokio::test]
    async fn test_non_interactive_piggybacks_on_interactive_login() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager(&factory);
        let cancel = CancellationToken::new();

        manager.get_token(&interactive("T1", 120), &cancel).await.unwrap();
        let browser = factory.last_built().unwrap();
        assert_eq!(browser.calls(), 1);

        manager
            .get_token(&non_interactive(Some("T1")), &cancel)
            .await
            .unwrap();

        assert_eq!(browser.calls(), 2);
    }

    #[tokio::test]
    async fn test_interactive_for_other_tenant_is_not_prepended() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager(&factory);
        let cancel = CancellationToken::new();

        manager.get_token(&interactive("T1", 120), &cancel).await.unwrap();
        let browser = factory.last_built().unwrap();

        manager
            .get_token(&non_interactive(Some("T2")), &cancel)
            .await
            .unwrap();

        assert_eq!(browser.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interactive_timeout() {
        let factory = Arc::new(CountingFactory::with_behavior(Behavior::Hang));
        let manager = manager(&factory);

        let err = manager
            .get_token(&interactive("T1", 1), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::LoginTimedOut { seconds: 1 }));
        assert!(err.to_string().starts_with("Login timed out after 1 seconds"));
    }

    #[tokio::test]
    async fn test_cancellation_is_not_a_failure() {
        let factory = Arc::new(CountingFactory::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager(&factory)
            .get_token(&non_interactive(None), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!err.is_failure());
    }

    #[tokio::test]
    async fn test_chain_failure_extracts_provider_detail() {
        let factory = Arc::new(CountingFactory::with_behavior(Behavior::Fail(
            CredentialErrorKind::Unavailable,
            "not configured".to_string(),
        )));
        factory.set_source_behavior(
            CredentialSource::AzureCli,
            Behavior::Fail(
                CredentialErrorKind::AuthenticationFailed,
                "ERROR: AADSTS700016: Application with identifier 'abc' was not found in the directory 'contoso'. Trace ID: 1234".to_string(),
            ),
        );

        let err = manager(&factory)
            .get_token(&non_interactive(None), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Could not get a token! Application with identifier 'abc' was not found in the directory 'contoso'."
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_chain_failure_without_detail_uses_fallback() {
        let factory = Arc::new(CountingFactory::with_behavior(Behavior::Fail(
            CredentialErrorKind::Unavailable,
            "not configured".to_string(),
        )));

        let err = manager(&factory)
            .get_token(&non_interactive(None), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(
            err.to_string(),
            "Could not get a token! See inner error for more details."
        );
    }

    #[tokio::test]
    async fn test_result_metadata_and_session_update() {
        let factory = Arc::new(CountingFactory::with_behavior(Behavior::Token(jwt(
            r#"{"tid":"resolved","email":"e@example.org","oid":"oid-1"}"#,
        ))));
        let manager = manager(&factory);

        let result = manager
            .get_token(
                &non_interactive(None).with_resource("https://vault.azure.net/"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.identity(), Some("e@example.org"));
        assert_eq!(result.tenant_id(), Some("resolved"));
        assert_eq!(result.scopes(), &["https://vault.azure.net/.default"]);

        let state = manager.session().lock().await;
        assert_eq!(state.last_tenant_id(), None);
        assert_eq!(state.last_resolved_tenant_id(), Some("resolved"));
        assert_eq!(
            state.last_precedence(),
            Some(&CredentialSource::DEFAULT_PRECEDENCE[..])
        );
    }

    #[tokio::test]
    async fn test_reset_forces_rebuild() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager(&factory);
        let cancel = CancellationToken::new();

        manager
            .get_token(&managed_identity(None), &cancel)
            .await
            .unwrap();
        manager.reset().await;
        manager
            .get_token(&managed_identity(None), &cancel)
            .await
            .unwrap();

        assert_eq!(factory.count("managed_identity"), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_build_one_chain() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager(&factory);

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .get_token(&non_interactive(Some("T1")), &CancellationToken::new())
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(factory.sources_built(), CredentialSource::DEFAULT_PRECEDENCE.len());
    }

    #[tokio::test]
    async fn test_device_code_delivers_one_message_then_token() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager(&factory);
        let mut messages = Vec::new();

        let flow = manager
            .get_token_device_code(&device_code(None), &CancellationToken::new())
            .unwrap();
        let mut state = flow.subscribe();
        let result = flow.run(|m| messages.push(m.to_string())).await.unwrap();

        assert_eq!(messages, vec![DEVICE_CODE_MESSAGE.to_string()]);
        assert_eq!(result.identity(), Some("u@example.org"));
        assert_eq!(*state.borrow_and_update(), FlowState::Succeeded);
    }

    #[tokio::test]
    async fn test_reused_device_code_credential_reaches_new_flow() {
        let factory = Arc::new(CountingFactory::new());
        let manager = manager(&factory);

        for _ in 0..2 {
            let mut messages = Vec::new();
            manager
                .get_token_device_code(&device_code(Some("app")), &CancellationToken::new())
                .unwrap()
                .run(|m| messages.push(m.to_string()))
                .await
                .unwrap();
            assert_eq!(messages.len(), 1);
        }

        assert_eq!(factory.count("device_code"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_code_timeout() {
        let factory = Arc::new(CountingFactory::with_behavior(Behavior::Hang));
        let manager = manager(&factory);
        let request = TokenRequest::new(AuthMethod::DeviceCode {
            client_id: None,
            token_cache: None,
            timeout_seconds: 2,
            use_unprotected_cache: false,
        });

        let flow = manager
            .get_token_device_code(&request, &CancellationToken::new())
            .unwrap();
        let state = flow.subscribe();
        let mut seen = 0;
        let err = flow.run(|_| seen += 1).await.unwrap_err();

        assert_eq!(seen, 1);
        assert!(matches!(err, AuthError::LoginTimedOut { seconds: 2 }));
        assert_eq!(*state.borrow(), FlowState::TimedOut);
    }

    #[tokio::test]
    async fn test_cache_method_requires_cache_manager() {
        let factory = Arc::new(CountingFactory::new());
        let request = TokenRequest::new(AuthMethod::Cache {
            client_id: None,
            token_cache: "team".to_string(),
            username: "user@example.org".to_string(),
            use_unprotected_cache: false,
        });

        let err = manager(&factory)
            .get_token(&request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_provider_detail_extraction() {
        assert_eq!(
            extract_provider_detail("AADSTS50076: Due to a configuration change you must use MFA._x001B_[0m"),
            Some("Due to a configuration change you must use MFA.")
        );
        assert_eq!(
            extract_provider_detail("AADSTS90002: Tenant 'x' not found."),
            Some("Tenant 'x' not found.")
        );
        assert_eq!(extract_provider_detail("connection refused"), None);
    }
}
