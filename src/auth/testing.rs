// Test doubles for credential providers

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::provider::{
    CredentialError, CredentialErrorKind, CredentialFactory, DeviceCodeCallback, SourceOptions,
    TokenCredential,
};
use super::types::{AccessToken, CertificateSource, CredentialSource, TokenRequestContext};

pub const DEVICE_CODE_MESSAGE: &str = "To sign in, use a web browser to open the page https://microsoft.com/devicelogin and enter the code ABC123 to authenticate.";

/// Unsigned JWT-shaped token carrying the given payload
pub fn jwt(payload: &str) -> String {
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(payload)
    )
}

#[derive(Clone, Debug)]
pub enum Behavior {
    Token(String),
    Fail(CredentialErrorKind, String),
    /// Never completes and ignores cancellation
    Hang,
}

pub struct ScriptedCredential {
    name: String,
    behavior: Behavior,
    calls: AtomicUsize,
    device_code: Option<DeviceCodeCallback>,
    contexts: Mutex<Vec<TokenRequestContext>>,
}

impl ScriptedCredential {
    pub fn new(name: &str, behavior: Behavior) -> Self {
        Self {
            name: name.to_string(),
            behavior,
            calls: AtomicUsize::new(0),
            device_code: None,
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn token(name: &str, token: &str) -> Self {
        Self::new(name, Behavior::Token(token.to_string()))
    }

    pub fn unavailable(name: &str, message: &str) -> Self {
        Self::new(
            name,
            Behavior::Fail(CredentialErrorKind::Unavailable, message.to_string()),
        )
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self::new(
            name,
            Behavior::Fail(CredentialErrorKind::AuthenticationFailed, message.to_string()),
        )
    }

    pub fn cancelled(name: &str) -> Self {
        Self::new(
            name,
            Behavior::Fail(CredentialErrorKind::Cancelled, "cancelled".to_string()),
        )
    }

    pub fn with_device_code(mut self, callback: DeviceCodeCallback) -> Self {
        self.device_code = Some(callback);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_context(&self) -> Option<TokenRequestContext> {
        self.contexts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl TokenCredential for ScriptedCredential {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_token(
        &self,
        context: &TokenRequestContext,
        _cancel: &CancellationToken,
    ) -> Result<AccessToken, CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.clone());

        if let Some(callback) = &self.device_code {
            callback(DEVICE_CODE_MESSAGE.to_string());
        }

        match &self.behavior {
            Behavior::Token(token) => Ok(AccessToken {
                token: token.clone(),
                expires_on: Utc::now() + Duration::hours(1),
            }),
            Behavior::Fail(kind, message) => Err(CredentialError::new(*kind, message.clone())),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// Factory that records every credential it builds
pub struct CountingFactory {
    default: Mutex<Behavior>,
    per_source: Mutex<HashMap<CredentialSource, Behavior>>,
    counts: Mutex<HashMap<&'static str, usize>>,
    options: Mutex<HashMap<CredentialSource, SourceOptions>>,
    built: Mutex<Vec<Arc<ScriptedCredential>>>,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self::with_behavior(Behavior::Token(jwt(
            r#"{"tid":"T1","upn":"u@example.org","scp":".default"}"#,
        )))
    }

    pub fn with_behavior(behavior: Behavior) -> Self {
        Self {
            default: Mutex::new(behavior),
            per_source: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
            options: Mutex::new(HashMap::new()),
            built: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.default.lock().unwrap() = behavior;
    }

    pub fn set_source_behavior(&self, source: CredentialSource, behavior: Behavior) {
        self.per_source.lock().unwrap().insert(source, behavior);
    }

    pub fn count(&self, kind: &str) -> usize {
        self.counts.lock().unwrap().get(kind).copied().unwrap_or(0)
    }

    pub fn sources_built(&self) -> usize {
        self.count("source")
    }

    pub fn options_seen(&self, source: CredentialSource) -> Option<SourceOptions> {
        self.options.lock().unwrap().get(&source).copied()
    }

    pub fn last_built(&self) -> Option<Arc<ScriptedCredential>> {
        self.built.lock().unwrap().last().cloned()
    }

    fn record(&self, kind: &'static str, credential: ScriptedCredential) -> Arc<dyn TokenCredential> {
        *self.counts.lock().unwrap().entry(kind).or_insert(0) += 1;
        let credential = Arc::new(credential);
        self.built.lock().unwrap().push(credential.clone());
        credential
    }

    fn behavior(&self) -> Behavior {
        self.default.lock().unwrap().clone()
    }
}

impl CredentialFactory for CountingFactory {
    fn source(
        &self,
        source: CredentialSource,
        options: SourceOptions,
    ) -> Arc<dyn TokenCredential> {
        self.options.lock().unwrap().insert(source, options);
        let behavior = self
            .per_source
            .lock()
            .unwrap()
            .get(&source)
            .cloned()
            .unwrap_or_else(|| self.behavior());
        self.record("source", ScriptedCredential::new(source.name(), behavior))
    }

    fn interactive_browser(
        &self,
        _client_id: Option<&str>,
        _tenant_id: Option<&str>,
    ) -> Arc<dyn TokenCredential> {
        self.record(
            "interactive",
            ScriptedCredential::new("InteractiveBrowserCredential", self.behavior()),
        )
    }

    fn device_code(
        &self,
        _client_id: Option<&str>,
        _tenant_id: Option<&str>,
        callback: DeviceCodeCallback,
    ) -> Arc<dyn TokenCredential> {
        self.record(
            "device_code",
            ScriptedCredential::new("DeviceCodeCredential", self.behavior())
                .with_device_code(callback),
        )
    }

    fn managed_identity(
        &self,
        _client_id: Option<&str>,
        options: SourceOptions,
    ) -> Arc<dyn TokenCredential> {
        self.options
            .lock()
            .unwrap()
            .insert(CredentialSource::ManagedIdentity, options);
        self.record(
            "managed_identity",
            ScriptedCredential::new("ManagedIdentityCredential", self.behavior()),
        )
    }

    fn client_secret(
        &self,
        _tenant_id: &str,
        _client_id: &str,
        _client_secret: &str,
    ) -> Arc<dyn TokenCredential> {
        self.record(
            "client_secret",
            ScriptedCredential::new("ClientSecretCredential", self.behavior()),
        )
    }

    fn client_certificate(
        &self,
        _tenant_id: &str,
        _client_id: &str,
        _certificate: &CertificateSource,
    ) -> Arc<dyn TokenCredential> {
        self.record(
            "client_certificate",
            ScriptedCredential::new("ClientCertificateCredential", self.behavior()),
        )
    }

    fn client_assertion(
        &self,
        _tenant_id: &str,
        _client_id: &str,
        _assertion: &str,
    ) -> Arc<dyn TokenCredential> {
        self.record(
            "client_assertion",
            ScriptedCredential::new("ClientAssertionCredential", self.behavior()),
        )
    }
}
