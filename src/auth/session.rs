// Session state
// Remembers the last credential and what it was bound to, so later calls can reuse it

use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use super::device_code::DeviceCodeRelay;
use super::provider::TokenCredential;
use super::types::{CredentialKind, CredentialSource};

/// The credential currently held by a session and the parameters it was built for
#[derive(Clone)]
pub struct ActiveCredential {
    pub kind: CredentialKind,
    pub handle: Arc<dyn TokenCredential>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    /// Only set for chained credentials
    pub precedence: Option<Vec<CredentialSource>>,
    pub(crate) device_code_relay: Option<DeviceCodeRelay>,
}

impl ActiveCredential {
    pub fn new(kind: CredentialKind, handle: Arc<dyn TokenCredential>) -> Self {
        Self {
            kind,
            handle,
            tenant_id: None,
            client_id: None,
            precedence: None,
            device_code_relay: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: Option<&str>) -> Self {
        self.tenant_id = tenant_id.map(str::to_string);
        self
    }

    pub fn with_client_id(mut self, client_id: Option<&str>) -> Self {
        self.client_id = client_id.map(str::to_string);
        self
    }

    pub fn with_precedence(mut self, precedence: Vec<CredentialSource>) -> Self {
        self.precedence = Some(precedence);
        self
    }

    pub(crate) fn with_device_code_relay(mut self, relay: DeviceCodeRelay) -> Self {
        self.device_code_relay = Some(relay);
        self
    }
}

impl fmt::Debug for ActiveCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveCredential")
            .field("kind", &self.kind)
            .field("handle", &self.handle.name())
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("precedence", &self.precedence)
            .finish()
    }
}

/// Mutable state behind a [`Session`]
#[derive(Debug, Default)]
pub struct SessionState {
    active: Option<ActiveCredential>,
    last_tenant_id: Option<String>,
    last_resolved_tenant_id: Option<String>,
    last_client_id: Option<String>,
    last_precedence: Option<Vec<CredentialSource>>,
}

impl SessionState {
    pub fn active(&self) -> Option<&ActiveCredential> {
        self.active.as_ref()
    }

    pub fn active_kind(&self) -> Option<CredentialKind> {
        self.active.as_ref().map(|a| a.kind)
    }

    /// The current chain, if it was built for this tenant and exactly this precedence
    pub fn reusable_chain(
        &self,
        tenant_id: Option<&str>,
        precedence: &[CredentialSource],
    ) -> Option<Arc<dyn TokenCredential>> {
        self.active
            .as_ref()
            .filter(|active| {
                active.kind == CredentialKind::Chained
                    && active.tenant_id.as_deref() == tenant_id
                    && active.precedence.as_deref() == Some(precedence)
            })
            .map(|active| active.handle.clone())
    }

    /// The current credential, if it is of this variant and bound to this client id
    pub fn reusable(
        &self,
        kind: CredentialKind,
        client_id: Option<&str>,
    ) -> Option<&ActiveCredential> {
        self.active
            .as_ref()
            .filter(|active| active.kind == kind && active.client_id.as_deref() == client_id)
    }

    /// An interactive login from this session for the same tenant
    pub fn interactive_for_tenant(
        &self,
        tenant_id: Option<&str>,
    ) -> Option<Arc<dyn TokenCredential>> {
        self.active
            .as_ref()
            .filter(|active| {
                active.kind == CredentialKind::Interactive
                    && active.tenant_id.as_deref() == tenant_id
            })
            .map(|active| active.handle.clone())
    }

    pub fn install(&mut self, active: ActiveCredential) {
        tracing::debug!(kind = ?active.kind, credential = active.handle.name(), "Installing new session credential");
        self.active = Some(active);
    }

    /// Record what produced the last successful token
    pub fn record_success(&mut self, resolved_tenant_id: Option<&str>) {
        let Some(active) = &self.active else {
            return;
        };
        self.last_tenant_id = active.tenant_id.clone();
        self.last_client_id = active.client_id.clone();
        self.last_precedence = match active.kind {
            CredentialKind::Chained => active.precedence.clone(),
            _ => None,
        };
        self.last_resolved_tenant_id = resolved_tenant_id.map(str::to_string);
    }

    pub fn last_tenant_id(&self) -> Option<&str> {
        self.last_tenant_id.as_deref()
    }

    /// Tenant reported by the last token, which may differ from the requested one
    pub fn last_resolved_tenant_id(&self) -> Option<&str> {
        self.last_resolved_tenant_id.as_deref()
    }

    pub fn last_client_id(&self) -> Option<&str> {
        self.last_client_id.as_deref()
    }

    pub fn last_precedence(&self) -> Option<&[CredentialSource]> {
        self.last_precedence.as_deref()
    }

    pub fn has_client_id(&self) -> bool {
        self.last_client_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn clear(&mut self) {
        *self = SessionState::default();
    }
}

/// One logical user session
///
/// The lock is held for the whole decide, acquire, record sequence, so
/// callers sharing a session never race on credential rebuilds.
#[derive(Debug, Default)]
pub struct Session {
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Forget every earlier authentication
    pub async fn reset(&self) {
        tracing::debug!("Clearing session credential");
        self.state.lock().await.clear();
    }

    pub async fn has_client_id(&self) -> bool {
        self.state.lock().await.has_client_id()
    }
}
