// Authentication module
// Credential selection, session reuse and token acquisition

mod chain;
mod claims;
mod device_code;
mod manager;
mod provider;
mod session;
mod timeout;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use chain::{ChainBuilder, ChainedCredential};
pub use claims::{decode_claims, ClaimsError, ClaimsMap, TokenClaims};
pub use device_code::{
    device_code_channel, DeviceCodeFlow, DeviceCodeReceiver, DeviceCodeSendError,
    DeviceCodeSender, FlowState,
};
pub use manager::TokenManager;
pub use provider::{
    CredentialError, CredentialErrorKind, CredentialFactory, DeviceCodeCallback, SourceOptions,
    TokenCredential,
};
pub use session::{ActiveCredential, Session, SessionState};
pub use timeout::with_login_timeout;
pub use types::{
    dedup_precedence, full_scopes, parse_precedence, AccessToken, AuthMethod, CertificateSource,
    CredentialKind, CredentialSource, TokenRequest, TokenRequestContext, TokenResult,
    DEFAULT_LOGIN_TIMEOUT_SECONDS, DEFAULT_MANAGED_IDENTITY_TIMEOUT_SECONDS, DEFAULT_RESOURCE,
    DEFAULT_SCOPE,
};
