// HTTP credential providers
// Managed identity through the instance metadata service, service principals through the token endpoint

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::auth::{
    AccessToken, CredentialError, SourceOptions, TokenCredential, TokenRequestContext,
};

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_API_VERSION: &str = "2018-02-01";
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 800;

enum SendError {
    Cancelled,
    Http(reqwest::Error),
}

/// HTTP client plus the retry budget from [`SourceOptions`]
#[derive(Debug, Clone)]
pub struct HttpPolicy {
    client: Client,
    max_retries: u32,
    base_delay_ms: u64,
}

impl HttpPolicy {
    pub fn new(options: SourceOptions) -> anyhow::Result<Self> {
        let timeout = options
            .network_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_NETWORK_TIMEOUT_SECS));
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            max_retries: options.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            base_delay_ms: BASE_DELAY_MS,
        })
    }

    /// Send with retries on throttling, server errors and network failures
    ///
    /// Any other response is returned to the caller, successful or not.
    async fn send(
        &self,
        build: impl Fn(&Client) -> RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<Response, SendError> {
        let mut attempt = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SendError::Cancelled),
                result = build(&self.client).send() => result,
            };

            let retry_reason = match &result {
                Ok(response)
                    if response.status() == StatusCode::TOO_MANY_REQUESTS
                        || response.status().is_server_error() =>
                {
                    Some(response.status().to_string())
                }
                Ok(_) => None,
                Err(e) if !e.is_builder() => Some(e.to_string()),
                Err(_) => None,
            };

            match retry_reason {
                Some(reason) if attempt < self.max_retries => {
                    let delay = self.calculate_backoff_delay(attempt);
                    tracing::warn!(
                        "Request failed: {}, retrying after {}ms (attempt {}/{})",
                        reason,
                        delay,
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(SendError::Cancelled),
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    }
                    attempt += 1;
                }
                _ => return result.map_err(SendError::Http),
            }
        }
    }

    /// Exponential backoff with up to 10% jitter
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms * 2_u64.pow(attempt);
        let jitter = (delay as f64 * 0.1 * jitter::random()) as u64;
        delay + jitter
    }
}

// Cheap jitter source without pulling in a random number crate
mod jitter {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};

    pub fn random() -> f64 {
        let mut hasher = RandomState::new().build_hasher();
        std::time::SystemTime::now().hash(&mut hasher);
        (hasher.finish() % 1000) as f64 / 1000.0
    }
}

/// Managed identity token from the instance metadata service
pub struct ManagedIdentityCredential {
    client_id: Option<String>,
    endpoint: String,
    policy: HttpPolicy,
}

impl ManagedIdentityCredential {
    pub fn new(client_id: Option<&str>, policy: HttpPolicy) -> Self {
        Self {
            client_id: client_id.map(str::to_string),
            endpoint: IMDS_ENDPOINT.to_string(),
            policy,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    fn name(&self) -> &str {
        "ManagedIdentityCredential"
    }

    async fn get_token(
        &self,
        context: &TokenRequestContext,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, CredentialError> {
        let [scope] = context.scopes.as_slice() else {
            return Err(CredentialError::other(
                "ManagedIdentityCredential requires exactly one scope",
            ));
        };
        let resource = scope_to_resource(scope);

        let mut query = vec![
            ("api-version", IMDS_API_VERSION.to_string()),
            ("resource", resource.to_string()),
        ];
        if let Some(client_id) = &self.client_id {
            query.push(("client_id", client_id.clone()));
        }

        tracing::debug!(endpoint = %self.endpoint, "Requesting managed identity token");
        let response = self
            .policy
            .send(
                |client| {
                    client
                        .get(&self.endpoint)
                        .header("Metadata", "true")
                        .query(&query)
                },
                cancel,
            )
            .await
            .map_err(|e| match e {
                SendError::Cancelled => CredentialError::cancelled(),
                SendError::Http(e) => CredentialError::unavailable(format!(
                    "ManagedIdentityCredential authentication unavailable. No managed identity endpoint found: {}",
                    e
                )),
            })?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::unavailable(format!(
                "ManagedIdentityCredential authentication unavailable. The requested identity has not been assigned to this resource. {}",
                error_description(&body)
            )));
        }
        parse_token_response(response, "ManagedIdentityCredential").await
    }
}

/// Secret material presented to the token endpoint
#[derive(Clone)]
pub enum ClientGrant {
    Secret(String),
    /// Signed JWT issued by an external identity provider
    Assertion(String),
}

/// Service principal login through the token endpoint
pub struct ClientCredential {
    name: &'static str,
    tenant_id: String,
    client_id: String,
    grant: ClientGrant,
    authority_host: String,
    policy: HttpPolicy,
}

impl ClientCredential {
    pub fn new(
        tenant_id: &str,
        client_id: &str,
        grant: ClientGrant,
        authority_host: &str,
        policy: HttpPolicy,
    ) -> Self {
        let name = match grant {
            ClientGrant::Secret(_) => "ClientSecretCredential",
            ClientGrant::Assertion(_) => "ClientAssertionCredential",
        };
        Self {
            name,
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            grant,
            authority_host: authority_host.trim_end_matches('/').to_string(),
            policy,
        }
    }

    fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority_host, tenant_id)
    }
}

#[async_trait]
impl TokenCredential for ClientCredential {
    fn name(&self) -> &str {
        self.name
    }

    async fn get_token(
        &self,
        context: &TokenRequestContext,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, CredentialError> {
        let tenant_id = context.tenant_id.as_deref().unwrap_or(&self.tenant_id);
        let url = self.token_url(tenant_id);

        let mut form = vec![
            ("client_id", self.client_id.clone()),
            ("scope", context.scopes.join(" ")),
            ("grant_type", "client_credentials".to_string()),
        ];
        match &self.grant {
            ClientGrant::Secret(secret) => form.push(("client_secret", secret.clone())),
            ClientGrant::Assertion(assertion) => {
                form.push(("client_assertion_type", CLIENT_ASSERTION_TYPE.to_string()));
                form.push(("client_assertion", assertion.clone()));
            }
        }
        if let Some(claims) = &context.claims {
            form.push(("claims", claims.clone()));
        }

        tracing::debug!(credential = self.name, url = %url, "Requesting token from token endpoint");
        let response = self
            .policy
            .send(|client| client.post(&url).form(&form), cancel)
            .await
            .map_err(|e| match e {
                SendError::Cancelled => CredentialError::cancelled(),
                SendError::Http(e) => CredentialError::authentication_failed(format!(
                    "{} failed to reach the token endpoint: {}",
                    self.name, e
                )),
            })?;

        parse_token_response(response, self.name).await
    }
}

/// `https://vault.azure.net/.default` becomes `https://vault.azure.net/`
pub fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix(".default").unwrap_or(scope)
}

async fn parse_token_response(
    response: Response,
    credential: &str,
) -> Result<AccessToken, CredentialError> {
    let status = response.status();
    let body = response.text().await.map_err(|e| {
        CredentialError::other(format!("{} could not read the response: {}", credential, e))
    })?;

    if !status.is_success() {
        return Err(CredentialError::authentication_failed(format!(
            "{} authentication failed ({}): {}",
            credential,
            status.as_u16(),
            error_description(&body)
        )));
    }

    let data: Value = serde_json::from_str(&body).map_err(|e| {
        CredentialError::other(format!("{} returned an invalid response: {}", credential, e))
    })?;
    let token = data
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            CredentialError::other(format!("{} response does not contain access_token", credential))
        })?;

    Ok(AccessToken {
        token: token.to_string(),
        expires_on: expiry_from_response(&data),
    })
}

/// `expires_on` as epoch seconds, else `expires_in` from now, else one hour
fn expiry_from_response(data: &Value) -> DateTime<Utc> {
    let as_i64 = |v: &Value| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()));

    if let Some(epoch) = data.get("expires_on").and_then(as_i64) {
        if let Some(at) = Utc.timestamp_opt(epoch, 0).single() {
            return at;
        }
    }
    let expires_in = data.get("expires_in").and_then(as_i64).unwrap_or(3600);
    Utc::now() + ChronoDuration::seconds(expires_in)
}

/// `error_description` of an OAuth error body, else the raw body
fn error_description(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error_description")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}
