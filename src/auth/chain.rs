// Credential chain
// Ordered composite of credential sources, first success wins

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::provider::{CredentialError, CredentialFactory, SourceOptions, TokenCredential};
use super::types::{AccessToken, CredentialSource, TokenRequestContext};

/// Tries each source in order and returns the first token obtained
pub struct ChainedCredential {
    sources: Vec<Arc<dyn TokenCredential>>,
}

impl ChainedCredential {
    pub fn new(sources: Vec<Arc<dyn TokenCredential>>) -> Self {
        Self { sources }
    }

    /// Put an already-authenticated credential in front of the chain
    pub fn prepend(&mut self, credential: Arc<dyn TokenCredential>) {
        self.sources.insert(0, credential);
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl TokenCredential for ChainedCredential {
    fn name(&self) -> &str {
        "ChainedTokenCredential"
    }

    async fn get_token(
        &self,
        context: &TokenRequestContext,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, CredentialError> {
        let mut failures = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            if cancel.is_cancelled() {
                return Err(CredentialError::cancelled());
            }

            tracing::debug!(source = source.name(), "Trying credential source");
            match source.get_token(context, cancel).await {
                Ok(token) => {
                    tracing::info!(source = source.name(), "Token acquired from credential source");
                    return Ok(token);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::debug!(source = source.name(), error = %e, "Credential source failed");
                    failures.push(format!("{}: {}", source.name(), e.message));
                }
            }
        }

        let mut message = String::from(
            "ChainedTokenCredential failed to retrieve a token from the included credentials.",
        );
        for failure in failures {
            message.push_str("\n- ");
            message.push_str(&failure);
        }
        Err(CredentialError::authentication_failed(message))
    }
}

/// Builds chains from a precedence list with the configured timeouts
pub struct ChainBuilder<'a> {
    factory: &'a dyn CredentialFactory,
    timeout: Option<Duration>,
    managed_identity_timeout: Duration,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(factory: &'a dyn CredentialFactory, managed_identity_timeout: Duration) -> Self {
        Self {
            factory,
            timeout: None,
            managed_identity_timeout,
        }
    }

    /// Timeout with no retries for every non managed identity source
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Options applied to one source
    pub fn options_for(&self, source: CredentialSource) -> SourceOptions {
        if source.is_managed_identity() {
            SourceOptions::fail_fast(self.managed_identity_timeout)
        } else {
            self.timeout
                .map(SourceOptions::fail_fast)
                .unwrap_or_default()
        }
    }

    /// One credential per source, in precedence order
    pub fn build(&self, precedence: &[CredentialSource]) -> ChainedCredential {
        let sources = precedence
            .iter()
            .map(|source| self.factory.source(*source, self.options_for(*source)))
            .collect();
        ChainedCredential::new(sources)
    }
}
