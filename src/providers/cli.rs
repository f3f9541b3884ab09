// Azure CLI credential
// Asks the locally signed-in `az` for a token

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::auth::{AccessToken, CredentialError, TokenCredential, TokenRequestContext};

const DEFAULT_PROCESS_TIMEOUT_SECS: u64 = 13;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    /// Local time, e.g. `2024-01-01 12:00:00.000000`
    expires_on: Option<String>,
    /// Epoch seconds, emitted by newer CLI versions
    #[serde(rename = "expires_on")]
    expires_on_epoch: Option<i64>,
}

pub struct AzureCliCredential {
    program: String,
    timeout: Duration,
}

impl AzureCliCredential {
    pub fn new(timeout: Option<Duration>) -> Self {
        let program = if cfg!(windows) { "az.cmd" } else { "az" };
        Self {
            program: program.to_string(),
            timeout: timeout.unwrap_or(Duration::from_secs(DEFAULT_PROCESS_TIMEOUT_SECS)),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, context: &TokenRequestContext) -> Command {
        let mut command = Command::new(&self.program);
        command.args(["account", "get-access-token", "--output", "json"]);
        for scope in &context.scopes {
            command.args(["--scope", scope.as_str()]);
        }
        if let Some(tenant_id) = &context.tenant_id {
            command.args(["--tenant", tenant_id.as_str()]);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl TokenCredential for AzureCliCredential {
    fn name(&self) -> &str {
        "AzureCliCredential"
    }

    async fn get_token(
        &self,
        context: &TokenRequestContext,
        cancel: &CancellationToken,
    ) -> Result<AccessToken, CredentialError> {
        let mut command = self.command(context);
        tracing::debug!(program = %self.program, "Requesting token from Azure CLI");

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CredentialError::cancelled()),
            result = tokio::time::timeout(self.timeout, command.output()) => result,
        };

        let output = match output {
            Err(_) => {
                return Err(CredentialError::unavailable(format!(
                    "Azure CLI did not respond within {} seconds",
                    self.timeout.as_secs()
                )))
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialError::unavailable(
                    "Azure CLI not installed or not on the PATH",
                ))
            }
            Ok(Err(e)) => {
                return Err(CredentialError::unavailable(format!(
                    "Azure CLI could not be started: {}",
                    e
                )))
            }
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("az login") || stderr.contains("az account set") {
                return Err(CredentialError::unavailable(
                    "Please run 'az login' to set up an account",
                ));
            }
            return Err(CredentialError::authentication_failed(stderr));
        }

        parse_cli_output(&output.stdout)
    }
}

fn parse_cli_output(stdout: &[u8]) -> Result<AccessToken, CredentialError> {
    let token: CliToken = serde_json::from_slice(stdout).map_err(|e| {
        CredentialError::other(format!("Azure CLI returned unexpected output: {}", e))
    })?;

    let expires_on = token
        .expires_on_epoch
        .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
        .or_else(|| token.expires_on.as_deref().and_then(parse_local_time))
        .ok_or_else(|| CredentialError::other("Azure CLI output has no usable expiry"))?;

    Ok(AccessToken {
        token: token.access_token,
        expires_on,
    })
}

fn parse_local_time(value: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}
