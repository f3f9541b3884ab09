// Token claims extraction
// Reads the payload of a JWT-shaped bearer token without verifying it

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while decoding a token payload
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClaimsError {
    #[error("token is not in JWT format")]
    NotAJwt,

    #[error("token payload is not valid base64url: {0}")]
    Encoding(String),

    #[error("token payload is not a JSON object: {0}")]
    Json(String),
}

/// Claim name to every value seen for it, in encounter order
///
/// Claim names are not unique: a name can repeat, and array-valued claims
/// such as `roles` contribute one value per element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ClaimsMap(BTreeMap<String, Vec<String>>);

impl ClaimsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value; existing values for the name are kept
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// `upn` for work accounts, `email` for personal accounts, `oid` for everything else
    pub fn identity(&self) -> Option<&str> {
        self.first("upn")
            .or_else(|| self.first("email"))
            .or_else(|| self.first("oid"))
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.first("tid")
    }

    /// Effective scopes from the space-delimited `scp` claim
    pub fn scopes(&self) -> Option<Vec<String>> {
        self.first("scp")
            .map(|scp| scp.split_whitespace().map(str::to_string).collect())
    }
}

impl fmt::Display for ClaimsMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .0
            .iter()
            .map(|(name, values)| format!("[{}: {}]", name, values.join(", ")))
            .collect::<Vec<_>>()
            .join(", ");
        f.write_str(&rendered)
    }
}

impl<'de> Deserialize<'de> for ClaimsMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(ClaimsVisitor)
    }
}

// Walks the payload entry by entry so repeated keys accumulate instead of overwriting
struct ClaimsVisitor;

impl<'de> Visitor<'de> for ClaimsVisitor {
    type Value = ClaimsMap;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON object of claims")
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut claims = ClaimsMap::new();
        while let Some((name, value)) = access.next_entry::<String, Value>()? {
            push_claim_values(&mut claims, &name, value);
        }
        Ok(claims)
    }
}

fn push_claim_values(claims: &mut ClaimsMap, name: &str, value: Value) {
    match value {
        Value::Null => {}
        Value::String(s) => claims.add(name, s),
        Value::Array(items) => {
            for item in items {
                push_claim_values(claims, name, item);
            }
        }
        // Nested objects stay as their JSON text
        other => claims.add(name, other.to_string()),
    }
}

/// Decode every claim from the payload segment of a token
pub fn decode_claims(token: &str) -> Result<ClaimsMap, ClaimsError> {
    let mut segments = token.trim().split('.');
    let payload = match (segments.next(), segments.next()) {
        (Some(_header), Some(payload)) if !payload.is_empty() => payload,
        _ => return Err(ClaimsError::NotAJwt),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| ClaimsError::Encoding(e.to_string()))?;

    serde_json::from_slice::<ClaimsMap>(&bytes).map_err(|e| ClaimsError::Json(e.to_string()))
}

/// Identity metadata recovered from a token
#[derive(Debug, Clone, Default)]
pub struct TokenClaims {
    pub identity: Option<String>,
    pub tenant_id: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub claims: ClaimsMap,
}

impl TokenClaims {
    /// Extract claims for display; a token that cannot be read yields empty metadata
    pub fn extract(token: &str) -> Self {
        match decode_claims(token) {
            Ok(claims) => Self {
                identity: claims.identity().map(str::to_string),
                tenant_id: claims.tenant_id().map(str::to_string),
                scopes: claims.scopes(),
                claims,
            },
            Err(e) => {
                tracing::debug!("Token claims could not be read: {}", e);
                Self::default()
            }
        }
    }
}
