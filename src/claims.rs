//! JWT claims extractor — a single capability with three backends:
//! upstream-proxy header, direct JWKS validation, and a dev-only unsigned
//! variant. Modeled as a capability trait with three implementing structs,
//! the same shape used elsewhere in this codebase for pluggable backends
//! (e.g. a coordination client implemented by more than one transport).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

pub type Claims = Map<String, Value>;

const CRITICAL_CLAIMS: [&str; 5] = ["sub", "iss", "exp", "org", "tier"];

#[derive(Debug, Error)]
pub enum ClaimsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unverified: {0}")]
    Unverified(String),
    #[error("verification failed: {0}")]
    Verification(String),
    #[error("insecure JWT extraction is disabled (set ALLOW_INSECURE_JWT=true)")]
    InsecureDisabled,
}

#[async_trait::async_trait]
pub trait ClaimsExtractor: Send + Sync {
    async fn extract(&self, request: &ClaimsRequest) -> Result<Claims, ClaimsError>;
    fn mode(&self) -> &'static str;
}

/// The inputs an extractor needs, abstracted away from any particular web
/// framework's request type.
#[derive(Debug, Default)]
pub struct ClaimsRequest {
    pub upstream_header: Option<String>,
    pub authorization_bearer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamUserInfo {
    claims: String,
}

/// Reads `X-Endpoint-API-UserInfo`, base64-decodes (standard alphabet),
/// parses JSON, and extracts the inner `claims` JSON string. As
/// defense-in-depth, if an `Authorization: Bearer` header is also present,
/// its (unverified) critical claims are compared against the header's;
/// a mismatch is logged but never fails the request.
pub struct UpstreamHeaderExtractor;

#[async_trait::async_trait]
impl ClaimsExtractor for UpstreamHeaderExtractor {
    async fn extract(&self, request: &ClaimsRequest) -> Result<Claims, ClaimsError> {
        let header = request
            .upstream_header
            .as_ref()
            .ok_or_else(|| ClaimsError::InvalidArgument("missing upstream header".to_string()))?;

        let decoded = STANDARD
            .decode(header)
            .map_err(|e| ClaimsError::InvalidArgument(e.to_string()))?;
        let user_info: UpstreamUserInfo = serde_json::from_slice(&decoded)
            .map_err(|e| ClaimsError::InvalidArgument(e.to_string()))?;
        let claims: Claims = serde_json::from_str(&user_info.claims)
            .map_err(|e| ClaimsError::InvalidArgument(e.to_string()))?;

        if let Some(bearer) = &request.authorization_bearer {
            if let Ok(bearer_claims) = unverified_claims(bearer) {
                if critical_claim_set(&claims) != critical_claim_set(&bearer_claims) {
                    tracing::warn!("upstream header claims and bearer token claims disagree on critical claims");
                }
            }
        }

        Ok(claims)
    }

    fn mode(&self) -> &'static str {
        "upstream"
    }
}

fn unverified_claims(token: &str) -> Result<Claims, ClaimsError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(b""), &validation)
        .map_err(|e| ClaimsError::Unverified(e.to_string()))?;
    Ok(data.claims)
}

fn critical_claim_set(claims: &Claims) -> HashSet<(String, String)> {
    CRITICAL_CLAIMS
        .iter()
        .filter_map(|name| {
            claims
                .get(*name)
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

/// Requires URL scheme `http`/`https`. On each invocation, fetches the JWKS
/// document fresh (no caching — this variant is intended for tests), tries
/// each key until one verifies the token's signature, then validates
/// standard time claims against the current time.
pub struct DirectJwksExtractor {
    jwks_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

impl DirectJwksExtractor {
    pub fn new(jwks_url: String) -> Result<Self, ClaimsError> {
        if !(jwks_url.starts_with("http://") || jwks_url.starts_with("https://")) {
            return Err(ClaimsError::InvalidArgument(format!(
                "unsupported JWKS url scheme: {}",
                jwks_url
            )));
        }
        Ok(DirectJwksExtractor {
            jwks_url,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait::async_trait]
impl ClaimsExtractor for DirectJwksExtractor {
    async fn extract(&self, request: &ClaimsRequest) -> Result<Claims, ClaimsError> {
        let token = request
            .authorization_bearer
            .as_ref()
            .ok_or_else(|| ClaimsError::InvalidArgument("missing bearer token".to_string()))?;

        let header =
            decode_header(token).map_err(|e| ClaimsError::Unverified(e.to_string()))?;

        let jwks: JwkSet = self
            .client
            .get(&self.jwks_url)
            .send()
            .await
            .map_err(|e| ClaimsError::Verification(e.to_string()))?
            .json()
            .await
            .map_err(|e| ClaimsError::Verification(e.to_string()))?;

        for key in &jwks.keys {
            if header.kid.is_some() && key.kid != header.kid {
                continue;
            }
            let decoding_key = match DecodingKey::from_rsa_components(&key.n, &key.e) {
                Ok(k) => k,
                Err(_) => continue,
            };
            let mut validation = Validation::new(Algorithm::RS256);
            validation.validate_exp = true;
            if let Ok(data) = decode::<Claims>(token, &decoding_key, &validation) {
                tracing::info!(kid = ?key.kid, "JWKS key verified token");
                return Ok(data.claims);
            }
        }

        Err(ClaimsError::Verification(
            "no JWKS key verified the token".to_string(),
        ))
    }

    fn mode(&self) -> &'static str {
        "direct"
    }
}

/// Refuses to construct unless `ALLOW_INSECURE_JWT=true`. Parses the JWT
/// without verifying its signature and returns the claims as-is.
pub struct InsecureDevExtractor;

impl InsecureDevExtractor {
    pub fn new() -> Result<Self, ClaimsError> {
        let allowed = std::env::var("ALLOW_INSECURE_JWT")
            .map(|v| v == "true")
            .unwrap_or(false);
        if !allowed {
            return Err(ClaimsError::InsecureDisabled);
        }
        Ok(InsecureDevExtractor)
    }
}

#[async_trait::async_trait]
impl ClaimsExtractor for InsecureDevExtractor {
    async fn extract(&self, request: &ClaimsRequest) -> Result<Claims, ClaimsError> {
        let token = request
            .authorization_bearer
            .as_ref()
            .ok_or_else(|| ClaimsError::InvalidArgument("missing bearer token".to_string()))?;
        unverified_claims(token)
    }

    fn mode(&self) -> &'static str {
        "insecure"
    }
}

#[derive(Debug, Serialize)]
pub struct ModeResponse {
    pub mode: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insecure_extractor_refuses_without_env_var() {
        std::env::remove_var("ALLOW_INSECURE_JWT");
        assert!(matches!(
            InsecureDevExtractor::new(),
            Err(ClaimsError::InsecureDisabled)
        ));
    }

    #[test]
    fn direct_extractor_rejects_bad_scheme() {
        let err = DirectJwksExtractor::new("ftp://example.com/jwks.json".to_string());
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn upstream_extractor_requires_header() {
        let extractor = UpstreamHeaderExtractor;
        let request = ClaimsRequest::default();
        let result = extractor.extract(&request).await;
        assert!(result.is_err());
    }

    #[test]
    fn critical_claim_set_detects_mismatch() {
        let mut a = Claims::new();
        a.insert("sub".to_string(), Value::String("a".to_string()));
        let mut b = Claims::new();
        b.insert("sub".to_string(), Value::String("b".to_string()));
        assert_ne!(critical_claim_set(&a), critical_claim_set(&b));
    }
}
