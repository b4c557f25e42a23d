//! # Token Validator
//!
//! Validation order:
//! 1. Decode the header (`kid`) and the unverified payload (`iss`); reject
//!    issuers outside the identity-broker allow-list before any network call.
//! 2. Resolve the RSA key for (issuer, kid) through the [`KeyCache`].
//! 3. Verify the RS256 signature, expiry, audience and subject.
//! 4. Check `jti` and the datasource claims that bind the token to this gateway.

use super::{AuthError, KeyCache};
use crate::config::AuthConfig;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Identity broker endpoints allowed to issue tokens.
pub const TRUSTED_ISSUERS: [&str; 6] = [
    "https://idbrokerbts.webex.com/idb",
    "https://idbrokerbts-eu.webex.com/idb",
    "https://idbroker.webex.com/idb",
    "https://idbroker-eu.webex.com/idb",
    "https://idbroker-b-us.webex.com/idb",
    "https://idbroker-ca.webex.com/idb",
];

pub const DATASOURCE_URL_CLAIM: &str = "com.cisco.datasource.url";
pub const DATASOURCE_SCHEMA_CLAIM: &str = "com.cisco.datasource.schema.uuid";

/// Schema UUID of the voice virtual agent data source.
pub const DEFAULT_SCHEMA_UUID: &str = "5397013b-7920-4ffc-807c-e8a3e0a18f43";

#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    iss: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    iss: String,
    sub: Option<String>,
    jti: Option<String>,
    #[serde(rename = "com.cisco.datasource.url")]
    datasource_url: Option<String>,
    #[serde(rename = "com.cisco.datasource.schema.uuid")]
    datasource_schema_uuid: Option<String>,
}

/// Identity extracted from a token that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub issuer: String,
    pub subject: String,
    pub token_id: String,
}

pub struct TokenValidator {
    keys: Arc<KeyCache>,
    allowed_issuers: Vec<String>,
    datasource_url: String,
    datasource_schema_uuid: String,
    audience: Option<String>,
    expected_subject: Option<String>,
}

impl TokenValidator {
    pub fn new(config: &AuthConfig, keys: Arc<KeyCache>) -> Self {
        Self {
            keys,
            allowed_issuers: TRUSTED_ISSUERS.iter().map(|s| s.to_string()).collect(),
            datasource_url: config.datasource_url.clone(),
            datasource_schema_uuid: config.datasource_schema_uuid.clone(),
            audience: config.audience.clone(),
            expected_subject: config.expected_subject.clone(),
        }
    }

    /// Replace the issuer allow-list (tests point this at a mock broker).
    #[cfg(test)]
    pub(crate) fn with_allowed_issuers(mut self, issuers: Vec<String>) -> Self {
        self.allowed_issuers = issuers;
        self
    }

    /// Verify `token` (without the `Bearer ` prefix).
    pub async fn validate(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        let header = decode_header(token).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::Malformed("token header has no 'kid'".to_string()))?;

        let issuer = unverified_issuer(token)?;
        if !self.allowed_issuers.iter().any(|allowed| *allowed == issuer) {
            return Err(AuthError::UntrustedIssuer(issuer));
        }

        let key = self.keys.get(&issuer, &kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_required_spec_claims(&["exp", "aud", "sub"]);
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            // Presence is still enforced through the required claims
            None => validation.validate_aud = false,
        }
        validation.sub = self.expected_subject.clone();

        let claims = decode::<Claims>(token, &key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                ErrorKind::InvalidAudience => AuthError::InvalidAudience,
                ErrorKind::InvalidSubject => AuthError::InvalidSubject,
                ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
                _ => AuthError::Malformed(e.to_string()),
            })?
            .claims;

        let subject = non_empty(claims.sub).ok_or_else(|| AuthError::MissingClaim("sub".into()))?;
        let token_id = non_empty(claims.jti).ok_or_else(|| AuthError::MissingClaim("jti".into()))?;

        if claims.datasource_url.as_deref() != Some(self.datasource_url.as_str()) {
            return Err(AuthError::DatasourceMismatch {
                claim: DATASOURCE_URL_CLAIM,
                actual: claims.datasource_url,
            });
        }
        if claims.datasource_schema_uuid.as_deref() != Some(self.datasource_schema_uuid.as_str()) {
            return Err(AuthError::DatasourceMismatch {
                claim: DATASOURCE_SCHEMA_CLAIM,
                actual: claims.datasource_schema_uuid,
            });
        }

        debug!(issuer = %claims.iss, subject = %subject, "Token validated");
        Ok(VerifiedToken {
            issuer: claims.iss,
            subject,
            token_id,
        })
    }
}

fn unverified_issuer(token: &str) -> Result<String, AuthError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::Malformed("token has no payload segment".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| AuthError::Malformed(format!("payload is not base64url: {}", e)))?;
    let claims: UnverifiedClaims = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::Malformed(format!("payload is not JSON: {}", e)))?;
    non_empty(claims.iss).ok_or_else(|| AuthError::MissingClaim("iss".to_string()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwks::DEFAULT_KEY_TTL;
    use crate::auth::testkit::{self, sign, TRUSTED_KEY_PEM, UNTRUSTED_KEY_PEM};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn auth_config() -> AuthConfig {
        AuthConfig {
            enabled: true,
            enforce: true,
            datasource_url: testkit::DATASOURCE_URL.to_string(),
            ..AuthConfig::default()
        }
    }

    async fn broker() -> (MockServer, String) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/idb/oauth2/v2/keys/verificationjwk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testkit::jwks_body("k1")))
            .mount(&server)
            .await;
        let issuer = format!("{}/idb", server.uri());
        (server, issuer)
    }

    fn validator(config: &AuthConfig, issuer: &str) -> TokenValidator {
        let keys = Arc::new(KeyCache::new(reqwest::Client::new(), DEFAULT_KEY_TTL));
        TokenValidator::new(config, keys).with_allowed_issuers(vec![issuer.to_string()])
    }

    #[tokio::test]
    async fn test_valid_token() {
        let (_server, issuer) = broker().await;
        let token = sign(&testkit::valid_claims(&issuer), "k1", TRUSTED_KEY_PEM);
        let verified = validator(&auth_config(), &issuer).validate(&token).await.unwrap();
        assert_eq!(verified.subject, "contact-center");
        assert_eq!(verified.token_id, "token-1");
    }

    #[tokio::test]
    async fn test_untrusted_issuer_rejected_without_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testkit::jwks_body("k1")))
            .expect(0)
            .mount(&server)
            .await;
        let issuer = format!("{}/idb", server.uri());
        let token = sign(&testkit::valid_claims(&issuer), "k1", TRUSTED_KEY_PEM);

        // Default allow-list only holds the production brokers
        let keys = Arc::new(KeyCache::new(reqwest::Client::new(), DEFAULT_KEY_TTL));
        let err = TokenValidator::new(&auth_config(), keys)
            .validate(&token)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::UntrustedIssuer(issuer));
    }

    #[tokio::test]
    async fn test_wrong_signing_key() {
        let (_server, issuer) = broker().await;
        let token = sign(&testkit::valid_claims(&issuer), "k1", UNTRUSTED_KEY_PEM);
        let err = validator(&auth_config(), &issuer).validate(&token).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidSignature);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let (_server, issuer) = broker().await;
        let mut claims = testkit::valid_claims(&issuer);
        claims["exp"] = (testkit::now() - 3600).into();
        let token = sign(&claims, "k1", TRUSTED_KEY_PEM);
        let err = validator(&auth_config(), &issuer).validate(&token).await.unwrap_err();
        assert_eq!(err, AuthError::Expired);
    }

    #[tokio::test]
    async fn test_missing_jti() {
        let (_server, issuer) = broker().await;
        let mut claims = testkit::valid_claims(&issuer);
        claims.as_object_mut().unwrap().remove("jti");
        let token = sign(&claims, "k1", TRUSTED_KEY_PEM);
        let err = validator(&auth_config(), &issuer).validate(&token).await.unwrap_err();
        assert_eq!(err, AuthError::MissingClaim("jti".to_string()));
    }

    #[tokio::test]
    async fn test_datasource_mismatch() {
        let (_server, issuer) = broker().await;
        let mut claims = testkit::valid_claims(&issuer);
        claims[DATASOURCE_URL_CLAIM] = "https://someone-else.example.com".into();
        let token = sign(&claims, "k1", TRUSTED_KEY_PEM);
        let err = validator(&auth_config(), &issuer).validate(&token).await.unwrap_err();
        assert_eq!(err.kind(), "datasource_mismatch");

        let mut claims = testkit::valid_claims(&issuer);
        claims[DATASOURCE_SCHEMA_CLAIM] = "00000000-0000-0000-0000-000000000000".into();
        let token = sign(&claims, "k1", TRUSTED_KEY_PEM);
        let err = validator(&auth_config(), &issuer).validate(&token).await.unwrap_err();
        assert_eq!(err.kind(), "datasource_mismatch");
    }

    #[tokio::test]
    async fn test_configured_audience_and_subject() {
        let (_server, issuer) = broker().await;
        let token = sign(&testkit::valid_claims(&issuer), "k1", TRUSTED_KEY_PEM);

        let mut config = auth_config();
        config.audience = Some("voice-gateway".to_string());
        config.expected_subject = Some("contact-center".to_string());
        assert!(validator(&config, &issuer).validate(&token).await.is_ok());

        config.audience = Some("another-service".to_string());
        let err = validator(&config, &issuer).validate(&token).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidAudience);

        config.audience = None;
        config.expected_subject = Some("someone-else".to_string());
        let err = validator(&config, &issuer).validate(&token).await.unwrap_err();
        assert_eq!(err, AuthError::InvalidSubject);
    }

    #[tokio::test]
    async fn test_garbage_token() {
        let (_server, issuer) = broker().await;
        let err = validator(&auth_config(), &issuer)
            .validate("not-a-jwt")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "malformed_token");
    }
}
