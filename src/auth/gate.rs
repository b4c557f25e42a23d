//! # Authentication Gate
//!
//! Applies the configured policy to the `authorization` metadata of one request:
//!
//! | policy   | missing token | invalid token        | valid token |
//! |----------|---------------|----------------------|-------------|
//! | disabled | allowed       | not checked          | not checked |
//! | monitor  | allowed       | allowed, logged warn | verified    |
//! | enforce  | rejected      | rejected             | verified    |
//!
//! A rejection only affects the one request; the stream it arrived on stays open.

use super::validator::VerifiedToken;
use super::{AuthError, TokenValidator};
use crate::config::AuthConfig;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPolicy {
    Disabled,
    Monitor,
    Enforce,
}

impl AuthPolicy {
    pub fn from_config(config: &AuthConfig) -> Self {
        match (config.enabled, config.enforce) {
            (false, _) => AuthPolicy::Disabled,
            (true, false) => AuthPolicy::Monitor,
            (true, true) => AuthPolicy::Enforce,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthPolicy::Disabled => "disabled",
            AuthPolicy::Monitor => "monitor",
            AuthPolicy::Enforce => "enforce",
        }
    }
}

/// What the gate decided for a request it let through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Authentication is disabled
    Skipped,
    /// No token was presented and the policy does not require one
    Anonymous,
    /// The token passed validation
    Verified(VerifiedToken),
    /// The token failed validation but the policy only monitors
    Unverified(AuthError),
}

pub struct AuthGate {
    policy: AuthPolicy,
    validator: Option<Arc<TokenValidator>>,
}

impl AuthGate {
    pub fn new(policy: AuthPolicy, validator: Arc<TokenValidator>) -> Self {
        Self {
            policy,
            validator: Some(validator),
        }
    }

    pub fn disabled() -> Self {
        Self {
            policy: AuthPolicy::Disabled,
            validator: None,
        }
    }

    pub fn policy(&self) -> AuthPolicy {
        self.policy
    }

    /// Check one request's `authorization` value (with or without the `Bearer ` prefix).
    pub async fn check(&self, authorization: Option<&str>) -> Result<AuthOutcome, AuthError> {
        let validator = match (&self.policy, &self.validator) {
            (AuthPolicy::Disabled, _) | (_, None) => return Ok(AuthOutcome::Skipped),
            (_, Some(validator)) => validator,
        };

        let token = authorization.map(strip_bearer).filter(|t| !t.is_empty());
        let token = match (token, self.policy) {
            (Some(token), _) => token,
            (None, AuthPolicy::Enforce) => {
                warn!("Rejecting request without authorization token");
                return Err(AuthError::MissingToken);
            }
            (None, _) => {
                debug!("No authorization token presented, allowed by monitor policy");
                return Ok(AuthOutcome::Anonymous);
            }
        };

        match validator.validate(token).await {
            Ok(verified) => Ok(AuthOutcome::Verified(verified)),
            Err(err) if self.policy == AuthPolicy::Enforce => {
                warn!(kind = err.kind(), error = %err, "Rejecting request with invalid token");
                Err(err)
            }
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "Token validation failed, allowed by monitor policy");
                Ok(AuthOutcome::Unverified(err))
            }
        }
    }
}

fn strip_bearer(value: &str) -> &str {
    let value = value.trim_start();
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwks::DEFAULT_KEY_TTL;
    use crate::auth::testkit::{self, sign, TRUSTED_KEY_PEM};
    use crate::auth::KeyCache;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn gate(policy: AuthPolicy) -> (MockServer, String, AuthGate) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/idb/oauth2/v2/keys/verificationjwk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testkit::jwks_body("k1")))
            .mount(&server)
            .await;
        let issuer = format!("{}/idb", server.uri());

        let config = AuthConfig {
            enabled: true,
            enforce: policy == AuthPolicy::Enforce,
            datasource_url: testkit::DATASOURCE_URL.to_string(),
            ..AuthConfig::default()
        };
        let keys = Arc::new(KeyCache::new(reqwest::Client::new(), DEFAULT_KEY_TTL));
        let validator = TokenValidator::new(&config, keys).with_allowed_issuers(vec![issuer.clone()]);
        (server, issuer, AuthGate::new(policy, Arc::new(validator)))
    }

    #[test]
    fn test_policy_from_config() {
        let mut config = AuthConfig::default();
        config.enabled = false;
        config.enforce = true;
        assert_eq!(AuthPolicy::from_config(&config), AuthPolicy::Disabled);
        config.enabled = true;
        assert_eq!(AuthPolicy::from_config(&config), AuthPolicy::Enforce);
        config.enforce = false;
        assert_eq!(AuthPolicy::from_config(&config), AuthPolicy::Monitor);
    }

    #[test]
    fn test_strip_bearer() {
        assert_eq!(strip_bearer("Bearer abc.def.ghi"), "abc.def.ghi");
        assert_eq!(strip_bearer("  bearer abc "), "abc");
        assert_eq!(strip_bearer("abc"), "abc");
    }

    #[tokio::test]
    async fn test_disabled_skips_everything() {
        let gate = AuthGate::disabled();
        assert_eq!(gate.check(None).await, Ok(AuthOutcome::Skipped));
        assert_eq!(gate.check(Some("garbage")).await, Ok(AuthOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_missing_token() {
        let (_server, _issuer, enforce) = gate(AuthPolicy::Enforce).await;
        assert_eq!(enforce.check(None).await, Err(AuthError::MissingToken));
        assert_eq!(enforce.check(Some("Bearer ")).await, Err(AuthError::MissingToken));

        let (_server, _issuer, monitor) = gate(AuthPolicy::Monitor).await;
        assert_eq!(monitor.check(None).await, Ok(AuthOutcome::Anonymous));
    }

    #[tokio::test]
    async fn test_untrusted_issuer_enforce_vs_monitor() {
        let claims = testkit::valid_claims("https://idp.attacker.example/idb");
        let token = format!("Bearer {}", sign(&claims, "k1", TRUSTED_KEY_PEM));

        let (_server, _issuer, enforce) = gate(AuthPolicy::Enforce).await;
        let err = enforce.check(Some(&token)).await.unwrap_err();
        assert_eq!(err.kind(), "untrusted_issuer");

        let (_server, _issuer, monitor) = gate(AuthPolicy::Monitor).await;
        match monitor.check(Some(&token)).await {
            Ok(AuthOutcome::Unverified(err)) => assert_eq!(err.kind(), "untrusted_issuer"),
            other => panic!("expected unverified pass-through, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_valid_bearer_token() {
        let (_server, issuer, enforce) = gate(AuthPolicy::Enforce).await;
        let token = format!("Bearer {}", sign(&testkit::valid_claims(&issuer), "k1", TRUSTED_KEY_PEM));
        assert!(matches!(enforce.check(Some(&token)).await, Ok(AuthOutcome::Verified(_))));
    }
}
