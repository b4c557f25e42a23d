//! # Bearer Token Authentication
//!
//! Every inbound request can carry `authorization: Bearer <token>`. This module
//! verifies those tokens against the identity broker's published RSA keys.
//!
//! ## Pieces:
//! - **jwks**: per-(issuer, key id) public key cache with single-flight fetching
//! - **validator**: issuer allow-list, RS256 signature and claim checks
//! - **gate**: the disabled / monitor / enforce policy applied to each request

pub mod gate;
pub mod jwks;
pub mod validator;

pub use gate::{AuthGate, AuthOutcome, AuthPolicy};
pub use jwks::KeyCache;
pub use validator::TokenValidator;

use thiserror::Error;

/// Why a request failed authentication.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authorization token")]
    MissingToken,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("issuer '{0}' is not trusted")]
    UntrustedIssuer(String),

    #[error("no public key '{kid}' published by {issuer}")]
    UnknownKey { issuer: String, kid: String },

    #[error("could not fetch signing keys: {0}")]
    KeyFetch(String),

    #[error("token signature is not valid")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token audience does not match")]
    InvalidAudience,

    #[error("token subject does not match")]
    InvalidSubject,

    #[error("token is missing required claim '{0}'")]
    MissingClaim(String),

    #[error("claim '{claim}' does not match this gateway (got {actual:?})")]
    DatasourceMismatch {
        claim: &'static str,
        actual: Option<String>,
    },
}

impl AuthError {
    /// Short machine-readable kind used in logs and error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::Malformed(_) => "malformed_token",
            AuthError::UntrustedIssuer(_) => "untrusted_issuer",
            AuthError::UnknownKey { .. } => "unknown_key",
            AuthError::KeyFetch(_) => "key_fetch_failed",
            AuthError::InvalidSignature => "invalid_signature",
            AuthError::Expired => "expired",
            AuthError::InvalidAudience => "invalid_audience",
            AuthError::InvalidSubject => "invalid_subject",
            AuthError::MissingClaim(_) => "missing_claim",
            AuthError::DatasourceMismatch { .. } => "datasource_mismatch",
        }
    }
}
