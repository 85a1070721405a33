//! Claims validation, the pluggable boundary to external identity providers.
//!
//! Each provider type gets one [`ClaimsValidator`]. The orchestrator picks the
//! validator named by the policy through the [`ValidatorRegistry`] and never
//! depends on a concrete provider.
//!
//! A validator must fail (never return empty claims) when the token is
//! malformed, its signature does not verify against the provider's current
//! keys, it has expired, or its issuer/organization does not match the
//! expected one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use join_core::Claims;

use super::jwks::{JwksCache, JwtVerifier};
use super::policy::ProviderType;
use super::{circleci::CircleCiValidator, github::GitHubValidator};
use crate::config::ProvidersConfig;

/// Error variants for external token validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ClaimsError {
    /// The token is not a structurally valid JWT.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// JWT decode, signature, expiry or audience verification failed.
    #[error("JWT verification failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header contains no `kid` field.
    #[error("JWT missing 'kid' field in header")]
    MissingKeyId,

    /// The `kid` in the JWT header is not in the provider's JWKS.
    #[error("unknown key ID: {0}")]
    UnknownKeyId(String),

    /// The token was signed with an algorithm we do not accept.
    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The token's `iss` claim is not the issuer the policy expects.
    #[error("issuer mismatch: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Issuer derived from the policy.
        expected: String,
        /// Issuer found in the token.
        actual: String,
    },

    /// Network or HTTP error while fetching JWKS.
    #[error("JWKS fetch error: {0}")]
    Fetch(#[from] reqwest::Error),

    /// The provider did not answer within the validation timeout.
    #[error("token validation timed out after {0:?}")]
    Timeout(Duration),

    /// Provider-specific rejection.
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Validates raw external tokens for one provider type.
///
/// Implementations own whatever verification state they need (cached signing
/// keys, HTTP clients) and must be safe to share across concurrent requests.
#[async_trait::async_trait]
pub trait ClaimsValidator: Send + Sync + 'static {
    /// Provider this validator serves.
    fn provider(&self) -> ProviderType;

    /// Verify `token` and return its claims.
    ///
    /// `organization_id` comes from the policy and pins the issuer or
    /// organization the token must belong to.
    async fn validate(&self, organization_id: &str, token: &str) -> Result<Claims, ClaimsError>;
}

/// Validators keyed by provider type.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<ProviderType, Arc<dyn ClaimsValidator>>,
}

impl ValidatorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in CircleCI and GitHub Actions validators,
    /// sharing one JWKS cache.
    #[must_use]
    pub fn with_builtin(config: &ProvidersConfig) -> Self {
        let cache = Arc::new(JwksCache::new(config.jwks_cache_ttl, config.jwks_fetch_timeout));
        let verifier = JwtVerifier::new(cache);

        let mut registry = Self::new();
        registry.register(Arc::new(CircleCiValidator::new(
            verifier.clone(),
            config.circleci.issuer_base.clone(),
        )));
        registry.register(Arc::new(GitHubValidator::new(
            verifier,
            config.github.issuer_base.clone(),
            config.github.audience.clone(),
        )));
        registry
    }

    /// Register (or replace) the validator for its provider type.
    pub fn register(&mut self, validator: Arc<dyn ClaimsValidator>) {
        self.validators.insert(validator.provider(), validator);
    }

    /// Validator for `provider`, if one is registered.
    #[must_use]
    pub fn get(&self, provider: ProviderType) -> Option<Arc<dyn ClaimsValidator>> {
        self.validators.get(&provider).cloned()
    }

    /// Registered provider types.
    pub fn providers(&self) -> impl Iterator<Item = ProviderType> + '_ {
        self.validators.keys().copied()
    }
}
