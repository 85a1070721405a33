//! GitHub Actions OIDC token validation.
//!
//! Tokens come from `https://token.actions.githubusercontent.com`, or from
//! `https://token.actions.githubusercontent.com/<enterprise-slug>` when the
//! enterprise has a customized issuer. A policy selects the latter by setting
//! its `organization_id` to the slug. The audience is the configured cluster
//! audience.
//!
//! All exposed attributes are scalars: `repository`, `repository_owner`,
//! `workflow`, `environment`, `actor`, `ref`, `ref_type`. Attributes absent
//! from the token (e.g. `environment` outside a deployment job) are not
//! reported, so rules requiring them never match.

use join_core::Claims;
use serde::Deserialize;
use tracing::debug;

use super::claims::{ClaimsError, ClaimsValidator};
use super::jwks::{Expectation, JwtVerifier};
use super::policy::ProviderType;

/// Default GitHub Actions issuer.
pub const DEFAULT_ISSUER_BASE: &str = "https://token.actions.githubusercontent.com";

/// Raw GitHub Actions ID token claims.
#[derive(Debug, Deserialize)]
struct GitHubTokenClaims {
    sub: String,
    repository: Option<String>,
    repository_owner: Option<String>,
    workflow: Option<String>,
    environment: Option<String>,
    actor: Option<String>,
    #[serde(rename = "ref")]
    git_ref: Option<String>,
    ref_type: Option<String>,
}

impl From<GitHubTokenClaims> for Claims {
    fn from(raw: GitHubTokenClaims) -> Self {
        let mut claims = Claims::new(raw.sub);
        let attributes = [
            ("repository", raw.repository),
            ("repository_owner", raw.repository_owner),
            ("workflow", raw.workflow),
            ("environment", raw.environment),
            ("actor", raw.actor),
            ("ref", raw.git_ref),
            ("ref_type", raw.ref_type),
        ];
        for (name, value) in attributes {
            if let Some(value) = value {
                claims = claims.with_scalar(name, value);
            }
        }
        claims
    }
}

/// Validator for GitHub Actions OIDC tokens.
pub struct GitHubValidator {
    verifier: JwtVerifier,
    issuer_base: String,
    audience: String,
}

impl GitHubValidator {
    /// Create a validator that requires tokens minted for `audience`.
    #[must_use]
    pub fn new(
        verifier: JwtVerifier,
        issuer_base: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            verifier,
            issuer_base: issuer_base.into(),
            audience: audience.into(),
        }
    }

    /// Issuer URL; an empty `enterprise_slug` selects the public issuer.
    #[must_use]
    pub fn issuer_for(&self, enterprise_slug: &str) -> String {
        let base = self.issuer_base.trim_end_matches('/');
        if enterprise_slug.is_empty() {
            base.to_string()
        } else {
            format!("{base}/{enterprise_slug}")
        }
    }
}

#[async_trait::async_trait]
impl ClaimsValidator for GitHubValidator {
    fn provider(&self) -> ProviderType {
        ProviderType::GitHub
    }

    async fn validate(&self, organization_id: &str, token: &str) -> Result<Claims, ClaimsError> {
        let issuer = self.issuer_for(organization_id);
        let jwks_uri = format!("{issuer}/.well-known/jwks");
        let raw: GitHubTokenClaims = self
            .verifier
            .verify(
                token,
                &Expectation {
                    issuer: &issuer,
                    jwks_uri: &jwks_uri,
                    audience: &self.audience,
                },
            )
            .await?;

        debug!(subject = %raw.sub, repository = ?raw.repository, "GitHub Actions token verified");
        Ok(raw.into())
    }
}
