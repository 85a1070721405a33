//! CircleCI OIDC token validation.
//!
//! CircleCI issues one OIDC issuer per organization:
//! `https://oidc.circleci.com/org/<organization-id>`, with keys published at
//! `<issuer>/.well-known/jwks-pub.json`. The token audience is the
//! organization id as well.
//!
//! Verified claims expose:
//!
//! | Attribute | Kind | Source claim |
//! |-----------|------|--------------|
//! | `project_id` | scalar | `oidc.circleci.com/project-id` |
//! | `context_id` | list | `oidc.circleci.com/context-ids` |

use join_core::Claims;
use serde::Deserialize;
use tracing::debug;

use super::claims::{ClaimsError, ClaimsValidator};
use super::jwks::{Expectation, JwtVerifier};
use super::policy::ProviderType;

/// Default issuer prefix; the organization id is appended.
pub const DEFAULT_ISSUER_BASE: &str = "https://oidc.circleci.com/org";

/// Rule/claims attribute for the CircleCI project.
pub const PROJECT_ID: &str = "project_id";
/// Rule/claims attribute for CircleCI contexts.
pub const CONTEXT_ID: &str = "context_id";

/// Raw CircleCI ID token claims.
#[derive(Debug, Deserialize)]
struct CircleCiTokenClaims {
    sub: String,
    #[serde(rename = "oidc.circleci.com/project-id")]
    project_id: String,
    #[serde(rename = "oidc.circleci.com/context-ids", default)]
    context_ids: Vec<String>,
}

impl From<CircleCiTokenClaims> for Claims {
    fn from(raw: CircleCiTokenClaims) -> Self {
        Claims::new(raw.sub)
            .with_scalar(PROJECT_ID, raw.project_id)
            .with_list(CONTEXT_ID, raw.context_ids)
    }
}

/// Validator for CircleCI OIDC tokens.
pub struct CircleCiValidator {
    verifier: JwtVerifier,
    issuer_base: String,
}

impl CircleCiValidator {
    /// Create a validator using `issuer_base` (normally [`DEFAULT_ISSUER_BASE`]).
    #[must_use]
    pub fn new(verifier: JwtVerifier, issuer_base: impl Into<String>) -> Self {
        Self {
            verifier,
            issuer_base: issuer_base.into(),
        }
    }

    /// Issuer URL for an organization.
    #[must_use]
    pub fn issuer_for(&self, organization_id: &str) -> String {
        format!("{}/{organization_id}", self.issuer_base.trim_end_matches('/'))
    }

    /// JWKS URL for an organization.
    #[must_use]
    pub fn jwks_uri_for(&self, organization_id: &str) -> String {
        format!("{}/.well-known/jwks-pub.json", self.issuer_for(organization_id))
    }
}

#[async_trait::async_trait]
impl ClaimsValidator for CircleCiValidator {
    fn provider(&self) -> ProviderType {
        ProviderType::CircleCi
    }

    async fn validate(&self, organization_id: &str, token: &str) -> Result<Claims, ClaimsError> {
        if organization_id.is_empty() {
            return Err(ClaimsError::Invalid(
                "circleci organization id is empty".to_string(),
            ));
        }

        let issuer = self.issuer_for(organization_id);
        let jwks_uri = self.jwks_uri_for(organization_id);
        let raw: CircleCiTokenClaims = self
            .verifier
            .verify(
                token,
                &Expectation {
                    issuer: &issuer,
                    jwks_uri: &jwks_uri,
                    audience: organization_id,
                },
            )
            .await?;

        debug!(
            subject = %raw.sub,
            project_id = %raw.project_id,
            contexts = raw.context_ids.len(),
            "CircleCI token verified"
        );
        Ok(raw.into())
    }
}
