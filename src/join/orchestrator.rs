//! Registration orchestrator.
//!
//! [`JoinService::register`] runs the exchange of an external CI token for a
//! cluster credential as a straight pipeline:
//!
//! 1. **Lookup**: the named policy must exist, be unexpired and declare the
//!    requested role.
//! 2. **Precondition**: token and public keys must be present. Checked
//!    locally, before any call to a provider.
//! 3. **Verification**: the provider's [`ClaimsValidator`] turns the token
//!    into claims. Its error is returned as-is.
//! 4. **Authorization**: the claims must satisfy at least one allow rule.
//! 5. **Issuance**: the [`CredentialIssuer`] mints the credential.
//!
//! Nothing is mutated before stage 5 and nothing is retried.
//!
//! [`ClaimsValidator`]: super::claims::ClaimsValidator

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use super::audit::{self, AuditContext, AuditEvent};
use super::claims::{ClaimsError, ValidatorRegistry};
use super::issuer::{Credential, CredentialIssuer, IssueError, IssueRequest, PublicKeys};
use super::policy::{PolicyStore, Role};

/// Message carried by every access denial. Operators and automated checks
/// match on it; changing it is a breaking change.
pub const ACCESS_DENIED_MESSAGE: &str = "identity claims did not match any allow rules";

/// Message for a request without an external token.
pub const TOKEN_NOT_PROVIDED_MESSAGE: &str = "token not provided";

/// Caller-facing classification of a failed join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request is malformed or incomplete.
    BadParameter,
    /// The policy is unknown, expired, or does not declare the role.
    NotFoundOrExpired,
    /// The provider rejected the external token.
    ExternalValidationFailed,
    /// The token verified but matched no allow rule.
    AccessDenied,
    /// Issuance failed after authorization succeeded.
    Internal,
}

/// Error variants for a join attempt.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// Malformed or incomplete request.
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// No policy with that name.
    #[error("join policy {0:?} not found")]
    PolicyNotFound(String),

    /// The policy exists but is past its expiry.
    #[error("join policy {0:?} has expired")]
    PolicyExpired(String),

    /// The policy does not declare the requested role.
    #[error("join policy {policy:?} does not allow role {role}")]
    RoleNotAllowed {
        /// Policy name.
        policy: String,
        /// Requested role.
        role: Role,
    },

    /// The provider's validator failed; passed through unchanged.
    #[error(transparent)]
    Validation(#[from] ClaimsError),

    /// Claims verified but no allow rule matched.
    #[error("{}", ACCESS_DENIED_MESSAGE)]
    AccessDenied,

    /// Credential issuance failed.
    #[error(transparent)]
    Issue(#[from] IssueError),
}

impl JoinError {
    /// Caller-facing classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadParameter(_) => ErrorKind::BadParameter,
            Self::PolicyNotFound(_) | Self::PolicyExpired(_) | Self::RoleNotAllowed { .. } => {
                ErrorKind::NotFoundOrExpired
            }
            Self::Validation(_) => ErrorKind::ExternalValidationFailed,
            Self::AccessDenied => ErrorKind::AccessDenied,
            Self::Issue(_) => ErrorKind::Internal,
        }
    }
}

/// A machine's request to join the cluster.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    /// Policy the machine claims to satisfy.
    pub policy_name: String,
    /// Role to assume.
    pub role: Role,
    /// Raw external identity token.
    pub external_token: String,
    /// Host identifier forwarded to the issuer (may be empty).
    pub host_id: String,
    /// Keys the issued credential is bound to.
    pub public_keys: PublicKeys,
}

/// Decides join requests and issues credentials for the admitted ones.
#[derive(Clone)]
pub struct JoinService {
    policies: Arc<dyn PolicyStore>,
    validators: ValidatorRegistry,
    issuer: Arc<dyn CredentialIssuer>,
    validation_timeout: Duration,
}

impl JoinService {
    /// Create a service. `validation_timeout` bounds each provider call.
    #[must_use]
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        validators: ValidatorRegistry,
        issuer: Arc<dyn CredentialIssuer>,
        validation_timeout: Duration,
    ) -> Self {
        Self {
            policies,
            validators,
            issuer,
            validation_timeout,
        }
    }

    /// Policy store backing this service.
    #[must_use]
    pub fn policies(&self) -> &Arc<dyn PolicyStore> {
        &self.policies
    }

    /// Run one join attempt and audit its outcome.
    ///
    /// # Errors
    ///
    /// See [`JoinError`]; [`JoinError::kind`] gives the classification.
    pub async fn register(&self, request: RegistrationRequest) -> Result<Credential, JoinError> {
        let mut ctx = AuditContext {
            policy: request.policy_name.clone(),
            role: request.role,
            host_id: (!request.host_id.is_empty()).then(|| request.host_id.clone()),
            provider: None,
            subject: None,
        };

        match self.decide(&request, &mut ctx).await {
            Ok((rule, credential)) => {
                audit::emit(&AuditEvent::allowed(&ctx, rule, &credential));
                Ok(credential)
            }
            Err(e) => {
                audit::emit(&AuditEvent::failed(&ctx, &e));
                Err(e)
            }
        }
    }

    async fn decide(
        &self,
        request: &RegistrationRequest,
        ctx: &mut AuditContext,
    ) -> Result<(usize, Credential), JoinError> {
        if request.policy_name.is_empty() {
            return Err(JoinError::BadParameter("policy name not provided".to_string()));
        }

        // Stage 1: lookup
        let policy = self
            .policies
            .get(&request.policy_name)
            .await
            .ok_or_else(|| JoinError::PolicyNotFound(request.policy_name.clone()))?;
        ctx.provider = Some(policy.provider);
        if policy.is_expired_at(Utc::now()) {
            return Err(JoinError::PolicyExpired(policy.name));
        }
        if !policy.allows_role(request.role) {
            return Err(JoinError::RoleNotAllowed {
                policy: policy.name,
                role: request.role,
            });
        }

        // Stage 2: local preconditions
        if request.external_token.is_empty() {
            return Err(JoinError::BadParameter(TOKEN_NOT_PROVIDED_MESSAGE.to_string()));
        }
        if request.public_keys.is_empty() {
            return Err(JoinError::BadParameter("public keys not provided".to_string()));
        }
        let validator = self.validators.get(policy.provider).ok_or_else(|| {
            JoinError::BadParameter(format!(
                "no validator registered for provider {}",
                policy.provider
            ))
        })?;

        // Stage 3: verification
        let claims = tokio::time::timeout(
            self.validation_timeout,
            validator.validate(&policy.organization_id, &request.external_token),
        )
        .await
        .map_err(|_| ClaimsError::Timeout(self.validation_timeout))??;
        ctx.subject = Some(claims.subject.clone());

        // Stage 4: authorization
        let rule = join_core::first_match(&claims, &policy.allow).ok_or(JoinError::AccessDenied)?;
        debug!(policy = %policy.name, rule, subject = %claims.subject, "Claims matched allow rule");

        // Stage 5: issuance
        let credential = self
            .issuer
            .issue(IssueRequest {
                policy: &policy.name,
                role: request.role,
                host_id: &request.host_id,
                public_keys: &request.public_keys,
                claims: &claims,
            })
            .await?;

        Ok((rule, credential))
    }
}
