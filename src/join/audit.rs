//! Audit logging for join decisions.
//!
//! Every event is emitted via `tracing::info!` with a JSON payload in the
//! `audit` field, making the trail queryable by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `join.allowed` | Claims matched an allow rule and a credential was issued |
//! | `join.denied` | Claims verified but matched no allow rule |
//! | `join.rejected` | The external token failed validation |
//! | `join.invalid` | The request, policy or role was unusable |
//! | `join.failed` | Authorization succeeded but issuance failed |

use serde::Serialize;

use super::issuer::Credential;
use super::orchestrator::{ErrorKind, JoinError};
use super::policy::{ProviderType, Role};

/// Structured audit event emitted for every join outcome.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"join.allowed"`).
    pub event: &'static str,
    /// Policy named by the request.
    pub policy: String,
    /// Requested role.
    pub role: Role,
    /// Provider the policy trusts (once the policy was found).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderType>,
    /// External identity subject (once verified).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Host identifier from the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    /// Index of the matching allow rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<usize>,
    /// Id of the issued credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    /// Error classification for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    /// Human-readable reason for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Request facts known before the decision, shared by every event.
#[derive(Debug, Clone)]
pub struct AuditContext {
    /// Policy named by the request.
    pub policy: String,
    /// Requested role.
    pub role: Role,
    /// Host identifier, if supplied.
    pub host_id: Option<String>,
    /// Provider, filled in once the policy is loaded.
    pub provider: Option<ProviderType>,
    /// Subject, filled in once claims are verified.
    pub subject: Option<String>,
}

impl AuditEvent {
    fn base(event: &'static str, ctx: &AuditContext) -> Self {
        Self {
            event,
            policy: ctx.policy.clone(),
            role: ctx.role,
            provider: ctx.provider,
            subject: ctx.subject.clone(),
            host_id: ctx.host_id.clone(),
            rule: None,
            credential_id: None,
            kind: None,
            reason: None,
        }
    }

    /// Construct a `join.allowed` event.
    #[must_use]
    pub fn allowed(ctx: &AuditContext, rule: usize, credential: &Credential) -> Self {
        Self {
            rule: Some(rule),
            credential_id: Some(credential.id.clone()),
            subject: Some(credential.subject.clone()),
            ..Self::base("join.allowed", ctx)
        }
    }

    /// Construct the failure event matching `err`'s classification.
    #[must_use]
    pub fn failed(ctx: &AuditContext, err: &JoinError) -> Self {
        let kind = err.kind();
        let event = match kind {
            ErrorKind::AccessDenied => "join.denied",
            ErrorKind::ExternalValidationFailed => "join.rejected",
            ErrorKind::BadParameter | ErrorKind::NotFoundOrExpired => "join.invalid",
            ErrorKind::Internal => "join.failed",
        };
        Self {
            kind: Some(kind),
            reason: Some(err.to_string()),
            ..Self::base(event, ctx)
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// ```text
/// INFO ci_join::join::audit audit={"event":"join.allowed","policy":...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "join audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::join::orchestrator::ACCESS_DENIED_MESSAGE;

    fn ctx() -> AuditContext {
        AuditContext {
            policy: "ci".to_string(),
            role: Role::Node,
            host_id: Some("host-1".to_string()),
            provider: Some(ProviderType::CircleCi),
            subject: Some("org/o/project/p/user/u".to_string()),
        }
    }

    fn credential() -> Credential {
        let now = Utc::now();
        Credential {
            id: "cred-1".to_string(),
            token: "cij_secret".to_string(),
            role: Role::Node,
            host_id: "host-1".to_string(),
            subject: "org/o/project/p/user/u".to_string(),
            policy: "ci".to_string(),
            tls_key_fingerprint: String::new(),
            ssh_key_fingerprint: String::new(),
            issued_at: now,
            expires_at: now,
        }
    }

    #[test]
    fn allowed_event_carries_rule_and_credential_id() {
        let event = AuditEvent::allowed(&ctx(), 2, &credential());

        assert_eq!(event.event, "join.allowed");
        assert_eq!(event.rule, Some(2));
        assert_eq!(event.credential_id.as_deref(), Some("cred-1"));
        assert!(event.kind.is_none());
    }

    #[test]
    fn allowed_event_never_leaks_bearer_value() {
        let json = serde_json::to_string(&AuditEvent::allowed(&ctx(), 0, &credential())).unwrap();

        assert!(!json.contains("cij_secret"));
    }

    #[test]
    fn denial_maps_to_denied_event_with_fixed_reason() {
        let event = AuditEvent::failed(&ctx(), &JoinError::AccessDenied);

        assert_eq!(event.event, "join.denied");
        assert_eq!(event.kind, Some(ErrorKind::AccessDenied));
        assert_eq!(event.reason.as_deref(), Some(ACCESS_DENIED_MESSAGE));
    }

    #[test]
    fn failure_events_by_kind() {
        let not_found = AuditEvent::failed(&ctx(), &JoinError::PolicyNotFound("x".to_string()));
        let bad = AuditEvent::failed(&ctx(), &JoinError::BadParameter("y".to_string()));

        assert_eq!(not_found.event, "join.invalid");
        assert_eq!(bad.event, "join.invalid");
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::failed(&ctx(), &JoinError::AccessDenied));
    }
}
