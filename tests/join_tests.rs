//! End-to-end join decisions against a scripted CircleCI validator.

mod common;

use std::sync::Arc;

use ci_join::join::{ClaimsError, ErrorKind, JoinError, Role};
use ci_join::join::orchestrator::{ACCESS_DENIED_MESSAGE, TOKEN_NOT_PROVIDED_MESSAGE};
use common::{
    CONTEXT_A, CONTEXT_B, HangingValidator, ORG, PROJECT, ScriptedValidator, VALID_TOKEN,
    circleci_policy, harness, request, rule,
};
use join_core::AllowRule;
use pretty_assertions::assert_eq;

/// Expected outcome of one join attempt.
#[derive(Debug, PartialEq)]
enum Outcome {
    Allowed,
    Failed(ErrorKind),
}

struct Case {
    name: &'static str,
    organization_id: &'static str,
    allow: Vec<AllowRule>,
    token: &'static str,
    expected: Outcome,
}

#[tokio::test]
async fn circleci_join_table() {
    let cases = vec![
        Case {
            name: "matching project and context",
            organization_id: ORG,
            allow: vec![rule(PROJECT, CONTEXT_A)],
            token: VALID_TOKEN,
            expected: Outcome::Allowed,
        },
        Case {
            name: "matching second context of the token",
            organization_id: ORG,
            allow: vec![AllowRule::new().require("context_id", CONTEXT_B)],
            token: VALID_TOKEN,
            expected: Outcome::Allowed,
        },
        Case {
            name: "any rule may match",
            organization_id: ORG,
            allow: vec![rule("other", CONTEXT_A), rule(PROJECT, CONTEXT_B)],
            token: VALID_TOKEN,
            expected: Outcome::Allowed,
        },
        Case {
            name: "wrong organization",
            organization_id: "org-other",
            allow: vec![rule(PROJECT, CONTEXT_A)],
            token: VALID_TOKEN,
            expected: Outcome::Failed(ErrorKind::ExternalValidationFailed),
        },
        Case {
            name: "invalid token",
            organization_id: ORG,
            allow: vec![rule(PROJECT, CONTEXT_A)],
            token: "forged-token",
            expected: Outcome::Failed(ErrorKind::ExternalValidationFailed),
        },
        Case {
            name: "missing token",
            organization_id: ORG,
            allow: vec![rule(PROJECT, CONTEXT_A)],
            token: "",
            expected: Outcome::Failed(ErrorKind::BadParameter),
        },
        Case {
            name: "context not held by the token",
            organization_id: ORG,
            allow: vec![rule(PROJECT, "context-c")],
            token: VALID_TOKEN,
            expected: Outcome::Failed(ErrorKind::AccessDenied),
        },
        Case {
            name: "project breaks the rule even though context matches",
            organization_id: ORG,
            allow: vec![rule("other", CONTEXT_A)],
            token: VALID_TOKEN,
            expected: Outcome::Failed(ErrorKind::AccessDenied),
        },
        Case {
            name: "no allow rules",
            organization_id: ORG,
            allow: Vec::new(),
            token: VALID_TOKEN,
            expected: Outcome::Failed(ErrorKind::AccessDenied),
        },
    ];

    for case in cases {
        let h = harness(
            vec![circleci_policy("ci", case.organization_id, case.allow)],
            Arc::new(ScriptedValidator::circleci()),
        )
        .await;

        let outcome = match h.service.register(request("ci", case.token)).await {
            Ok(_) => Outcome::Allowed,
            Err(e) => Outcome::Failed(e.kind()),
        };

        assert_eq!(outcome, case.expected, "case: {}", case.name);
    }
}

#[tokio::test]
async fn missing_token_never_calls_validator() {
    // GIVEN: a counting validator behind a valid policy
    let validator = Arc::new(ScriptedValidator::circleci());
    let h = harness(
        vec![circleci_policy("ci", ORG, vec![rule(PROJECT, CONTEXT_A)])],
        Arc::clone(&validator) as _,
    )
    .await;

    // WHEN: the token is empty
    let err = h.service.register(request("ci", "")).await.unwrap_err();

    // THEN: bad parameter and zero validator calls
    assert!(matches!(err, JoinError::BadParameter(_)));
    assert!(err.to_string().contains(TOKEN_NOT_PROVIDED_MESSAGE));
    assert_eq!(validator.calls(), 0);
}

#[tokio::test]
async fn validator_error_passes_through_unchanged() {
    let h = harness(
        vec![circleci_policy("ci", ORG, vec![rule(PROJECT, CONTEXT_A)])],
        Arc::new(ScriptedValidator::circleci()),
    )
    .await;

    let err = h.service.register(request("ci", "forged-token")).await.unwrap_err();

    assert!(matches!(err, JoinError::Validation(ClaimsError::Invalid(_))));
    assert_eq!(err.to_string(), "invalid token: signature verification failed");
}

#[tokio::test]
async fn denial_message_is_stable() {
    let h = harness(
        vec![circleci_policy("ci", ORG, vec![rule(PROJECT, "context-c")])],
        Arc::new(ScriptedValidator::circleci()),
    )
    .await;

    let err = h.service.register(request("ci", VALID_TOKEN)).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AccessDenied);
    assert_eq!(err.to_string(), ACCESS_DENIED_MESSAGE);
    assert_eq!(
        err.to_string(),
        "identity claims did not match any allow rules"
    );
}

#[tokio::test]
async fn allowed_join_issues_a_bound_credential() {
    let h = harness(
        vec![circleci_policy("ci", ORG, vec![rule(PROJECT, CONTEXT_A)])],
        Arc::new(ScriptedValidator::circleci()),
    )
    .await;

    let credential = h.service.register(request("ci", VALID_TOKEN)).await.unwrap();

    assert_eq!(credential.role, Role::Node);
    assert_eq!(credential.policy, "ci");
    assert_eq!(credential.host_id, "runner-1");
    assert!(!credential.ssh_key_fingerprint.is_empty());
    assert_eq!(h.credentials.get(&credential.token), Some(credential));
}

#[tokio::test]
async fn wildcard_rule_admits_any_verified_identity() {
    let h = harness(
        vec![circleci_policy("ci", ORG, vec![AllowRule::new()])],
        Arc::new(ScriptedValidator::circleci()),
    )
    .await;

    assert!(h.service.register(request("ci", VALID_TOKEN)).await.is_ok());
    // still needs a verifiable token
    assert!(h.service.register(request("ci", "forged-token")).await.is_err());
}

#[tokio::test]
async fn unknown_expired_and_wrong_role_are_not_found_or_expired() {
    let mut expired = circleci_policy("old", ORG, vec![AllowRule::new()]);
    expired.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
    let validator = Arc::new(ScriptedValidator::circleci());
    let h = harness(
        vec![circleci_policy("ci", ORG, vec![AllowRule::new()]), expired],
        Arc::clone(&validator) as _,
    )
    .await;

    let mut wrong_role = request("ci", VALID_TOKEN);
    wrong_role.role = Role::Kube;

    for req in [request("missing", VALID_TOKEN), request("old", VALID_TOKEN), wrong_role] {
        let err = h.service.register(req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFoundOrExpired, "{err}");
    }
    assert_eq!(validator.calls(), 0);
}

#[tokio::test]
async fn hanging_validator_times_out() {
    let h = harness(
        vec![circleci_policy("ci", ORG, vec![AllowRule::new()])],
        Arc::new(HangingValidator),
    )
    .await;

    let err = h.service.register(request("ci", VALID_TOKEN)).await.unwrap_err();

    assert!(matches!(err, JoinError::Validation(ClaimsError::Timeout(_))), "{err}");
    assert!(h.credentials.is_empty());
}
