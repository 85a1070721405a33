//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use ci_join::join::{
    BearerCredentialIssuer, ClaimsError, ClaimsValidator, CredentialStore, InMemoryPolicyStore,
    JoinService, Policy, ProviderType, PublicKeys, RegistrationRequest, Role, ValidatorRegistry,
};
use join_core::{AllowRule, Claims};

pub const ORG: &str = "org-1";
pub const PROJECT: &str = "project-1";
pub const CONTEXT_A: &str = "context-a";
pub const CONTEXT_B: &str = "context-b";
pub const VALID_TOKEN: &str = "valid-token";

/// Validator that accepts a fixed set of tokens for one organization and
/// counts every call.
pub struct ScriptedValidator {
    provider: ProviderType,
    organization_id: String,
    tokens: HashMap<String, Claims>,
    calls: AtomicUsize,
}

impl ScriptedValidator {
    pub fn circleci() -> Self {
        let claims = Claims::new(format!("org/{ORG}/project/{PROJECT}/user/u1"))
            .with_scalar("project_id", PROJECT)
            .with_list("context_id", [CONTEXT_A, CONTEXT_B]);
        Self {
            provider: ProviderType::CircleCi,
            organization_id: ORG.to_string(),
            tokens: HashMap::from([(VALID_TOKEN.to_string(), claims)]),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ClaimsValidator for ScriptedValidator {
    fn provider(&self) -> ProviderType {
        self.provider
    }

    async fn validate(&self, organization_id: &str, token: &str) -> Result<Claims, ClaimsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if organization_id != self.organization_id {
            return Err(ClaimsError::IssuerMismatch {
                expected: format!("https://oidc.circleci.com/org/{organization_id}"),
                actual: format!("https://oidc.circleci.com/org/{}", self.organization_id),
            });
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| ClaimsError::Invalid("signature verification failed".to_string()))
    }
}

/// Validator that never answers.
pub struct HangingValidator;

#[async_trait::async_trait]
impl ClaimsValidator for HangingValidator {
    fn provider(&self) -> ProviderType {
        ProviderType::CircleCi
    }

    async fn validate(&self, _org: &str, _token: &str) -> Result<Claims, ClaimsError> {
        std::future::pending().await
    }
}

pub fn circleci_policy(name: &str, organization_id: &str, allow: Vec<AllowRule>) -> Policy {
    Policy {
        name: name.to_string(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        roles: vec![Role::Node],
        provider: ProviderType::CircleCi,
        organization_id: organization_id.to_string(),
        allow,
        revision: 0,
    }
}

pub fn rule(project: &str, context: &str) -> AllowRule {
    AllowRule::new()
        .require("project_id", project)
        .require("context_id", context)
}

pub fn request(policy: &str, token: &str) -> RegistrationRequest {
    RegistrationRequest {
        policy_name: policy.to_string(),
        role: Role::Node,
        external_token: token.to_string(),
        host_id: "runner-1".to_string(),
        public_keys: PublicKeys {
            tls: b"tls-public-key".to_vec(),
            ssh: b"ssh-ed25519 AAAA".to_vec(),
        },
    }
}

pub struct Harness {
    pub service: JoinService,
    pub credentials: Arc<CredentialStore>,
}

pub async fn harness(policies: Vec<Policy>, validator: Arc<dyn ClaimsValidator>) -> Harness {
    let credentials = Arc::new(CredentialStore::new());
    let mut validators = ValidatorRegistry::new();
    validators.register(validator);
    let service = JoinService::new(
        Arc::new(InMemoryPolicyStore::seeded(policies).await),
        validators,
        Arc::new(BearerCredentialIssuer::new(
            Arc::clone(&credentials),
            Duration::from_secs(600),
        )),
        Duration::from_millis(200),
    );
    Harness {
        service,
        credentials,
    }
}
