//! CI join: CI platform identity tokens to cluster credentials.
//!
//! A machine running inside a CI job presents the job's OIDC token together
//! with the name of a join policy and the role it wants. The service:
//!
//! 1. **Looks up** the policy ([`policy`]) and checks expiry and role.
//! 2. **Verifies** the token with the provider's validator ([`claims`],
//!    [`circleci`], [`github`], sharing the JWKS cache in [`jwks`]).
//! 3. **Authorizes** the verified claims against the policy's allow rules
//!    (see [`join_core::rule`]).
//! 4. **Issues** a credential bound to the machine's public keys ([`issuer`]).
//!
//! Every decision is audited ([`audit`]); [`handler`] exposes it over HTTP.

pub mod audit;
pub mod circleci;
pub mod claims;
pub mod github;
pub mod handler;
pub mod issuer;
pub mod jwks;
pub mod orchestrator;
pub mod policy;

use std::sync::Arc;

use crate::config::Config;

pub use claims::{ClaimsError, ClaimsValidator, ValidatorRegistry};
pub use issuer::{BearerCredentialIssuer, Credential, CredentialIssuer, CredentialStore, PublicKeys};
pub use orchestrator::{ErrorKind, JoinError, JoinService, RegistrationRequest};
pub use policy::{InMemoryPolicyStore, Policy, PolicyError, PolicyStore, ProviderType, Role};

/// Everything the HTTP surface needs.
pub struct JoinServer {
    /// Decision pipeline
    pub service: JoinService,
    /// Credentials issued by the bundled issuer
    pub credentials: Arc<CredentialStore>,
    /// Resolved admin bearer token; `None` disables admin endpoints
    pub admin_token: Option<String>,
}

impl JoinServer {
    /// Build the server from configuration: seed the policy store, register
    /// the built-in validators and wire the bearer credential issuer.
    pub async fn from_config(config: &Config) -> Self {
        let policies: Arc<dyn PolicyStore> =
            Arc::new(InMemoryPolicyStore::seeded(config.policies.iter().cloned()).await);
        let credentials = Arc::new(CredentialStore::new());
        let issuer = Arc::new(BearerCredentialIssuer::new(
            Arc::clone(&credentials),
            config.join.credential_ttl,
        ));

        let service = JoinService::new(
            policies,
            ValidatorRegistry::with_builtin(&config.providers),
            issuer,
            config.join.validation_timeout,
        );

        Self {
            service,
            credentials,
            admin_token: config.admin.resolve_bearer_token(),
        }
    }

    /// Start the policy and credential reapers; both stop on `shutdown`.
    pub fn spawn_reapers(
        &self,
        interval: std::time::Duration,
        shutdown: &tokio::sync::broadcast::Sender<()>,
    ) {
        policy::spawn_reaper(
            Arc::clone(self.service.policies()),
            interval,
            shutdown.subscribe(),
        );
        issuer::spawn_reaper(Arc::clone(&self.credentials), interval, shutdown.subscribe());
    }
}
