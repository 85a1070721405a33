//! Join policies and the policy store.
//!
//! A [`Policy`] is the administrator-authored record a registration request
//! names. It declares which identity provider it trusts, which organization
//! (or issuer) that provider must vouch for, which roles may join with it,
//! and the ordered allow rules the verified claims are matched against.
//!
//! The [`PolicyStore`] trait abstracts over storage backends. The only current
//! implementation is [`InMemoryPolicyStore`], backed by a `DashMap` and seeded
//! from configuration, with a background reaper that drops expired policies.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use join_core::AllowRule;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Identity provider types a policy can trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ProviderType {
    /// CircleCI OIDC tokens.
    #[serde(alias = "circle_ci")]
    CircleCi,
    /// GitHub Actions OIDC tokens.
    #[serde(alias = "github_actions")]
    GitHub,
}

impl ProviderType {
    /// Stable lowercase name, as written in configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CircleCi => "circleci",
            Self::GitHub => "github",
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster roles a joining machine may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// SSH node.
    Node,
    /// Proxy service.
    Proxy,
    /// Kubernetes service.
    Kube,
    /// Application service.
    App,
    /// Database service.
    Db,
    /// Machine identity bot.
    Bot,
}

impl Role {
    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Proxy => "proxy",
            Self::Kube => "kube",
            Self::App => "app",
            Self::Db => "db",
            Self::Bot => "bot",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a role name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0:?}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "node" => Ok(Self::Node),
            "proxy" => Ok(Self::Proxy),
            "kube" => Ok(Self::Kube),
            "app" => Ok(Self::App),
            "db" => Ok(Self::Db),
            "bot" => Ok(Self::Bot),
            _ => Err(UnknownRole(s.to_string())),
        }
    }
}

/// Structural problems that keep a policy from loading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// The policy name is empty or whitespace.
    #[error("policy name must not be empty")]
    EmptyName,

    /// The policy declares no roles.
    #[error("policy {0:?} declares no roles")]
    NoRoles(String),

    /// A CircleCI policy without the organization it trusts.
    #[error("policy {0:?} uses circleci but has no organization_id")]
    MissingOrganization(String),
}

/// A named, expiring join policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Unique name; registration requests refer to the policy by it.
    pub name: String,
    /// The policy stops admitting anyone at this instant.
    pub expires_at: DateTime<Utc>,
    /// Roles a machine may request with this policy.
    pub roles: Vec<Role>,
    /// Identity provider whose tokens this policy trusts.
    pub provider: ProviderType,
    /// Organization or issuer identifier the provider must vouch for.
    #[serde(default)]
    pub organization_id: String,
    /// Ordered allow rules. Empty means nothing is admitted.
    #[serde(default)]
    pub allow: Vec<AllowRule>,
    /// Store bookkeeping, bumped on every upsert.
    #[serde(rename = "__revision", default)]
    pub revision: u64,
}

impl Policy {
    /// Whether the policy has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether `role` is declared by this policy.
    #[must_use]
    pub fn allows_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Indices of allow rules with no field set.
    #[must_use]
    pub fn wildcard_rules(&self) -> Vec<usize> {
        self.allow
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.is_wildcard())
            .map(|(i, _)| i)
            .collect()
    }

    /// Structural checks run when policies are loaded.
    ///
    /// Hard errors are returned; suspicious-but-legal shapes (no allow rules,
    /// wildcard rules) are logged as warnings.
    ///
    /// # Errors
    ///
    /// Returns the first [`PolicyError`] found.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.name.trim().is_empty() {
            return Err(PolicyError::EmptyName);
        }
        if self.roles.is_empty() {
            return Err(PolicyError::NoRoles(self.name.clone()));
        }
        if self.provider == ProviderType::CircleCi && self.organization_id.trim().is_empty() {
            return Err(PolicyError::MissingOrganization(self.name.clone()));
        }

        if self.allow.is_empty() {
            warn!(policy = %self.name, "Policy has no allow rules and will reject every join");
        }
        let wildcards = self.wildcard_rules();
        if !wildcards.is_empty() {
            warn!(
                policy = %self.name,
                rules = ?wildcards,
                "Policy has allow rules with no fields set; they admit any verified identity"
            );
        }
        Ok(())
    }
}

/// Trait abstracting the policy storage backend.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    /// Look up a policy by name. Expired policies are still returned; expiry
    /// is judged by the caller.
    async fn get(&self, name: &str) -> Option<Policy>;

    /// Insert or replace a policy. Returns the new revision.
    async fn upsert(&self, policy: Policy) -> u64;

    /// Remove a policy. Returns `true` if it existed.
    async fn remove(&self, name: &str) -> bool;

    /// All stored policies, sorted by name.
    async fn list(&self) -> Vec<Policy>;

    /// Remove every policy expired at `now`.
    async fn reap_expired(&self, now: DateTime<Utc>) -> usize;
}

/// In-memory policy store keyed by policy name.
///
/// ```rust,no_run
/// # use ci_join::join::policy::{InMemoryPolicyStore, PolicyStore};
/// # tokio_test::block_on(async {
/// let store = InMemoryPolicyStore::new();
/// assert!(store.get("ci-nodes").await.is_none());
/// # });
/// ```
#[derive(Default)]
pub struct InMemoryPolicyStore {
    by_name: DashMap<String, Policy>,
}

impl InMemoryPolicyStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `policies`.
    pub async fn seeded(policies: impl IntoIterator<Item = Policy>) -> Self {
        let store = Self::new();
        for policy in policies {
            store.upsert(policy).await;
        }
        store
    }
}

#[async_trait::async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get(&self, name: &str) -> Option<Policy> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    async fn upsert(&self, mut policy: Policy) -> u64 {
        let name = policy.name.clone();
        // The entry guard holds the shard lock across the read and the write
        let revision = match self.by_name.entry(name.clone()) {
            Entry::Occupied(mut entry) => {
                policy.revision = entry.get().revision + 1;
                let revision = policy.revision;
                entry.insert(policy);
                revision
            }
            Entry::Vacant(entry) => {
                policy.revision = 1;
                entry.insert(policy);
                1
            }
        };
        debug!(policy = %name, revision, "Stored join policy");
        revision
    }

    async fn remove(&self, name: &str) -> bool {
        self.by_name.remove(name).is_some()
    }

    async fn list(&self) -> Vec<Policy> {
        let mut policies: Vec<Policy> = self.by_name.iter().map(|e| e.value().clone()).collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        policies
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.by_name.len();
        self.by_name.retain(|name, policy| {
            let keep = !policy.is_expired_at(now);
            if !keep {
                debug!(policy = %name, "Reaped expired join policy");
            }
            keep
        });
        before - self.by_name.len()
    }
}

/// Spawn a background task that reaps expired policies every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn PolicyStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired(Utc::now()).await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired join policies");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Policy reaper shutting down");
                    break;
                }
            }
        }
    });
}
