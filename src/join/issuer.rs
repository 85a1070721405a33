//! Credential issuance: the final step of a successful join.
//!
//! The [`CredentialIssuer`] trait is what the orchestrator calls once a
//! request is authorized. The bundled [`BearerCredentialIssuer`] mints opaque
//! bearer credentials bound to the caller's public keys and keeps them in a
//! [`CredentialStore`].
//!
//! # Store design
//!
//! Credentials are indexed by their **opaque bearer value** for O(1)
//! validation, *and* by their **id** for O(1) revocation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use join_core::Claims;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::policy::Role;

/// Public key material supplied by the joining machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicKeys {
    /// TLS public key (PEM or DER, opaque here).
    pub tls: Vec<u8>,
    /// SSH public key in `authorized_keys` format (opaque here).
    pub ssh: Vec<u8>,
}

impl PublicKeys {
    /// `true` when neither key was supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tls.is_empty() && self.ssh.is_empty()
    }
}

/// Everything the issuer needs to mint a credential.
#[derive(Debug, Clone, Copy)]
pub struct IssueRequest<'a> {
    /// Policy that admitted the request.
    pub policy: &'a str,
    /// Role being granted.
    pub role: Role,
    /// Host identifier chosen by the joining machine (may be empty).
    pub host_id: &'a str,
    /// Keys the credential is bound to.
    pub public_keys: &'a PublicKeys,
    /// Verified claims of the external identity.
    pub claims: &'a Claims,
}

/// An issued cluster credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Unique credential id (used for revocation).
    pub id: String,
    /// Opaque bearer value (`cij_<base64>`).
    pub token: String,
    /// Granted role.
    pub role: Role,
    /// Host identifier supplied at join time.
    pub host_id: String,
    /// External identity subject.
    pub subject: String,
    /// Policy that admitted the join.
    pub policy: String,
    /// SHA-256 of the TLS public key, hex. Empty if none supplied.
    pub tls_key_fingerprint: String,
    /// SHA-256 of the SSH public key, hex. Empty if none supplied.
    pub ssh_key_fingerprint: String,
    /// Issued-at.
    pub issued_at: DateTime<Utc>,
    /// Expires-at.
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Returns `true` if the credential has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Error variants for credential issuance.
#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    /// The configured lifetime cannot be represented.
    #[error("invalid credential lifetime: {0:?}")]
    InvalidTtl(Duration),
}

/// Produces the credential returned to an authorized caller.
#[async_trait::async_trait]
pub trait CredentialIssuer: Send + Sync + 'static {
    /// Mint a credential for an authorized request.
    async fn issue(&self, request: IssueRequest<'_>) -> Result<Credential, IssueError>;
}

/// In-memory credential store backed by two `DashMap` indices.
///
/// - `by_token`: bearer value → `Credential`  (O(1) validation)
/// - `by_id`:    credential id → bearer value  (O(1) revocation)
#[derive(Default)]
pub struct CredentialStore {
    by_token: DashMap<String, Credential>,
    by_id: DashMap<String, String>,
}

impl CredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly issued credential.
    pub fn insert(&self, credential: Credential) {
        self.by_id
            .insert(credential.id.clone(), credential.token.clone());
        self.by_token.insert(credential.token.clone(), credential);
    }

    /// Look up a credential by bearer value; expired entries are evicted.
    #[must_use]
    pub fn get(&self, token: &str) -> Option<Credential> {
        let credential = self.by_token.get(token)?.clone();

        if credential.is_expired() {
            self.by_token.remove(token);
            self.by_id.remove(&credential.id);
            debug!(id = %credential.id, "Lazy-evicted expired credential");
            return None;
        }

        Some(credential)
    }

    /// Revoke a credential by id. Returns `true` if it existed.
    pub fn revoke(&self, id: &str) -> bool {
        if let Some((_, token)) = self.by_id.remove(id) {
            self.by_token.remove(&token);
            true
        } else {
            false
        }
    }

    /// Number of stored credentials (including not-yet-reaped expired ones).
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    /// `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    /// Remove all expired credentials.
    pub fn reap_expired(&self) -> usize {
        let expired: Vec<String> = self
            .by_token
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();

        let count = expired.len();
        for token in expired {
            if let Some((_, credential)) = self.by_token.remove(&token) {
                self.by_id.remove(&credential.id);
                debug!(id = %credential.id, "Reaped expired credential");
            }
        }
        count
    }
}

/// Spawn a background task that reaps expired credentials every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<CredentialStore>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired();
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired credentials");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Credential reaper shutting down");
                    break;
                }
            }
        }
    });
}

/// Issuer minting opaque bearer credentials into a [`CredentialStore`].
pub struct BearerCredentialIssuer {
    store: Arc<CredentialStore>,
    ttl: Duration,
}

impl BearerCredentialIssuer {
    /// Create an issuer whose credentials live for `ttl`.
    #[must_use]
    pub fn new(store: Arc<CredentialStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Generate a cryptographically random opaque bearer value.
    ///
    /// Format: `cij_<43-char URL-safe base64>` (256 bits of entropy). The
    /// prefix makes credentials detectable by secret scanners.
    #[must_use]
    pub fn generate_bearer() -> String {
        let random_bytes: [u8; 32] = rand::rng().random();
        format!(
            "cij_{}",
            base64::Engine::encode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                random_bytes,
            )
        )
    }
}

/// Hex SHA-256 of `key`, or an empty string for an empty key.
#[must_use]
pub fn fingerprint(key: &[u8]) -> String {
    if key.is_empty() {
        return String::new();
    }
    hex::encode(Sha256::digest(key))
}

#[async_trait::async_trait]
impl CredentialIssuer for BearerCredentialIssuer {
    async fn issue(&self, request: IssueRequest<'_>) -> Result<Credential, IssueError> {
        let ttl = chrono::Duration::from_std(self.ttl).map_err(|_| IssueError::InvalidTtl(self.ttl))?;
        let issued_at = Utc::now();

        let credential = Credential {
            id: uuid::Uuid::new_v4().to_string(),
            token: Self::generate_bearer(),
            role: request.role,
            host_id: request.host_id.to_string(),
            subject: request.claims.subject.clone(),
            policy: request.policy.to_string(),
            tls_key_fingerprint: fingerprint(&request.public_keys.tls),
            ssh_key_fingerprint: fingerprint(&request.public_keys.ssh),
            issued_at,
            expires_at: issued_at + ttl,
        };

        self.store.insert(credential.clone());
        Ok(credential)
    }
}
