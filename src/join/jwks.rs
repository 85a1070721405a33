//! JWT verification against provider JWKS, shared by the concrete validators.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification); reject unsupported algorithms.
//! 2. Peek at the unverified `iss` claim and compare it with the issuer the
//!    policy expects. A mismatch fails before any network I/O.
//! 3. Fetch the provider's JWKS (cached; refreshed once on unknown `kid`).
//! 4. Verify the signature and the standard claims (`exp`, `iss`, `aud`, `sub`).
//!
//! # Security properties
//!
//! - JWKS fetched only over HTTPS (`https_only` on the client).
//! - Unknown `kid` triggers a single cache refresh before failing.
//! - Clock leeway of 60 seconds tolerates minor skew with the provider.
//! - Only asymmetric algorithms are accepted; symmetric keys in a JWKS are ignored.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::claims::ClaimsError;

/// Clock skew tolerance applied to `exp`/`nbf`/`iat`.
const LEEWAY_SECS: u64 = 60;

/// Cached JWKS entry.
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
    /// Seeded entries are never re-fetched.
    pinned: bool,
}

/// JWKS cache, one entry per JWKS URI.
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    ttl: Duration,
}

impl JwksCache {
    /// Create a cache whose entries live for `ttl`, fetching with `fetch_timeout`.
    #[must_use]
    pub fn new(ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            http: reqwest::Client::builder()
                .https_only(true)
                .timeout(fetch_timeout)
                .build()
                .unwrap_or_default(),
            ttl,
        }
    }

    /// Pin a key set for `jwks_uri`. Pinned sets are never fetched or refreshed.
    pub fn seed(&self, jwks_uri: &str, keys: JwkSet) {
        self.inner.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys,
                fetched_at: Instant::now(),
                pinned: true,
            },
        );
    }

    /// Return the cached JWKS for `jwks_uri`, fetching it if absent or stale.
    ///
    /// If `force_refresh` is `true`, an unpinned entry is re-fetched regardless of TTL.
    pub async fn get_or_fetch(
        &self,
        jwks_uri: &str,
        force_refresh: bool,
    ) -> Result<JwkSet, ClaimsError> {
        if let Some(cached) = self.inner.get(jwks_uri) {
            if cached.pinned || (!force_refresh && cached.fetched_at.elapsed() < self.ttl) {
                return Ok(cached.keys.clone());
            }
        }

        debug!(jwks_uri = %jwks_uri, "Fetching JWKS");
        let jwks: JwkSet = self
            .http
            .get(jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        self.inner.insert(
            jwks_uri.to_string(),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
                pinned: false,
            },
        );

        Ok(jwks)
    }
}

/// What a token must prove, derived from the policy and provider.
#[derive(Debug, Clone, Copy)]
pub struct Expectation<'a> {
    /// Exact `iss` value.
    pub issuer: &'a str,
    /// Where the issuer publishes its signing keys.
    pub jwks_uri: &'a str,
    /// Required `aud` value.
    pub audience: &'a str,
}

/// Signature and standard-claims verifier backed by a shared [`JwksCache`].
#[derive(Clone)]
pub struct JwtVerifier {
    cache: Arc<JwksCache>,
}

impl JwtVerifier {
    /// Create a verifier over `cache`.
    #[must_use]
    pub fn new(cache: Arc<JwksCache>) -> Self {
        Self { cache }
    }

    /// Verify `token` against `expect` and deserialize its claims as `C`.
    pub async fn verify<C: DeserializeOwned>(
        &self,
        token: &str,
        expect: &Expectation<'_>,
    ) -> Result<C, ClaimsError> {
        let header =
            jsonwebtoken::decode_header(token).map_err(|e| ClaimsError::Malformed(e.to_string()))?;
        let alg = accepted_algorithm(header.alg)?;

        let issuer = peek_issuer(token)?;
        if issuer != expect.issuer {
            return Err(ClaimsError::IssuerMismatch {
                expected: expect.issuer.to_string(),
                actual: issuer,
            });
        }

        let kid = header.kid.ok_or(ClaimsError::MissingKeyId)?;
        let key = self.find_decoding_key(&kid, expect.jwks_uri).await?;

        let mut validation = Validation::new(alg);
        validation.leeway = LEEWAY_SECS;
        validation.set_issuer(&[expect.issuer]);
        validation.set_audience(&[expect.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let data = jsonwebtoken::decode::<C>(token, &key, &validation)?;
        Ok(data.claims)
    }

    /// Find a decoding key by `kid`, refreshing the JWKS once if not found.
    async fn find_decoding_key(&self, kid: &str, jwks_uri: &str) -> Result<DecodingKey, ClaimsError> {
        let jwks = self.cache.get_or_fetch(jwks_uri, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.cache.get_or_fetch(jwks_uri, true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| ClaimsError::UnknownKeyId(kid.to_string()))
    }
}

fn accepted_algorithm(alg: Algorithm) -> Result<Algorithm, ClaimsError> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::ES256
        | Algorithm::ES384 => Ok(alg),
        other => Err(ClaimsError::UnsupportedAlgorithm(format!("{other:?}"))),
    }
}

/// Read `iss` from the payload without verifying the signature.
fn peek_issuer(token: &str) -> Result<String, ClaimsError> {
    #[derive(Deserialize)]
    struct IssuerOnly {
        iss: String,
    }

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ClaimsError::Malformed("missing payload segment".to_string()))?;
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, payload)
        .map_err(|e| ClaimsError::Malformed(format!("payload is not base64url: {e}")))?;
    serde_json::from_slice::<IssuerOnly>(&bytes)
        .map(|claims| claims.iss)
        .map_err(|e| ClaimsError::Malformed(format!("payload has no issuer: {e}")))
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks
        .keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))?;

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y).ok(),
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}
