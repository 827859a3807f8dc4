//! ID token verification: JWT signature validation and JWKS caching.
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Fetch the provider's JWKS (cached; refreshed once on unknown `kid`).
//! 3. Verify the signature plus `exp`, `iss` and `aud` with 60 s leeway.
//! 4. Map the claims to an [`Identity`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{
    Algorithm, DecodingKey, Header, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{ClaimMapping, Identity, OidcError, ProviderMetadata, TokenAuthenticator};
use crate::config::OidcConfig;

/// Cached JWKS entry
struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS cache keyed by `jwks_uri`
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    ttl: Duration,
}

impl JwksCache {
    /// Create a cache that trusts a fetched key set for `ttl`
    #[must_use]
    pub fn new(http: reqwest::Client, ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            http,
            ttl,
        }
    }

    /// Return the cached JWKS, or fetch it if stale or `force_refresh` is set.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError::Http`] if the key set cannot be fetched.
    pub async fn get_or_fetch(
        &self,
        jwks_uri: &str,
        force_refresh: bool,
    ) -> Result<JwkSet, OidcError> {
        if !force_refresh
            && let Some(cached) = self.inner.get(jwks_uri)
            && cached.fetched_at.elapsed() < self.ttl
        {
            return Ok(cached.keys.clone());
        }

        debug!(jwks_uri = %jwks_uri, force_refresh, "Fetching JWKS");
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
            },
        );

        Ok(jwks)
    }
}

/// Verifies ID tokens issued to this gateway's client
pub struct OidcVerifier {
    issuer: String,
    client_id: String,
    jwks_uri: String,
    jwks_cache: JwksCache,
    mapping: ClaimMapping,
}

impl OidcVerifier {
    /// Create a verifier for the discovered provider
    #[must_use]
    pub fn new(config: &OidcConfig, metadata: &ProviderMetadata, http: reqwest::Client) -> Self {
        Self {
            issuer: metadata.issuer.clone(),
            client_id: config.client_id.clone(),
            jwks_uri: metadata.jwks_uri.clone(),
            jwks_cache: JwksCache::new(http, config.jwks_cache_ttl),
            mapping: ClaimMapping::from(config),
        }
    }

    /// Verify signature and standard claims, returning the raw claim set.
    ///
    /// # Errors
    ///
    /// Returns [`OidcError`] if the token is malformed, expired, issued by or
    /// for someone else, signed with an unknown key, or the JWKS cannot be
    /// fetched.
    pub async fn verify(&self, token: &str) -> Result<Map<String, Value>, OidcError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.clone().ok_or(OidcError::MissingKeyId)?;
        let decoding_key = self.find_decoding_key(&kid).await?;

        let validation = build_validation(&header, &self.issuer, &self.client_id);
        let data: TokenData<Map<String, Value>> =
            jsonwebtoken::decode(token, &decoding_key, &validation)?;
        Ok(data.claims)
    }

    /// Find a decoding key by `kid`, refreshing the JWKS cache if not found.
    async fn find_decoding_key(&self, kid: &str) -> Result<DecodingKey, OidcError> {
        let jwks = self.jwks_cache.get_or_fetch(&self.jwks_uri, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not found in cached JWKS, refreshing");
        let jwks = self.jwks_cache.get_or_fetch(&self.jwks_uri, true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| OidcError::UnknownKeyId(kid.to_string()))
    }
}

#[async_trait]
impl TokenAuthenticator for OidcVerifier {
    async fn authenticate_token(&self, token: &str) -> Result<Option<Identity>, OidcError> {
        match self.verify(token).await {
            Ok(claims) => {
                let identity = self.mapping.map(&claims);
                if identity.is_none() {
                    warn!(claim = %self.mapping.username_claim, "ID token lacks username claim");
                }
                Ok(identity)
            }
            Err(e) if e.is_rejection() => {
                debug!(error = %e, "Bearer token rejected");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Expiry of a JWT read without verifying it.
///
/// Used only to size the session cookie when the token response omits
/// `expires_in`.
#[must_use]
pub fn unverified_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Map<String, Value> = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks
        .keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))?;

    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
    }
}

/// Build a [`Validation`] from the JWT header algorithm.
fn build_validation(header: &Header, issuer: &str, audience: &str) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        other => {
            warn!(alg = ?other, "Unsupported JWT algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut v = Validation::new(alg);
    v.leeway = 60;
    v.set_issuer(&[issuer]);
    v.set_audience(&[audience]);
    v
}
