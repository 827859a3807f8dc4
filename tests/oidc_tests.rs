//! OIDC discovery and ID token verification against a local provider
//!
//! Tokens are signed with freshly generated P-256 keys published through a
//! JWKS endpoint whose contents the tests can rotate.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{Json, Router, routing::get};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rcgen::KeyPair;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use tke_gateway::config::OidcConfig;
use tke_gateway::oidc::{
    OidcError, OidcSession, OidcVerifier, ProviderMetadata, TENANT_ID_KEY, TokenAuthenticator,
};

/// ES256 signing key with its `kid`
struct Signer {
    kid: &'static str,
    key: KeyPair,
}

impl Signer {
    fn new(kid: &'static str) -> Self {
        Self {
            kid,
            key: KeyPair::generate().unwrap(),
        }
    }

    fn jwk(&self) -> Value {
        // Uncompressed SEC1 point: 0x04 || x || y
        let raw = self.key.public_key_raw();
        json!({
            "kty": "EC",
            "crv": "P-256",
            "use": "sig",
            "alg": "ES256",
            "kid": self.kid,
            "x": URL_SAFE_NO_PAD.encode(&raw[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&raw[33..65]),
        })
    }

    fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.kid.to_string());
        let key = EncodingKey::from_ec_pem(self.key.serialize_pem().as_bytes()).unwrap();
        jsonwebtoken::encode(&header, claims, &key).unwrap()
    }
}

/// Local provider serving discovery and a rotatable key set
struct Provider {
    issuer: String,
    keys: Arc<Mutex<Vec<Value>>>,
    fetches: Arc<AtomicUsize>,
}

impl Provider {
    async fn start(keys: Vec<Value>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let issuer = format!("http://{}/oidc", listener.local_addr().unwrap());
        let keys = Arc::new(Mutex::new(keys));
        let fetches = Arc::new(AtomicUsize::new(0));

        let document = json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/auth"),
            "token_endpoint": format!("{issuer}/token"),
            "jwks_uri": format!("{issuer}/keys"),
            "userinfo_endpoint": format!("{issuer}/userinfo"),
            "scopes_supported": ["openid", "groups", "offline_access"],
            "response_types_supported": ["code"],
        });
        let served_keys = Arc::clone(&keys);
        let counter = Arc::clone(&fetches);
        let router = Router::new()
            .route(
                "/oidc/.well-known/openid-configuration",
                get(move || {
                    let document = document.clone();
                    async move { Json(document) }
                }),
            )
            .route(
                "/oidc/keys",
                get(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let keys = served_keys.lock().clone();
                    async move { Json(json!({ "keys": keys })) }
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            issuer,
            keys,
            fetches,
        }
    }

    fn config(&self) -> OidcConfig {
        OidcConfig {
            issuer_url: self.issuer.clone(),
            client_id: "tke".to_string(),
            client_secret: "s3cret".to_string(),
            ..OidcConfig::default()
        }
    }

    async fn verifier(&self) -> OidcVerifier {
        let config = self.config();
        let session = OidcSession::discover(&config).await.unwrap();
        OidcVerifier::new(&config, session.metadata(), session.http().clone())
    }

    fn claims(&self, overrides: &Value) -> Value {
        let now = Utc::now().timestamp();
        let mut claims = json!({
            "iss": self.issuer,
            "aud": "tke",
            "sub": "u-42",
            "name": "bob",
            "email": "bob@example.com",
            "groups": ["dev", "tenant-a:admins"],
            "federated_claims": {"connector_id": "tenant-a", "user_id": "bob"},
            "iat": now,
            "exp": now + 600,
        });
        if let (Some(base), Some(extra)) = (claims.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        claims
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_discovery_reads_provider_document() {
    let provider = Provider::start(vec![]).await;

    let session = OidcSession::discover(&provider.config()).await.unwrap();

    let metadata = session.metadata();
    assert_eq!(metadata.issuer, provider.issuer);
    assert_eq!(metadata.token_endpoint, format!("{}/token", provider.issuer));
    assert_eq!(metadata.jwks_uri, format!("{}/keys", provider.issuer));
    assert_eq!(metadata.scopes_supported.len(), 3);
}

#[tokio::test]
async fn test_discovery_rejects_foreign_issuer() {
    let provider = Provider::start(vec![]).await;
    let client = reqwest::Client::new();

    // Same document, reached under a different configured issuer
    let aliased = provider.issuer.replace("127.0.0.1", "localhost");
    let err = ProviderMetadata::discover(&client, &aliased).await.unwrap_err();
    assert!(matches!(err, OidcError::IssuerMismatch { .. }), "{err}");

    let err = ProviderMetadata::discover(&client, &format!("{}/missing", provider.issuer))
        .await
        .unwrap_err();
    assert!(matches!(err, OidcError::Endpoint { status: 404, .. }), "{err}");
}

#[tokio::test]
async fn test_verified_token_maps_to_identity() {
    let signer = Signer::new("k1");
    let provider = Provider::start(vec![signer.jwk()]).await;
    let verifier = provider.verifier().await;

    let token = signer.sign(&provider.claims(&json!({})));
    let identity = verifier.authenticate_token(&token).await.unwrap().unwrap();

    assert_eq!(identity.name, "bob");
    assert_eq!(identity.uid, "u-42");
    assert_eq!(identity.groups, vec!["dev", "tenant-a:admins"]);
    assert_eq!(identity.extra[TENANT_ID_KEY], vec!["tenant-a"]);
}

#[tokio::test]
async fn test_key_rotation_refreshes_jwks_once() {
    // GIVEN: a verifier that has cached a key set holding only k1
    let old = Signer::new("k1");
    let new = Signer::new("k2");
    let provider = Provider::start(vec![old.jwk()]).await;
    let verifier = provider.verifier().await;
    let claims = provider.claims(&json!({}));

    assert!(verifier.authenticate_token(&old.sign(&claims)).await.unwrap().is_some());
    assert_eq!(provider.fetches(), 1);

    // WHEN: the provider rotates in k2
    provider.keys.lock().push(new.jwk());

    // THEN: the unknown kid triggers exactly one refetch, after which both
    // keys are served from cache
    assert!(verifier.authenticate_token(&new.sign(&claims)).await.unwrap().is_some());
    assert_eq!(provider.fetches(), 2);
    assert!(verifier.authenticate_token(&old.sign(&claims)).await.unwrap().is_some());
    assert!(verifier.authenticate_token(&new.sign(&claims)).await.unwrap().is_some());
    assert_eq!(provider.fetches(), 2);
}

#[tokio::test]
async fn test_invalid_tokens_are_rejected_not_errors() {
    let signer = Signer::new("k1");
    let stranger = Signer::new("k1");
    let provider = Provider::start(vec![signer.jwk()]).await;
    let verifier = provider.verifier().await;
    let expired_at = Utc::now().timestamp() - 3600;

    let cases = [
        ("wrong audience", signer.sign(&provider.claims(&json!({"aud": "other"})))),
        ("wrong issuer", signer.sign(&provider.claims(&json!({"iss": "https://evil"})))),
        ("expired", signer.sign(&provider.claims(&json!({"exp": expired_at})))),
        ("forged signature", stranger.sign(&provider.claims(&json!({})))),
        ("unknown kid", Signer::new("k9").sign(&provider.claims(&json!({})))),
        ("not a jwt", "not-a-jwt".to_string()),
    ];
    for (name, token) in cases {
        let result = verifier.authenticate_token(&token).await;
        assert!(matches!(result, Ok(None)), "{name}: {result:?}");
    }
}

#[tokio::test]
async fn test_token_without_username_is_rejected() {
    let signer = Signer::new("k1");
    let provider = Provider::start(vec![signer.jwk()]).await;
    let verifier = provider.verifier().await;

    let token = signer.sign(&provider.claims(&json!({"name": ""})));
    assert_eq!(verifier.authenticate_token(&token).await.unwrap(), None);
}

#[tokio::test]
async fn test_unreachable_jwks_is_an_error() {
    let signer = Signer::new("k1");
    let provider = Provider::start(vec![signer.jwk()]).await;
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let metadata = ProviderMetadata {
        issuer: provider.issuer.clone(),
        authorization_endpoint: format!("{}/auth", provider.issuer),
        token_endpoint: format!("{}/token", provider.issuer),
        jwks_uri: format!("http://{closed}/keys"),
        userinfo_endpoint: None,
        end_session_endpoint: None,
        scopes_supported: vec![],
    };
    let verifier = OidcVerifier::new(&provider.config(), &metadata, reqwest::Client::new());

    let token = signer.sign(&provider.claims(&json!({})));
    let err = verifier.authenticate_token(&token).await.unwrap_err();
    assert!(!err.is_rejection());
    assert!(matches!(
        tke_gateway::Error::from(err),
        tke_gateway::Error::Upstream(_)
    ));
}
