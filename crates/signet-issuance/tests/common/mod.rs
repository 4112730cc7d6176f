//! Shared fixtures: a wiremock OIDC issuer, a wiremock CT log, a counting
//! authority, caller key pairs and an in-process server.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_ASN1_SIGNING, ECDSA_P256_SHA256_FIXED_SIGNING,
};
use serde_json::{json, Value};
use signet_issuance::api::{self, ApiState};
use signet_issuance::{
    CaError, CertificateAuthority, CertificateChain, EphemeralCa, IdentityType, IssuanceContext,
    IssuanceCoordinator, IssuerConfig, IssuerRegistry, PublicKey, TokenVerifier, TransparencyLog,
    TrustBundle, VerifiedIdentity, VerifierConfig,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CLIENT_ID: &str = "sigstore";

const RSA_FIXTURE_PEM: &str = include_str!("../fixtures/rsa2048.pk8.pem");
const RSA_FIXTURE_JWK: &str = include_str!("../fixtures/rsa2048.jwk.json");

pub fn now() -> u64 {
    jsonwebtoken::get_current_timestamp()
}

// ---------------------------------------------------------------------------
// Token signing keys
// ---------------------------------------------------------------------------

/// A key the test issuer signs tokens with.
pub struct TokenKey {
    kid: String,
    alg: Algorithm,
    encoding: EncodingKey,
    jwk: Value,
}

impl TokenKey {
    /// Fresh P-256 key.
    pub fn es256(kid: &str) -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .unwrap();
        // Uncompressed point: 0x04 || x || y.
        let point = pair.public_key().as_ref();
        let jwk = json!({
            "kty": "EC",
            "crv": "P-256",
            "use": "sig",
            "alg": "ES256",
            "kid": kid,
            "x": URL_SAFE_NO_PAD.encode(&point[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&point[33..65]),
        });
        Self {
            kid: kid.to_string(),
            alg: Algorithm::ES256,
            encoding: EncodingKey::from_ec_der(pkcs8.as_ref()),
            jwk,
        }
    }

    /// The checked-in RSA-2048 fixture.
    pub fn rs256() -> Self {
        let jwk: Value = serde_json::from_str(RSA_FIXTURE_JWK).unwrap();
        Self {
            kid: jwk["kid"].as_str().unwrap().to_string(),
            alg: Algorithm::RS256,
            encoding: EncodingKey::from_rsa_pem(RSA_FIXTURE_PEM.as_bytes()).unwrap(),
            jwk,
        }
    }

    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(self.alg);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding).unwrap()
    }

    pub fn jwk(&self) -> &Value {
        &self.jwk
    }

    /// Signs with no `kid` in the header, so the verifier has to try every key.
    pub fn sign_without_kid(&self, claims: &Value) -> String {
        encode(&Header::new(self.alg), claims, &self.encoding).unwrap()
    }
}

// ---------------------------------------------------------------------------
// OIDC issuer
// ---------------------------------------------------------------------------

/// A wiremock server publishing discovery metadata and a JWKS.
pub struct TestIssuer {
    pub server: MockServer,
    pub key: TokenKey,
}

impl TestIssuer {
    pub async fn start(key: TokenKey) -> Self {
        let server = MockServer::start().await;
        let issuer = Self { server, key };
        issuer.mount_discovery(&issuer.url()).await;
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keys": [issuer.key.jwk.clone()],
            })))
            .mount(&issuer.server)
            .await;
        issuer
    }

    /// An issuer whose discovery document names somebody else.
    pub async fn start_impostor(key: TokenKey) -> Self {
        let server = MockServer::start().await;
        let issuer = Self { server, key };
        issuer.mount_discovery("https://elsewhere.example").await;
        issuer
    }

    async fn mount_discovery(&self, issuer_name: &str) {
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer_name,
                "jwks_uri": format!("{}/jwks", self.url()),
            })))
            .mount(&self.server)
            .await;
    }

    pub fn url(&self) -> String {
        self.server.uri()
    }

    pub fn config(&self, identity_type: IdentityType) -> IssuerConfig {
        IssuerConfig::new(self.url(), CLIENT_ID, identity_type)
    }

    /// Standard claims valid for five minutes, merged with `extra`.
    pub fn claims(&self, extra: Value) -> Value {
        let mut claims = json!({
            "iss": self.url(),
            "aud": CLIENT_ID,
            "iat": now(),
            "exp": now() + 300,
        });
        if let (Some(base), Value::Object(extra)) = (claims.as_object_mut(), extra) {
            base.extend(extra);
        }
        claims
    }

    pub fn token(&self, extra: Value) -> String {
        self.key.sign(&self.claims(extra))
    }

    /// Publishes `keys` ahead of the JWKS mounted at start.
    pub async fn publish_keys(&self, keys: &[&TokenKey]) {
        let keys: Vec<Value> = keys.iter().map(|k| k.jwk.clone()).collect();
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"keys": keys})))
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    pub fn email_token(&self, email: &str) -> String {
        self.token(json!({"sub": "user-1", "email": email, "email_verified": true}))
    }

    pub async fn discovery_fetches(&self) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == "/.well-known/openid-configuration")
            .count()
    }
}

// ---------------------------------------------------------------------------
// CT log
// ---------------------------------------------------------------------------

pub fn sct_body() -> Value {
    json!({
        "sct_version": 0,
        "id": "a1b2c3d4",
        "timestamp": 1_700_000_000_000u64,
        "extensions": "",
        "signature": "BAMARjBEAiA=",
    })
}

/// A CT log that accepts every submission.
pub async fn accepting_log() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/add-chain"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sct_body()))
        .mount(&server)
        .await;
    server
}

/// A CT log answering every submission with `response`.
pub async fn log_responding(response: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/add-chain"))
        .respond_with(response)
        .mount(&server)
        .await;
    server
}

/// Submitted chain lengths, in order.
pub async fn submitted_chains(log: &MockServer) -> Vec<Vec<String>> {
    log.received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|r| {
            let body: Value = r.body_json().unwrap();
            body["chain"]
                .as_array()
                .unwrap()
                .iter()
                .map(|c| c.as_str().unwrap().to_string())
                .collect()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Authority
// ---------------------------------------------------------------------------

/// Wraps an authority and counts `issue` calls.
pub struct CountingAuthority {
    inner: EphemeralCa,
    pub calls: AtomicUsize,
}

impl CountingAuthority {
    pub fn new() -> Self {
        Self {
            inner: EphemeralCa::new().unwrap(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for CountingAuthority {
    async fn issue(
        &self,
        identity: &VerifiedIdentity,
        public_key: &PublicKey,
    ) -> Result<CertificateChain, CaError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.issue(identity, public_key).await
    }

    fn root(&self) -> &TrustBundle {
        self.inner.root()
    }
}

// ---------------------------------------------------------------------------
// Caller keys
// ---------------------------------------------------------------------------

/// The caller's signing key, whose public half goes into the certificate.
pub struct CallerKey {
    pair: EcdsaKeyPair,
    pub spki: Vec<u8>,
}

impl CallerKey {
    pub fn generate() -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8.as_ref(), &rng)
                .unwrap();
        let spki = {
            use rcgen::PublicKeyData;
            rcgen::KeyPair::try_from(pkcs8.as_ref())
                .unwrap()
                .subject_public_key_info()
        };
        Self { pair, spki }
    }

    pub fn prove(&self, subject: &str) -> Vec<u8> {
        self.pair
            .sign(&SystemRandom::new(), subject.as_bytes())
            .unwrap()
            .as_ref()
            .to_vec()
    }

    /// JSON body for `POST /api/v1/signingCert`.
    pub fn request_body(&self, subject: &str) -> Value {
        json!({
            "publicKey": {"content": STANDARD.encode(&self.spki), "algorithm": "ecdsa"},
            "possessionProof": STANDARD.encode(self.prove(subject)),
        })
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub fn context(
    issuers: Vec<IssuerConfig>,
    authority: Arc<dyn CertificateAuthority>,
    log: Arc<dyn TransparencyLog>,
) -> IssuanceContext {
    IssuanceContext::new(
        Arc::new(IssuerRegistry::new(issuers).unwrap()),
        authority,
        log,
    )
}

pub fn coordinator() -> Arc<IssuanceCoordinator> {
    Arc::new(IssuanceCoordinator::new(
        TokenVerifier::new(VerifierConfig::default()).unwrap(),
    ))
}

/// Serves the API on an ephemeral port and returns its base URL.
pub async fn spawn_server(context: IssuanceContext) -> String {
    let app = api::router(ApiState::new(coordinator(), context));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// POSTs a signing request and returns the status and JSON body.
pub async fn post_signing_cert(
    base_url: &str,
    route: &str,
    token: Option<&str>,
    body: &Value,
) -> (u16, Value) {
    let mut request = reqwest::Client::new()
        .post(format!("{base_url}{route}"))
        .json(body);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.unwrap();
    let status = response.status().as_u16();
    let body = response.json().await.unwrap();
    (status, body)
}
