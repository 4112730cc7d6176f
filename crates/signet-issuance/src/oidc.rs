//! OIDC identity token verification.
//!
//! Tokens are checked against the signing keys their issuer publishes through
//! OIDC discovery. The flow for each token is:
//!
//! 1. Decode the header and the `iss` claim without trusting either
//! 2. Look up the issuer in the [`IssuerRegistry`]
//! 3. Fetch (or reuse) the issuer's JWKS via `{issuer}/.well-known/openid-configuration`
//! 4. Verify the signature with the key named by `kid`, or every key when the
//!    token carries none
//! 5. Check `exp` (no leeway) and `iat`/`nbf` (60 s leeway for clock skew)
//! 6. Check that `aud` contains the issuer's configured client id
//! 7. Derive the subject according to the issuer's [`IdentityType`]
//!
//! Failures to reach the issuer surface as [`OidcError::IssuerUnreachable`]
//! (upstream class), distinct from credential errors. Nothing is retried.
//!
//! # Security Model
//!
//! - **Issuer allowlist**: only issuers present in the registry are contacted
//! - **Asymmetric only**: HMAC-signed tokens are rejected outright
//! - **Per-issuer key sets**: a key published by one issuer never verifies another's token
//! - **Verified subject only**: the subject is read from verified claims, never the request

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::{Jwk, PublicKeyUse};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{IdentityType, IssuerConfig, IssuerRegistry};
use crate::identity::{SpiffeId, SubjectKind, VerifiedIdentity, WorkflowAttributes};
use crate::ErrorClass;

/// How long a fetched JWKS is trusted before it is fetched again.
pub const DEFAULT_JWKS_TTL: Duration = Duration::from_secs(3600);

/// Timeout for discovery and JWKS requests.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Allowed clock skew for `iat` and `nbf`.
pub const DEFAULT_ISSUED_AT_LEEWAY: Duration = Duration::from_secs(60);

/// Minimum age of a cached JWKS before an unknown `kid` forces a refetch.
const MIN_FORCED_REFRESH_AGE: Duration = Duration::from_secs(30);

// ═══════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

/// Tunables for [`TokenVerifier`].
#[derive(Clone, Debug)]
pub struct VerifierConfig {
    /// How long to cache each issuer's JWKS.
    pub jwks_ttl: Duration,
    /// Timeout for outbound discovery and JWKS requests.
    pub http_timeout: Duration,
    /// Allowed clock skew for `iat` and `nbf`.
    pub issued_at_leeway: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            jwks_ttl: DEFAULT_JWKS_TTL,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            issued_at_leeway: DEFAULT_ISSUED_AT_LEEWAY,
        }
    }
}

impl VerifierConfig {
    /// Set the JWKS cache TTL.
    pub fn with_jwks_ttl(mut self, ttl: Duration) -> Self {
        self.jwks_ttl = ttl;
        self
    }

    /// Set the outbound HTTP timeout.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Set the allowed clock skew for `iat` and `nbf`.
    pub fn with_issued_at_leeway(mut self, leeway: Duration) -> Self {
        self.issued_at_leeway = leeway;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CLAIMS
// ═══════════════════════════════════════════════════════════════════════════

/// The only claim read before the signature is checked.
#[derive(Debug, Deserialize)]
struct UntrustedClaims {
    iss: Option<String>,
}

/// `aud` may be a single string or an array of strings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn contains(&self, client_id: &str) -> bool {
        match self {
            Audience::One(aud) => aud == client_id,
            Audience::Many(auds) => auds.iter().any(|a| a == client_id),
        }
    }
}

/// Claims read after the signature has been verified.
#[derive(Debug, Clone, Deserialize)]
struct TokenClaims {
    iss: String,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    aud: Option<Audience>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    iat: Option<u64>,
    #[serde(default)]
    nbf: Option<u64>,
    /// Everything else, consumed by identity-type specific extraction.
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TokenClaims {
    fn string(&self, name: &str) -> Option<&str> {
        self.extra.get(name).and_then(Value::as_str)
    }

    fn required(&self, name: &str) -> Result<&str, OidcError> {
        self.string(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OidcError::ClaimInvalid(format!("missing {name} claim")))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// JWKS HANDLING
// ═══════════════════════════════════════════════════════════════════════════

/// Subset of the OIDC provider metadata document.
#[derive(Debug, Clone, Deserialize)]
struct ProviderMetadata {
    issuer: String,
    jwks_uri: String,
}

/// Raw JWKS document; keys are parsed one by one so an unsupported key type
/// does not poison the whole set.
#[derive(Debug, Deserialize)]
struct RawJwkSet {
    keys: Vec<Value>,
}

/// Signing keys of one issuer, refreshed through OIDC discovery.
///
/// Readers share `state`; only the holder of `refresh_lock` fetches, so a
/// burst of requests against a cold cache triggers a single fetch.
pub struct JwksCache {
    issuer_url: String,
    state: RwLock<JwksCacheState>,
    refresh_lock: Mutex<()>,
    cache_duration: Duration,
}

struct JwksCacheState {
    keys: Arc<Vec<Jwk>>,
    last_fetch: Option<Instant>,
}

impl JwksCache {
    /// Create an empty cache for `issuer_url`.
    pub fn new(issuer_url: impl Into<String>, cache_duration: Duration) -> Self {
        Self {
            issuer_url: issuer_url.into(),
            state: RwLock::new(JwksCacheState {
                keys: Arc::new(Vec::new()),
                last_fetch: None,
            }),
            refresh_lock: Mutex::new(()),
            cache_duration,
        }
    }

    /// Returns the issuer's signing keys, fetching them if the cache is stale.
    ///
    /// With `force`, a cache older than a short minimum age is refetched
    /// regardless of its TTL (used when a token names an unknown `kid`).
    pub async fn keys(
        &self,
        http: &reqwest::Client,
        force: bool,
    ) -> Result<Arc<Vec<Jwk>>, OidcError> {
        if self.needs_refresh(force).await {
            let _refresh_guard = self.refresh_lock.lock().await;

            // Another task may have refreshed while we waited.
            if self.needs_refresh(force).await {
                self.refresh(http).await?;
            }
        }

        Ok(Arc::clone(&self.state.read().await.keys))
    }

    async fn needs_refresh(&self, force: bool) -> bool {
        let state = self.state.read().await;
        match state.last_fetch {
            None => true,
            Some(t) if force => t.elapsed() > MIN_FORCED_REFRESH_AGE,
            Some(t) => t.elapsed() > self.cache_duration,
        }
    }

    /// Fetch discovery metadata and then the JWKS.
    ///
    /// MUST be called while holding refresh_lock.
    async fn refresh(&self, http: &reqwest::Client) -> Result<(), OidcError> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.issuer_url.trim_end_matches('/')
        );
        debug!(issuer = %self.issuer_url, url = %discovery_url, "fetching OIDC discovery document");

        let metadata: ProviderMetadata = fetch_json(http, &discovery_url).await?;
        if metadata.issuer.trim_end_matches('/') != self.issuer_url.trim_end_matches('/') {
            return Err(OidcError::DiscoveryInvalid(format!(
                "discovery document names issuer {}",
                metadata.issuer
            )));
        }

        let raw: RawJwkSet = fetch_json(http, &metadata.jwks_uri).await?;
        let keys: Vec<Jwk> = raw
            .keys
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<Jwk>(value) {
                Ok(jwk) => Some(jwk),
                Err(e) => {
                    debug!(issuer = %self.issuer_url, error = %e, "skipping unsupported JWK");
                    None
                }
            })
            .filter(|jwk| {
                !matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption))
            })
            .collect();

        info!(issuer = %self.issuer_url, keys = keys.len(), "loaded issuer JWKS");

        {
            let mut state = self.state.write().await;
            state.keys = Arc::new(keys);
            state.last_fetch = Some(Instant::now());
        }

        Ok(())
    }
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksCache")
            .field("issuer_url", &self.issuer_url)
            .field("cache_duration", &self.cache_duration)
            .finish()
    }
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
) -> Result<T, OidcError> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| OidcError::IssuerUnreachable(format!("{url}: {e}")))?;

    if !response.status().is_success() {
        return Err(OidcError::IssuerUnreachable(format!(
            "{url}: HTTP {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| OidcError::DiscoveryInvalid(format!("{url}: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════
// VERIFIER
// ═══════════════════════════════════════════════════════════════════════════

/// Verifies identity tokens from registered issuers.
pub struct TokenVerifier {
    http: reqwest::Client,
    config: VerifierConfig,
    caches: RwLock<HashMap<String, Arc<JwksCache>>>,
}

impl TokenVerifier {
    /// Create a verifier with the given configuration.
    pub fn new(config: VerifierConfig) -> Result<Self, OidcError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| OidcError::IssuerUnreachable(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            http,
            config,
            caches: RwLock::new(HashMap::new()),
        })
    }

    /// Verify `token` against `registry` and return the identity it asserts.
    pub async fn verify(
        &self,
        registry: &IssuerRegistry,
        token: &str,
    ) -> Result<VerifiedIdentity, OidcError> {
        let header = decode_header(token).map_err(|e| OidcError::MalformedToken(e.to_string()))?;
        let issuer_url = untrusted_issuer(token)?;

        let issuer = registry
            .get(&issuer_url)
            .ok_or_else(|| OidcError::IssuerUnknown(issuer_url.clone()))?;

        if matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(OidcError::SignatureInvalid(format!(
                "symmetric algorithm {:?} not accepted",
                header.alg
            )));
        }

        let cache = self.cache_for(&issuer.issuer_url).await;
        let claims = self.verify_signature(&cache, &header, token).await?;

        if claims.iss != issuer.issuer_url {
            return Err(OidcError::ClaimInvalid(format!(
                "iss changed between untrusted and verified decode: {}",
                claims.iss
            )));
        }

        self.check_lifetime(&claims)?;

        let audience_ok = claims
            .aud
            .as_ref()
            .is_some_and(|aud| aud.contains(&issuer.client_id));
        if !audience_ok {
            return Err(OidcError::AudienceMismatch {
                expected: issuer.client_id.clone(),
            });
        }

        let identity = extract_identity(issuer, &claims)?;

        debug!(
            issuer = %identity.issuer(),
            subject = %identity.subject(),
            "identity token verified"
        );

        Ok(identity)
    }

    async fn cache_for(&self, issuer_url: &str) -> Arc<JwksCache> {
        if let Some(cache) = self.caches.read().await.get(issuer_url) {
            return Arc::clone(cache);
        }
        let mut caches = self.caches.write().await;
        Arc::clone(caches.entry(issuer_url.to_string()).or_insert_with(|| {
            Arc::new(JwksCache::new(issuer_url, self.config.jwks_ttl))
        }))
    }

    async fn verify_signature(
        &self,
        cache: &JwksCache,
        header: &Header,
        token: &str,
    ) -> Result<TokenClaims, OidcError> {
        let keys = cache.keys(&self.http, false).await?;
        let keys = match &header.kid {
            Some(kid) if !keys.iter().any(|k| k.common.key_id.as_deref() == Some(kid.as_str())) => {
                debug!(kid = %kid, "unknown key id, refetching JWKS");
                cache.keys(&self.http, true).await?
            }
            _ => keys,
        };

        let candidates: Vec<&Jwk> = match &header.kid {
            Some(kid) => keys
                .iter()
                .filter(|k| k.common.key_id.as_deref() == Some(kid.as_str()))
                .collect(),
            None => keys.iter().collect(),
        };
        if candidates.is_empty() {
            return Err(OidcError::SignatureInvalid(match &header.kid {
                Some(kid) => format!("no signing key with kid {kid}"),
                None => "issuer publishes no signing keys".to_string(),
            }));
        }

        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let mut last_error = None;
        for jwk in candidates {
            let key = match DecodingKey::from_jwk(jwk) {
                Ok(key) => key,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            match decode::<TokenClaims>(token, &key, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(e) => {
                    if let jsonwebtoken::errors::ErrorKind::Json(_) = e.kind() {
                        return Err(OidcError::ClaimInvalid(e.to_string()));
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(OidcError::SignatureInvalid(
            last_error.map_or_else(|| "no usable key".to_string(), |e| e.to_string()),
        ))
    }

    fn check_lifetime(&self, claims: &TokenClaims) -> Result<(), OidcError> {
        let now = jsonwebtoken::get_current_timestamp();
        let leeway = self.config.issued_at_leeway.as_secs();

        let exp = claims
            .exp
            .ok_or_else(|| OidcError::ClaimInvalid("missing exp claim".to_string()))?;
        if exp <= now {
            return Err(OidcError::TokenExpired(format!(
                "expired {}s ago",
                now - exp
            )));
        }
        if let Some(iat) = claims.iat {
            if iat > now + leeway {
                return Err(OidcError::TokenExpired(format!(
                    "issued {}s in the future",
                    iat - now
                )));
            }
        }
        if let Some(nbf) = claims.nbf {
            if nbf > now + leeway {
                return Err(OidcError::TokenExpired(format!(
                    "not valid for another {}s",
                    nbf - now
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("config", &self.config)
            .finish()
    }
}

/// Read `iss` without verifying anything.
fn untrusted_issuer(token: &str) -> Result<String, OidcError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<UntrustedClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| OidcError::MalformedToken(e.to_string()))?;
    data.claims
        .iss
        .ok_or_else(|| OidcError::MalformedToken("missing iss claim".to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════
// SUBJECT EXTRACTION
// ═══════════════════════════════════════════════════════════════════════════

fn extract_identity(
    issuer: &IssuerConfig,
    claims: &TokenClaims,
) -> Result<VerifiedIdentity, OidcError> {
    let issuer_url = issuer.issuer_url.clone();
    match &issuer.identity_type {
        IdentityType::Spiffe => {
            let sub = claims
                .sub
                .as_deref()
                .ok_or_else(|| OidcError::ClaimInvalid("missing sub claim".to_string()))?;
            let id = SpiffeId::parse(sub).map_err(|e| OidcError::ClaimInvalid(e.to_string()))?;
            if let Some(trust_domain) = &issuer.spiffe_trust_domain {
                if id.trust_domain() != trust_domain {
                    return Err(OidcError::ClaimInvalid(format!(
                        "SPIFFE ID {id} is outside trust domain {trust_domain}"
                    )));
                }
            }
            Ok(VerifiedIdentity::new(id.to_string(), issuer_url, SubjectKind::Uri))
        }
        IdentityType::Email => {
            let email = claims.required("email")?;
            let verified = match claims.extra.get("email_verified") {
                Some(Value::Bool(b)) => *b,
                Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
                _ => false,
            };
            if !verified {
                return Err(OidcError::ClaimInvalid(format!(
                    "email {email} is not verified"
                )));
            }
            Ok(VerifiedIdentity::new(
                email.to_string(),
                issuer_url,
                SubjectKind::Email,
            ))
        }
        IdentityType::Kubernetes => {
            let (namespace, service_account) = kubernetes_service_account(claims)?;
            Ok(VerifiedIdentity::new(
                format!("https://kubernetes.io/namespaces/{namespace}/serviceaccounts/{service_account}"),
                issuer_url,
                SubjectKind::Uri,
            ))
        }
        IdentityType::GithubWorkflow => {
            let job_workflow_ref = claims.required("job_workflow_ref")?;
            let attribute = |name: &str| claims.string(name).map(str::to_string);
            let workflow = WorkflowAttributes {
                trigger: attribute("event_name"),
                sha: attribute("sha"),
                name: attribute("workflow"),
                repository: attribute("repository"),
                git_ref: attribute("ref"),
            };
            Ok(VerifiedIdentity::new(
                format!("https://github.com/{job_workflow_ref}"),
                issuer_url,
                SubjectKind::Uri,
            )
            .with_workflow(workflow))
        }
        IdentityType::Unsupported(kind) => {
            warn!(issuer = %issuer.issuer_url, identity_type = %kind, "no subject extraction rule");
            Err(OidcError::UnsupportedIdentityType(kind.clone()))
        }
    }
}

/// Namespace and service account name from a projected service account token.
///
/// Prefers the structured `kubernetes.io` claim and falls back to a
/// `system:serviceaccount:{namespace}:{name}` subject.
fn kubernetes_service_account(claims: &TokenClaims) -> Result<(String, String), OidcError> {
    let segment_ok = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    };

    let from_claim = claims.extra.get("kubernetes.io").and_then(|k8s| {
        let namespace = k8s.get("namespace")?.as_str()?;
        let name = k8s.get("serviceaccount")?.get("name")?.as_str()?;
        Some((namespace.to_string(), name.to_string()))
    });

    let from_sub = || {
        let rest = claims.sub.as_deref()?.strip_prefix("system:serviceaccount:")?;
        let (namespace, name) = rest.split_once(':')?;
        Some((namespace.to_string(), name.to_string()))
    };

    let (namespace, name) = from_claim
        .or_else(from_sub)
        .ok_or_else(|| OidcError::ClaimInvalid("missing kubernetes.io service account claims".to_string()))?;

    if !segment_ok(&namespace) || !segment_ok(&name) {
        return Err(OidcError::ClaimInvalid(format!(
            "invalid service account {namespace}/{name}"
        )));
    }
    Ok((namespace, name))
}

// ═══════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════

/// Errors that can occur during identity token verification.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("unknown issuer: {0}")]
    IssuerUnknown(String),

    #[error("issuer unreachable: {0}")]
    IssuerUnreachable(String),

    #[error("invalid discovery metadata: {0}")]
    DiscoveryInvalid(String),

    #[error("invalid token signature: {0}")]
    SignatureInvalid(String),

    #[error("token expired: {0}")]
    TokenExpired(String),

    #[error("audience does not contain client id {expected}")]
    AudienceMismatch { expected: String },

    #[error("invalid identity claim: {0}")]
    ClaimInvalid(String),

    #[error("unsupported identity type: {0}")]
    UnsupportedIdentityType(String),
}

impl OidcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OidcError::IssuerUnreachable(_) | OidcError::DiscoveryInvalid(_) => {
                ErrorClass::Upstream
            }
            OidcError::UnsupportedIdentityType(_) => ErrorClass::Validation,
            OidcError::MissingToken
            | OidcError::MalformedToken(_)
            | OidcError::IssuerUnknown(_)
            | OidcError::SignatureInvalid(_)
            | OidcError::TokenExpired(_)
            | OidcError::AudienceMismatch { .. }
            | OidcError::ClaimInvalid(_) => ErrorClass::Authentication,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            OidcError::MissingToken => "missing_token",
            OidcError::MalformedToken(_) => "malformed_token",
            OidcError::IssuerUnknown(_) => "issuer_unknown",
            OidcError::IssuerUnreachable(_) => "issuer_unreachable",
            OidcError::DiscoveryInvalid(_) => "discovery_invalid",
            OidcError::SignatureInvalid(_) => "signature_invalid",
            OidcError::TokenExpired(_) => "token_expired",
            OidcError::AudienceMismatch { .. } => "audience_mismatch",
            OidcError::ClaimInvalid(_) => "claim_invalid",
            OidcError::UnsupportedIdentityType(_) => "unsupported_identity_type",
        }
    }
}
