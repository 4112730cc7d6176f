//! Issuer registry configuration.
//!
//! The registry maps an OIDC issuer URL to the client id tokens must be
//! minted for and to the rule used to turn the token into a certificate
//! subject. It is loaded once and shared read-only behind an `Arc`.
//!
//! ```json
//! {
//!   "OIDCIssuers": {
//!     "https://token.actions.githubusercontent.com": {
//!       "IssuerURL": "https://token.actions.githubusercontent.com",
//!       "ClientID": "sigstore",
//!       "Type": "github-workflow"
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How a verified token is turned into a certificate subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IdentityType {
    /// `email` claim, which must be verified.
    Email,
    /// `sub` is a SPIFFE ID and is passed through.
    Spiffe,
    /// Kubernetes service account projected token.
    Kubernetes,
    /// GitHub Actions workflow token.
    GithubWorkflow,
    /// A type this service has no extraction rule for.
    Unsupported(String),
}

impl IdentityType {
    pub fn as_str(&self) -> &str {
        match self {
            IdentityType::Email => "email",
            IdentityType::Spiffe => "spiffe",
            IdentityType::Kubernetes => "kubernetes",
            IdentityType::GithubWorkflow => "github-workflow",
            IdentityType::Unsupported(other) => other,
        }
    }
}

impl From<String> for IdentityType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "email" => IdentityType::Email,
            "spiffe" => IdentityType::Spiffe,
            "kubernetes" | "kubernetes-service-account" => IdentityType::Kubernetes,
            "github-workflow" => IdentityType::GithubWorkflow,
            _ => IdentityType::Unsupported(value),
        }
    }
}

impl From<IdentityType> for String {
    fn from(value: IdentityType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for IdentityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a single trusted OIDC issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// Issuer URL, matched exactly against the token's `iss` claim.
    #[serde(rename = "IssuerURL")]
    pub issuer_url: String,
    /// Audience the token must carry.
    #[serde(rename = "ClientID")]
    pub client_id: String,
    /// Subject extraction rule.
    #[serde(rename = "Type")]
    pub identity_type: IdentityType,
    /// When set, SPIFFE subjects from this issuer must belong to this trust domain.
    #[serde(
        rename = "SPIFFETrustDomain",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub spiffe_trust_domain: Option<String>,
}

impl IssuerConfig {
    pub fn new(
        issuer_url: impl Into<String>,
        client_id: impl Into<String>,
        identity_type: IdentityType,
    ) -> Self {
        Self {
            issuer_url: issuer_url.into(),
            client_id: client_id.into(),
            identity_type,
            spiffe_trust_domain: None,
        }
    }

    /// Restrict SPIFFE subjects to a trust domain.
    pub fn with_spiffe_trust_domain(mut self, trust_domain: impl Into<String>) -> Self {
        self.spiffe_trust_domain = Some(trust_domain.into());
        self
    }
}

/// Read-only mapping from issuer URL to issuer configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerRegistry {
    #[serde(rename = "OIDCIssuers")]
    issuers: BTreeMap<String, IssuerConfig>,
}

impl IssuerRegistry {
    /// Builds a registry from issuer configurations, keyed by their issuer URL.
    pub fn new(issuers: impl IntoIterator<Item = IssuerConfig>) -> Result<Self> {
        let registry = Self {
            issuers: issuers
                .into_iter()
                .map(|c| (c.issuer_url.clone(), c))
                .collect(),
        };
        registry.validate()?;
        Ok(registry)
    }

    /// Parses a registry from its JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let registry: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid issuer registry: {e}")))?;
        registry.validate()?;
        Ok(registry)
    }

    /// Loads a registry from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&contents)
    }

    /// Looks up an issuer by exact URL match.
    pub fn get(&self, issuer_url: &str) -> Option<&IssuerConfig> {
        self.issuers.get(issuer_url)
    }

    pub fn len(&self) -> usize {
        self.issuers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IssuerConfig> {
        self.issuers.values()
    }

    fn validate(&self) -> Result<()> {
        for (key, config) in &self.issuers {
            if key != &config.issuer_url {
                return Err(Error::Config(format!(
                    "issuer entry {key} declares IssuerURL {}",
                    config.issuer_url
                )));
            }
            if config.client_id.trim().is_empty() {
                return Err(Error::Config(format!("issuer {key} has an empty ClientID")));
            }
            if !key.starts_with("https://") && !key.starts_with("http://") {
                return Err(Error::Config(format!("issuer {key} is not an http(s) URL")));
            }
        }
        Ok(())
    }
}
