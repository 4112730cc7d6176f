//! Ephemeral Certificate Authority for development and testing.
//!
//! The root key pair is generated in memory when the CA is created and is
//! never persisted; every process start yields a new root. Relying parties
//! must fetch the root again after a restart.
//!
//! # Example
//!
//! ```
//! use signet_issuance::ca::{CertificateAuthority, EphemeralCa};
//!
//! let ca = EphemeralCa::new().unwrap();
//! assert_eq!(ca.root().roots().len(), 1);
//! ```

use std::time::Duration;

use async_trait::async_trait;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::info;

use super::{sign_leaf, CaError, CertificateAuthority, DEFAULT_LEAF_TTL};
use crate::certificate::{Certificate, CertificateChain, TrustBundle};
use crate::identity::VerifiedIdentity;
use crate::possession::PublicKey;

/// A CA whose root exists only for the lifetime of the process.
pub struct EphemeralCa {
    /// Root key plus the name and key usages leaves are issued under.
    issuer: Issuer<'static, KeyPair>,
    /// The root certificate.
    root_certificate: Certificate,
    /// Trust bundle containing just the root cert.
    trust_bundle: TrustBundle,
    /// Validity window for issued leaves.
    leaf_ttl: Duration,
}

impl EphemeralCa {
    /// Creates a CA with a fresh P-256 root valid for 10 years.
    pub fn new() -> Result<Self, CaError> {
        let root_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::SigningUnavailable(format!("root key generation failed: {e}")))?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "signet ephemeral root");
        dn.push(DnType::OrganizationName, "signet");
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + TimeDuration::days(3650);

        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let root_cert = params
            .self_signed(&root_key)
            .map_err(|e| CaError::SigningUnavailable(format!("root cert generation failed: {e}")))?;

        let root_certificate = Certificate::from_der(root_cert.der().to_vec());
        let trust_bundle = TrustBundle::new(vec![root_certificate.clone()]);

        info!("generated ephemeral root certificate");

        Ok(Self {
            issuer: Issuer::new(params, root_key),
            root_certificate,
            trust_bundle,
            leaf_ttl: DEFAULT_LEAF_TTL,
        })
    }

    /// Set the validity window for issued leaves.
    pub fn with_leaf_ttl(mut self, ttl: Duration) -> Self {
        self.leaf_ttl = ttl;
        self
    }

    /// Returns the PEM-encoded root certificate.
    pub fn root_cert_pem(&self) -> &str {
        self.root_certificate.to_pem()
    }

    pub fn leaf_ttl(&self) -> Duration {
        self.leaf_ttl
    }
}

#[async_trait]
impl CertificateAuthority for EphemeralCa {
    async fn issue(
        &self,
        identity: &VerifiedIdentity,
        public_key: &PublicKey,
    ) -> Result<CertificateChain, CaError> {
        sign_leaf(
            &self.issuer,
            std::slice::from_ref(&self.root_certificate),
            identity,
            public_key,
            self.leaf_ttl,
        )
    }

    fn root(&self) -> &TrustBundle {
        &self.trust_bundle
    }
}

impl std::fmt::Debug for EphemeralCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralCa")
            .field("root_key", &"[REDACTED]")
            .field("leaf_ttl", &self.leaf_ttl)
            .finish()
    }
}
