//! Certificate Authority backed by operator-supplied PEM files.
//!
//! The certificate file holds the issuing CA certificate followed by any
//! intermediates and the self-signed root. The key file holds the issuing
//! certificate's PKCS#8 private key. Key custody (HSM export, KMS unwrap, a
//! mounted secret) happens before this process starts; the key is only read.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rcgen::{Issuer, KeyPair, PublicKeyData};
use tracing::info;

use super::{sign_leaf, CaError, CertificateAuthority, DEFAULT_LEAF_TTL};
use crate::certificate::{parse_cert_chain_pem, Certificate, CertificateChain, TrustBundle};
use crate::identity::VerifiedIdentity;
use crate::possession::PublicKey;

/// A CA that signs with a certificate and key loaded from PEM.
pub struct FileCa {
    issuer: Issuer<'static, KeyPair>,
    /// Issuing certificate first, root last.
    ca_chain: Vec<Certificate>,
    trust_bundle: TrustBundle,
    leaf_ttl: Duration,
}

impl FileCa {
    /// Builds a CA from a PEM certificate chain and a PEM private key.
    ///
    /// Fails if the chain is not a valid path to a self-signed root, if the
    /// first certificate is not a CA, or if the key does not belong to it.
    pub fn from_pem(cert_chain_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        let certificates = parse_cert_chain_pem(cert_chain_pem)
            .map_err(|e| CaError::InvalidCaMaterial(e.to_string()))?;
        let chain = CertificateChain::new(certificates)
            .map_err(|e| CaError::InvalidCaMaterial(e.to_string()))?;

        let signing_cert = chain.leaf();
        let is_ca = signing_cert
            .is_ca()
            .map_err(|e| CaError::InvalidCaMaterial(e.to_string()))?;
        if !is_ca {
            return Err(CaError::InvalidCaMaterial(
                "issuing certificate is not a CA".to_string(),
            ));
        }

        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| CaError::SigningUnavailable(format!("failed to load CA key: {e}")))?;
        let cert_spki = signing_cert
            .public_key_der()
            .map_err(|e| CaError::InvalidCaMaterial(e.to_string()))?;
        if key.subject_public_key_info() != cert_spki {
            return Err(CaError::InvalidCaMaterial(
                "private key does not match the issuing certificate".to_string(),
            ));
        }

        let issuer = Issuer::from_ca_cert_pem(signing_cert.to_pem(), key)
            .map_err(|e| CaError::InvalidCaMaterial(format!("unusable CA certificate: {e}")))?;

        info!(
            chain_len = chain.len(),
            "loaded CA certificate chain from PEM"
        );

        Ok(Self {
            issuer,
            trust_bundle: TrustBundle::new(vec![chain.root().clone()]),
            ca_chain: chain.certificates().to_vec(),
            leaf_ttl: DEFAULT_LEAF_TTL,
        })
    }

    /// Loads the certificate chain and key from files.
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self, CaError> {
        let read = |path: &Path| {
            std::fs::read_to_string(path)
                .map_err(|e| CaError::SigningUnavailable(format!("{}: {e}", path.display())))
        };
        let cert_pem = read(cert_path.as_ref())?;
        let key_pem = read(key_path.as_ref())?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Set the validity window for issued leaves.
    pub fn with_leaf_ttl(mut self, ttl: Duration) -> Self {
        self.leaf_ttl = ttl;
        self
    }
}

#[async_trait]
impl CertificateAuthority for FileCa {
    async fn issue(
        &self,
        identity: &VerifiedIdentity,
        public_key: &PublicKey,
    ) -> Result<CertificateChain, CaError> {
        sign_leaf(
            &self.issuer,
            &self.ca_chain,
            identity,
            public_key,
            self.leaf_ttl,
        )
    }

    fn root(&self) -> &TrustBundle {
        &self.trust_bundle
    }
}

impl std::fmt::Debug for FileCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCa")
            .field("key", &"[REDACTED]")
            .field("chain_len", &self.ca_chain.len())
            .field("leaf_ttl", &self.leaf_ttl)
            .finish()
    }
}
