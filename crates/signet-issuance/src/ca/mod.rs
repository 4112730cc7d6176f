//! Certificate Authority (CA) trait and implementations.
//!
//! This module provides a pluggable CA interface for minting short-lived
//! code-signing certificates. Implementations include:
//!
//! - [`EphemeralCa`] - In-memory root generated at process start (development and testing)
//! - [`FileCa`] - Root or intermediate certificate and key supplied by an operator
//!
//! Both produce the same leaf profile: the caller's public key, a SAN carrying
//! the verified subject, a fixed short validity window, `digitalSignature` key
//! usage, the `codeSigning` extended key usage, a random serial and the OIDC
//! issuer (plus CI workflow attributes when present) as custom extensions.

mod ephemeral;
mod file;

pub use ephemeral::EphemeralCa;
pub use file::FileCa;

use std::time::Duration;

use async_trait::async_trait;
use rcgen::string::Ia5String;
use rcgen::{
    CertificateParams, CustomExtension, DistinguishedName, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyUsagePurpose, SanType, SerialNumber, SigningKey,
};
use ring::rand::{SecureRandom, SystemRandom};
use time::OffsetDateTime;

use crate::certificate::{Certificate, CertificateChain, TrustBundle};
use crate::identity::{SubjectKind, VerifiedIdentity};
use crate::oid::{
    OID_ISSUER_TUPLE, OID_WORKFLOW_NAME_TUPLE, OID_WORKFLOW_REF_TUPLE,
    OID_WORKFLOW_REPOSITORY_TUPLE, OID_WORKFLOW_SHA_TUPLE, OID_WORKFLOW_TRIGGER_TUPLE,
};
use crate::possession::PublicKey;
use crate::ErrorClass;

/// Default validity window for issued leaf certificates.
pub const DEFAULT_LEAF_TTL: Duration = Duration::from_secs(10 * 60);

/// Leaf validity is backdated by this much to absorb clock skew between
/// the CA and verifiers.
const BACKDATE: Duration = Duration::from_secs(30);

/// Errors raised by certificate authorities.
#[derive(Debug, thiserror::Error)]
pub enum CaError {
    /// Key material cannot be accessed or used.
    #[error("signing key unavailable: {0}")]
    SigningUnavailable(String),

    /// The submitted key cannot be placed in a certificate.
    #[error("public key cannot be certified: {0}")]
    UnsupportedPublicKey(String),

    /// The subject cannot be encoded in a SAN.
    #[error("subject cannot be encoded: {0}")]
    InvalidSubject(String),

    /// CA certificate or key supplied by the operator is unusable.
    #[error("invalid CA material: {0}")]
    InvalidCaMaterial(String),

    /// The minted chain failed validation.
    #[error("issued chain is invalid: {0}")]
    ChainInvalid(String),
}

impl CaError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CaError::UnsupportedPublicKey(_) | CaError::InvalidSubject(_) => {
                ErrorClass::Validation
            }
            CaError::SigningUnavailable(_)
            | CaError::InvalidCaMaterial(_)
            | CaError::ChainInvalid(_) => ErrorClass::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            CaError::SigningUnavailable(_) => "signing_unavailable",
            CaError::UnsupportedPublicKey(_) => "unsupported_public_key",
            CaError::InvalidSubject(_) => "invalid_subject",
            CaError::InvalidCaMaterial(_) => "invalid_ca_material",
            CaError::ChainInvalid(_) => "chain_invalid",
        }
    }
}

/// A certificate authority that binds verified identities to public keys.
///
/// Implementations own any synchronization their key material needs;
/// `issue` may be called concurrently through a shared reference.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Issues a short-lived leaf for `public_key` carrying `identity`.
    ///
    /// Returns the full chain, leaf first, ending at a self-signed root.
    async fn issue(
        &self,
        identity: &VerifiedIdentity,
        public_key: &PublicKey,
    ) -> Result<CertificateChain, CaError>;

    /// Root certificates served to relying parties.
    fn root(&self) -> &TrustBundle;
}

/// Signs a leaf for `identity` under `issuer`, then appends `ca_chain`
/// (the issuing certificate and everything above it).
pub(crate) fn sign_leaf<S: SigningKey>(
    issuer: &Issuer<'_, S>,
    ca_chain: &[Certificate],
    identity: &VerifiedIdentity,
    public_key: &PublicKey,
    ttl: Duration,
) -> Result<CertificateChain, CaError> {
    let params = leaf_params(identity, ttl)?;
    let spki = rcgen::SubjectPublicKeyInfo::from_der(public_key.der())
        .map_err(|e| CaError::UnsupportedPublicKey(e.to_string()))?;

    let leaf = params
        .signed_by(&spki, issuer)
        .map_err(|e| CaError::SigningUnavailable(format!("leaf signing failed: {e}")))?;

    let mut certificates = Vec::with_capacity(ca_chain.len() + 1);
    certificates.push(Certificate::from_der(leaf.der().to_vec()));
    certificates.extend(ca_chain.iter().cloned());

    CertificateChain::new(certificates).map_err(|e| CaError::ChainInvalid(e.to_string()))
}

fn leaf_params(identity: &VerifiedIdentity, ttl: Duration) -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params.serial_number = Some(random_serial()?);

    let now = OffsetDateTime::now_utc();
    params.not_before = now - BACKDATE;
    params.not_after = now + ttl;

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::CodeSigning];
    params.use_authority_key_identifier_extension = true;

    let san = Ia5String::try_from(identity.subject().to_string())
        .map_err(|e| CaError::InvalidSubject(format!("{}: {e}", identity.subject())))?;
    params.subject_alt_names = vec![match identity.kind() {
        SubjectKind::Email => SanType::Rfc822Name(san),
        SubjectKind::Uri => SanType::URI(san),
    }];

    params.custom_extensions.push(CustomExtension::from_oid_content(
        OID_ISSUER_TUPLE,
        identity.issuer().as_bytes().to_vec(),
    ));
    if let Some(workflow) = identity.workflow() {
        for (oid, value) in [
            (OID_WORKFLOW_TRIGGER_TUPLE, &workflow.trigger),
            (OID_WORKFLOW_SHA_TUPLE, &workflow.sha),
            (OID_WORKFLOW_NAME_TUPLE, &workflow.name),
            (OID_WORKFLOW_REPOSITORY_TUPLE, &workflow.repository),
            (OID_WORKFLOW_REF_TUPLE, &workflow.git_ref),
        ] {
            if let Some(value) = value {
                params
                    .custom_extensions
                    .push(CustomExtension::from_oid_content(oid, value.as_bytes().to_vec()));
            }
        }
    }

    Ok(params)
}

/// 20 random bytes with the sign bit cleared.
fn random_serial() -> Result<SerialNumber, CaError> {
    let mut bytes = [0u8; 20];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| CaError::SigningUnavailable("system RNG failure".to_string()))?;
    bytes[0] &= 0x7f;
    bytes[0] |= 0x01;
    Ok(SerialNumber::from_slice(&bytes))
}

#[cfg(test)]
pub(crate) mod test_support {
    use ring::rand::SystemRandom;
    use ring::signature::{EcdsaKeyPair, ECDSA_P256_SHA256_ASN1_SIGNING};

    use rcgen::PublicKeyData;

    use crate::identity::{SubjectKind, VerifiedIdentity, WorkflowAttributes};
    use crate::possession::PublicKey;

    pub fn spiffe_identity() -> VerifiedIdentity {
        VerifiedIdentity::new(
            "spiffe://example.org/foo/bar".to_string(),
            "https://idp.example/oidc".to_string(),
            SubjectKind::Uri,
        )
    }

    pub fn email_identity() -> VerifiedIdentity {
        VerifiedIdentity::new(
            "alice@example.com".to_string(),
            "https://accounts.example".to_string(),
            SubjectKind::Email,
        )
    }

    pub fn workflow_identity() -> VerifiedIdentity {
        VerifiedIdentity::new(
            "https://github.com/acme/widgets/.github/workflows/release.yml@refs/tags/v1.0.0"
                .to_string(),
            "https://token.actions.githubusercontent.com".to_string(),
            SubjectKind::Uri,
        )
        .with_workflow(WorkflowAttributes {
            trigger: Some("push".to_string()),
            sha: Some("c0ffee".to_string()),
            name: Some("release".to_string()),
            repository: Some("acme/widgets".to_string()),
            git_ref: None,
        })
    }

    pub fn p256_public_key() -> PublicKey {
        let pkcs8 =
            EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &SystemRandom::new())
                .unwrap();
        let spki = rcgen::KeyPair::try_from(pkcs8.as_ref())
            .unwrap()
            .subject_public_key_info();
        PublicKey::from_der(&spki).unwrap()
    }
}
