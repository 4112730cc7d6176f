//! Proof-of-possession verification.
//!
//! The caller proves it controls the private key for the submitted public key
//! by signing the verified subject string. The signature scheme follows from
//! the key's SubjectPublicKeyInfo algorithm:
//!
//! | Key            | Accepted signatures                                   |
//! |----------------|-------------------------------------------------------|
//! | ECDSA P-256    | ASN.1 DER ECDSA over SHA-256                          |
//! | ECDSA P-384    | ASN.1 DER ECDSA over SHA-384 or SHA-256               |
//! | RSA >= 2048    | PKCS#1 v1.5 or PSS over SHA-256                       |
//! | Ed25519        | Ed25519 over the raw subject bytes                    |
//!
//! Hashing happens inside ring's verifier, so the message handed to it is the
//! subject itself.

use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey as ParsedPublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::oid::{
    OID_CURVE_P256, OID_CURVE_P384, OID_EC_PUBLIC_KEY, OID_ED25519, OID_RSA_ENCRYPTION,
};
use crate::ErrorClass;

const MIN_RSA_BITS: usize = 2048;

/// Errors raised while checking a public key and its possession proof.
#[derive(Debug, thiserror::Error)]
pub enum PossessionError {
    #[error("malformed public key: {0}")]
    MalformedPublicKey(String),

    #[error("unsupported key algorithm: {0}")]
    UnsupportedKeyAlgorithm(String),

    #[error("possession proof does not verify under the submitted public key")]
    ProofInvalid,
}

impl PossessionError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }

    pub fn code(&self) -> &'static str {
        match self {
            PossessionError::MalformedPublicKey(_) => "malformed_public_key",
            PossessionError::UnsupportedKeyAlgorithm(_) => "unsupported_key_algorithm",
            PossessionError::ProofInvalid => "proof_invalid",
        }
    }
}

/// Public key families with a defined verification rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    EcdsaP256,
    EcdsaP384,
    Rsa,
    Ed25519,
}

/// A caller-supplied public key as DER-encoded SubjectPublicKeyInfo.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    der: Vec<u8>,
    algorithm: KeyAlgorithm,
    /// Key material handed to ring: EC point, PKCS#1 RSAPublicKey or raw Ed25519 key.
    key_bytes: Vec<u8>,
}

impl PublicKey {
    /// Parses submitted key content: SPKI DER, or a PEM `PUBLIC KEY` block.
    pub fn parse(content: &[u8]) -> Result<Self, PossessionError> {
        if content.starts_with(b"-----BEGIN") {
            let block = pem::parse(content)
                .map_err(|e| PossessionError::MalformedPublicKey(format!("invalid PEM: {e}")))?;
            if block.tag() != "PUBLIC KEY" {
                return Err(PossessionError::MalformedPublicKey(format!(
                    "expected PUBLIC KEY PEM block, found {}",
                    block.tag()
                )));
            }
            return Self::from_der(block.contents());
        }
        Self::from_der(content)
    }

    /// Parses DER-encoded SubjectPublicKeyInfo.
    pub fn from_der(der: &[u8]) -> Result<Self, PossessionError> {
        let (rest, spki) = SubjectPublicKeyInfo::from_der(der)
            .map_err(|e| PossessionError::MalformedPublicKey(e.to_string()))?;
        if !rest.is_empty() {
            return Err(PossessionError::MalformedPublicKey(
                "trailing bytes after SubjectPublicKeyInfo".to_string(),
            ));
        }

        let algorithm = classify(&spki)?;
        let key_bytes: &[u8] = &spki.subject_public_key.data;
        if key_bytes.is_empty() {
            return Err(PossessionError::MalformedPublicKey(
                "empty subject public key".to_string(),
            ));
        }

        Ok(Self {
            der: spki.raw.to_vec(),
            algorithm,
            key_bytes: key_bytes.to_vec(),
        })
    }

    /// DER-encoded SubjectPublicKeyInfo.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// Verifies `signature` over `message` with every scheme accepted for this key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), PossessionError> {
        let schemes: &[&'static dyn VerificationAlgorithm] = match self.algorithm {
            KeyAlgorithm::EcdsaP256 => &[&signature::ECDSA_P256_SHA256_ASN1],
            KeyAlgorithm::EcdsaP384 => &[
                &signature::ECDSA_P384_SHA384_ASN1,
                &signature::ECDSA_P384_SHA256_ASN1,
            ],
            KeyAlgorithm::Rsa => &[
                &signature::RSA_PKCS1_2048_8192_SHA256,
                &signature::RSA_PSS_2048_8192_SHA256,
            ],
            KeyAlgorithm::Ed25519 => &[&signature::ED25519],
        };

        schemes
            .iter()
            .any(|scheme| {
                UnparsedPublicKey::new(*scheme, &self.key_bytes)
                    .verify(message, signature)
                    .is_ok()
            })
            .then_some(())
            .ok_or(PossessionError::ProofInvalid)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm)
            .field("der_len", &self.der.len())
            .finish()
    }
}

/// Checks that `proof` is a signature over `subject` by the holder of `public_key`.
pub fn verify_possession(
    subject: &str,
    public_key: &PublicKey,
    proof: &[u8],
) -> Result<(), PossessionError> {
    if proof.is_empty() {
        return Err(PossessionError::ProofInvalid);
    }
    public_key.verify(subject.as_bytes(), proof)
}

fn classify(spki: &SubjectPublicKeyInfo<'_>) -> Result<KeyAlgorithm, PossessionError> {
    let algorithm = spki.algorithm.algorithm.to_id_string();
    match algorithm.as_str() {
        OID_EC_PUBLIC_KEY => {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .map(|oid| oid.to_id_string())
                .ok_or_else(|| {
                    PossessionError::MalformedPublicKey("EC key without named curve".to_string())
                })?;
            match curve.as_str() {
                OID_CURVE_P256 => Ok(KeyAlgorithm::EcdsaP256),
                OID_CURVE_P384 => Ok(KeyAlgorithm::EcdsaP384),
                other => Err(PossessionError::UnsupportedKeyAlgorithm(format!(
                    "EC curve {other}"
                ))),
            }
        }
        OID_RSA_ENCRYPTION => match spki.parsed() {
            Ok(ParsedPublicKey::RSA(rsa)) if rsa.key_size() >= MIN_RSA_BITS => Ok(KeyAlgorithm::Rsa),
            Ok(ParsedPublicKey::RSA(rsa)) => Err(PossessionError::UnsupportedKeyAlgorithm(format!(
                "RSA key of {} bits (minimum {MIN_RSA_BITS})",
                rsa.key_size()
            ))),
            _ => Err(PossessionError::MalformedPublicKey(
                "invalid RSA public key".to_string(),
            )),
        },
        OID_ED25519 => Ok(KeyAlgorithm::Ed25519),
        other => Err(PossessionError::UnsupportedKeyAlgorithm(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::PublicKeyData;
    use ring::rand::SystemRandom;
    use ring::signature::{EcdsaKeyPair, Ed25519KeyPair, KeyPair};

    const SUBJECT: &str = "spiffe://example.org/foo/bar";

    fn ecdsa_spki(alg: &'static signature::EcdsaSigningAlgorithm) -> (EcdsaKeyPair, Vec<u8>) {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(alg, &rng).unwrap();
        let key = EcdsaKeyPair::from_pkcs8(alg, pkcs8.as_ref(), &rng).unwrap();
        let spki = rcgen::KeyPair::try_from(pkcs8.as_ref())
            .unwrap()
            .subject_public_key_info();
        (key, spki)
    }

    #[test]
    fn test_p256_proof() {
        let (key, spki) = ecdsa_spki(&signature::ECDSA_P256_SHA256_ASN1_SIGNING);
        let public_key = PublicKey::from_der(&spki).unwrap();
        assert_eq!(public_key.algorithm(), KeyAlgorithm::EcdsaP256);

        let proof = key.sign(&SystemRandom::new(), SUBJECT.as_bytes()).unwrap();
        verify_possession(SUBJECT, &public_key, proof.as_ref()).unwrap();
    }

    #[test]
    fn test_p384_accepts_sha384_and_sha256() {
        let rng = SystemRandom::new();
        let pkcs8 =
            EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P384_SHA384_ASN1_SIGNING, &rng).unwrap();
        let spki = rcgen::KeyPair::try_from(pkcs8.as_ref())
            .unwrap()
            .subject_public_key_info();
        let public_key = PublicKey::from_der(&spki).unwrap();
        assert_eq!(public_key.algorithm(), KeyAlgorithm::EcdsaP384);

        let sha384 = EcdsaKeyPair::from_pkcs8(
            &signature::ECDSA_P384_SHA384_ASN1_SIGNING,
            pkcs8.as_ref(),
            &rng,
        )
        .unwrap();
        let proof = sha384.sign(&rng, SUBJECT.as_bytes()).unwrap();
        verify_possession(SUBJECT, &public_key, proof.as_ref()).unwrap();

        let sha256 = EcdsaKeyPair::from_pkcs8(
            &signature::ECDSA_P384_SHA256_ASN1_SIGNING,
            pkcs8.as_ref(),
            &rng,
        )
        .unwrap();
        let proof = sha256.sign(&rng, SUBJECT.as_bytes()).unwrap();
        verify_possession(SUBJECT, &public_key, proof.as_ref()).unwrap();
        assert!(matches!(
            verify_possession("spiffe://example.org/other", &public_key, proof.as_ref()),
            Err(PossessionError::ProofInvalid)
        ));
    }

    const RSA2048_PKCS8: &str = include_str!("../tests/fixtures/rsa2048.pk8.pem");
    const RSA2048_SPKI: &str = include_str!("../tests/fixtures/rsa2048.spki.pem");
    const RSA1024_SPKI: &str = include_str!("../tests/fixtures/rsa1024.spki.pem");

    fn rsa_sign(padding: &'static dyn signature::RsaEncoding, msg: &[u8]) -> Vec<u8> {
        let der = pem::parse(RSA2048_PKCS8).unwrap().into_contents();
        let key = signature::RsaKeyPair::from_pkcs8(&der).unwrap();
        let mut sig = vec![0; key.public().modulus_len()];
        key.sign(padding, &SystemRandom::new(), msg, &mut sig).unwrap();
        sig
    }

    #[test]
    fn test_rsa_pkcs1_and_pss_proofs() {
        let public_key = PublicKey::parse(RSA2048_SPKI.as_bytes()).unwrap();
        assert_eq!(public_key.algorithm(), KeyAlgorithm::Rsa);

        for padding in [
            &signature::RSA_PKCS1_SHA256 as &'static dyn signature::RsaEncoding,
            &signature::RSA_PSS_SHA256,
        ] {
            let proof = rsa_sign(padding, SUBJECT.as_bytes());
            verify_possession(SUBJECT, &public_key, &proof).unwrap();

            let other = rsa_sign(padding, b"spiffe://example.org/other");
            assert!(matches!(
                verify_possession(SUBJECT, &public_key, &other),
                Err(PossessionError::ProofInvalid)
            ));
        }
    }

    #[test]
    fn test_rsa_below_2048_bits_rejected() {
        let err = PublicKey::parse(RSA1024_SPKI.as_bytes()).unwrap_err();
        assert!(
            matches!(err, PossessionError::UnsupportedKeyAlgorithm(ref msg) if msg.contains("1024")),
            "{err:?}"
        );
        assert_eq!(err.code(), "unsupported_key_algorithm");
    }

    #[test]
    fn test_ed25519_proof() {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let key = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let mut spki = ed25519_spki_prefix();
        spki.extend_from_slice(key.public_key().as_ref());

        let public_key = PublicKey::from_der(&spki).unwrap();
        assert_eq!(public_key.algorithm(), KeyAlgorithm::Ed25519);

        let proof = key.sign(SUBJECT.as_bytes());
        verify_possession(SUBJECT, &public_key, proof.as_ref()).unwrap();
        assert!(matches!(
            verify_possession("spiffe://example.org/other", &public_key, proof.as_ref()),
            Err(PossessionError::ProofInvalid)
        ));
    }

    fn ed25519_spki_prefix() -> Vec<u8> {
        vec![
            0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
        ]
    }

    #[test]
    fn test_proof_over_other_subject_rejected() {
        let (key, spki) = ecdsa_spki(&signature::ECDSA_P256_SHA256_ASN1_SIGNING);
        let public_key = PublicKey::from_der(&spki).unwrap();
        let proof = key
            .sign(&SystemRandom::new(), b"spiffe://example.org/someone-else")
            .unwrap();
        assert!(matches!(
            verify_possession(SUBJECT, &public_key, proof.as_ref()),
            Err(PossessionError::ProofInvalid)
        ));
    }

    #[test]
    fn test_proof_from_other_key_rejected() {
        let (_, spki) = ecdsa_spki(&signature::ECDSA_P256_SHA256_ASN1_SIGNING);
        let (other, _) = ecdsa_spki(&signature::ECDSA_P256_SHA256_ASN1_SIGNING);
        let public_key = PublicKey::from_der(&spki).unwrap();
        let proof = other.sign(&SystemRandom::new(), SUBJECT.as_bytes()).unwrap();
        assert!(matches!(
            verify_possession(SUBJECT, &public_key, proof.as_ref()),
            Err(PossessionError::ProofInvalid)
        ));
    }

    #[test]
    fn test_empty_and_garbage_proofs_rejected() {
        let (_, spki) = ecdsa_spki(&signature::ECDSA_P256_SHA256_ASN1_SIGNING);
        let public_key = PublicKey::from_der(&spki).unwrap();
        assert!(verify_possession(SUBJECT, &public_key, &[]).is_err());
        assert!(verify_possession(SUBJECT, &public_key, &[0x30, 0x00]).is_err());
    }

    #[test]
    fn test_pem_content_accepted() {
        let (_, spki) = ecdsa_spki(&signature::ECDSA_P256_SHA256_ASN1_SIGNING);
        let pem = pem::encode(&pem::Pem::new("PUBLIC KEY", spki.clone()));
        let public_key = PublicKey::parse(pem.as_bytes()).unwrap();
        assert_eq!(public_key.der(), spki.as_slice());
    }

    #[test]
    fn test_malformed_key_rejected() {
        for bad in [&b""[..], b"not a key", &[0x30, 0x03, 0x02, 0x01, 0x01]] {
            assert!(matches!(
                PublicKey::parse(bad),
                Err(PossessionError::MalformedPublicKey(_))
            ));
        }
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        // SPKI with algorithm 1.2.3.4 and a one-byte key.
        let spki = [
            0x30, 0x0c, 0x30, 0x05, 0x06, 0x03, 0x2a, 0x03, 0x04, 0x03, 0x03, 0x00, 0x01, 0x02,
        ];
        assert!(matches!(
            PublicKey::from_der(&spki),
            Err(PossessionError::UnsupportedKeyAlgorithm(_))
        ));
    }

    #[test]
    fn test_debug_omits_key_material() {
        let (_, spki) = ecdsa_spki(&signature::ECDSA_P256_SHA256_ASN1_SIGNING);
        let public_key = PublicKey::from_der(&spki).unwrap();
        let debug = format!("{public_key:?}");
        assert!(debug.contains("EcdsaP256"));
    }
}
