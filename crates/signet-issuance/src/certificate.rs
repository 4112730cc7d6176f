//! X.509 certificate handling for issued chains and trust roots.

use chrono::{DateTime, Utc};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{GeneralName, ParsedExtension};

use crate::{Error, Result};

/// A DER certificate with its PEM form kept alongside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    pem: String,
}

impl Certificate {
    pub fn from_der(der: Vec<u8>) -> Self {
        let pem = der_to_pem(&der, "CERTIFICATE");
        Self { der, pem }
    }

    /// Parses one `CERTIFICATE` PEM block.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let parsed = pem::parse(pem)
            .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?;
        if parsed.tag() != "CERTIFICATE" {
            return Err(Error::Certificate(format!(
                "expected CERTIFICATE PEM block, found {}",
                parsed.tag()
            )));
        }
        Ok(Self::from_der(parsed.into_contents()))
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    fn parsed(&self) -> Result<X509Certificate<'_>> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der)
            .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;
        Ok(cert)
    }

    /// URI and email entries of the Subject Alternative Name extension.
    pub fn subject_alt_names(&self) -> Result<Vec<String>> {
        let cert = self.parsed()?;
        let mut names = Vec::new();
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    match name {
                        GeneralName::URI(uri) => names.push(uri.to_string()),
                        GeneralName::RFC822Name(email) => names.push(email.to_string()),
                        _ => {}
                    }
                }
            }
        }
        Ok(names)
    }

    /// Raw value of a non-standard extension, if present.
    pub fn extension_value(&self, oid_der: &[u8]) -> Result<Option<Vec<u8>>> {
        let cert = self.parsed()?;
        Ok(cert
            .extensions()
            .iter()
            .find(|ext| ext.oid.as_bytes() == oid_der)
            .map(|ext| ext.value.to_vec()))
    }

    /// DER-encoded SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self.parsed()?.public_key().raw.to_vec())
    }

    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let timestamp = self.parsed()?.validity().not_after.timestamp();
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| Error::Certificate(format!("notAfter out of range: {timestamp}")))
    }

    pub fn not_before(&self) -> Result<DateTime<Utc>> {
        let timestamp = self.parsed()?.validity().not_before.timestamp();
        DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| Error::Certificate(format!("notBefore out of range: {timestamp}")))
    }

    /// RFC 4514 rendering of the subject DN; empty for issued leaves.
    pub fn subject(&self) -> Result<String> {
        Ok(self.parsed()?.subject().to_string())
    }

    pub fn issuer(&self) -> Result<String> {
        Ok(self.parsed()?.issuer().to_string())
    }

    /// Whether basicConstraints marks this certificate as a CA.
    pub fn is_ca(&self) -> Result<bool> {
        Ok(self.parsed()?.is_ca())
    }

    /// Checks that this certificate was signed by `issuer`'s key, or by its
    /// own key when `issuer` is `None`.
    pub fn verify_signed_by(&self, issuer: Option<&Certificate>) -> Result<()> {
        let cert = self.parsed()?;
        let result = match issuer {
            Some(issuer) => {
                let issuer = issuer.parsed()?;
                cert.verify_signature(Some(issuer.public_key()))
            }
            None => cert.verify_signature(None),
        };
        result.map_err(|e| Error::Certificate(format!("signature verification failed: {e}")))
    }
}

/// An issued certificate chain: leaf first, ending at a self-signed root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateChain {
    certificates: Vec<Certificate>,
}

impl CertificateChain {
    /// Validates and wraps a chain.
    ///
    /// The chain must be non-empty, each certificate's issuer must equal the
    /// next certificate's subject and be signed by it, and the last certificate
    /// must be self-signed.
    pub fn new(certificates: Vec<Certificate>) -> Result<Self> {
        let root = certificates
            .last()
            .ok_or_else(|| Error::Certificate("empty certificate chain".to_string()))?;

        for pair in certificates.windows(2) {
            let (child, parent) = (&pair[0], &pair[1]);
            let (issuer, subject) = (child.issuer()?, parent.subject()?);
            if issuer != subject {
                return Err(Error::Certificate(format!(
                    "chain break: issuer {issuer:?} does not match next subject {subject:?}"
                )));
            }
            child.verify_signed_by(Some(parent))?;
        }

        if root.issuer()? != root.subject()? {
            return Err(Error::Certificate(
                "chain does not end at a self-signed root".to_string(),
            ));
        }
        root.verify_signed_by(None)?;

        Ok(Self { certificates })
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    pub fn leaf(&self) -> &Certificate {
        &self.certificates[0]
    }

    pub fn root(&self) -> &Certificate {
        &self.certificates[self.certificates.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// PEM entries, one per certificate, leaf first.
    pub fn to_pem_entries(&self) -> Vec<String> {
        self.certificates
            .iter()
            .map(|c| c.to_pem().to_string())
            .collect()
    }
}

/// Roots relying parties anchor issued chains to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustBundle {
    roots: Vec<Certificate>,
}

impl TrustBundle {
    pub fn new(roots: Vec<Certificate>) -> Self {
        Self { roots }
    }

    /// Parses concatenated PEM; at least one certificate is required.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let roots = parse_cert_chain_pem(pem)?;
        if roots.is_empty() {
            return Err(Error::Certificate("no certificates in PEM".to_string()));
        }
        Ok(Self { roots })
    }

    pub fn roots(&self) -> &[Certificate] {
        &self.roots
    }

    /// Concatenated PEM blocks, one per root.
    pub fn to_pem(&self) -> String {
        self.roots.iter().map(|c| c.to_pem()).collect()
    }
}

/// Every `CERTIFICATE` block in `pem_str`, in order. Other blocks are skipped.
pub fn parse_cert_chain_pem(pem_str: &str) -> Result<Vec<Certificate>> {
    pem::parse_many(pem_str)
        .map_err(|e| Error::Certificate(format!("failed to parse PEM: {e}")))?
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| Ok(Certificate::from_der(p.into_contents())))
        .collect()
}

pub(crate) fn der_to_pem(der: &[u8], label: &str) -> String {
    pem::encode(&pem::Pem::new(label, der))
}
