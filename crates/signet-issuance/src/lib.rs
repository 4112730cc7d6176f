//! Identity-bound, short-lived code-signing certificate issuance.
//!
//! A caller presents an OIDC identity token, a public key and a signature over
//! its verified identity. This crate verifies all three, mints a short-lived
//! X.509 certificate for the key, records it in a certificate transparency
//! log and hands back the chain together with the log's receipt.
//!
//! # Components
//!
//! - [`config`] - Issuer registry (issuer URL to client id and identity type)
//! - [`oidc`] - Token verification against per-issuer JWKS via OIDC discovery
//! - [`identity`] - Verified identities and SPIFFE ID validation
//! - [`possession`] - Proof-of-possession checks over the verified subject
//! - [`ca`] - Certificate authority trait and implementations (ephemeral, file-backed)
//! - [`certificate`] - X.509 certificate, chain and trust bundle handling
//! - [`ctlog`] - Certificate transparency log client
//! - [`issuance`] - The issuance pipeline and root distribution
//! - [`api`] - HTTP surface (axum router) over the pipeline
//! - [`client`] - Typed HTTP client for the issuance API

pub mod api;
pub mod ca;
pub mod certificate;
pub mod client;
pub mod config;
pub mod ctlog;
pub mod identity;
pub mod issuance;
pub mod oid;
pub mod oidc;
pub mod possession;

pub use ca::{CaError, CertificateAuthority, EphemeralCa, FileCa, DEFAULT_LEAF_TTL};
pub use certificate::{Certificate, CertificateChain, TrustBundle};
pub use client::ApiClient;
pub use config::{IdentityType, IssuerConfig, IssuerRegistry};
pub use ctlog::{
    ChainSubmission, CtLogClient, LogError, LogReceipt, SignedCertificateTimestamp,
    TransparencyLog,
};
pub use identity::{SubjectKind, VerifiedIdentity, WorkflowAttributes};
pub use issuance::{
    CertificateRequest, IssuanceContext, IssuanceCoordinator, IssuanceStage, IssuedCertificate,
};
pub use oidc::{OidcError, TokenVerifier, VerifierConfig};
pub use possession::{PossessionError, PublicKey};

/// How a failure should be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Caller must re-authenticate (unknown issuer, bad or expired token).
    Authentication,
    /// Caller must correct the request (bad key, bad proof, unsupported type).
    Validation,
    /// A remote dependency failed; safe to retry.
    Upstream,
    /// Operator-visible failure such as unavailable signing keys.
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Authentication => "authentication",
            ErrorClass::Validation => "validation",
            ErrorClass::Upstream => "upstream",
            ErrorClass::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in signet-issuance operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Identity token rejected or its issuer could not be reached.
    #[error(transparent)]
    Oidc(#[from] OidcError),

    /// Public key or possession proof rejected.
    #[error(transparent)]
    Possession(#[from] PossessionError),

    /// Certificate authority failure.
    #[error(transparent)]
    Ca(#[from] CaError),

    /// Transparency log failure.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Invalid SPIFFE ID.
    #[error("invalid SPIFFE ID: {0}")]
    InvalidSpiffeId(String),

    /// Certificate parsing error.
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classifies the error for the caller.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Oidc(e) => e.class(),
            Error::Possession(e) => e.class(),
            Error::Ca(e) => e.class(),
            Error::Log(e) => e.class(),
            Error::InvalidSpiffeId(_) => ErrorClass::Authentication,
            Error::Certificate(_) | Error::Config(_) | Error::Io(_) => ErrorClass::Internal,
        }
    }

    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Oidc(e) => e.code(),
            Error::Possession(e) => e.code(),
            Error::Ca(e) => e.code(),
            Error::Log(e) => e.code(),
            Error::InvalidSpiffeId(_) => "invalid_spiffe_id",
            Error::Certificate(_) => "certificate_error",
            Error::Config(_) => "configuration_error",
            Error::Io(_) => "io_error",
        }
    }
}

/// Result type for signet-issuance operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_errors_keep_their_class() {
        let err: Error = OidcError::IssuerUnknown("https://nope.example".into()).into();
        assert_eq!(err.class(), ErrorClass::Authentication);
        assert_eq!(err.code(), "issuer_unknown");

        let err: Error = PossessionError::ProofInvalid.into();
        assert_eq!(err.class(), ErrorClass::Validation);

        let err: Error = LogError::LogUnreachable("connection refused".into()).into();
        assert_eq!(err.class(), ErrorClass::Upstream);

        let err: Error = CaError::SigningUnavailable("key gone".into()).into();
        assert_eq!(err.class(), ErrorClass::Internal);
    }

    #[test]
    fn test_transparent_display() {
        let err: Error = OidcError::IssuerUnknown("https://nope.example".into()).into();
        assert_eq!(err.to_string(), "unknown issuer: https://nope.example");
    }
}
