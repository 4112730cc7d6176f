//! OID constants for issued certificates and submitted public keys.
//!
//! Certificate extension OIDs live under the `1.3.6.1.4.1.57264.1` arc and are
//! kept in two forms: DER-encoded bytes (for matching parsed extensions) and
//! component tuples (for certificate generation with rcgen). Public key
//! algorithm OIDs are kept as dotted strings because they are only ever
//! compared against parsed SubjectPublicKeyInfo algorithms.

/// OIDC issuer URL that authenticated the subject.
///
/// OID: 1.3.6.1.4.1.57264.1.1
pub const OID_ISSUER_BYTES: &[u8] = &[0x2b, 0x06, 0x01, 0x04, 0x01, 0x83, 0xbf, 0x30, 0x01, 0x01];
pub const OID_ISSUER_TUPLE: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 1];

/// Event that triggered a CI workflow (`push`, `workflow_dispatch`, ...).
pub const OID_WORKFLOW_TRIGGER_TUPLE: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 2];

/// Commit SHA the workflow ran against.
pub const OID_WORKFLOW_SHA_TUPLE: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 3];

/// Workflow name.
pub const OID_WORKFLOW_NAME_TUPLE: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 4];

/// Repository (`owner/name`) the workflow belongs to.
pub const OID_WORKFLOW_REPOSITORY_TUPLE: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 5];

/// Git ref the workflow ran on.
pub const OID_WORKFLOW_REF_TUPLE: &[u64] = &[1, 3, 6, 1, 4, 1, 57264, 1, 6];

// Public key algorithms (SubjectPublicKeyInfo.algorithm).
pub const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
pub const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
pub const OID_CURVE_P384: &str = "1.3.132.0.34";
pub const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
pub const OID_ED25519: &str = "1.3.101.112";
