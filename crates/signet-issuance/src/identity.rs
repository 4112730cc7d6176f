//! Verified identities and SPIFFE ID validation.
//!
//! A [`VerifiedIdentity`] is only ever produced by the token verifier; callers
//! cannot construct one from request data.

use std::fmt;

use crate::{Error, Result};

/// How the subject is encoded in the certificate's SAN extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    /// rfc822Name SAN.
    Email,
    /// uniformResourceIdentifier SAN.
    Uri,
}

/// CI workflow attributes carried by GitHub Actions tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowAttributes {
    pub trigger: Option<String>,
    pub sha: Option<String>,
    pub name: Option<String>,
    pub repository: Option<String>,
    pub git_ref: Option<String>,
}

/// An identity extracted from a token whose signature, lifetime and audience
/// have been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    subject: String,
    issuer: String,
    kind: SubjectKind,
    workflow: Option<WorkflowAttributes>,
}

impl VerifiedIdentity {
    pub(crate) fn new(subject: String, issuer: String, kind: SubjectKind) -> Self {
        Self {
            subject,
            issuer,
            kind,
            workflow: None,
        }
    }

    pub(crate) fn with_workflow(mut self, workflow: WorkflowAttributes) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// Normalized subject (email address or URI).
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Issuer URL the token was verified against.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn kind(&self) -> SubjectKind {
        self.kind
    }

    pub fn workflow(&self) -> Option<&WorkflowAttributes> {
        self.workflow.as_ref()
    }
}

impl fmt::Display for VerifiedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (issuer {})", self.subject, self.issuer)
    }
}

/// A parsed `spiffe://trust-domain/path` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpiffeId {
    trust_domain: String,
    path: String,
}

/// Maximum SPIFFE ID length in bytes.
const MAX_SPIFFE_ID_LEN: usize = 2048;

impl SpiffeId {
    /// Parses and validates a SPIFFE ID.
    ///
    /// The trust domain may contain lowercase letters, digits, `.`, `-` and `_`,
    /// optionally followed by `:port`. The port is part of the trust domain.
    /// Path segments may contain only `[a-zA-Z0-9.-_]`, must not be empty and
    /// must not be `.` or `..`. Percent-encoding, query and fragment are rejected.
    pub fn parse(uri: &str) -> Result<Self> {
        if uri.len() > MAX_SPIFFE_ID_LEN {
            return Err(Error::InvalidSpiffeId(format!(
                "exceeds maximum length ({MAX_SPIFFE_ID_LEN} bytes): {} bytes",
                uri.len()
            )));
        }

        let rest = uri
            .strip_prefix("spiffe://")
            .ok_or_else(|| Error::InvalidSpiffeId(format!("missing spiffe:// scheme: {uri}")))?;

        let (trust_domain, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        validate_trust_domain(trust_domain)?;

        if !path.is_empty() {
            for segment in path[1..].split('/') {
                validate_path_segment(segment)?;
            }
        }

        Ok(Self {
            trust_domain: trust_domain.to_string(),
            path: path.to_string(),
        })
    }

    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spiffe://{}{}", self.trust_domain, self.path)
    }
}

/// `host` or `host:port`; the port must be a decimal `u16`.
fn validate_trust_domain(trust_domain: &str) -> Result<()> {
    let (host, port) = match trust_domain.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (trust_domain, None),
    };

    if host.is_empty() {
        return Err(Error::InvalidSpiffeId("empty trust domain".to_string()));
    }
    if !host.chars().all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' || c == '_'
    }) {
        return Err(Error::InvalidSpiffeId(format!(
            "invalid trust domain characters: {trust_domain}"
        )));
    }
    if let Some(port) = port {
        if !port.bytes().all(|b| b.is_ascii_digit()) || port.parse::<u16>().is_err() {
            return Err(Error::InvalidSpiffeId(format!(
                "invalid trust domain port: {trust_domain}"
            )));
        }
    }
    Ok(())
}

fn validate_path_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::InvalidSpiffeId("empty path segment".to_string()));
    }
    if segment == "." || segment == ".." {
        return Err(Error::InvalidSpiffeId(format!(
            "path segment cannot be a relative path modifier: {segment}"
        )));
    }
    for c in segment.chars() {
        if !c.is_ascii_alphanumeric() && c != '.' && c != '-' && c != '_' {
            return Err(Error::InvalidSpiffeId(format!(
                "path segment contains invalid character '{}' (only a-zA-Z0-9.-_ allowed): {segment}",
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                }
            )));
        }
    }
    Ok(())
}
