//! Certificate transparency log client.
//!
//! Every issued certificate is submitted to a CT log before it is returned.
//! The log answers with a signed certificate timestamp (SCT), which is passed
//! to the caller untouched as proof that the certificate was logged.
//!
//! Wire format:
//!
//! ```text
//! POST {log_url}/add-chain
//! {"chain": ["<base64 DER leaf>", ...]}
//!
//! 200 OK
//! {"sct_version": 0, "id": "<base64 log id>", "timestamp": 1700000000000,
//!  "extensions": "", "signature": "<base64>"}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::certificate::CertificateChain;
use crate::ErrorClass;

/// Default timeout for log submissions.
pub const DEFAULT_LOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while submitting to the transparency log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Transport failure or non-success status.
    #[error("transparency log unreachable: {0}")]
    LogUnreachable(String),

    /// The log answered with something other than an SCT.
    #[error("invalid transparency log response: {0}")]
    LogResponseInvalid(String),
}

impl LogError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Upstream
    }

    pub fn code(&self) -> &'static str {
        match self {
            LogError::LogUnreachable(_) => "log_unreachable",
            LogError::LogResponseInvalid(_) => "log_response_invalid",
        }
    }
}

/// Which certificates of an issued chain are submitted to the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChainSubmission {
    /// The leaf alone.
    #[default]
    LeafOnly,
    /// The leaf followed by every intermediate and the root.
    FullChain,
}

/// A log's receipt for a submitted chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCertificateTimestamp {
    #[serde(alias = "sctVersion")]
    pub sct_version: u8,
    /// Base64 log id.
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub extensions: String,
    #[serde(default)]
    pub signature: String,
}

/// An SCT together with the exact bytes the log returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogReceipt {
    sct: SignedCertificateTimestamp,
    raw: Vec<u8>,
}

impl LogReceipt {
    /// Parses a log response body.
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self, LogError> {
        let sct: SignedCertificateTimestamp = serde_json::from_slice(&raw)
            .map_err(|e| LogError::LogResponseInvalid(e.to_string()))?;
        if sct.id.is_empty() {
            return Err(LogError::LogResponseInvalid("SCT without log id".to_string()));
        }
        Ok(Self { sct, raw })
    }

    pub fn sct(&self) -> &SignedCertificateTimestamp {
        &self.sct
    }

    /// The receipt bytes as returned by the log.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Base64 of the receipt bytes, as handed to callers.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.raw)
    }
}

/// A transparency log the issuance pipeline submits to.
#[async_trait]
pub trait TransparencyLog: Send + Sync {
    async fn submit(&self, chain: &CertificateChain) -> Result<LogReceipt, LogError>;
}

#[derive(Debug, Serialize)]
struct AddChainRequest {
    chain: Vec<String>,
}

/// HTTP client for a CT log's `add-chain` endpoint.
#[derive(Debug, Clone)]
pub struct CtLogClient {
    http: reqwest::Client,
    add_chain_url: String,
    submission: ChainSubmission,
}

impl CtLogClient {
    /// Create a client for the log at `log_url` with the default timeout.
    pub fn new(log_url: &str) -> Result<Self, LogError> {
        Self::with_timeout(log_url, DEFAULT_LOG_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(log_url: &str, timeout: Duration) -> Result<Self, LogError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LogError::LogUnreachable(format!("HTTP client setup failed: {e}")))?;
        Ok(Self {
            http,
            add_chain_url: format!("{}/add-chain", log_url.trim_end_matches('/')),
            submission: ChainSubmission::default(),
        })
    }

    /// Choose which part of the chain is submitted.
    pub fn with_submission(mut self, submission: ChainSubmission) -> Self {
        self.submission = submission;
        self
    }

    pub fn submission(&self) -> ChainSubmission {
        self.submission
    }

    fn request_body(&self, chain: &CertificateChain) -> AddChainRequest {
        let certificates = match self.submission {
            ChainSubmission::LeafOnly => std::slice::from_ref(chain.leaf()),
            ChainSubmission::FullChain => chain.certificates(),
        };
        AddChainRequest {
            chain: certificates
                .iter()
                .map(|c| STANDARD.encode(c.der()))
                .collect(),
        }
    }
}

#[async_trait]
impl TransparencyLog for CtLogClient {
    async fn submit(&self, chain: &CertificateChain) -> Result<LogReceipt, LogError> {
        let body = self.request_body(chain);
        debug!(url = %self.add_chain_url, entries = body.chain.len(), "submitting chain to CT log");

        let response = self
            .http
            .post(&self.add_chain_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LogError::LogUnreachable(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| LogError::LogUnreachable(e.to_string()))?;

        if !status.is_success() {
            let detail = String::from_utf8_lossy(&bytes);
            warn!(status = %status, body = %detail, "CT log rejected submission");
            return Err(LogError::LogUnreachable(format!("HTTP {status}: {detail}")));
        }

        LogReceipt::from_bytes(bytes.to_vec())
    }
}
