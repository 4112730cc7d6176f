//! The issuance pipeline.
//!
//! Each request moves through
//! `Received → TokenVerified → ProofVerified → CertIssued → Logged → Completed`.
//! Any failure stops the pipeline where it is; there is no partially
//! successful outcome. A certificate is only returned once the transparency
//! log has accepted it.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::ca::CertificateAuthority;
use crate::certificate::{CertificateChain, TrustBundle};
use crate::config::IssuerRegistry;
use crate::ctlog::{LogReceipt, TransparencyLog};
use crate::oidc::TokenVerifier;
use crate::possession::{verify_possession, PublicKey};
use crate::{Error, Result};

/// A caller's request for a certificate. Untrusted until verified.
#[derive(Debug, Clone)]
pub struct CertificateRequest {
    /// SPKI DER (or PEM) of the key to certify.
    pub public_key: Vec<u8>,
    /// Signature over the verified subject by the matching private key.
    pub possession_proof: Vec<u8>,
}

/// A logged certificate chain.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub chain: CertificateChain,
    pub receipt: LogReceipt,
}

/// Collaborators for one request.
///
/// Cheap to clone; tests swap in substitute authorities and logs per request.
#[derive(Clone)]
pub struct IssuanceContext {
    pub registry: Arc<IssuerRegistry>,
    pub authority: Arc<dyn CertificateAuthority>,
    pub log: Arc<dyn TransparencyLog>,
}

impl IssuanceContext {
    pub fn new(
        registry: Arc<IssuerRegistry>,
        authority: Arc<dyn CertificateAuthority>,
        log: Arc<dyn TransparencyLog>,
    ) -> Self {
        Self {
            registry,
            authority,
            log,
        }
    }
}

impl fmt::Debug for IssuanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuanceContext")
            .field("issuers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Where a request is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceStage {
    Received,
    TokenVerified,
    ProofVerified,
    CertIssued,
    Logged,
    Completed,
    /// Terminal state after any error; the error carries the reason.
    Failed,
}

impl fmt::Display for IssuanceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IssuanceStage::Received => "received",
            IssuanceStage::TokenVerified => "token_verified",
            IssuanceStage::ProofVerified => "proof_verified",
            IssuanceStage::CertIssued => "cert_issued",
            IssuanceStage::Logged => "logged",
            IssuanceStage::Completed => "completed",
            IssuanceStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Runs the issuance pipeline and serves root distribution.
#[derive(Debug)]
pub struct IssuanceCoordinator {
    verifier: TokenVerifier,
}

impl IssuanceCoordinator {
    pub fn new(verifier: TokenVerifier) -> Self {
        Self { verifier }
    }

    /// Verify `token` and `request`, mint a certificate and log it.
    pub async fn issue(
        &self,
        ctx: &IssuanceContext,
        token: &str,
        request: &CertificateRequest,
    ) -> Result<IssuedCertificate> {
        let mut stage = IssuanceStage::Received;
        let result = self.run(ctx, token, request, &mut stage).await;

        match &result {
            Ok(issued) => info!(
                chain_len = issued.chain.len(),
                log_id = %issued.receipt.sct().id,
                "certificate issued and logged"
            ),
            Err(e) => {
                fail(&mut stage, e);
            }
        }
        result
    }

    async fn run(
        &self,
        ctx: &IssuanceContext,
        token: &str,
        request: &CertificateRequest,
        stage: &mut IssuanceStage,
    ) -> Result<IssuedCertificate> {
        let identity = self.verifier.verify(&ctx.registry, token).await?;
        advance(stage, IssuanceStage::TokenVerified);

        let public_key = PublicKey::parse(&request.public_key)?;
        verify_possession(identity.subject(), &public_key, &request.possession_proof)?;
        advance(stage, IssuanceStage::ProofVerified);

        let chain = ctx.authority.issue(&identity, &public_key).await?;
        advance(stage, IssuanceStage::CertIssued);

        let receipt = ctx.log.submit(&chain).await?;
        advance(stage, IssuanceStage::Logged);

        advance(stage, IssuanceStage::Completed);
        Ok(IssuedCertificate { chain, receipt })
    }

    /// The authority's current root certificates. Requires no credentials.
    pub fn root(&self, ctx: &IssuanceContext) -> TrustBundle {
        ctx.authority.root().clone()
    }
}

fn advance(stage: &mut IssuanceStage, next: IssuanceStage) {
    debug!(from = %stage, to = %next, "issuance stage");
    *stage = next;
}

/// Moves `stage` to `Failed` and reports the last stage reached.
fn fail(stage: &mut IssuanceStage, error: &Error) -> IssuanceStage {
    let failed_after = *stage;
    advance(stage, IssuanceStage::Failed);
    warn!(
        failed_after = %failed_after,
        class = %error.class(),
        code = error.code(),
        error = %error,
        "issuance failed"
    );
    failed_after
}
