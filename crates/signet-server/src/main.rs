use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use signet_issuance::api::{self, ApiState};
use signet_issuance::{
    CertificateAuthority, ChainSubmission, CtLogClient, EphemeralCa, FileCa, IssuanceContext,
    IssuanceCoordinator, IssuerRegistry, TokenVerifier, VerifierConfig,
};
use tracing::{info, warn};

/// Longest certificate validity the server will issue.
const MAX_CERT_TTL_SECS: u64 = 3600;

#[derive(Parser, Debug)]
#[command(name = "signet-server", about = "Short-lived code-signing certificate issuance")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "SIGNET_LISTEN", default_value = "127.0.0.1:5555")]
    listen: String,

    /// Issuer registry (JSON, `{"OIDCIssuers": {...}}`).
    #[arg(long, env = "SIGNET_CONFIG")]
    config: PathBuf,

    /// Base URL of the certificate transparency log.
    #[arg(long, env = "SIGNET_CT_LOG_URL")]
    ct_log_url: String,

    #[arg(long, env = "SIGNET_CA", value_enum, default_value = "ephemeral")]
    ca: CaKind,

    /// CA certificate chain (PEM, issuing certificate first). Required with `--ca file`.
    #[arg(long, env = "SIGNET_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// CA private key (PEM). Required with `--ca file`.
    #[arg(long, env = "SIGNET_CA_KEY")]
    ca_key: Option<PathBuf>,

    /// Validity of issued certificates, at most one hour.
    #[arg(long, env = "SIGNET_CERT_TTL_SECS", default_value_t = 600)]
    cert_ttl_secs: u64,

    /// Timeout for OIDC discovery, JWKS and CT log requests.
    #[arg(long, env = "SIGNET_HTTP_TIMEOUT_SECS", default_value_t = 10)]
    http_timeout_secs: u64,

    /// Submit intermediates and root to the log alongside the leaf.
    #[arg(long, env = "SIGNET_CT_SUBMIT_FULL_CHAIN", default_value_t = false)]
    ct_submit_full_chain: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, ValueEnum)]
enum CaKind {
    /// In-memory root, regenerated on every start.
    Ephemeral,
    /// Operator-supplied certificate and key files.
    File,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();
    let state = build_state(&args)?;
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("signet-server listening on {}", args.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn build_state(args: &Args) -> anyhow::Result<ApiState> {
    if args.cert_ttl_secs == 0 {
        bail!("certificate TTL must be positive");
    }
    if args.cert_ttl_secs > MAX_CERT_TTL_SECS {
        bail!(
            "certificate TTL of {}s exceeds the {MAX_CERT_TTL_SECS}s maximum",
            args.cert_ttl_secs
        );
    }
    let cert_ttl = Duration::from_secs(args.cert_ttl_secs);
    let http_timeout = Duration::from_secs(args.http_timeout_secs);

    let registry = IssuerRegistry::load(&args.config)
        .with_context(|| format!("failed to load issuer registry {}", args.config.display()))?;
    if registry.is_empty() {
        warn!("issuer registry is empty; every signing request will be rejected");
    }
    for issuer in registry.iter() {
        info!(
            issuer = %issuer.issuer_url,
            identity_type = %issuer.identity_type,
            "registered OIDC issuer"
        );
    }

    let authority: Arc<dyn CertificateAuthority> = match args.ca {
        CaKind::Ephemeral => {
            warn!("using ephemeral CA; the root changes on every restart");
            Arc::new(EphemeralCa::new()?.with_leaf_ttl(cert_ttl))
        }
        CaKind::File => {
            let (Some(cert), Some(key)) = (&args.ca_cert, &args.ca_key) else {
                bail!("--ca file requires --ca-cert and --ca-key (SIGNET_CA_CERT, SIGNET_CA_KEY)");
            };
            Arc::new(FileCa::load(cert, key)?.with_leaf_ttl(cert_ttl))
        }
    };

    let submission = if args.ct_submit_full_chain {
        ChainSubmission::FullChain
    } else {
        ChainSubmission::LeafOnly
    };
    let log = CtLogClient::with_timeout(&args.ct_log_url, http_timeout)?.with_submission(submission);
    info!(url = %args.ct_log_url, submission = ?submission, "configured CT log");

    let verifier = TokenVerifier::new(VerifierConfig::default().with_http_timeout(http_timeout))?;
    let context = IssuanceContext::new(Arc::new(registry), authority, Arc::new(log));

    Ok(ApiState::new(
        Arc::new(IssuanceCoordinator::new(verifier)),
        context,
    ))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
