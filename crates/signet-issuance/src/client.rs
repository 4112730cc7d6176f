//! Typed client for the issuance API.
//!
//! ```no_run
//! # async fn run() -> Result<(), signet_issuance::client::ClientError> {
//! use signet_issuance::ApiClient;
//!
//! let client = ApiClient::new("http://127.0.0.1:5555")?;
//! let roots = client.root_cert().await?;
//! println!("{} trusted root(s)", roots.roots().len());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;

use crate::api::{
    ErrorBody, PublicKeyContent, RootCertResponse, SigningCertRequest, SigningCertResponse,
};
use crate::certificate::TrustBundle;

/// Errors returned by [`ApiClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(String),

    /// The server answered with an error body.
    #[error("server returned {status}: {} ({})", .body.message, .body.code)]
    Api { status: u16, body: ErrorBody },

    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Client for a running issuance server.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Request a certificate for `public_key_der`, proving possession with
    /// `proof` (a signature over the token's subject).
    pub async fn signing_cert(
        &self,
        token: &str,
        public_key_der: &[u8],
        proof: &[u8],
    ) -> Result<SigningCertResponse, ClientError> {
        let body = SigningCertRequest {
            public_key: PublicKeyContent {
                content: STANDARD.encode(public_key_der),
                algorithm: None,
            },
            possession_proof: STANDARD.encode(proof),
        };
        let response = self
            .http
            .post(format!("{}/api/v1/signingCert", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        read_json(response).await
    }

    /// Fetch the server's trust roots.
    pub async fn root_cert(&self) -> Result<TrustBundle, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/v1/rootCert", self.base_url))
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let body: RootCertResponse = read_json(response).await?;
        TrustBundle::from_pem(&body.chain_pem).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;

    if !status.is_success() {
        let body = serde_json::from_slice::<ErrorBody>(&bytes).map_err(|_| {
            ClientError::Decode(format!(
                "HTTP {status}: {}",
                String::from_utf8_lossy(&bytes)
            ))
        })?;
        return Err(ClientError::Api {
            status: status.as_u16(),
            body,
        });
    }

    serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
}
