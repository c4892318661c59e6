//! The single boundary this crate consumes from the control-plane
//! collaborator: "give me a fresh access URL for buffer B
//! (read|write, optional TTL)". Everything else about runs, codespecs, the
//! CLI, auth, and orchestration is out of scope and lives on the other side
//! of this trait.

use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;
use url::Url;

#[derive(Debug, Snafu)]
pub enum ControlPlaneError {
    #[snafu(display("control plane request failed: {source}"))]
    Request { source: reqwest::Error },
    #[snafu(display("control plane returned an unparseable access URL: {reason}"))]
    InvalidResponse { reason: String },
}

/// Issues pre-signed container access URLs for a buffer.
///
/// Implementations typically call
/// `POST /buffers/{id}/access?writeable={bool}&ttl={duration?}` against the
/// control-plane REST API and parse the `uri` field of the JSON response
///; that REST surface itself is out of scope for this crate.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn access_url(
        &self,
        buffer_id: &str,
        writeable: bool,
        ttl: Option<Duration>,
    ) -> Result<Url, ControlPlaneError>;
}

/// A [`ControlPlane`] backed by a plain HTTP call to the documented
/// endpoint, for callers that have a bearer-token-authenticated `reqwest`
/// client already set up and just want the default request shape.
pub struct HttpControlPlane {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpControlPlane {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }
}

#[derive(serde::Deserialize)]
struct AccessResponse {
    uri: String,
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn access_url(
        &self,
        buffer_id: &str,
        writeable: bool,
        ttl: Option<Duration>,
    ) -> Result<Url, ControlPlaneError> {
        let mut url = self
            .base_url
            .join(&format!("buffers/{buffer_id}/access"))
            .map_err(|e| ControlPlaneError::InvalidResponse { reason: e.to_string() })?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("writeable", if writeable { "true" } else { "false" });
            if let Some(ttl) = ttl {
                pairs.append_pair("ttl", &humantime::format_duration(ttl).to_string());
            }
        }

        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|source| ControlPlaneError::Request { source })?
            .error_for_status()
            .map_err(|source| ControlPlaneError::Request { source })?;

        let parsed: AccessResponse = response
            .json()
            .await
            .map_err(|source| ControlPlaneError::Request { source })?;

        Url::parse(&parsed.uri).map_err(|e| ControlPlaneError::InvalidResponse { reason: e.to_string() })
    }
}
