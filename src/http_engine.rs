//! Idempotent PUT/GET/HEAD against the blob store, with classified-error
//! retry, URL redaction, and connection reuse.
//!
//! The retry policy is deliberately a pure function of `(status,
//! error-code-header, attempt count)`, isolated in
//! [`classify`] so it can be unit tested without a network round-trip. The
//! engine itself never touches the access-URL holder;
//! callers pass in the URL to use for each attempt and retry with whatever
//! `current()` returns next.

use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use reqwest::{Client, StatusCode};
use snafu::Snafu;
use tracing::{debug, warn};
use url::Url;

use crate::config::RetryBudgets;

/// API version pinned in every request.
pub const BLOB_STORE_API_VERSION: &str = "2021-08-06";

/// Header carrying the cumulative hash-chain value.
pub const CHAIN_HEADER: &str = "x-ms-meta-cumulative_hash_chain";

/// Header the store uses to classify 4xx/5xx failures.
const ERROR_CODE_HEADER: &str = "x-ms-error-code";

/// Errors produced by a single request or its exhausted retry budget.
#[derive(Debug, Snafu)]
pub enum HttpError {
    #[snafu(display("transport error: {source}"))]
    Transport { source: reqwest::Error },

    #[snafu(display("failed to read response body: {source}"))]
    BodyRead { source: reqwest::Error },

    #[snafu(display("server returned transient status {status}"))]
    TransientStatus { status: StatusCode },

    #[snafu(display("Content-MD5 mismatch on {path}"))]
    IntegrityMismatch { path: String },

    #[snafu(display("response missing required Content-Length"))]
    MissingContentLength,

    #[snafu(display("response missing required {header}"))]
    MissingHeader { header: &'static str },

    #[snafu(display("blob {path} not found (writer has not produced it yet)"))]
    NotFoundWhileWaiting { path: String },

    #[snafu(display("blob {path} does not exist past the known final block"))]
    NotFoundAfterFinal { path: String },

    #[snafu(display("blob {path} is expected to exist but does not"))]
    NotFoundBelowFinal { path: String },

    #[snafu(display("access URL rejected by store: {detail}"))]
    AccessUrlInvalid { detail: String },

    #[snafu(display("access URL does not permit the requested operation"))]
    PermissionDenied,

    #[snafu(display("buffer cannot be overwritten"))]
    OverwriteForbidden,

    #[snafu(display("container does not exist"))]
    BufferDoesNotExist,

    #[snafu(display("unexpected status {status}: {body}"))]
    UnexpectedStatus { status: StatusCode, body: String },

    #[snafu(display("retry budget ({budget}) exhausted after {attempts} attempts: {last}"))]
    RetriesExhausted {
        budget: &'static str,
        attempts: u32,
        last: Box<HttpError>,
    },
}

impl HttpError {
    /// True if a fresh attempt of the *same* request has a chance of
    /// succeeding, per the retry taxonomy below.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HttpError::Transport { .. }
                | HttpError::BodyRead { .. }
                | HttpError::TransientStatus { .. }
                | HttpError::IntegrityMismatch { .. }
                | HttpError::NotFoundWhileWaiting { .. }
                | HttpError::AccessUrlInvalid { .. }
        )
    }
}

/// Response to a successful GET, carrying the headers the download pool must
/// verify before trusting the payload.
pub struct GetResponse {
    pub payload: Bytes,
    pub content_md5: String,
    pub chain_header: Option<String>,
}

/// Response to a successful HEAD.
pub struct HeadResponse {
    pub content_md5: Option<String>,
    pub chain_header: Option<String>,
}

/// Thin wrapper over a `reqwest::Client` tuned for large-body transfer
/// (100s response-header timeout, 20s response timeout, 1000 max idle
/// connections per host).
#[derive(Clone)]
pub struct RequestEngine {
    client: Client,
}

impl RequestEngine {
    pub fn new() -> Result<Self, HttpError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(100))
            .timeout(Duration::from_secs(120))
            .pool_max_idle_per_host(1000)
            .build()
            .map_err(|source| HttpError::Transport { source })?;
        Ok(Self { client })
    }

    /// Builds from an externally configured client, e.g. one shared with the
    /// relay client or built with a non-default timeout for relay's
    /// "unlimited" streaming mode.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    fn date_header() -> String {
        // RFC 1123 with an explicit zone, as required by the store's
        // `Date` header validation.
        chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }

    pub async fn head(&self, container: &Url, path: &str) -> Result<Option<HeadResponse>, HttpError> {
        let url = join(container, path);
        debug!(url = %redact_url(&url), "HEAD blob");
        let response = self
            .client
            .head(url.clone())
            .header("Date", Self::date_header())
            .header("x-ms-version", BLOB_STORE_API_VERSION)
            .send()
            .await
            .map_err(|source| HttpError::Transport { source })?;

        match classify_head(response.status(), error_code(&response)) {
            HeadOutcome::Found => {
                let content_md5 = response
                    .headers()
                    .get("Content-MD5")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                let chain_header = response
                    .headers()
                    .get(CHAIN_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                Ok(Some(HeadResponse {
                    content_md5,
                    chain_header,
                }))
            }
            HeadOutcome::NotFound => Ok(None),
            HeadOutcome::Error(err) => Err(err),
        }
    }

    pub async fn put_block(
        &self,
        container: &Url,
        path: &str,
        payload: Bytes,
        content_md5: &str,
        chain_header: Option<&str>,
    ) -> Result<(), HttpError> {
        let url = join(container, path);
        debug!(url = %redact_url(&url), len = payload.len(), "PUT blob");

        let mut request = self
            .client
            .put(url.clone())
            .header("Date", Self::date_header())
            .header("x-ms-version", BLOB_STORE_API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header("Content-MD5", content_md5)
            .header("Content-Length", payload.len().to_string());

        if let Some(chain) = chain_header {
            request = request.header(CHAIN_HEADER, chain);
        }

        // A zero-length block uses a `nil` body, never chunked encoding:
        // `reqwest` sends an explicit `Content-Length: 0` body as long as
        // we pass an empty `Bytes`, which is exactly this case.
        let response = request
            .body(payload)
            .send()
            .await
            .map_err(|source| HttpError::Transport { source })?;

        let status = response.status();
        let code = error_code(&response);

        match classify_put(status, code.as_deref()) {
            PutOutcome::Created => Ok(()),
            PutOutcome::OverwriteMaybeReconciled => {
                // Caller (the framing protocol / upload worker) is expected
                // to reconcile via `head` and treat this as a hint, not a
                // terminal answer; surface it so the caller can decide.
                Err(HttpError::OverwriteForbidden)
            }
            PutOutcome::AccessUrlInvalid => Err(HttpError::AccessUrlInvalid {
                detail: extract_auth_error_detail(response).await,
            }),
            PutOutcome::Error(err) => Err(err),
        }
    }

    pub async fn get_block(&self, container: &Url, path: &str) -> Result<GetResponse, HttpError> {
        let url = join(container, path);
        debug!(url = %redact_url(&url), "GET blob");

        let response = self
            .client
            .get(url.clone())
            .header("Date", Self::date_header())
            .header("x-ms-version", BLOB_STORE_API_VERSION)
            .send()
            .await
            .map_err(|source| HttpError::Transport { source })?;

        let status = response.status();
        let code = error_code(&response);

        match classify_get(status, code.as_deref(), path) {
            GetOutcome::Ok => {}
            GetOutcome::NotFound => return Err(HttpError::NotFoundWhileWaiting { path: path.to_owned() }),
            GetOutcome::AccessUrlInvalid => {
                return Err(HttpError::AccessUrlInvalid {
                    detail: extract_auth_error_detail(response).await,
                })
            }
            GetOutcome::Error(err) => return Err(err),
        }

        if response.headers().get("Content-Length").is_none() {
            return Err(HttpError::MissingContentLength);
        }
        let content_md5 = response
            .headers()
            .get("Content-MD5")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or(HttpError::MissingHeader { header: "Content-MD5" })?;
        let chain_header = response
            .headers()
            .get(CHAIN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = response.bytes().await.map_err(|source| HttpError::BodyRead { source })?;

        if crate::hash::content_md5(&body) != content_md5 {
            return Err(HttpError::IntegrityMismatch { path: path.to_owned() });
        }

        Ok(GetResponse {
            payload: body,
            content_md5,
            chain_header,
        })
    }
}

fn join(container: &Url, path: &str) -> Url {
    let mut url = container.clone();
    let mut segments: Vec<&str> = url.path().trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    let extra: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    segments.extend(extra);
    url.set_path(&segments.join("/"));
    url
}

fn error_code(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(ERROR_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

enum HeadOutcome {
    Found,
    NotFound,
    Error(HttpError),
}

fn classify_head(status: StatusCode, code: Option<String>) -> HeadOutcome {
    match status {
        StatusCode::OK => HeadOutcome::Found,
        StatusCode::NOT_FOUND => HeadOutcome::NotFound,
        other => HeadOutcome::Error(HttpError::UnexpectedStatus {
            status: other,
            body: code.unwrap_or_default(),
        }),
    }
}

enum PutOutcome {
    Created,
    OverwriteMaybeReconciled,
    AccessUrlInvalid,
    Error(HttpError),
}

fn classify_put(status: StatusCode, code: Option<&str>) -> PutOutcome {
    match (status, code) {
        (StatusCode::CREATED, _) => PutOutcome::Created,
        (StatusCode::BAD_REQUEST, Some("Md5Mismatch")) => {
            PutOutcome::Error(HttpError::IntegrityMismatch { path: String::new() })
        }
        (StatusCode::FORBIDDEN, Some("UnauthorizedBlobOverwrite")) => PutOutcome::OverwriteMaybeReconciled,
        (StatusCode::FORBIDDEN, Some("AuthorizationPermissionMismatch")) => {
            PutOutcome::Error(HttpError::PermissionDenied)
        }
        (StatusCode::FORBIDDEN, Some("AuthenticationFailed")) => PutOutcome::AccessUrlInvalid,
        (StatusCode::NOT_FOUND, Some("ContainerNotFound")) => PutOutcome::Error(HttpError::BufferDoesNotExist),
        (StatusCode::INTERNAL_SERVER_ERROR, _) => PutOutcome::Error(HttpError::TransientStatus { status }),
        (StatusCode::SERVICE_UNAVAILABLE, _) => PutOutcome::Error(HttpError::TransientStatus { status }),
        (other, _) => PutOutcome::Error(HttpError::UnexpectedStatus {
            status: other,
            body: code.unwrap_or_default().to_owned(),
        }),
    }
}

/// Extracts the `<AuthenticationErrorDetail>` element from an
/// `AuthenticationFailed` error body, when the store includes one, falling
/// back to the bare error code if the body is absent or unparseable.
async fn extract_auth_error_detail(response: reqwest::Response) -> String {
    let body = match response.text().await {
        Ok(body) => body,
        Err(_) => return "AuthenticationFailed".to_owned(),
    };
    parse_auth_error_detail(&body).unwrap_or_else(|| "AuthenticationFailed".to_owned())
}

fn parse_auth_error_detail(xml: &str) -> Option<String> {
    use quick_xml::events::Event;
    use quick_xml::reader::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut in_detail = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(tag)) if tag.name().as_ref() == b"AuthenticationErrorDetail" => in_detail = true,
            Ok(Event::Text(text)) if in_detail => {
                return text.unescape().ok().map(|s| s.into_owned());
            }
            Ok(Event::End(tag)) if tag.name().as_ref() == b"AuthenticationErrorDetail" => in_detail = false,
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

enum GetOutcome {
    Ok,
    NotFound,
    AccessUrlInvalid,
    Error(HttpError),
}

fn classify_get(status: StatusCode, code: Option<&str>, path: &str) -> GetOutcome {
    match (status, code) {
        (StatusCode::OK, _) => GetOutcome::Ok,
        (StatusCode::NOT_FOUND, Some("BlobNotFound")) | (StatusCode::NOT_FOUND, None) => GetOutcome::NotFound,
        (StatusCode::NOT_FOUND, Some("ContainerNotFound")) => GetOutcome::Error(HttpError::BufferDoesNotExist),
        (StatusCode::FORBIDDEN, Some("AuthorizationPermissionMismatch")) => {
            GetOutcome::Error(HttpError::PermissionDenied)
        }
        (StatusCode::FORBIDDEN, Some("AuthenticationFailed")) => GetOutcome::AccessUrlInvalid,
        (StatusCode::INTERNAL_SERVER_ERROR, _) => GetOutcome::Error(HttpError::TransientStatus { status }),
        (StatusCode::SERVICE_UNAVAILABLE, _) => GetOutcome::Error(HttpError::TransientStatus { status }),
        (other, _) => GetOutcome::Error(HttpError::UnexpectedStatus {
            status: other,
            body: format!("{path}: {}", code.unwrap_or_default()),
        }),
    }
}

/// Redacts every query-string value in `url`, keeping keys visible, so logs
/// never leak a SAS signature.
pub fn redact_url(url: &Url) -> Url {
    let mut redacted = url.clone();
    let redacted_pairs: Vec<(String, &'static str)> = redacted
        .query_pairs()
        .map(|(k, _)| (k.into_owned(), "REDACTED"))
        .collect();
    if redacted_pairs.is_empty() {
        return redacted;
    }
    let mut builder = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in &redacted_pairs {
        builder.append_pair(key, value);
    }
    redacted.set_query(Some(&builder.finish()));
    redacted
}

/// Sleep schedule for the "not found while waiting for the writer" class:
/// tiered `100ms → 500ms → 1s → 5s`.
pub fn not_found_tiered_sleep(attempt: u32) -> Duration {
    match attempt {
        0 => Duration::from_millis(100),
        1 => Duration::from_millis(500),
        2 => Duration::from_secs(1),
        _ => Duration::from_secs(5),
    }
}

/// Exponential backoff with full jitter, default base 800ms / cap 30s.
pub fn backoff(attempt: u32, budgets: &RetryBudgets) -> Duration {
    let exp = budgets.backoff_base.as_millis().saturating_mul(1u128 << attempt.min(16));
    let capped = exp.min(budgets.backoff_cap.as_millis());
    let jittered = rand::rng().random_range(0..=capped.max(1));
    Duration::from_millis(jittered as u64)
}
