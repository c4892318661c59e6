//! Single-stream relay mode for containers whose access URL carries
//! `relay=true`: the whole buffer is written and read as one HTTP
//! request rather than as a sequence of addressable blocks, because the
//! relay endpoint holds no blob-store semantics of its own.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use reqwest::{Body, Client, StatusCode};
use snafu::Snafu;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::{debug, warn};
use url::Url;

use crate::http_engine::{redact_url, BLOB_STORE_API_VERSION};

/// Size of the prefix the relay writer buffers up front. The whole source is
/// sent as one PUT; this much of it is kept in memory so a failure that
/// happens before the stream has advanced past the prefix can be retried
/// once from the start, without having to replay bytes already read from the
/// source past this point.
pub const RELAY_WRITE_CHUNK: usize = 64 * 1024;

#[derive(Debug, Snafu)]
pub enum RelayError {
    #[snafu(display("relay transport error: {source}"))]
    Transport { source: reqwest::Error },

    #[snafu(display("relay endpoint is not ready after {attempts} health checks"))]
    NotReady { attempts: u32 },

    #[snafu(display("relay stream was already opened by another caller"))]
    AlreadyCalled,

    #[snafu(display("relay failed to open a reader for this buffer"))]
    FailedToOpenReader,

    #[snafu(display("relay endpoint does not support this operation"))]
    MethodNotAllowed,

    #[snafu(display("relay returned unexpected status {status}"))]
    UnexpectedStatus { status: StatusCode },

    #[snafu(display("error reading source stream: {source}"))]
    SourceRead { source: std::io::Error },
}

fn classify_relay_error(status: StatusCode, error_header: Option<&str>) -> RelayError {
    match (status, error_header) {
        (StatusCode::CONFLICT, Some("AlreadyCalled")) => RelayError::AlreadyCalled,
        (_, Some("FailedToOpenReader")) => RelayError::FailedToOpenReader,
        (StatusCode::METHOD_NOT_ALLOWED, _) => RelayError::MethodNotAllowed,
        (status, _) => RelayError::UnexpectedStatus { status },
    }
}

fn relay_error_header(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get("x-ms-error")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// A thin HTTP client for the relay's whole-stream PUT/GET/HEAD surface.
/// Kept separate from [`crate::http_engine::RequestEngine`] because relay
/// semantics (single call, no block addressing, no chain header) don't fit
/// the blob-store request shape.
pub struct RelayClient {
    client: Client,
}

impl RelayClient {
    pub fn new() -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(None)
            .build()
            .map_err(|source| RelayError::Transport { source })?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Polls `HEAD` until the relay reports ready, tiered 100ms/500ms/1s/5s
    /// like the blob-store "not found while waiting" schedule, capped at
    /// `max_attempts`.
    pub async fn wait_until_ready(&self, url: &Url, max_attempts: u32) -> Result<(), RelayError> {
        for attempt in 0..max_attempts {
            let response = self
                .client
                .head(url.clone())
                .header("x-ms-version", BLOB_STORE_API_VERSION)
                .send()
                .await
                .map_err(|source| RelayError::Transport { source })?;
            if response.status().is_success() {
                return Ok(());
            }
            debug!(url = %redact_url(url), attempt, status = %response.status(), "relay not ready yet");
            let wait = match attempt {
                0 => Duration::from_millis(100),
                1 => Duration::from_millis(500),
                2 => Duration::from_secs(1),
                _ => Duration::from_secs(5),
            };
            tokio::time::sleep(wait).await;
        }
        Err(RelayError::NotReady { attempts: max_attempts })
    }

    /// Streams the whole source through to the relay endpoint as a single
    /// PUT. Only the first [`RELAY_WRITE_CHUNK`] bytes are buffered; past
    /// that, bytes stream straight from `source` with bounded memory. If the
    /// attempt fails before the stream has read anything past the buffered
    /// prefix, the whole PUT is retried once from that same prefix — once
    /// streaming has moved past it, those bytes are gone and the error is
    /// returned as-is.
    pub async fn write_stream<R>(&self, url: &Url, mut source: R) -> Result<u64, RelayError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut prefix = BytesMut::zeroed(RELAY_WRITE_CHUNK);
        let mut filled = 0;
        while filled < prefix.len() {
            let n = source
                .read(&mut prefix[filled..])
                .await
                .map_err(|source| RelayError::SourceRead { source })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        prefix.truncate(filled);
        let prefix = prefix.freeze();
        // Shared, not moved outright, so a retry can hand the same
        // never-advanced reader to a second attempt.
        let reader = Arc::new(std::sync::Mutex::new(source));

        match self.put_stream(url, prefix.clone(), reader.clone()).await {
            Ok(total) => Ok(total),
            Err((error, false)) => {
                warn!(url = %redact_url(url), error = %error, "relay PUT failed before the stream advanced past the buffered prefix, retrying once");
                self.put_stream(url, prefix, reader).await.map_err(|(error, _)| error)
            }
            Err((error, true)) => Err(error),
        }
    }

    /// Sends `prefix` followed by the rest of `reader` as a single PUT body.
    /// On failure, the `bool` says whether the stream ever read anything
    /// past `prefix` before the failure, which is what the caller needs to
    /// decide whether a retry is safe.
    async fn put_stream<R>(&self, url: &Url, prefix: Bytes, reader: Arc<std::sync::Mutex<R>>) -> Result<u64, (RelayError, bool)>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let touched = Arc::new(AtomicBool::new(false));
        let total = Arc::new(AtomicU64::new(0));
        let body = Body::wrap_stream(PrefixedStream {
            prefix: Some(prefix),
            reader,
            buf: BytesMut::new(),
            touched: touched.clone(),
            total: total.clone(),
        });

        let response = self
            .client
            .put(url.clone())
            .header("x-ms-version", BLOB_STORE_API_VERSION)
            .body(body)
            .send()
            .await
            .map_err(|source| (RelayError::Transport { source }, touched.load(Ordering::Relaxed)))?;

        if response.status().is_success() {
            return Ok(total.load(Ordering::Relaxed));
        }
        let header = relay_error_header(&response);
        let status = response.status();
        warn!(status = %status, ?header, "relay PUT failed");
        Err((classify_relay_error(status, header.as_deref()), touched.load(Ordering::Relaxed)))
    }

    /// Opens the relay's streaming GET and returns the whole body. Relay
    /// mode has no per-block addressing, so there is nothing smaller to read
    /// incrementally against; callers that need bounded memory on the read
    /// side should not use relay mode.
    pub async fn read_stream(&self, url: &Url) -> Result<Bytes, RelayError> {
        let response = self
            .client
            .get(url.clone())
            .header("x-ms-version", BLOB_STORE_API_VERSION)
            .send()
            .await
            .map_err(|source| RelayError::Transport { source })?;

        if !response.status().is_success() {
            let header = relay_error_header(&response);
            let status = response.status();
            return Err(classify_relay_error(status, header.as_deref()));
        }
        response.bytes().await.map_err(|source| RelayError::Transport { source })
    }
}

/// Feeds a buffered `prefix` as the first item, then reads the rest of
/// `reader` directly, reporting via `touched` the moment anything past the
/// prefix is actually read, and accumulating the running byte total in
/// `total`. `reader` is shared rather than owned outright so a failed,
/// not-yet-touched attempt can hand the same reader to a retry.
struct PrefixedStream<R> {
    prefix: Option<Bytes>,
    reader: Arc<std::sync::Mutex<R>>,
    buf: BytesMut,
    touched: Arc<AtomicBool>,
    total: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> Stream for PrefixedStream<R> {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(prefix) = this.prefix.take() {
            if !prefix.is_empty() {
                this.total.fetch_add(prefix.len() as u64, Ordering::Relaxed);
                return Poll::Ready(Some(Ok(prefix)));
            }
        }

        if this.buf.len() != RELAY_WRITE_CHUNK {
            this.buf.resize(RELAY_WRITE_CHUNK, 0);
        }
        let mut read_buf = ReadBuf::new(&mut this.buf);
        let mut reader = this.reader.lock().expect("relay stream reader mutex poisoned");
        let poll = Pin::new(&mut *reader).poll_read(cx, &mut read_buf);
        match poll {
            Poll::Ready(Ok(())) => {
                let n = read_buf.filled().len();
                drop(reader);
                if n == 0 {
                    Poll::Ready(None)
                } else {
                    this.touched.store(true, Ordering::Relaxed);
                    this.total.fetch_add(n as u64, Ordering::Relaxed);
                    Poll::Ready(Some(Ok(Bytes::copy_from_slice(read_buf.filled()))))
                }
            }
            Poll::Ready(Err(error)) => Poll::Ready(Some(Err(error))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_already_called_maps_to_conflict() {
        assert!(matches!(
            classify_relay_error(StatusCode::CONFLICT, Some("AlreadyCalled")),
            RelayError::AlreadyCalled
        ));
    }

    #[test]
    fn classify_failed_to_open_reader_ignores_status() {
        assert!(matches!(
            classify_relay_error(StatusCode::INTERNAL_SERVER_ERROR, Some("FailedToOpenReader")),
            RelayError::FailedToOpenReader
        ));
    }

    #[test]
    fn classify_method_not_allowed() {
        assert!(matches!(
            classify_relay_error(StatusCode::METHOD_NOT_ALLOWED, None),
            RelayError::MethodNotAllowed
        ));
    }
}
