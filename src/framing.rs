//! Writes and reads the start- and end-metadata sentinel blobs that delimit
//! a buffer, and drives the wait/terminate semantics the download pool needs
//! to tell "writer hasn't produced this block yet" from "writer is done".

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::config::{CURRENT_BUFFER_FORMAT_VERSION, END_METADATA_BLOB_NAME, START_METADATA_BLOB_NAME};
use crate::hash::content_md5;
use crate::http_engine::{HttpError, RequestEngine};

#[derive(Debug, Snafu)]
pub enum FramingError {
    #[snafu(display("buffer cannot be overwritten: start metadata already exists"))]
    AlreadyWritten,
    #[snafu(display("failed to probe start metadata: {source}"))]
    Probe { source: HttpError },
    #[snafu(display("failed to write metadata blob: {source}"))]
    Write { source: HttpError },
    #[snafu(display("failed to read start metadata: {source}"))]
    Read { source: HttpError },
    #[snafu(display("start metadata is missing or unreadable: {reason}"))]
    Malformed { reason: String },
    #[snafu(display("buffer format version {found} is not supported (expected {CURRENT_BUFFER_FORMAT_VERSION})"))]
    UnsupportedVersion { found: String },
}

#[derive(Serialize, Deserialize)]
struct StartMetadata {
    version: String,
}

/// Terminal status recorded in the end-metadata blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Complete,
    Failed,
}

#[derive(Serialize, Deserialize)]
struct EndMetadataPayload {
    status: TerminalStatus,
    /// Lets a reader learn the final block index straight from the
    /// end-metadata payload instead of waiting to observe the terminal
    /// zero-length block itself; omitted on the wire when absent so the
    /// blob stays byte-compatible with a reader that only knows `status`.
    #[serde(skip_serializing_if = "Option::is_none")]
    final_index: Option<u64>,
}

/// Writes the start-metadata blob, failing if one already exists.
pub async fn write_start_metadata(http: &RequestEngine, container: &Url) -> Result<(), FramingError> {
    match http.head(container, START_METADATA_BLOB_NAME).await {
        Ok(Some(_)) => return Err(FramingError::AlreadyWritten),
        Ok(None) => {}
        Err(source) => return Err(FramingError::Probe { source }),
    }

    let body = serde_json::to_vec(&StartMetadata {
        version: CURRENT_BUFFER_FORMAT_VERSION.to_owned(),
    })
    .expect("StartMetadata always serializes");
    let md5 = content_md5(&body);

    http.put_block(container, START_METADATA_BLOB_NAME, Bytes::from(body), &md5, None)
        .await
        .map_err(|source| FramingError::Write { source })
}

/// Writes the end-metadata blob with the given terminal status. Callers on
/// a cancelled path should wrap this in a fresh, short-deadline context that
/// inherits no cancellation from the parent; see
/// [`write_end_metadata_with_deadline`].
pub async fn write_end_metadata(
    http: &RequestEngine,
    container: &Url,
    status: TerminalStatus,
    final_index: Option<u64>,
) -> Result<(), FramingError> {
    let body = serde_json::to_vec(&EndMetadataPayload { status, final_index }).expect("EndMetadataPayload always serializes");
    let md5 = content_md5(&body);
    http.put_block(container, END_METADATA_BLOB_NAME, Bytes::from(body), &md5, None)
        .await
        .map_err(|source| FramingError::Write { source })
}

/// Best-effort end-metadata write under a short deadline, for the path
/// where the transfer's own cancellation already fired. Errors are
/// logged and swallowed rather than propagated: by this point the
/// transfer's outcome is already decided, and a failure to record it
/// shouldn't mask that outcome or block shutdown.
pub async fn write_end_metadata_with_deadline(
    http: &RequestEngine,
    container: &Url,
    status: TerminalStatus,
    final_index: Option<u64>,
    deadline: Duration,
) {
    match tokio::time::timeout(deadline, write_end_metadata(http, container, status, final_index)).await {
        Ok(Ok(())) => info!(?status, "wrote end metadata"),
        Ok(Err(error)) => warn!(?error, "failed to write end metadata"),
        Err(_) => warn!(?deadline, "timed out writing end metadata"),
    }
}

/// Reads and validates the start-metadata blob. Required before the reader
/// reports the first data block to its consumer.
pub async fn read_start_metadata(http: &RequestEngine, container: &Url) -> Result<(), FramingError> {
    let response = http
        .get_block(container, START_METADATA_BLOB_NAME)
        .await
        .map_err(|source| FramingError::Read { source })?;

    let parsed: StartMetadata = serde_json::from_slice(&response.payload)
        .map_err(|e| FramingError::Malformed { reason: e.to_string() })?;

    if parsed.version != CURRENT_BUFFER_FORMAT_VERSION {
        return Err(FramingError::UnsupportedVersion { found: parsed.version });
    }
    Ok(())
}

/// Shared state the download pool consults on every 404: has the writer
/// finished, and if so, with what final block index and status.
pub struct EndMetadataState {
    waiting: AtomicBool,
    final_index: AtomicI64,
    status: Mutex<Option<TerminalStatus>>,
}

impl EndMetadataState {
    pub fn new() -> Self {
        Self {
            waiting: AtomicBool::new(true),
            final_index: AtomicI64::new(-1),
            status: Mutex::new(None),
        }
    }

    /// True while the writer has not yet been observed to finish: a 404 in
    /// this state means "not produced yet", not an error.
    pub fn waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn final_index(&self) -> Option<u64> {
        let v = self.final_index.load(Ordering::Acquire);
        (v >= 0).then_some(v as u64)
    }

    pub fn status(&self) -> Option<TerminalStatus> {
        *self.status.lock().expect("end metadata mutex poisoned")
    }

    /// Records a final index learned either from the end-metadata payload
    /// or by observing a zero-length block; first writer wins.
    pub fn record_final_index(&self, index: u64) {
        let _ = self
            .final_index
            .compare_exchange(-1, index as i64, Ordering::AcqRel, Ordering::Acquire);
    }

    fn mark_done(&self, status: TerminalStatus, final_index: Option<u64>) {
        *self.status.lock().expect("end metadata mutex poisoned") = Some(status);
        if let Some(index) = final_index {
            self.record_final_index(index);
        }
        self.waiting.store(false, Ordering::Release);
    }
}

impl Default for EndMetadataState {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls the end-metadata blob every `poll_interval` until it is readable,
/// then updates `state` and returns.
pub async fn poll_end_metadata(
    http: RequestEngine,
    container: Url,
    poll_interval: Duration,
    state: std::sync::Arc<EndMetadataState>,
    cancel: CancellationToken,
) {
    loop {
        match http.get_block(&container, END_METADATA_BLOB_NAME).await {
            Ok(response) => match serde_json::from_slice::<EndMetadataPayload>(&response.payload) {
                Ok(payload) => {
                    info!(status = ?payload.status, "end metadata observed");
                    state.mark_done(payload.status, payload.final_index);
                    return;
                }
                Err(error) => warn!(?error, "end metadata blob was malformed, will keep polling"),
            },
            Err(HttpError::NotFoundWhileWaiting { .. }) => {}
            Err(error) => warn!(?error, "error polling end metadata, will keep polling"),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_metadata_state_starts_waiting_with_no_final_index() {
        let state = EndMetadataState::new();
        assert!(state.waiting());
        assert_eq!(state.final_index(), None);
        assert_eq!(state.status(), None);
    }

    #[test]
    fn record_final_index_keeps_the_first_value() {
        let state = EndMetadataState::new();
        state.record_final_index(42);
        state.record_final_index(7);
        assert_eq!(state.final_index(), Some(42));
    }

    #[test]
    fn mark_done_clears_waiting_and_sets_status() {
        let state = EndMetadataState::new();
        state.mark_done(TerminalStatus::Complete, Some(10));
        assert!(!state.waiting());
        assert_eq!(state.status(), Some(TerminalStatus::Complete));
        assert_eq!(state.final_index(), Some(10));
    }

    #[test]
    fn end_metadata_payload_round_trips_without_final_index() {
        let payload = EndMetadataPayload {
            status: TerminalStatus::Failed,
            final_index: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("final_index"));
        let parsed: EndMetadataPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, TerminalStatus::Failed);
    }

    #[test]
    fn status_serializes_lowercase_matching_the_wire_format() {
        assert_eq!(serde_json::to_string(&TerminalStatus::Complete).unwrap(), "\"complete\"");
        assert_eq!(serde_json::to_string(&TerminalStatus::Failed).unwrap(), "\"failed\"");
    }
}
