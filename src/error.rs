//! Crate-wide error aggregation.
//!
//! Every module defines its own narrow `snafu` enum; this module rolls them
//! up into one `TransferError` that the public `write`/`read` entry points
//! return, plus an `ErrorKind` classification that's independent of which
//! module produced the error — useful for callers that want to branch on
//! "is this retryable" without matching on every leaf variant.

use snafu::Snafu;

use crate::access_url::AccessUrlError;
use crate::framing::FramingError;
use crate::http_engine::HttpError;
use crate::relay::RelayError;
use crate::tunnel::TunnelError;

/// A classification of failure independent of which component raised it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    TransientStatus,
    IntegrityMismatch,
    NotFoundWhileWaiting,
    NotFoundAfterFinal,
    NotFoundBelowFinal,
    AccessUrlInvalid,
    PermissionDenied,
    OverwriteForbidden,
    BufferDoesNotExist,
    BufferFailedState,
    ProtocolViolation,
    Cancelled,
}

impl ErrorKind {
    /// Whether a fresh attempt at the same operation has a chance of
    /// succeeding.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Transport
                | ErrorKind::TransientStatus
                | ErrorKind::IntegrityMismatch
                | ErrorKind::NotFoundWhileWaiting
                | ErrorKind::AccessUrlInvalid
        )
    }
}

#[derive(Debug, Snafu)]
pub enum TransferError {
    #[snafu(display("{source}"))]
    Http { source: HttpError },

    #[snafu(display("{source}"))]
    AccessUrl { source: AccessUrlError },

    #[snafu(display("{source}"))]
    Framing { source: FramingError },

    #[snafu(display("{source}"))]
    Relay { source: RelayError },

    #[snafu(display("{source}"))]
    Tunnel { source: TunnelError },

    #[snafu(display("block {index} failed hash-chain verification"))]
    ChainMismatch { index: u64 },

    #[snafu(display("received block {actual} out of order, expected {expected}"))]
    OutOfOrderBlock { expected: u64, actual: u64 },

    #[snafu(display("buffer format version {found} is not supported"))]
    UnsupportedVersion { found: String },

    #[snafu(display("buffer ended in a failed state"))]
    BufferFailed,

    #[snafu(display("transfer was cancelled"))]
    Cancelled,

    #[snafu(display("error reading source stream: {source}"))]
    SourceRead { source: std::io::Error },
}

fn http_error_kind(error: &HttpError) -> ErrorKind {
    match error {
        HttpError::Transport { .. } | HttpError::BodyRead { .. } => ErrorKind::Transport,
        HttpError::TransientStatus { .. } => ErrorKind::TransientStatus,
        HttpError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
        HttpError::NotFoundWhileWaiting { .. } => ErrorKind::NotFoundWhileWaiting,
        HttpError::NotFoundAfterFinal { .. } => ErrorKind::NotFoundAfterFinal,
        HttpError::NotFoundBelowFinal { .. } => ErrorKind::NotFoundBelowFinal,
        HttpError::AccessUrlInvalid { .. } => ErrorKind::AccessUrlInvalid,
        HttpError::PermissionDenied => ErrorKind::PermissionDenied,
        HttpError::OverwriteForbidden => ErrorKind::OverwriteForbidden,
        HttpError::BufferDoesNotExist => ErrorKind::BufferDoesNotExist,
        HttpError::MissingContentLength | HttpError::MissingHeader { .. } | HttpError::UnexpectedStatus { .. } => {
            ErrorKind::ProtocolViolation
        }
        HttpError::RetriesExhausted { last, .. } => http_error_kind(last),
    }
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Http { source } => http_error_kind(source),
            TransferError::AccessUrl { .. } => ErrorKind::AccessUrlInvalid,
            TransferError::Framing { .. } => ErrorKind::ProtocolViolation,
            TransferError::Relay { .. } => ErrorKind::Transport,
            TransferError::Tunnel { .. } => ErrorKind::Transport,
            TransferError::ChainMismatch { .. } => ErrorKind::IntegrityMismatch,
            TransferError::OutOfOrderBlock { .. } => ErrorKind::ProtocolViolation,
            TransferError::UnsupportedVersion { .. } => ErrorKind::ProtocolViolation,
            TransferError::BufferFailed => ErrorKind::BufferFailedState,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::SourceRead { .. } => ErrorKind::Transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_the_http_layer_taxonomy() {
        assert!(ErrorKind::Transport.is_retryable());
        assert!(ErrorKind::TransientStatus.is_retryable());
        assert!(ErrorKind::IntegrityMismatch.is_retryable());
        assert!(ErrorKind::NotFoundWhileWaiting.is_retryable());
        assert!(ErrorKind::AccessUrlInvalid.is_retryable());
    }

    #[test]
    fn fatal_kinds_are_not_retryable() {
        assert!(!ErrorKind::PermissionDenied.is_retryable());
        assert!(!ErrorKind::OverwriteForbidden.is_retryable());
        assert!(!ErrorKind::BufferDoesNotExist.is_retryable());
        assert!(!ErrorKind::ProtocolViolation.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn chain_mismatch_classifies_as_integrity_mismatch() {
        assert_eq!(TransferError::ChainMismatch { index: 3 }.kind(), ErrorKind::IntegrityMismatch);
    }

    #[test]
    fn cancelled_classifies_as_cancelled() {
        assert_eq!(TransferError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
