//! Integrity and failure-path coverage: a tampered hash chain, a payload
//! corrupted at rest, and a source stream that fails partway through a
//! write, all exercised against the in-process fake blob store in
//! `common`.

mod common;

use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use tyger_dataplane::config::RetryBudgets;
use tyger_dataplane::framing::TerminalStatus;
use tyger_dataplane::path::block_path;
use tyger_dataplane::{read, write, AccessUrlHolder, ErrorKind, RequestEngine, TransferConfig, TransferError};

use common::FakeStore;

fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn request_path(container_path: &str, index: u64) -> String {
    format!("{container_path}/{}", block_path(index))
}

#[tokio::test]
async fn download_detects_chain_tampering() {
    let store = FakeStore::new();
    let container = store.clone().spawn().await;
    let access = Arc::new(AccessUrlHolder::direct(container.clone()));
    let http = RequestEngine::new().unwrap();
    let config = TransferConfig::builder().block_size(64).build().unwrap();

    write(
        Cursor::new(sample_bytes(512)),
        access.clone(),
        http.clone(),
        config.clone(),
        "chain-tamper".to_owned(),
    )
    .await
    .unwrap();

    store.corrupt_chain_header(&request_path(container.path(), 0), "dGFtcGVyZWQ=");

    let temp = tempfile::NamedTempFile::new().unwrap();
    let sink = tokio::fs::File::create(temp.path()).await.unwrap();
    let result = read(sink, access, http, config, "chain-tamper".to_owned()).await;

    match result {
        Err(TransferError::ChainMismatch { index }) => assert_eq!(index, 0),
        other => panic!("expected a chain mismatch on block 0, got {other:?}"),
    }
}

#[tokio::test]
async fn download_detects_payload_corruption_via_content_md5() {
    let store = FakeStore::new();
    let container = store.clone().spawn().await;
    let access = Arc::new(AccessUrlHolder::direct(container.clone()));
    let http = RequestEngine::new().unwrap();
    let config = TransferConfig::builder().block_size(64).build().unwrap();

    write(
        Cursor::new(sample_bytes(512)),
        access.clone(),
        http.clone(),
        config.clone(),
        "md5-tamper".to_owned(),
    )
    .await
    .unwrap();

    store.corrupt_body(&request_path(container.path(), 0), vec![0xFFu8; 64]);

    // Fail fast instead of waiting through the real md5-mismatch backoff.
    let fast_fail_config = TransferConfig::builder()
        .block_size(64)
        .retry_budgets(RetryBudgets {
            md5_mismatch_attempts: 0,
            ..Default::default()
        })
        .build()
        .unwrap();

    let temp = tempfile::NamedTempFile::new().unwrap();
    let sink = tokio::fs::File::create(temp.path()).await.unwrap();
    let result = read(sink, access, http, fast_fail_config, "md5-tamper".to_owned()).await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::IntegrityMismatch);
}

/// An `AsyncRead` source that yields `remaining_ok` zero bytes and then
/// fails every subsequent read, to exercise the write path's error handling
/// without a real broken pipe.
struct FailingAfter {
    remaining_ok: usize,
}

impl AsyncRead for FailingAfter {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        if self.remaining_ok == 0 {
            return Poll::Ready(Err(std::io::Error::other("synthetic source failure")));
        }
        let n = buf.remaining().min(self.remaining_ok);
        buf.put_slice(&vec![0u8; n]);
        self.remaining_ok -= n;
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn write_failure_marks_end_metadata_as_failed() {
    let container = FakeStore::new().spawn().await;
    let access = Arc::new(AccessUrlHolder::direct(container));
    let http = RequestEngine::new().unwrap();
    let config = TransferConfig::builder().block_size(1_000_000).build().unwrap();

    let result = write(
        FailingAfter { remaining_ok: 16 },
        access.clone(),
        http.clone(),
        config.clone(),
        "write-failure".to_owned(),
    )
    .await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Transport);

    #[derive(serde::Deserialize)]
    struct EndMetadataProbe {
        status: TerminalStatus,
    }

    let response = http
        .get_block(&access.current(), tyger_dataplane::config::END_METADATA_BLOB_NAME)
        .await
        .unwrap();
    let probe: EndMetadataProbe = serde_json::from_slice(&response.payload).unwrap();
    assert_eq!(probe.status, TerminalStatus::Failed);
}
