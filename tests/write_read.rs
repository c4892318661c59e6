//! End-to-end coverage of `write`/`read` against the in-process fake blob
//! store in `common`: round-tripping bytes, the overwrite-protection
//! guarantee on the start-metadata blob, and the file-backed access URL
//! path through the same orchestration.

mod common;

use std::io::Cursor;
use std::sync::Arc;

use tyger_dataplane::framing::FramingError;
use tyger_dataplane::{read, write, AccessUrlHolder, RequestEngine, TransferConfig, TransferError};

use common::FakeStore;

fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn roundtrip_write_then_read_reproduces_the_source_bytes() {
    let container = FakeStore::new().spawn().await;
    let access = Arc::new(AccessUrlHolder::direct(container));
    let http = RequestEngine::new().unwrap();
    let config = TransferConfig::builder().block_size(64).build().unwrap();
    let source = sample_bytes(10_000);

    write(
        Cursor::new(source.clone()),
        access.clone(),
        http.clone(),
        config.clone(),
        "roundtrip".to_owned(),
    )
    .await
    .unwrap();

    let temp = tempfile::NamedTempFile::new().unwrap();
    let path = temp.path().to_path_buf();
    let sink = tokio::fs::File::create(&path).await.unwrap();
    read(sink, access, http, config, "roundtrip".to_owned()).await.unwrap();

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written, source);
}

#[tokio::test]
async fn overwrite_protection_rejects_a_second_write() {
    let container = FakeStore::new().spawn().await;
    let access = Arc::new(AccessUrlHolder::direct(container));
    let http = RequestEngine::new().unwrap();
    let config = TransferConfig::builder().block_size(64).build().unwrap();

    write(
        Cursor::new(sample_bytes(256)),
        access.clone(),
        http.clone(),
        config.clone(),
        "overwrite".to_owned(),
    )
    .await
    .unwrap();

    let result = write(Cursor::new(sample_bytes(64)), access, http, config, "overwrite".to_owned()).await;

    match result {
        Err(TransferError::Framing {
            source: FramingError::AlreadyWritten,
        }) => {}
        other => panic!("expected a rejected overwrite, got {other:?}"),
    }
}

#[tokio::test]
async fn write_then_read_through_a_file_backed_access_url() {
    let container = FakeStore::new().spawn().await;
    let url_file = tempfile::NamedTempFile::new().unwrap();
    tokio::fs::write(url_file.path(), container.as_str()).await.unwrap();

    let access = Arc::new(AccessUrlHolder::from_file(url_file.path()).await.unwrap());
    let http = RequestEngine::new().unwrap();
    let config = TransferConfig::builder().block_size(128).build().unwrap();
    let source = sample_bytes(4_096);

    write(
        Cursor::new(source.clone()),
        access.clone(),
        http.clone(),
        config.clone(),
        "file-backed".to_owned(),
    )
    .await
    .unwrap();

    let temp = tempfile::NamedTempFile::new().unwrap();
    let path = temp.path().to_path_buf();
    let sink = tokio::fs::File::create(&path).await.unwrap();
    read(sink, access, http, config, "file-backed".to_owned()).await.unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), source);
}
