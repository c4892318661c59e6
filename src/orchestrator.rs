//! The two public entry points: `write` streams a source into a buffer,
//! `read` streams a buffer out to a sink. Both compose the framing
//! protocol, a worker pool, and the metrics ticker the same way regardless
//! of which blob-store container or relay endpoint is underneath.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::access_url::AccessUrlHolder;
use crate::block::{BlockReader, BufferPool};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::framing::{poll_end_metadata, read_start_metadata, write_end_metadata, write_end_metadata_with_deadline, write_start_metadata, EndMetadataState, TerminalStatus};
use crate::http_engine::RequestEngine;
use crate::metrics::{run_metrics_ticker, Direction, TransferMetrics};
use crate::upload::run_upload_pool;
use crate::download::run_download_pool;

pub struct WriteSummary {
    pub blocks_written: u64,
    pub bytes_written: u64,
}

pub struct ReadSummary {
    pub blocks_read: u64,
    pub bytes_read: u64,
}

/// Streams `source` into the buffer addressed by `access`, framing it with
/// start/end metadata and reporting progress through `metrics_buffer_id`.
pub async fn write<R>(
    source: R,
    access: Arc<AccessUrlHolder>,
    http: RequestEngine,
    config: TransferConfig,
    metrics_buffer_id: String,
) -> Result<WriteSummary, TransferError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let container = access.current();
    write_start_metadata(&http, &container)
        .await
        .map_err(|source| TransferError::Framing { source })?;

    let config = Arc::new(config);
    let cancel = CancellationToken::new();
    let pool = BufferPool::new();
    let reader = BlockReader::new(source, config.block_size, config.flush_interval, pool.clone());

    let metrics = TransferMetrics::new(Direction::Upload, metrics_buffer_id);
    let ticker = tokio::spawn(run_metrics_ticker(
        metrics.clone(),
        config.metrics_tick_interval,
        cancel.clone(),
        Some(pool),
    ));

    let result = run_upload_pool(reader, access, http.clone(), config.clone(), metrics.clone(), cancel.clone()).await;

    cancel.cancel();
    let _ = ticker.await;

    match result {
        Ok(outcome) => {
            write_end_metadata(&http, &container, TerminalStatus::Complete, Some(outcome.final_index))
                .await
                .map_err(|source| TransferError::Framing { source })?;
            info!(blocks = outcome.blocks_written, "write completed");
            Ok(WriteSummary {
                blocks_written: outcome.blocks_written,
                bytes_written: metrics.bytes_total(),
            })
        }
        Err(error) => {
            warn!(?error, "write failed, recording terminal failure");
            write_end_metadata_with_deadline(
                &http,
                &container,
                TerminalStatus::Failed,
                None,
                config.end_metadata_deadline,
            )
            .await;
            Err(error)
        }
    }
}

/// Streams the buffer addressed by `access` into `sink`, waiting on
/// end-metadata for blocks that haven't been produced yet.
pub async fn read<W>(
    sink: W,
    access: Arc<AccessUrlHolder>,
    http: RequestEngine,
    config: TransferConfig,
    metrics_buffer_id: String,
) -> Result<ReadSummary, TransferError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let container = access.current();
    read_start_metadata(&http, &container)
        .await
        .map_err(|source| TransferError::Framing { source })?;

    let config = Arc::new(config);
    let cancel = CancellationToken::new();
    let end_metadata = Arc::new(EndMetadataState::new());

    let poller = tokio::spawn(poll_end_metadata(
        http.clone(),
        container.clone(),
        config.end_metadata_poll_interval,
        end_metadata.clone(),
        cancel.clone(),
    ));

    let metrics = TransferMetrics::new(Direction::Download, metrics_buffer_id);
    let ticker = tokio::spawn(run_metrics_ticker(
        metrics.clone(),
        config.metrics_tick_interval,
        cancel.clone(),
        None,
    ));

    let result = run_download_pool(sink, access, http, config, metrics.clone(), end_metadata, cancel.clone()).await;

    cancel.cancel();
    let _ = poller.await;
    let _ = ticker.await;

    match result {
        Ok(outcome) => {
            info!(blocks = outcome.blocks_read, "read completed");
            Ok(ReadSummary {
                blocks_read: outcome.blocks_read,
                bytes_read: metrics.bytes_total(),
            })
        }
        Err(error) => {
            error!(?error, "read failed");
            Err(error)
        }
    }
}
