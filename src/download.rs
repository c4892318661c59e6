//! Fixed-size pool of workers that GET blocks by index, claimed via a shared
//! monotonic counter, with a single in-order consumer task that verifies the
//! hash chain and hands payloads to the sink in order.
//!
//! Workers race ahead of the consumer — worker claiming index 9 can finish
//! before the one claiming index 3 — but the consumer only ever sees index
//! `i+1` after it has processed `i`, via the same publish/wait-for-index
//! broker shape [`crate::upload::run_upload_pool`] uses for chain
//! propagation, applied here to whole GET results instead of just chain
//! values.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use url::Url;

use crate::access_url::AccessUrlHolder;
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::framing::EndMetadataState;
use crate::hash::{chain_next, H0};
use crate::http_engine::{backoff, not_found_tiered_sleep, HttpError, RequestEngine};
use crate::path::block_path;

struct FetchedBlock {
    payload: Bytes,
    content_md5: String,
    chain_header: Option<String>,
}

/// Publishes each claimed index's fetch result exactly once, for the
/// in-order consumer to pick up regardless of completion order.
struct ResultBroker {
    state: Mutex<HashMap<u64, FetchedBlock>>,
    notify: Notify,
}

impl ResultBroker {
    fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    fn publish(&self, index: u64, block: FetchedBlock) {
        self.state.lock().expect("result broker mutex poisoned").insert(index, block);
        self.notify.notify_waiters();
    }

    async fn take(&self, index: u64) -> FetchedBlock {
        loop {
            let notified = self.notify.notified();
            if let Some(block) = self.state.lock().expect("result broker mutex poisoned").remove(&index) {
                return block;
            }
            notified.await;
        }
    }
}

struct FirstError {
    slot: Mutex<Option<TransferError>>,
    cancel: CancellationToken,
}

impl FirstError {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            slot: Mutex::new(None),
            cancel,
        }
    }

    fn report(&self, error: TransferError) {
        let mut slot = self.slot.lock().expect("first-error mutex poisoned");
        if slot.is_none() {
            *slot = Some(error);
            self.cancel.cancel();
        } else {
            warn!(?error, "additional error after first failure, dropped");
        }
    }

    fn take(&self) -> Option<TransferError> {
        self.slot.lock().expect("first-error mutex poisoned").take()
    }
}

pub struct DownloadOutcome {
    pub blocks_read: u64,
    pub final_index: u64,
}

/// Runs the download worker pool to completion, writing verified payloads
/// to `sink` in order and stopping once the terminal zero-length block has
/// been written.
pub async fn run_download_pool<W>(
    mut sink: W,
    access: Arc<AccessUrlHolder>,
    http: RequestEngine,
    config: Arc<TransferConfig>,
    metrics: Arc<crate::metrics::TransferMetrics>,
    end_metadata: Arc<EndMetadataState>,
    cancel: CancellationToken,
) -> Result<DownloadOutcome, TransferError>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let broker = Arc::new(ResultBroker::new());
    let first_error = Arc::new(FirstError::new(cancel.clone()));
    let next_claim = Arc::new(AtomicU64::new(0));

    let mut workers = Vec::with_capacity(config.download_dop);
    for _ in 0..config.download_dop {
        let broker = broker.clone();
        let access = access.clone();
        let http = http.clone();
        let config = config.clone();
        let end_metadata = end_metadata.clone();
        let cancel = cancel.clone();
        let first_error = first_error.clone();
        let next_claim = next_claim.clone();
        let metrics = metrics.clone();

        workers.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                if let Some(final_index) = end_metadata.final_index() {
                    if next_claim.load(Ordering::Acquire) > final_index {
                        return;
                    }
                }
                let index = next_claim.fetch_add(1, Ordering::AcqRel);
                if let Some(final_index) = end_metadata.final_index() {
                    if index > final_index {
                        return;
                    }
                }

                metrics.block_started(0);
                let result = get_block_with_retry(&http, &access, &config, &end_metadata, &cancel, index).await;
                match result {
                    Ok(block) => {
                        metrics.block_finished(block.payload.len() as u64, true);
                        broker.publish(index, block);
                    }
                    Err(error) => {
                        metrics.block_finished(0, false);
                        match &error {
                            // A worker can legitimately race past the end of
                            // the buffer (claim an index the writer never
                            // produced) or observe cancellation after the
                            // consumer has already finished successfully;
                            // neither is a real failure, so don't let it
                            // clobber a correct read.
                            TransferError::Cancelled => {}
                            TransferError::Http {
                                source: HttpError::NotFoundAfterFinal { .. },
                            } => {}
                            _ => first_error.report(error),
                        }
                        return;
                    }
                }
            }
        }));
    }

    let mut prev_chain = H0.to_owned();
    let mut blocks_read = 0u64;
    let mut index = 0u64;
    let mut final_index = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let block = broker.take(index).await;
        let expected_chain = chain_next(&prev_chain, &block.content_md5);
        if let Some(actual_chain) = &block.chain_header {
            if *actual_chain != expected_chain {
                first_error.report(TransferError::ChainMismatch { index });
                break;
            }
        }

        let is_terminal = block.payload.is_empty();
        if !block.payload.is_empty() {
            if let Err(source) = sink.write_all(&block.payload).await {
                first_error.report(TransferError::SourceRead { source });
                break;
            }
        }

        prev_chain = expected_chain;
        blocks_read += 1;
        if is_terminal {
            end_metadata.record_final_index(index);
            final_index = Some(index);
            break;
        }
        index += 1;
    }

    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    let _ = sink.flush().await;

    if let Some(error) = first_error.take() {
        return Err(error);
    }

    let final_index = final_index.ok_or(TransferError::Cancelled)?;
    Ok(DownloadOutcome { blocks_read, final_index })
}

#[instrument(skip(http, access, config, end_metadata, cancel), fields(block = %block_path(index)))]
async fn get_block_with_retry(
    http: &RequestEngine,
    access: &AccessUrlHolder,
    config: &TransferConfig,
    end_metadata: &EndMetadataState,
    cancel: &CancellationToken,
    index: u64,
) -> Result<FetchedBlock, TransferError> {
    let path = block_path(index);
    let mut not_found_attempt = 0u32;
    let mut retry_attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let container = access.current();
        match http.get_block(&container, &path).await {
            Ok(response) => {
                return Ok(FetchedBlock {
                    payload: response.payload,
                    content_md5: response.content_md5,
                    chain_header: response.chain_header,
                });
            }
            Err(HttpError::NotFoundWhileWaiting { .. }) => {
                if let Some(final_index) = end_metadata.final_index() {
                    if index > final_index {
                        return Err(TransferError::Http {
                            source: HttpError::NotFoundAfterFinal { path },
                        });
                    }
                    return Err(TransferError::Http {
                        source: HttpError::NotFoundBelowFinal { path },
                    });
                }
                let sleep = not_found_tiered_sleep(not_found_attempt);
                not_found_attempt = not_found_attempt.saturating_add(1);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
            Err(source) if source.is_retryable() && retry_attempt < retry_budget_for(&source, &config.retry_budgets) => {
                retry_attempt += 1;
                let sleep = backoff(retry_attempt, &config.retry_budgets);
                warn!(attempt = retry_attempt, path = %path, error = %source, "retrying block download");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
            Err(source) if source.is_retryable() => {
                return Err(TransferError::Http {
                    source: HttpError::RetriesExhausted {
                        budget: retry_budget_name_for(&source),
                        attempts: retry_attempt,
                        last: Box::new(source),
                    },
                })
            }
            Err(source) => return Err(TransferError::Http { source }),
        }
    }
}

fn retry_budget_for(error: &HttpError, budgets: &crate::config::RetryBudgets) -> u32 {
    match error {
        HttpError::Transport { .. } | HttpError::BodyRead { .. } => budgets.transport_attempts,
        HttpError::IntegrityMismatch { .. } => budgets.md5_mismatch_attempts,
        HttpError::TransientStatus { .. } => budgets.server_busy_attempts,
        HttpError::AccessUrlInvalid { .. } => budgets.access_url_invalid_attempts,
        _ => 0,
    }
}

fn retry_budget_name_for(error: &HttpError) -> &'static str {
    match error {
        HttpError::Transport { .. } | HttpError::BodyRead { .. } => "transport",
        HttpError::IntegrityMismatch { .. } => "md5_mismatch",
        HttpError::TransientStatus { .. } => "server_busy",
        HttpError::AccessUrlInvalid { .. } => "access_url_invalid",
        _ => "none",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn result_broker_resolves_out_of_order_publishes() {
        let broker = Arc::new(ResultBroker::new());
        broker.publish(
            2,
            FetchedBlock {
                payload: Bytes::from_static(b"two"),
                content_md5: "md5-2".to_owned(),
                chain_header: None,
            },
        );
        let taken = broker.take(2).await;
        assert_eq!(&taken.payload[..], b"two");
    }

    #[tokio::test]
    async fn result_broker_wakes_a_waiter_on_publish() {
        let broker = Arc::new(ResultBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.take(1).await.content_md5 })
        };
        tokio::task::yield_now().await;
        broker.publish(
            1,
            FetchedBlock {
                payload: Bytes::new(),
                content_md5: "md5-1".to_owned(),
                chain_header: None,
            },
        );
        assert_eq!(waiter.await.unwrap(), "md5-1");
    }

    #[test]
    fn retry_budget_matches_the_error_class() {
        let budgets = crate::config::RetryBudgets::default();
        assert_eq!(retry_budget_for(&HttpError::PermissionDenied, &budgets), 0);
        assert_eq!(
            retry_budget_for(&HttpError::IntegrityMismatch { path: String::new() }, &budgets),
            budgets.md5_mismatch_attempts
        );
    }
}
