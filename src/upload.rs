//! Fixed-size pool of workers that PUT blocks produced by a
//! [`crate::block::BlockReader`], computing the hash chain in block-index
//! order while allowing the network PUTs themselves to run out of order and
//! concurrently.
//!
//! Concurrency shape: one feeder task owns the `BlockReader` and fans blocks
//! out over a bounded channel; `upload_dop` workers share that channel's
//! receiving end. Each worker computes its block's `Content-MD5`
//! immediately, but must wait for the *previous* block's chain value before
//! it can compute and send its own — that dependency is the only ordering
//! constraint, and it's expressed with a [`ChainBroker`] rather than with a
//! single upload-order queue, so block 5's PUT can be in flight before block
//! 4's has returned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncRead;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};
use url::Url;

use crate::access_url::AccessUrlHolder;
use crate::block::{Block, BlockReader};
use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::hash::{chain_next, content_md5, H0};
use crate::http_engine::{backoff, HttpError, RequestEngine};
use crate::path::block_path;

/// Publishes each block index's chain value exactly once and lets any number
/// of waiters block on a given index until it appears.
struct ChainBroker {
    state: Mutex<HashMap<u64, String>>,
    notify: Notify,
}

impl ChainBroker {
    fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    fn publish(&self, index: u64, chain: String) {
        self.state.lock().expect("chain broker mutex poisoned").insert(index, chain);
        self.notify.notify_waiters();
    }

    async fn wait_for(&self, index: u64) -> String {
        if index == 0 {
            return H0.to_owned();
        }
        loop {
            let notified = self.notify.notified();
            if let Some(chain) = self.state.lock().expect("chain broker mutex poisoned").get(&index) {
                return chain.clone();
            }
            notified.await;
        }
    }
}

/// First error reported by any worker or the feeder; later errors are
/// logged and dropped.
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

    /// Takes the recorded error, if any. Only meaningful once every worker
    /// and the feeder have finished, so there is no concurrent writer left.
    fn take(&self) -> Option<TransferError> {
        self.slot.lock().expect("first-error mutex poisoned").take()
    }
}

pub struct UploadOutcome {
    pub blocks_written: u64,
    pub final_index: u64,
    pub final_chain: String,
}

/// Runs the upload worker pool to completion against `container`, reading
/// from `source` until [`BlockReader`] yields its terminal zero-length
/// block. Returns once every block, including the terminal one, has been
/// durably written, or once the first unrecoverable error is observed.
pub async fn run_upload_pool<R>(
    mut reader: BlockReader<R>,
    access: Arc<AccessUrlHolder>,
    http: RequestEngine,
    config: Arc<TransferConfig>,
    metrics: Arc<crate::metrics::TransferMetrics>,
    cancel: CancellationToken,
) -> Result<UploadOutcome, TransferError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Block>(config.upload_dop * 2);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let pool = reader.pool().clone();
    let broker = Arc::new(ChainBroker::new());
    let first_error = Arc::new(FirstError::new(cancel.clone()));
    let blocks_written = Arc::new(AtomicU64::new(0));
    let final_index = Arc::new(Mutex::new(None::<u64>));

    let feeder_cancel = cancel.clone();
    let feeder_error = first_error.clone();
    let feeder = tokio::spawn(async move {
        loop {
            if feeder_cancel.is_cancelled() {
                return;
            }
            let block = tokio::select! {
                _ = feeder_cancel.cancelled() => return,
                result = reader.next_block() => result,
            };
            match block {
                Ok(Some(block)) => {
                    let is_terminal = block.is_terminal();
                    if tx.send(block).await.is_err() {
                        return;
                    }
                    if is_terminal {
                        return;
                    }
                }
                Ok(None) => return,
                Err(source) => {
                    feeder_error.report(TransferError::SourceRead { source });
                    return;
                }
            }
        }
    });

    let mut workers = Vec::with_capacity(config.upload_dop);
    for _ in 0..config.upload_dop {
        let rx = rx.clone();
        let broker = broker.clone();
        let access = access.clone();
        let http = http.clone();
        let config = config.clone();
        let cancel = cancel.clone();
        let first_error = first_error.clone();
        let blocks_written = blocks_written.clone();
        let final_index = final_index.clone();
        let metrics = metrics.clone();
        let pool = pool.clone();

        workers.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let block = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(block) = block else { return };
                let index = block.index;
                let is_terminal = block.is_terminal();
                let payload_len = block.payload.len() as u64;

                let md5 = content_md5(&block.payload);
                let prev_chain = broker.wait_for(index).await;
                let chain = chain_next(&prev_chain, &md5);

                metrics.block_started(payload_len);
                let result = put_block_with_retry(&http, &access, &config, &cancel, index, block.payload.clone(), &md5, &chain).await;
                metrics.block_finished(payload_len, result.is_ok());
                if let Ok(buf) = block.payload.try_into_mut() {
                    pool.release(buf);
                }

                match result {
                    Ok(()) => {
                        broker.publish(index + 1, chain.clone());
                        blocks_written.fetch_add(1, Ordering::Relaxed);
                        if is_terminal {
                            *final_index.lock().expect("final index mutex poisoned") = Some(index);
                        }
                    }
                    Err(error) => first_error.report(error),
                }
            }
        }));
    }

    let _ = feeder.await;
    for worker in workers {
        let _ = worker.await;
    }

    if let Some(error) = first_error.take() {
        return Err(error);
    }
    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }

    let final_index = final_index.lock().expect("final index mutex poisoned").expect("terminal block was written");
    let final_chain = broker.wait_for(final_index + 1).await;

    Ok(UploadOutcome {
        blocks_written: blocks_written.load(Ordering::Relaxed),
        final_index,
        final_chain,
    })
}

#[instrument(skip(http, access, config, cancel, payload), fields(block = %block_path(index)))]
async fn put_block_with_retry(
    http: &RequestEngine,
    access: &AccessUrlHolder,
    config: &TransferConfig,
    cancel: &CancellationToken,
    index: u64,
    payload: bytes::Bytes,
    md5: &str,
    chain: &str,
) -> Result<(), TransferError> {
    let path = block_path(index);
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let container = access.current();
        let result = http
            .put_block(&container, &path, payload.clone(), md5, Some(chain))
            .await;
        match result {
            Ok(()) => return Ok(()),
            Err(HttpError::OverwriteForbidden) => {
                // The store refused the write because something is already
                // there. That's only a real conflict if it isn't our own
                // lost-ack retry: HEAD the blob and, if its Content-MD5
                // already matches what this attempt would have written,
                // treat it as success rather than failing a write that
                // actually landed.
                match http.head(&container, &path).await {
                    Ok(Some(existing)) if existing.content_md5.as_deref() == Some(md5) => {
                        warn!(path = %path, "overwrite rejected but blob already matches this attempt, treating as success");
                        return Ok(());
                    }
                    Ok(_) => return Err(TransferError::Http { source: HttpError::OverwriteForbidden }),
                    Err(head_source) => return Err(TransferError::Http { source: head_source }),
                }
            }
            Err(source) if source.is_retryable() && attempt < retry_budget_for(&source, &config.retry_budgets) => {
                attempt += 1;
                let sleep = backoff(attempt, &config.retry_budgets);
                warn!(attempt, path = %path, error = %source, "retrying block upload");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
            Err(source) if source.is_retryable() => {
                return Err(TransferError::Http {
                    source: HttpError::RetriesExhausted {
                        budget: retry_budget_name_for(&source),
                        attempts: attempt,
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
        HttpError::NotFoundWhileWaiting { .. } => budgets.transport_attempts,
        _ => 0,
    }
}

fn retry_budget_name_for(error: &HttpError) -> &'static str {
    match error {
        HttpError::Transport { .. } | HttpError::BodyRead { .. } | HttpError::NotFoundWhileWaiting { .. } => "transport",
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
    async fn chain_broker_resolves_index_zero_to_h0_immediately() {
        let broker = ChainBroker::new();
        assert_eq!(broker.wait_for(0).await, H0);
    }

    #[tokio::test]
    async fn chain_broker_wakes_a_waiter_on_publish() {
        let broker = Arc::new(ChainBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.wait_for(3).await })
        };
        tokio::task::yield_now().await;
        broker.publish(3, "chain-3".to_owned());
        assert_eq!(waiter.await.unwrap(), "chain-3");
    }

    #[test]
    fn retry_budget_matches_the_error_class() {
        let budgets = crate::config::RetryBudgets::default();
        assert_eq!(retry_budget_for(&HttpError::PermissionDenied, &budgets), 0);
        assert_eq!(
            retry_budget_for(&HttpError::TransientStatus { status: reqwest::StatusCode::INTERNAL_SERVER_ERROR }, &budgets),
            budgets.server_busy_attempts
        );
    }
}
