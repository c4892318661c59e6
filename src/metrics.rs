//! Byte/block counters and a periodic throughput log line.
//!
//! Counters are published through the `metrics` crate's facade so a host
//! application's own recorder (Prometheus, StatsD, whatever) picks them up
//! without this crate depending on a specific backend; the ticker task additionally
//! logs a human-readable summary line, which is the only observability a
//! caller gets if it never installs a recorder at all.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::block::BufferPool;

const METRIC_BYTES_TOTAL: &str = "tyger_dataplane_bytes_total";
const METRIC_BLOCKS_TOTAL: &str = "tyger_dataplane_blocks_total";
const METRIC_BYTES_IN_FLIGHT: &str = "tyger_dataplane_bytes_in_flight";
const METRIC_BUFFER_POOL_SIZE: &str = "tyger_dataplane_buffer_pool_size";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

/// Shared counters updated by the worker pools as blocks complete.
pub struct TransferMetrics {
    direction: Direction,
    buffer_id: String,
    bytes_total: AtomicU64,
    blocks_total: AtomicU64,
    bytes_in_flight: AtomicU64,
}

impl TransferMetrics {
    pub fn new(direction: Direction, buffer_id: String) -> Arc<Self> {
        Arc::new(Self {
            direction,
            buffer_id,
            bytes_total: AtomicU64::new(0),
            blocks_total: AtomicU64::new(0),
            bytes_in_flight: AtomicU64::new(0),
        })
    }

    /// Call when a block's network request starts, before its bytes are
    /// known to have landed durably.
    pub fn block_started(&self, payload_len: u64) {
        self.bytes_in_flight.fetch_add(payload_len, Ordering::Relaxed);
        gauge!(METRIC_BYTES_IN_FLIGHT, "direction" => self.direction.label(), "buffer_id" => self.buffer_id.clone())
            .set(self.bytes_in_flight.load(Ordering::Relaxed) as f64);
    }

    /// Call when a block's network request finishes, successfully or not.
    pub fn block_finished(&self, payload_len: u64, succeeded: bool) {
        self.bytes_in_flight.fetch_sub(payload_len, Ordering::Relaxed);
        gauge!(METRIC_BYTES_IN_FLIGHT, "direction" => self.direction.label(), "buffer_id" => self.buffer_id.clone())
            .set(self.bytes_in_flight.load(Ordering::Relaxed) as f64);
        if succeeded {
            self.bytes_total.fetch_add(payload_len, Ordering::Relaxed);
            self.blocks_total.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_BYTES_TOTAL, "direction" => self.direction.label(), "buffer_id" => self.buffer_id.clone())
                .increment(payload_len);
            counter!(METRIC_BLOCKS_TOTAL, "direction" => self.direction.label(), "buffer_id" => self.buffer_id.clone())
                .increment(1);
        }
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    pub fn blocks_total(&self) -> u64 {
        self.blocks_total.load(Ordering::Relaxed)
    }

    pub fn report_buffer_pool_size(&self, size: usize) {
        gauge!(METRIC_BUFFER_POOL_SIZE, "direction" => self.direction.label(), "buffer_id" => self.buffer_id.clone())
            .set(size as f64);
    }
}

/// Logs a throughput line every `interval` until `cancel` fires, then logs a
/// final summary. Bits/s is computed from the delta since the previous tick,
/// not a lifetime average, so a stalled transfer shows `0 bit/s` rather than
/// a slowly decaying number. `buffer_pool` is `Some` on the upload path,
/// where idle-buffer count is a useful backpressure signal; the download
/// path has no pool to report.
pub async fn run_metrics_ticker(
    metrics: Arc<TransferMetrics>,
    interval: Duration,
    cancel: CancellationToken,
    buffer_pool: Option<BufferPool>,
) {
    let mut last_bytes = 0u64;
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let now_bytes = metrics.bytes_total();
                let delta = now_bytes.saturating_sub(last_bytes);
                let bits_per_sec = (delta * 8) as f64 / interval.as_secs_f64();
                info!(
                    direction = metrics.direction.label(),
                    buffer_id = %metrics.buffer_id,
                    bytes_total = now_bytes,
                    blocks_total = metrics.blocks_total(),
                    bits_per_sec,
                    "transfer progress"
                );
                if let Some(pool) = &buffer_pool {
                    metrics.report_buffer_pool_size(pool.len());
                }
                last_bytes = now_bytes;
            }
        }
    }

    info!(
        direction = metrics.direction.label(),
        buffer_id = %metrics.buffer_id,
        bytes_total = metrics.bytes_total(),
        blocks_total = metrics.blocks_total(),
        "transfer finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_finished_only_counts_successes() {
        let metrics = TransferMetrics::new(Direction::Upload, "buf1".to_owned());
        metrics.block_started(100);
        metrics.block_finished(100, false);
        assert_eq!(metrics.bytes_total(), 0);
        assert_eq!(metrics.blocks_total(), 0);

        metrics.block_started(50);
        metrics.block_finished(50, true);
        assert_eq!(metrics.bytes_total(), 50);
        assert_eq!(metrics.blocks_total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_stops_promptly_when_cancelled() {
        let metrics = TransferMetrics::new(Direction::Download, "buf2".to_owned());
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(run_metrics_ticker(metrics, Duration::from_secs(1), cancel_clone, None));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("ticker should stop promptly after cancellation")
            .unwrap();
    }
}
