//! Tunable knobs for a transfer, collected behind a `TransferConfig` /
//! `TransferConfigBuilder` split: defaults live next to each setter's doc
//! comment, and `build()` performs cross-field validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Default block size: 4 MiB, a reasonable default for blob-store part
/// sizes and the middle value in the round-trip test matrix.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Default degree of parallelism for uploads.
pub const DEFAULT_UPLOAD_DOP: usize = 16;

/// Default degree of parallelism for downloads.
pub const DEFAULT_DOWNLOAD_DOP: usize = 32;

/// Default max-interval flush.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default end-metadata deadline when the parent context is cancelled.
pub const DEFAULT_END_METADATA_DEADLINE: Duration = Duration::from_secs(3);

/// Default end-metadata poll interval on the read side.
pub const DEFAULT_END_METADATA_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default metrics tick interval.
pub const DEFAULT_METRICS_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Current buffer envelope format version.
pub const CURRENT_BUFFER_FORMAT_VERSION: &str = "0.3.0";

/// Name of the start-metadata sentinel blob.
pub const START_METADATA_BLOB_NAME: &str = ".bufferstart";

/// Name of the end-metadata sentinel blob.
pub const END_METADATA_BLOB_NAME: &str = ".bufferend";

/// Per-error-class retry bounds and backoff shape.
///
/// The 5xx retry bound is pinned at 100 here, a large budget rather than
/// the tighter 6-attempt transport budget, since 500/503 are usually
/// transient load-shedding on the store side rather than a structural
/// problem with the request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryBudgets {
    /// Exponential backoff base delay. Default 800ms.
    pub backoff_base: Duration,
    /// Exponential backoff cap. Default 30s.
    pub backoff_cap: Duration,
    /// Attempts allowed for transport-level errors (DNS/TCP/TLS). Default 6.
    pub transport_attempts: u32,
    /// Attempts allowed for an MD5 mismatch on GET or PUT. Default 5.
    pub md5_mismatch_attempts: u32,
    /// Attempts allowed for 500/503 responses. Default 100.
    pub server_busy_attempts: u32,
    /// Attempts allowed for 403 `AuthenticationFailed` before giving up and
    /// surfacing `AccessUrlInvalid` as fatal. Default 5.
    pub access_url_invalid_attempts: u32,
}

impl Default for RetryBudgets {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(800),
            backoff_cap: Duration::from_secs(30),
            transport_attempts: 6,
            md5_mismatch_attempts: 5,
            server_busy_attempts: 100,
            access_url_invalid_attempts: 5,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("block_size must be greater than zero"))]
    ZeroBlockSize,
    #[snafu(display("dop must be at least 1, got {dop}"))]
    ZeroDop { dop: usize },
    #[snafu(display("flush_interval must be greater than zero"))]
    ZeroFlushInterval,
    #[snafu(display("tunnel_count must be at least 1 when tunneling is enabled, got {count}"))]
    ZeroTunnelCount { count: usize },
}

/// Top-level configuration for a single transfer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    pub block_size: usize,
    pub upload_dop: usize,
    pub download_dop: usize,
    pub flush_interval: Option<Duration>,
    pub end_metadata_deadline: Duration,
    pub end_metadata_poll_interval: Duration,
    pub metrics_tick_interval: Duration,
    pub retry_budgets: RetryBudgets,
    pub tunnel_count: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfigBuilder::default().build().expect("defaults are always valid")
    }
}

impl TransferConfig {
    pub fn builder() -> TransferConfigBuilder {
        TransferConfigBuilder::default()
    }
}

/// Builder for [`TransferConfig`]; see the module doc comment for the
/// pattern this follows.
#[derive(Debug)]
pub struct TransferConfigBuilder {
    block_size: Option<usize>,
    upload_dop: Option<usize>,
    download_dop: Option<usize>,
    flush_interval: Option<Duration>,
    end_metadata_deadline: Option<Duration>,
    end_metadata_poll_interval: Option<Duration>,
    metrics_tick_interval: Option<Duration>,
    retry_budgets: Option<RetryBudgets>,
    tunnel_count: Option<usize>,
}

impl Default for TransferConfigBuilder {
    fn default() -> Self {
        Self {
            block_size: None,
            upload_dop: None,
            download_dop: None,
            flush_interval: None,
            end_metadata_deadline: None,
            end_metadata_poll_interval: None,
            metrics_tick_interval: None,
            retry_budgets: None,
            tunnel_count: None,
        }
    }
}

impl TransferConfigBuilder {
    /// Sets the fixed block size in bytes. Defaults to 4 MiB.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = Some(size);
        self
    }

    /// Sets the upload worker count. Defaults to 16.
    pub fn upload_dop(mut self, dop: usize) -> Self {
        self.upload_dop = Some(dop);
        self
    }

    /// Sets the download worker count. Defaults to 32.
    pub fn download_dop(mut self, dop: usize) -> Self {
        self.download_dop = Some(dop);
        self
    }

    /// Enables max-interval flush mode with the given interval. When unset,
    /// the block reader uses fixed-block mode.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Sets the short deadline used to write end-metadata after the parent
    /// context is cancelled. Defaults to 3s.
    pub fn end_metadata_deadline(mut self, deadline: Duration) -> Self {
        self.end_metadata_deadline = Some(deadline);
        self
    }

    /// Sets the poll interval for the reader waiting on end-metadata.
    /// Defaults to 5s.
    pub fn end_metadata_poll_interval(mut self, interval: Duration) -> Self {
        self.end_metadata_poll_interval = Some(interval);
        self
    }

    /// Sets the metrics ticker interval. Defaults to 1s.
    pub fn metrics_tick_interval(mut self, interval: Duration) -> Self {
        self.metrics_tick_interval = Some(interval);
        self
    }

    /// Overrides the default retry budgets.
    pub fn retry_budgets(mut self, budgets: RetryBudgets) -> Self {
        self.retry_budgets = Some(budgets);
        self
    }

    /// Sets the number of SSH tunnels to maintain when tunneling is active.
    /// Defaults to 4.
    pub fn tunnel_count(mut self, count: usize) -> Self {
        self.tunnel_count = Some(count);
        self
    }

    pub fn build(self) -> Result<TransferConfig, ConfigError> {
        let block_size = self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        if block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        let upload_dop = self.upload_dop.unwrap_or(DEFAULT_UPLOAD_DOP);
        if upload_dop == 0 {
            return Err(ConfigError::ZeroDop { dop: upload_dop });
        }
        let download_dop = self.download_dop.unwrap_or(DEFAULT_DOWNLOAD_DOP);
        if download_dop == 0 {
            return Err(ConfigError::ZeroDop { dop: download_dop });
        }
        if let Some(interval) = self.flush_interval {
            if interval.is_zero() {
                return Err(ConfigError::ZeroFlushInterval);
            }
        }
        let tunnel_count = self.tunnel_count.unwrap_or(4);
        if tunnel_count == 0 {
            return Err(ConfigError::ZeroTunnelCount { count: tunnel_count });
        }

        Ok(TransferConfig {
            block_size,
            upload_dop,
            download_dop,
            flush_interval: self.flush_interval,
            end_metadata_deadline: self.end_metadata_deadline.unwrap_or(DEFAULT_END_METADATA_DEADLINE),
            end_metadata_poll_interval: self
                .end_metadata_poll_interval
                .unwrap_or(DEFAULT_END_METADATA_POLL_INTERVAL),
            metrics_tick_interval: self.metrics_tick_interval.unwrap_or(DEFAULT_METRICS_TICK_INTERVAL),
            retry_budgets: self.retry_budgets.unwrap_or_default(),
            tunnel_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TransferConfig::default();
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(config.upload_dop, 16);
        assert_eq!(config.download_dop, 32);
        assert_eq!(config.end_metadata_deadline, Duration::from_secs(3));
    }

    #[test]
    fn rejects_zero_block_size() {
        let err = TransferConfig::builder().block_size(0).build().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroBlockSize));
    }

    #[test]
    fn rejects_zero_dop() {
        assert!(TransferConfig::builder().upload_dop(0).build().is_err());
        assert!(TransferConfig::builder().download_dop(0).build().is_err());
    }

    #[test]
    fn rejects_zero_flush_interval() {
        let err = TransferConfig::builder()
            .flush_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ZeroFlushInterval));
    }

    #[test]
    fn builder_overrides_apply() {
        let config = TransferConfig::builder().block_size(1024).upload_dop(1).download_dop(1).build().unwrap();
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.upload_dop, 1);
        assert_eq!(config.download_dop, 1);
    }
}
