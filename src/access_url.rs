//! Keeps a valid pre-signed container URL available to the rest of the
//! engine, refreshing it before expiry or on external change.
//!
//! The three construction modes — direct, file-backed, and factory-backed —
//! each run (or don't run) a different background task, but all of them
//! publish through the same `ArcSwap<Url>`, so `current()` is always a
//! lock-free read and a race between an in-flight request and a rotation
//! resolves in the simplest way available: the in-flight request just
//! finishes under the URL it already captured.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use snafu::Snafu;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::http_engine::redact_url;

#[derive(Debug, Snafu)]
pub enum AccessUrlError {
    #[snafu(display("access URL file could not be read: {source}"))]
    FileRead { source: std::io::Error },
    #[snafu(display("access URL file contained an unparseable URL: {reason}"))]
    InvalidUrl { reason: String },
    #[snafu(display("access URL is missing required query parameter {name}"))]
    MissingParam { name: &'static str },
    #[snafu(display("access URL query parameter {name} is not valid RFC 3339: {value}"))]
    InvalidTimestamp { name: &'static str, value: String },
    #[snafu(display("failed to watch access URL file: {source}"))]
    Watch { source: notify::Error },
    #[snafu(display("control plane factory failed: {source}"))]
    Factory { source: ControlPlaneError },
}

/// The `st`/`se` lifetime window carried in a SAS URL's query string.
#[derive(Clone, Copy, Debug)]
struct Lifetime {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Lifetime {
    fn from_url(url: &Url) -> Result<Self, AccessUrlError> {
        let get = |name: &'static str| -> Result<DateTime<Utc>, AccessUrlError> {
            let value = url
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
                .ok_or(AccessUrlError::MissingParam { name })?;
            DateTime::parse_from_rfc3339(&value)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| AccessUrlError::InvalidTimestamp { name, value })
        };
        Ok(Self {
            start: get("st")?,
            end: get("se")?,
        })
    }

    /// 85% of the issued lifetime.
    fn refresh_at(&self) -> DateTime<Utc> {
        let total = self.end - self.start;
        self.start + (total * 85 / 100)
    }
}

/// Relay-mode marker: a container URL that carries `relay=true`.
pub fn is_relay_url(url: &Url) -> bool {
    url.query_pairs().any(|(k, v)| k == "relay" && v == "true")
}

/// Keeps a non-expired container URL available via a lock-free read.
pub struct AccessUrlHolder {
    current: Arc<ArcSwap<Url>>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AccessUrlHolder {
    /// A URL that never needs refreshing.
    pub fn direct(url: Url) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(url)),
            shutdown: None,
            task: None,
        }
    }

    /// A URL read from a file, reloaded whenever the file's contents or
    /// symlink target change. Performs one synchronous read up front so
    /// construction fails fast if the file is missing or empty.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, AccessUrlError> {
        let path = path.as_ref().to_path_buf();
        let initial = read_url_file(&path).await?;
        let current = Arc::new(ArcSwap::from_pointee(initial));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let watched_current = current.clone();
        let watched_path = path.clone();
        let task = tokio::task::spawn_blocking(move || {
            if let Err(error) = watch_file(&watched_path, watched_current, shutdown_rx) {
                error!(?error, "access URL file watcher stopped unexpectedly");
            }
        });

        Ok(Self {
            current,
            shutdown: Some(shutdown_tx),
            task: Some(tokio::spawn(async move {
                let _ = task.await;
            })),
        })
    }

    /// A URL refreshed from the control plane ahead of its expiry.
    pub fn from_factory(
        control_plane: Arc<dyn ControlPlane>,
        buffer_id: String,
        writeable: bool,
        ttl: Option<Duration>,
        initial: Url,
    ) -> Self {
        let current = Arc::new(ArcSwap::from_pointee(initial));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let refresher_current = current.clone();
        let task = tokio::spawn(refresh_loop(
            control_plane,
            buffer_id,
            writeable,
            ttl,
            refresher_current,
            shutdown_rx,
        ));

        Self {
            current,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Returns a non-expired URL as of the moment of the call. A request
    /// already in flight when the URL rotates completes under the URL it
    /// captured; only the next attempt observes the rotation.
    pub fn current(&self) -> Url {
        (**self.current.load()).clone()
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AccessUrlHolder {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn read_url_file(path: &Path) -> Result<Url, AccessUrlError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AccessUrlError::FileRead { source })?;
    Url::parse(contents.trim()).map_err(|e| AccessUrlError::InvalidUrl { reason: e.to_string() })
}

fn watch_file(
    path: &Path,
    current: Arc<ArcSwap<Url>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<(), AccessUrlError> {
    let (tx, rx) = std::sync::mpsc::channel::<notify::Result<Event>>();
    let mut watcher =
        RecommendedWatcher::new(tx, Config::default()).map_err(|source| AccessUrlError::Watch { source })?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    watcher
        .watch(parent, RecursiveMode::NonRecursive)
        .map_err(|source| AccessUrlError::Watch { source })?;

    loop {
        if shutdown_rx.try_recv().is_ok() {
            return Ok(());
        }
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(Ok(event)) => {
                if matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) && event.paths.iter().any(|p| paths_match(p, path))
                {
                    match std::fs::read_to_string(path) {
                        Ok(contents) => match Url::parse(contents.trim()) {
                            Ok(url) => {
                                debug!(path = ?path, "reloaded access URL from file");
                                current.store(Arc::new(url));
                            }
                            Err(error) => warn!(?error, "access URL file contains an unparseable URL"),
                        },
                        Err(error) => warn!(?error, "failed to re-read access URL file after change"),
                    }
                }
            }
            Ok(Err(error)) => warn!(?error, "access URL file watch error"),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

fn paths_match(candidate: &Path, target: &Path) -> bool {
    candidate == target || candidate.file_name() == target.file_name()
}

async fn refresh_loop(
    control_plane: Arc<dyn ControlPlane>,
    buffer_id: String,
    writeable: bool,
    ttl: Option<Duration>,
    current: Arc<ArcSwap<Url>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        let lifetime = match Lifetime::from_url(&current.load()) {
            Ok(lifetime) => lifetime,
            Err(error) => {
                warn!(?error, "could not parse access URL lifetime, refreshing in 30s");
                if sleep_or_shutdown(Duration::from_secs(30), &mut shutdown_rx).await {
                    return;
                }
                continue;
            }
        };

        let now = Utc::now();
        let refresh_at = lifetime.refresh_at();
        let wait = (refresh_at - now).to_std().unwrap_or(Duration::ZERO);
        if sleep_or_shutdown(wait, &mut shutdown_rx).await {
            return;
        }

        let mut attempt = 0u32;
        loop {
            match control_plane.access_url(&buffer_id, writeable, ttl).await {
                Ok(url) => {
                    info!(url = %redact_url(&url), "refreshed access URL");
                    current.store(Arc::new(url));
                    break;
                }
                Err(error) => {
                    attempt += 1;
                    let backoff = Duration::from_millis(200u64.saturating_mul(1 << attempt.min(10))).min(Duration::from_secs(30));
                    warn!(?error, attempt, "access URL refresh failed, retrying");
                    if sleep_or_shutdown(backoff, &mut shutdown_rx).await {
                        return;
                    }
                }
            }
        }
    }
}

/// Sleeps for `duration` unless a shutdown signal arrives first. Returns
/// `true` if shutdown was observed.
async fn sleep_or_shutdown(duration: Duration, shutdown_rx: &mut oneshot::Receiver<()>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown_rx => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_holder_returns_the_same_url_forever() {
        let url = Url::parse("https://store.example/container?sv=1").unwrap();
        let holder = AccessUrlHolder::direct(url.clone());
        assert_eq!(holder.current(), url);
        assert_eq!(holder.current(), url);
    }

    #[test]
    fn relay_url_is_detected() {
        let relay = Url::parse("https://relay.example/buffer?relay=true").unwrap();
        let plain = Url::parse("https://store.example/container").unwrap();
        assert!(is_relay_url(&relay));
        assert!(!is_relay_url(&plain));
    }

    #[test]
    fn lifetime_refresh_at_is_85_percent_of_issued_window() {
        let url = Url::parse(
            "https://store.example/c?st=2026-01-01T00:00:00Z&se=2026-01-01T00:10:00Z",
        )
        .unwrap();
        let lifetime = Lifetime::from_url(&url).unwrap();
        let refresh_at = lifetime.refresh_at();
        let expected = lifetime.start + (lifetime.end - lifetime.start) * 85 / 100;
        assert_eq!(refresh_at, expected);
        assert!(refresh_at < lifetime.end);
    }

    #[test]
    fn lifetime_requires_both_params() {
        let url = Url::parse("https://store.example/c?st=2026-01-01T00:00:00Z").unwrap();
        assert!(matches!(
            Lifetime::from_url(&url),
            Err(AccessUrlError::MissingParam { name: "se" })
        ));
    }

    #[tokio::test]
    async fn file_holder_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("url.txt");
        tokio::fs::write(&path, "https://store.example/container?sv=1\n")
            .await
            .unwrap();

        let holder = AccessUrlHolder::from_file(&path).await.unwrap();
        assert_eq!(
            holder.current(),
            Url::parse("https://store.example/container?sv=1").unwrap()
        );

        tokio::fs::write(&path, "https://store.example/container?sv=2\n")
            .await
            .unwrap();

        let mut observed_new = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if holder.current() == Url::parse("https://store.example/container?sv=2").unwrap() {
                observed_new = true;
                break;
            }
        }
        assert!(observed_new, "holder never observed the updated URL");
        holder.shutdown().await;
    }
}
