//! Maintains a pool of SSH-forwarded local ports in front of a remote Unix
//! socket, so the rest of the engine can talk plain HTTP to `127.0.0.1:port`
//! without knowing a tunnel sits underneath.
//!
//! Each tunnel is one `ssh -nNT -L <port>:<socket> <host>` child process plus
//! a 1Hz health-check watcher; a dead or unhealthy child is killed and
//! recreated with exponential backoff, following the same jittered-backoff
//! shape as [`crate::http_engine::backoff`].

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use snafu::Snafu;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use url::Url;

/// Base delay for tunnel recreation backoff. Default 200ms.
pub const TUNNEL_BACKOFF_BASE: Duration = Duration::from_millis(200);
/// Cap for tunnel recreation backoff. Default 30s.
pub const TUNNEL_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Health-check poll interval.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Grace period given to a child process after `Close` before it's killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Snafu)]
pub enum TunnelError {
    #[snafu(display("failed to spawn ssh tunnel: {source}"))]
    Spawn { source: std::io::Error },
    #[snafu(display("local port pool is exhausted after {attempts} attempts"))]
    PortExhausted { attempts: u32 },
}

fn tunnel_backoff(attempt: u32) -> Duration {
    let exp = TUNNEL_BACKOFF_BASE.as_millis().saturating_mul(1u128 << attempt.min(16));
    let capped = exp.min(TUNNEL_BACKOFF_CAP.as_millis());
    let jittered = rand::rng().random_range(0..=capped.max(1));
    Duration::from_millis(jittered as u64)
}

/// One SSH-forwarded local port, owned and supervised by a background task.
struct Tunnel {
    local_port: u16,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// A fixed-size pool of SSH tunnels in front of the same remote host and
/// socket, round-robin assigned to outgoing requests.
pub struct TunnelPool {
    tunnels: Vec<Tunnel>,
    next: AtomicUsize,
}

impl TunnelPool {
    /// Spawns `count` tunnels, each forwarding a distinct local port chosen
    /// from the OS-assigned ephemeral range via port 0 binding, to
    /// `remote_socket_path` on `ssh_host`.
    pub async fn spawn(ssh_host: String, remote_socket_path: String, count: usize) -> Result<Self, TunnelError> {
        let mut tunnels = Vec::with_capacity(count);
        for _ in 0..count {
            let local_port = reserve_local_port().await?;
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let task = tokio::spawn(supervise_tunnel(
                ssh_host.clone(),
                remote_socket_path.clone(),
                local_port,
                shutdown_rx,
            ));
            tunnels.push(Tunnel {
                local_port,
                shutdown: shutdown_tx,
                task,
            });
        }
        Ok(Self {
            tunnels,
            next: AtomicUsize::new(0),
        })
    }

    /// Rewrites `url`'s host and port to the next tunnel in round-robin
    /// order, preserving scheme, path, and query.
    pub fn rewrite(&self, url: &Url) -> Url {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.tunnels.len();
        let port = self.tunnels[index].local_port;
        let mut rewritten = url.clone();
        let _ = rewritten.set_host(Some("127.0.0.1"));
        let _ = rewritten.set_port(Some(port));
        rewritten
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Signals every tunnel's watcher to stop, then waits up to
    /// [`SHUTDOWN_GRACE`] for the supervising tasks to exit before moving on.
    pub async fn close(self) {
        for tunnel in &self.tunnels {
            // A send failure means the task already exited; nothing to do.
            let _ = tunnel.shutdown.send(());
        }
        for tunnel in self.tunnels {
            match tokio::time::timeout(SHUTDOWN_GRACE, tunnel.task).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(?error, "tunnel supervisor task panicked"),
                Err(_) => warn!(port = tunnel.local_port, "tunnel supervisor did not exit within grace period"),
            }
        }
    }
}

async fn reserve_local_port() -> Result<u16, TunnelError> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|source| TunnelError::Spawn { source })?;
    let port = listener
        .local_addr()
        .map_err(|source| TunnelError::Spawn { source })?
        .port();
    // Dropping the listener frees the port for ssh to bind; there is an
    // unavoidable race against another process grabbing it first, which the
    // supervisor's backoff-and-retry loop absorbs.
    drop(listener);
    Ok(port)
}

fn spawn_ssh_child(ssh_host: &str, remote_socket_path: &str, local_port: u16) -> std::io::Result<Child> {
    Command::new("ssh")
        .args([
            "-nNT",
            "-o",
            "ExitOnForwardFailure=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-L",
            &format!("{local_port}:{remote_socket_path}"),
            ssh_host,
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

async fn health_check(local_port: u16) -> bool {
    let url = format!("http://127.0.0.1:{local_port}/healthcheck");
    match reqwest::get(&url).await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Owns one tunnel's lifecycle: spawn, health-check at 1Hz, and recreate
/// with backoff on death, until told to shut down.
async fn supervise_tunnel(
    ssh_host: String,
    remote_socket_path: String,
    local_port: u16,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut attempt = 0u32;

    loop {
        let mut child = match spawn_ssh_child(&ssh_host, &remote_socket_path, local_port) {
            Ok(child) => child,
            Err(error) => {
                error!(?error, local_port, "failed to spawn ssh tunnel");
                let backoff = tunnel_backoff(attempt);
                attempt += 1;
                if sleep_or_shutdown(backoff, &mut shutdown_rx).await {
                    return;
                }
                continue;
            }
        };
        info!(local_port, "ssh tunnel spawned");
        attempt = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = child.kill().await;
                    return;
                }
                status = child.wait() => {
                    match status {
                        Ok(status) => warn!(local_port, %status, "ssh tunnel exited, recreating"),
                        Err(error) => warn!(?error, local_port, "failed to wait on ssh tunnel child"),
                    }
                    break;
                }
                () = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {
                    if !health_check(local_port).await {
                        warn!(local_port, "ssh tunnel failed health check, recreating");
                        let _ = child.kill().await;
                        break;
                    }
                }
            }
        }

        let backoff = tunnel_backoff(attempt);
        attempt += 1;
        if sleep_or_shutdown(backoff, &mut shutdown_rx).await {
            return;
        }
    }
}

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
    fn backoff_never_exceeds_the_cap() {
        for attempt in 0..20 {
            assert!(tunnel_backoff(attempt) <= TUNNEL_BACKOFF_CAP);
        }
    }

    #[tokio::test]
    async fn rewrite_round_robins_across_tunnels() {
        let pool = Arc::new(TunnelPool {
            tunnels: vec![
                Tunnel {
                    local_port: 10001,
                    shutdown: oneshot::channel().0,
                    task: tokio::spawn(async {}),
                },
                Tunnel {
                    local_port: 10002,
                    shutdown: oneshot::channel().0,
                    task: tokio::spawn(async {}),
                },
            ],
            next: AtomicUsize::new(0),
        });
        let url = Url::parse("https://store.example/container/00/000?sv=1").unwrap();
        let first = pool.rewrite(&url);
        let second = pool.rewrite(&url);
        let third = pool.rewrite(&url);
        assert_eq!(first.port(), Some(10001));
        assert_eq!(second.port(), Some(10002));
        assert_eq!(third.port(), Some(10001));
        assert_eq!(first.path(), "/container/00/000");
        assert_eq!(first.query(), Some("sv=1"));
    }

    #[tokio::test]
    async fn reserve_local_port_yields_a_free_ephemeral_port() {
        let port = reserve_local_port().await.unwrap();
        assert!(port > 0);
    }
}
