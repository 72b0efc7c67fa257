//! Horizontal scaling within one host.
//!
//! # Purpose
//! With `CLUSTER_MODE=true` the binary runs as a supervisor that spawns a
//! fixed number of worker copies of itself and respawns any that exit. Each
//! worker binds the same HTTP address with `SO_REUSEPORT` so the kernel spreads
//! connections across them.
//!
//! # Notes
//! Workers do not share state: each owns a disjoint session registry, so a
//! request for a client configured on another worker sees it as unconfigured.
use anyhow::Context;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;

/// Set on every spawned worker; its presence marks the process as a worker.
pub const WORKER_ID_ENV: &str = "MQTT_GATEWAY_WORKER_ID";

const LISTEN_BACKLOG: u32 = 1024;

pub fn worker_id() -> Option<String> {
    std::env::var(WORKER_ID_ENV).ok()
}

pub fn is_worker() -> bool {
    worker_id().is_some()
}

/// Bind the HTTP listener, sharing the port with sibling workers when asked.
pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    {
        if reuse_port {
            socket.set_reuseport(true)?;
        }
    }
    #[cfg(not(unix))]
    {
        if reuse_port {
            tracing::warn!("SO_REUSEPORT is unavailable on this platform");
        }
    }
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Spawns and babysits worker processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workers: usize,
    pub respawn_delay: Duration,
}

impl Supervisor {
    /// Supervise copies of the running executable.
    pub fn for_current_exe(workers: usize) -> anyhow::Result<Self> {
        let program = std::env::current_exe().context("locate gateway executable")?;
        Ok(Self {
            program,
            args: std::env::args().skip(1).collect(),
            workers,
            respawn_delay: Duration::from_secs(1),
        })
    }

    fn spawn_worker(&self, worker_id: usize) -> anyhow::Result<Child> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ID_ENV, worker_id.to_string())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn worker {worker_id}"))?;
        tracing::info!(worker_id, pid = ?child.id(), "worker started");
        Ok(child)
    }

    /// Run until `shutdown` resolves, then kill every worker.
    ///
    /// Returns the total number of worker processes started.
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<usize>
    where
        F: Future<Output = ()> + Send,
    {
        tracing::info!(workers = self.workers, "supervisor starting workers");
        let mut running: JoinSet<(usize, std::io::Result<ExitStatus>)> = JoinSet::new();
        let mut started = 0;
        for worker_id in 0..self.workers {
            let child = self.spawn_worker(worker_id)?;
            started += 1;
            running.spawn(wait_worker(worker_id, child));
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = running.join_next() => {
                    let worker_id = match joined {
                        Ok((worker_id, status)) => {
                            tracing::warn!(worker_id, status = ?status, "worker exited; starting a new worker");
                            worker_id
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "worker watcher failed");
                            continue;
                        }
                    };
                    tokio::time::sleep(self.respawn_delay).await;
                    match self.spawn_worker(worker_id) {
                        Ok(child) => {
                            started += 1;
                            running.spawn(wait_worker(worker_id, child));
                        }
                        Err(err) => tracing::error!(worker_id, error = %err, "failed to respawn worker"),
                    }
                }
            }
        }

        // Dropping the watchers drops each `Child`, which kills it.
        running.shutdown().await;
        tracing::info!("supervisor stopped");
        Ok(started)
    }
}

async fn wait_worker(worker_id: usize, mut child: Child) -> (usize, std::io::Result<ExitStatus>) {
    let status = child.wait().await;
    (worker_id, status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_listener_picks_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().expect("addr"), false).expect("bind");
        assert_ne!(listener.local_addr().expect("addr").port(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reuse_port_allows_sibling_listeners() {
        let first = bind_listener("127.0.0.1:0".parse().expect("addr"), true).expect("first");
        let addr = first.local_addr().expect("addr");
        let second = bind_listener(addr, true).expect("second");
        assert_eq!(second.local_addr().expect("addr"), addr);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_workers_are_respawned() {
        let supervisor = Supervisor {
            program: PathBuf::from("true"),
            args: Vec::new(),
            workers: 2,
            respawn_delay: Duration::from_millis(10),
        };
        let started = supervisor
            .run(tokio::time::sleep(Duration::from_millis(300)))
            .await
            .expect("run");
        assert!(started > 2, "expected respawns, started {started}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_stops_long_running_workers() {
        let supervisor = Supervisor {
            program: PathBuf::from("sleep"),
            args: vec!["30".to_string()],
            workers: 2,
            respawn_delay: Duration::from_millis(10),
        };
        let started = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.run(tokio::time::sleep(Duration::from_millis(100))),
        )
        .await
        .expect("supervisor stops")
        .expect("run");
        assert_eq!(started, 2);
    }

    #[tokio::test]
    async fn missing_program_fails_startup() {
        let supervisor = Supervisor {
            program: PathBuf::from("/nonexistent/mqtt-gateway-worker"),
            args: Vec::new(),
            workers: 1,
            respawn_delay: Duration::from_millis(10),
        };
        let err = supervisor
            .run(std::future::pending())
            .await
            .expect_err("spawn fails");
        assert!(err.to_string().contains("spawn worker 0"));
    }
}
