// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! GPU sidecar coordinator.
//!
//! One sidecar process per job holds the job's device memory across
//! checkpoint and restore. The coordinator spawns it, polls it until it
//! answers, forwards checkpoint/restore RPCs and tears it down. Watchers of
//! the primary process race to clean entries up, so every teardown path is
//! idempotent.

mod protocol;

pub use protocol::{
    codec, framed, next_message, send_message, GpuRestoreStats, SidecarClient, SidecarRequest,
    SidecarResponse, SidecarTransport, MAX_FRAME_LEN,
};

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::GpuConfig;
use crate::error::SidecarError;
use crate::types::Credentials;

/// Reserved job id for throwaway health-check sidecars.
pub const HEALTH_CHECK_JOB: &str = "healthcheck";

/// Interval between startup polls.
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Paths reported by a successful GPU checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuCheckpoint {
    pub mem_path: String,
    pub ckpt_path: String,
}

type OutputBuffer = Arc<Mutex<Vec<u8>>>;

/// Registry entry for one running sidecar.
#[derive(Debug)]
struct SidecarHandle {
    pid: u32,
    client: Mutex<SidecarClient>,
    child: Mutex<Option<Child>>,
    output: OutputBuffer,
}

impl SidecarHandle {
    fn signal(&self, signal: Signal) {
        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pid = self.pid, signal = ?signal, error = %e, "Failed to signal GPU sidecar"),
        }
    }
}

/// Spawns and tracks GPU sidecars, keyed by job id.
#[derive(Debug)]
pub struct SidecarCoordinator {
    sidecar_path: PathBuf,
    shared_lib_path: PathBuf,
    startup_timeout: Duration,
    sidecars: DashMap<String, Arc<SidecarHandle>>,
}

impl SidecarCoordinator {
    pub fn new(config: &GpuConfig) -> Self {
        Self {
            sidecar_path: config.sidecar_path.clone(),
            shared_lib_path: config.shared_lib_path.clone(),
            startup_timeout: config.startup_timeout,
            sidecars: DashMap::new(),
        }
    }

    /// Create a new coordinator wrapped in Arc for sharing.
    pub fn new_shared(config: &GpuConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Library preloaded into GPU jobs so the sidecar can intercept them.
    pub fn shared_lib_path(&self) -> &Path {
        &self.shared_lib_path
    }

    pub fn is_registered(&self, job_id: &str) -> bool {
        self.sidecars.contains_key(job_id)
    }

    pub fn pid(&self, job_id: &str) -> Option<u32> {
        self.sidecars.get(job_id).map(|h| h.pid)
    }

    pub fn len(&self) -> usize {
        self.sidecars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sidecars.is_empty()
    }

    fn handle(&self, job_id: &str) -> Result<Arc<SidecarHandle>, SidecarError> {
        self.sidecars
            .get(job_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SidecarError::NotRegistered {
                job_id: job_id.to_string(),
            })
    }

    /// Launch a sidecar for `job_id` and wait until it answers a startup poll.
    /// On failure the half-started process is terminated and unregistered.
    pub async fn start(&self, job_id: &str, credentials: &Credentials) -> Result<(), SidecarError> {
        if self.is_registered(job_id) {
            return Err(SidecarError::AlreadyRegistered {
                job_id: job_id.to_string(),
            });
        }

        let spawn_err = |reason: String| SidecarError::SpawnFailed {
            job_id: job_id.to_string(),
            reason,
        };

        let port = free_port().map_err(|e| spawn_err(format!("no free port: {}", e)))?;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let mut cmd = Command::new(&self.sidecar_path);
        cmd.arg(job_id)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        credentials.apply_to(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_err(format!("{}: {}", self.sidecar_path.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_err("exited before its pid was read".to_string()))?;

        let output: OutputBuffer = Arc::new(Mutex::new(Vec::new()));
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(capture(stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(capture(stderr, Arc::clone(&output)));
        }

        let handle = Arc::new(SidecarHandle {
            pid,
            client: Mutex::new(SidecarClient::new(addr)),
            child: Mutex::new(Some(child)),
            output,
        });
        self.sidecars.insert(job_id.to_string(), Arc::clone(&handle));

        tracing::info!(
            job_id = job_id,
            pid = pid,
            port = port,
            uid = credentials.uid,
            gid = credentials.gid,
            "Starting GPU sidecar"
        );

        let started = Instant::now();
        match tokio::time::timeout(self.startup_timeout, self.poll_until_ready(job_id, &handle)).await {
            Ok(Ok(())) => {
                tracing::info!(
                    job_id = job_id,
                    pid = pid,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "GPU sidecar ready"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                self.abort_start(job_id, &handle).await;
                Err(e)
            }
            Err(_) => {
                self.abort_start(job_id, &handle).await;
                Err(SidecarError::StartupTimeout {
                    job_id: job_id.to_string(),
                    timeout_ms: self.startup_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn poll_until_ready(&self, job_id: &str, handle: &SidecarHandle) -> Result<(), SidecarError> {
        loop {
            {
                let mut child = handle.child.lock().await;
                if let Some(child) = child.as_mut() {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Err(SidecarError::SpawnFailed {
                            job_id: job_id.to_string(),
                            reason: format!("exited during startup with {}", status),
                        });
                    }
                }
            }

            let mut client = handle.client.lock().await;
            match client.call(&SidecarRequest::StartupPoll).await {
                Ok(resp) if resp.success => return Ok(()),
                Ok(_) | Err(_) => client.close(),
            }
            drop(client);
            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }
    }

    async fn abort_start(&self, job_id: &str, handle: &SidecarHandle) {
        handle.signal(Signal::SIGTERM);
        handle.client.lock().await.close();
        if let Some(mut child) = handle.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(job_id = job_id, error = %e, "Sidecar already gone");
            }
        }
        self.log_output(job_id, handle).await;
        self.sidecars.remove(job_id);
    }

    /// Checkpoint device state into `dir`. Missing paths count as failure.
    pub async fn checkpoint(&self, job_id: &str, dir: &Path) -> Result<GpuCheckpoint, SidecarError> {
        let handle = self.handle(job_id)?;
        let request = SidecarRequest::Checkpoint {
            directory: dir.display().to_string(),
        };
        let started = Instant::now();
        let resp = handle.client.lock().await.call_ok(&request).await?;

        match (resp.mem_path, resp.ckpt_path) {
            (Some(mem_path), Some(ckpt_path)) if !mem_path.is_empty() && !ckpt_path.is_empty() => {
                tracing::info!(
                    job_id = job_id,
                    mem_path = %mem_path,
                    ckpt_path = %ckpt_path,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "GPU checkpoint complete"
                );
                Ok(GpuCheckpoint { mem_path, ckpt_path })
            }
            _ => Err(SidecarError::RpcFailed {
                rpc: "Checkpoint",
                reason: "response is missing the memory or checkpoint path".to_string(),
            }),
        }
    }

    /// Restore device state from `dir`.
    pub async fn restore(&self, job_id: &str, dir: &Path) -> Result<GpuRestoreStats, SidecarError> {
        let handle = self.handle(job_id)?;
        let request = SidecarRequest::Restore {
            directory: dir.display().to_string(),
        };
        let resp = handle.client.lock().await.call_ok(&request).await?;
        let stats = resp.stats.unwrap_or_default();

        tracing::info!(
            job_id = job_id,
            copy_mem_time_ms = stats.copy_mem_time_ms,
            replay_calls_time_ms = stats.replay_calls_time_ms,
            "GPU restore complete"
        );
        Ok(stats)
    }

    /// Ask the sidecar to exit and drop its connection. Missing entries are fine.
    pub async fn stop(&self, job_id: &str) {
        let Some(handle) = self.sidecars.get(job_id).map(|h| Arc::clone(h.value())) else {
            return;
        };
        tracing::debug!(job_id = job_id, pid = handle.pid, "Stopping GPU sidecar");
        handle.signal(Signal::SIGTERM);
        handle.client.lock().await.close();
    }

    /// Force-kill the sidecar. Used on shutdown and when the primary dies.
    pub async fn kill(&self, job_id: &str) {
        let Some(handle) = self.sidecars.get(job_id).map(|h| Arc::clone(h.value())) else {
            return;
        };
        tracing::debug!(job_id = job_id, pid = handle.pid, "Killing GPU sidecar");
        handle.signal(Signal::SIGKILL);
        handle.client.lock().await.close();
    }

    /// Whether a registered sidecar has exited. Does not reap or unregister it.
    pub async fn exited(&self, job_id: &str) -> bool {
        let Some(handle) = self.sidecars.get(job_id).map(|h| Arc::clone(h.value())) else {
            return false;
        };
        let mut child = handle.child.lock().await;
        match child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Wait for the sidecar to exit, log its output and unregister it.
    /// Returns None when no sidecar is registered or another waiter owns it.
    pub async fn wait(&self, job_id: &str) -> Option<ExitStatus> {
        let handle = self.sidecars.get(job_id).map(|h| Arc::clone(h.value()))?;
        let child = handle.child.lock().await.take();
        let mut child = child?;

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(job_id = job_id, error = %e, "Failed to wait for GPU sidecar");
                ExitStatus::from_raw(0)
            }
        };

        tracing::info!(job_id = job_id, pid = handle.pid, status = %status, "GPU sidecar exited");
        self.log_output(job_id, &handle).await;
        handle.client.lock().await.close();
        self.sidecars
            .remove_if(job_id, |_, current| Arc::ptr_eq(current, &handle));
        Some(status)
    }

    /// Start a throwaway sidecar, issue a health RPC, and always tear it down.
    pub async fn health_check(&self, credentials: &Credentials) -> Result<(), SidecarError> {
        if !self.sidecar_path.exists() {
            return Err(SidecarError::BinaryNotFound {
                path: self.sidecar_path.clone(),
            });
        }
        if !self.shared_lib_path.exists() {
            return Err(SidecarError::SharedLibraryNotFound {
                path: self.shared_lib_path.clone(),
            });
        }

        self.start(HEALTH_CHECK_JOB, credentials).await?;

        let result = match self.handle(HEALTH_CHECK_JOB) {
            Ok(handle) => handle
                .client
                .lock()
                .await
                .call_ok(&SidecarRequest::HealthCheck)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };

        self.stop(HEALTH_CHECK_JOB).await;
        self.wait(HEALTH_CHECK_JOB).await;
        result
    }

    async fn log_output(&self, job_id: &str, handle: &SidecarHandle) {
        let output = handle.output.lock().await;
        for line in String::from_utf8_lossy(&output).lines() {
            tracing::info!(job_id = job_id, "gpu sidecar: {}", line);
        }
    }
}

/// Ask the kernel for an unused loopback port.
fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, output: OutputBuffer) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => output.lock().await.extend_from_slice(&buf[..n]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn config(sidecar: &Path, timeout: Duration) -> GpuConfig {
        GpuConfig {
            enabled: true,
            sidecar_path: sidecar.to_path_buf(),
            shared_lib_path: PathBuf::from("/nonexistent/libgpu.so"),
            startup_timeout: timeout,
        }
    }

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("sidecar.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_startup_timeout_tears_down_sidecar() {
        let dir = TempDir::new().unwrap();
        let sidecar = script(&dir, "echo never listening; exec sleep 30");
        let coordinator = SidecarCoordinator::new(&config(&sidecar, Duration::from_millis(400)));

        let err = coordinator
            .start("job1", &Credentials::current())
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::StartupTimeout { .. }));
        assert!(!coordinator.is_registered("job1"));
    }

    #[tokio::test]
    async fn test_early_exit_fails_fast() {
        let dir = TempDir::new().unwrap();
        let sidecar = script(&dir, "exit 3");
        let coordinator = SidecarCoordinator::new(&config(&sidecar, Duration::from_secs(10)));

        let started = Instant::now();
        let err = coordinator
            .start("job1", &Credentials::current())
            .await
            .unwrap_err();
        assert!(matches!(err, SidecarError::SpawnFailed { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(coordinator.is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let coordinator = SidecarCoordinator::new(&config(
            Path::new("/nonexistent/sidecar"),
            Duration::from_secs(1),
        ));
        assert!(matches!(
            coordinator.start("job1", &Credentials::current()).await,
            Err(SidecarError::SpawnFailed { .. })
        ));
        assert!(matches!(
            coordinator.health_check(&Credentials::current()).await,
            Err(SidecarError::BinaryNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_and_wait_on_missing_entry_are_noops() {
        let coordinator = SidecarCoordinator::new(&config(
            Path::new("/nonexistent/sidecar"),
            Duration::from_secs(1),
        ));
        coordinator.stop("ghost").await;
        coordinator.kill("ghost").await;
        assert!(coordinator.wait("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_rpc_on_unregistered_job() {
        let coordinator = SidecarCoordinator::new(&config(
            Path::new("/nonexistent/sidecar"),
            Duration::from_secs(1),
        ));
        assert!(matches!(
            coordinator.checkpoint("job1", Path::new("/tmp")).await,
            Err(SidecarError::NotRegistered { .. })
        ));
    }
}
