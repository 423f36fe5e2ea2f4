// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Managed job lifecycle.
//!
//! The manager starts or adopts processes under a job id, routes dumps and
//! restores through the pipelines, and runs one exit watcher per live
//! process. Watchers are tracked so `shutdown` can cancel and await them.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::context::{run_blocking, EngineContext};
use crate::dump::{DumpPipeline, DumpRequest, DumpResponse};
use crate::error::{EngineError, EngineResult, JobError, PreconditionError};
use crate::restore::{RestorePipeline, RestoreRequest, RestoreResponse};
use crate::state::{JobState, ProcessState};
use crate::types::{Credentials, JobId, ProcessId};

/// How often adopted and restored processes are checked for exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const REAP_INTERVAL: Duration = Duration::from_millis(20);
const REAP_ATTEMPTS: u32 = 50;
const JOB_LOG_MODE: u32 = 0o644;

/// A new process to run as a managed job.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub job_id: JobId,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Defaults to the caller's credentials.
    pub credentials: Option<Credentials>,
    /// Start a GPU sidecar and preload its interception library.
    pub gpu: bool,
    /// Where stdout and stderr go. Defaults to
    /// `<output_log_dir>/checkpointd-<job id>.log`.
    pub log_path: Option<PathBuf>,
}

impl StartRequest {
    pub fn new(job_id: JobId, program: impl Into<PathBuf>) -> Self {
        Self {
            job_id,
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            credentials: None,
            gpu: false,
            log_path: None,
        }
    }
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub criu_version: u32,
    /// True when GPU support is enabled and a throwaway sidecar answered.
    pub gpu: bool,
}

/// How a watcher learns that its process is gone.
enum Watched {
    /// Our own child from `start`.
    Child(Child),
    /// Any other pid: restored siblings and adopted processes.
    Pid,
}

/// Front door for managed jobs.
#[derive(Debug)]
pub struct JobManager {
    ctx: Arc<EngineContext>,
    dump: DumpPipeline,
    restore: RestorePipeline,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl JobManager {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            dump: DumpPipeline::new(Arc::clone(&ctx)),
            restore: RestorePipeline::new(Arc::clone(&ctx)),
            ctx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Spawn `program` as a new managed job.
    pub async fn start(&self, request: StartRequest) -> EngineResult<ProcessState> {
        let jid = request.job_id.clone();
        self.ensure_not_running(&jid)?;
        if request.gpu && !self.ctx.config.gpu.enabled {
            return Err(PreconditionError::GpuNotEnabled.into());
        }
        let credentials = request.credentials.clone().unwrap_or_else(Credentials::current);

        let log_path = request.log_path.clone().unwrap_or_else(|| {
            self.ctx
                .config
                .restore
                .output_log_dir
                .join(format!("checkpointd-{}.log", jid))
        });
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(JOB_LOG_MODE)
            .open(&log_path)
            .map_err(|e| EngineError::io("open job output log", e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| EngineError::io("duplicate job output log", e))?;

        if request.gpu {
            self.ctx.sidecars.start(jid.as_str(), &credentials).await?;
        }

        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }
        if request.gpu {
            cmd.env("LD_PRELOAD", self.ctx.sidecars.shared_lib_path());
        }
        credentials.apply_to(&mut cmd);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.teardown_sidecar(&jid).await;
                return Err(JobError::StartFailed {
                    job_id: jid,
                    reason: format!("{}: {}", request.program.display(), e),
                }
                .into());
            }
        };
        let pid = match child.id().map(ProcessId::new) {
            Some(Ok(pid)) => pid,
            _ => {
                self.teardown_sidecar(&jid).await;
                return Err(JobError::StartFailed {
                    job_id: jid,
                    reason: "process exited before its pid was read".to_string(),
                }
                .into());
            }
        };

        let mut state = ProcessState::new(pid, Some(jid.clone()), credentials);
        state.gpu = request.gpu;
        match self.ctx.inspector.process_info(pid) {
            Ok(info) => state.process_info = info,
            Err(e) => tracing::debug!(job_id = %jid, error = %e, "Process facts unavailable at start"),
        }
        if let Err(e) = self.ctx.store.put(&jid, &state) {
            signal(pid, Signal::SIGKILL);
            self.teardown_sidecar(&jid).await;
            return Err(e.into());
        }

        tracing::info!(
            job_id = %jid,
            pid = pid.value(),
            program = %request.program.display(),
            log = %log_path.display(),
            gpu = request.gpu,
            "Started job"
        );
        self.watch(jid, pid, Watched::Child(child), request.gpu);
        Ok(state)
    }

    /// Adopt an already running process under a job id.
    pub async fn manage(&self, job_id: JobId, pid: ProcessId, gpu: bool) -> EngineResult<ProcessState> {
        self.ensure_not_running(&job_id)?;
        if gpu && !self.ctx.config.gpu.enabled {
            return Err(PreconditionError::GpuNotEnabled.into());
        }
        if !self.ctx.inspector.is_alive(pid) {
            return Err(JobError::PidNotFound { pid: pid.value() }.into());
        }

        let credentials = self.ctx.inspector.credentials(pid)?;
        let mut state = ProcessState::new(pid, Some(job_id.clone()), credentials.clone());
        state.gpu = gpu;
        state.process_info = self.ctx.inspector.process_info(pid)?;

        if gpu {
            self.ctx.sidecars.start(job_id.as_str(), &credentials).await?;
        }
        if let Err(e) = self.ctx.store.put(&job_id, &state) {
            self.teardown_sidecar(&job_id).await;
            return Err(e.into());
        }

        tracing::info!(job_id = %job_id, pid = pid.value(), gpu = gpu, "Managing existing process");
        self.watch(job_id, pid, Watched::Pid, gpu);
        Ok(state)
    }

    /// Stored jobs matching any of the given ids or pids. Empty filters
    /// match everything.
    pub fn query(&self, job_ids: &[JobId], pids: &[ProcessId]) -> EngineResult<Vec<ProcessState>> {
        let mut jobs: Vec<_> = self
            .ctx
            .store
            .list()?
            .into_iter()
            .filter(|state| {
                (job_ids.is_empty() && pids.is_empty())
                    || state.job_id.as_ref().is_some_and(|jid| job_ids.contains(jid))
                    || pids.contains(&state.pid)
            })
            .collect();
        jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(jobs)
    }

    /// SIGKILL a running job and mark it KILLED.
    pub async fn kill(&self, job_id: &JobId) -> EngineResult<ProcessState> {
        let _guard = self.ctx.locks.try_acquire(job_id)?;
        let mut state = self
            .ctx
            .store
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound { job_id: job_id.clone() })?;
        if !state.is_running() {
            return Err(PreconditionError::JobNotRunning { job_id: job_id.clone() }.into());
        }

        signal(state.pid, Signal::SIGKILL);
        state.transition_to(JobState::Killed)?;
        self.ctx.store.put(job_id, &state)?;
        self.ctx.sidecars.kill(job_id.as_str()).await;

        tracing::info!(job_id = %job_id, pid = state.pid.value(), "Killed job");
        Ok(state)
    }

    pub async fn dump(&self, request: DumpRequest) -> EngineResult<DumpResponse> {
        self.dump.dump(request).await
    }

    /// Restore, then watch the restored process when it belongs to a job.
    pub async fn restore(&self, request: RestoreRequest) -> EngineResult<RestoreResponse> {
        let response = self.restore.restore(request.clone()).await?;
        if let Some(jid) = request.job_id {
            self.watch(jid, response.pid, Watched::Pid, response.gpu_sidecar);
        }
        Ok(response)
    }

    /// CRIU version and, when enabled, a sidecar round trip.
    pub async fn health_check(&self) -> EngineResult<HealthStatus> {
        let criu = Arc::clone(&self.ctx.criu);
        let criu_version = run_blocking(move || Ok(criu.version()?)).await?;
        let gpu = if self.ctx.config.gpu.enabled {
            self.ctx.sidecars.health_check(&Credentials::current()).await?;
            true
        } else {
            false
        };
        Ok(HealthStatus { criu_version, gpu })
    }

    /// Number of live exit watchers.
    pub fn watchers(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel every watcher, force-kill their processes and sidecars, and
    /// wait for the watchers to finish.
    pub async fn shutdown(&self) {
        tracing::info!(watchers = self.tracker.len(), "Shutting down job manager");
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn ensure_not_running(&self, job_id: &JobId) -> EngineResult<()> {
        match self.ctx.store.get(job_id)? {
            Some(state) if state.is_running() => Err(JobError::AlreadyExists {
                job_id: job_id.clone(),
            }
            .into()),
            _ => Ok(()),
        }
    }

    async fn teardown_sidecar(&self, job_id: &JobId) {
        self.ctx.sidecars.stop(job_id.as_str()).await;
        self.ctx.sidecars.wait(job_id.as_str()).await;
    }

    fn watch(&self, job_id: JobId, pid: ProcessId, watched: Watched, gpu: bool) {
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.child_token();
        self.tracker
            .spawn(watch_exit(ctx, job_id, pid, watched, gpu, cancel));
    }
}

/// Wait for the job's process to exit, then record it. A GPU sidecar that
/// dies first takes the process down with it.
async fn watch_exit(
    ctx: Arc<EngineContext>,
    job_id: JobId,
    pid: ProcessId,
    mut watched: Watched,
    gpu: bool,
    cancel: CancellationToken,
) {
    tracing::debug!(job_id = %job_id, pid = pid.value(), gpu = gpu, "Watching job");
    let mut sidecar_alive = gpu;

    loop {
        let exited = match &mut watched {
            Watched::Child(child) => tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => tracing::info!(job_id = %job_id, pid = pid.value(), status = %status, "Job process exited"),
                        Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to wait for job process"),
                    }
                    true
                }
                _ = tokio::time::sleep(EXIT_POLL_INTERVAL), if sidecar_alive => false,
                _ = cancel.cancelled() => break,
            },
            Watched::Pid => tokio::select! {
                _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => pid_exited(&ctx, pid),
                _ = cancel.cancelled() => break,
            },
        };

        if exited {
            // A dump or restore in flight owns the record until it returns.
            let current = {
                let _guard = ctx.locks.acquire(&job_id).await;
                let current = is_current(&ctx, &job_id, pid);
                if current {
                    mark_done(&ctx, &job_id, pid);
                }
                current
            };
            if current && gpu {
                ctx.sidecars.stop(job_id.as_str()).await;
                ctx.sidecars.wait(job_id.as_str()).await;
            }
            return;
        }

        if sidecar_alive && ctx.sidecars.exited(job_id.as_str()).await {
            tracing::error!(job_id = %job_id, pid = pid.value(), "GPU sidecar exited before the job, killing job");
            sidecar_alive = false;
            ctx.sidecars.wait(job_id.as_str()).await;
            signal(pid, Signal::SIGKILL);
        }
    }

    tracing::debug!(job_id = %job_id, pid = pid.value(), "Watcher cancelled, killing job");
    signal(pid, Signal::SIGKILL);
    match &mut watched {
        Watched::Child(child) => {
            let _ = child.wait().await;
        }
        Watched::Pid => reap_killed(pid).await,
    }
    if gpu {
        ctx.sidecars.kill(job_id.as_str()).await;
        ctx.sidecars.wait(job_id.as_str()).await;
    }
}

/// Reap the pid if it is our child; otherwise fall back to /proc.
fn pid_exited(ctx: &EngineContext, pid: ProcessId) -> bool {
    match waitpid(pid.as_nix(), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(status) => {
            tracing::debug!(pid = pid.value(), status = ?status, "Reaped job process");
            true
        }
        Err(Errno::ECHILD) => !ctx.inspector.is_alive(pid),
        Err(e) => {
            tracing::warn!(pid = pid.value(), error = %e, "waitpid failed, assuming exit");
            true
        }
    }
}

/// Reap a SIGKILLed pid, giving the kernel a bounded time to deliver it.
async fn reap_killed(pid: ProcessId) {
    for _ in 0..REAP_ATTEMPTS {
        match waitpid(pid.as_nix(), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => tokio::time::sleep(REAP_INTERVAL).await,
            Ok(_) | Err(_) => return,
        }
    }
    tracing::warn!(pid = pid.value(), "Killed job process was not reaped");
}

/// Whether the stored record still describes this pid.
fn is_current(ctx: &EngineContext, job_id: &JobId, pid: ProcessId) -> bool {
    matches!(ctx.store.get(job_id), Ok(Some(state)) if state.pid == pid)
}

/// RUNNING → DONE, unless the job was dumped, killed or restored under
/// another pid in the meantime.
fn mark_done(ctx: &EngineContext, job_id: &JobId, pid: ProcessId) {
    let mut state = match ctx.store.get(job_id) {
        Ok(Some(state)) => state,
        Ok(None) => return,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job after exit");
            return;
        }
    };
    if state.pid != pid || !state.is_running() {
        tracing::debug!(job_id = %job_id, state = state.job_state.name(), "Exit does not change job state");
        return;
    }
    if let Err(e) = state.transition_to(JobState::Done) {
        tracing::error!(job_id = %job_id, error = %e, "Failed to mark job done");
        return;
    }
    if let Err(e) = ctx.store.put(job_id, &state) {
        tracing::error!(job_id = %job_id, error = %e, "Failed to record job exit");
    }
}

fn signal(pid: ProcessId, sig: Signal) {
    match kill(pid.as_nix(), sig) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid = pid.value(), signal = ?sig, error = %e, "Failed to signal job"),
    }
}
