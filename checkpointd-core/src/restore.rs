// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Restore pipeline.
//!
//! validate → scratch directory (extract or serve) → saved state → stdio
//! inheritance → CRIU RESTORE with GPU restore at pre-resume. A failed
//! restore removes its scratch directory and any sidecar it started.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::archive;
use crate::context::{run_blocking, EngineContext};
use crate::criu::{CheckpointOptions, HookName, HookSet, InheritFd};
use crate::dump::CHECKPOINT_STATE_FILE;
use crate::error::{EngineError, EngineResult, HookError, JobError, PreconditionError};
use crate::gpu::GpuRestoreStats;
use crate::state::{CheckpointState, JobState, ProcessState, StreamRole};
use crate::stats::RestoreStats;
use crate::streamer::{self, ImageStreamer, StreamerMode};
use crate::types::{JobId, ProcessId};

pub const RESTORE_LOG_FILE: &str = "restore.log";

const SCRATCH_DIR_MODE: u32 = 0o755;
const OUTPUT_LOG_MODE: u32 = 0o644;
/// Descriptor number of the first inherited file inside the CRIU worker.
const FIRST_INHERITED_FD: i32 = 3;

/// Caller inputs for one restore.
#[derive(Debug, Clone, Default)]
pub struct RestoreRequest {
    /// Restore a managed job; the checkpoint path defaults to its last dump.
    pub job_id: Option<JobId>,
    pub checkpoint_path: Option<PathBuf>,
    pub stream: bool,
    /// Fetch the job's latest remote checkpoint first.
    pub remote: bool,
    /// Hand the restored process's stdio back as pipes instead of a log file.
    pub attach: bool,
    pub tcp_established: bool,
    pub tcp_close: bool,
    pub external: Vec<String>,
}

/// Our ends of the restored process's stdio pipes.
#[derive(Debug, Default)]
pub struct AttachedStdio {
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

#[derive(Debug)]
pub struct RestoreResponse {
    pub pid: ProcessId,
    pub message: String,
    pub state: ProcessState,
    pub stats: RestoreStats,
    /// Set when the output went to a log file.
    pub output_log: Option<PathBuf>,
    /// Set for attached restores.
    pub stdio: Option<AttachedStdio>,
    /// True when a GPU sidecar was started for the restored job.
    pub gpu_sidecar: bool,
}

/// Where the images come from.
enum Source {
    Archive(PathBuf),
    /// Archive fetched from the uploader; removed once the restore ends.
    Downloaded(PathBuf),
    Stream(PathBuf),
}

/// Descriptors handed to CRIU plus the ends we keep.
#[derive(Default)]
struct Inheritance {
    inherit_fds: Vec<InheritFd>,
    extra_files: Vec<OwnedFd>,
    stdio: AttachedStdio,
    output_log: Option<PathBuf>,
}

/// Runs restores against one engine context.
#[derive(Debug, Clone)]
pub struct RestorePipeline {
    ctx: Arc<EngineContext>,
}

impl RestorePipeline {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn restore(&self, request: RestoreRequest) -> EngineResult<RestoreResponse> {
        let stored = self.validate(&request)?;
        let _guard = match &request.job_id {
            Some(jid) => Some(self.ctx.locks.try_acquire(jid)?),
            None => None,
        };

        let source = self.resolve_source(&request, stored.as_ref()).await?;
        let result = self.restore_from(&request, stored, &source).await;
        if let Source::Downloaded(path) = &source {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove downloaded checkpoint");
            }
        }
        if let Err(ref e) = result {
            tracing::warn!(job_id = ?request.job_id, error = %e, "Restore failed");
            if matches!(e, EngineError::Criu(_) | EngineError::Sidecar(_) | EngineError::Hook(_)) {
                self.record_failure(request.job_id.as_ref());
            }
        }
        result
    }

    async fn restore_from(
        &self,
        request: &RestoreRequest,
        stored: Option<ProcessState>,
        source: &Source,
    ) -> EngineResult<RestoreResponse> {
        let started = Instant::now();
        let (scratch, streamer) = self.prepare_scratch(request, source, stored.as_ref()).await?;

        let result = self.run(request, stored, &scratch, streamer, started).await;
        if result.is_err() && !matches!(source, Source::Stream(_)) {
            if let Err(e) = fs::remove_dir_all(&scratch) {
                tracing::warn!(dir = %scratch.display(), error = %e, "Failed to remove restore scratch dir");
            }
        }
        result
    }

    /// Reject bad requests before anything is spawned. Returns the stored
    /// record of a managed job.
    fn validate(&self, request: &RestoreRequest) -> EngineResult<Option<ProcessState>> {
        let stored = match &request.job_id {
            Some(jid) => Some(
                self.ctx
                    .store
                    .get(jid)?
                    .ok_or_else(|| JobError::NotFound { job_id: jid.clone() })?,
            ),
            None => None,
        };

        if request.remote {
            if self.ctx.uploader.is_none() {
                return Err(PreconditionError::NoUploader.into());
            }
            let jid = request
                .job_id
                .as_ref()
                .ok_or(PreconditionError::MissingCheckpointPath)?;
            if stored.as_ref().and_then(|s| s.latest_remote()).is_none() {
                return Err(PreconditionError::NoCheckpoint { job_id: jid.clone() }.into());
            }
        } else {
            let path = explicit_path(request)
                .or_else(|| stored.as_ref().and_then(|s| s.checkpoint_path.clone()));
            let path = match (path, &request.job_id) {
                (Some(path), _) => path,
                (None, Some(jid)) => {
                    return Err(PreconditionError::NoCheckpoint { job_id: jid.clone() }.into())
                }
                (None, None) => return Err(PreconditionError::MissingCheckpointPath.into()),
            };
            check_path(&path, request.stream)?;
        }

        if let Some(state) = &stored {
            if state.gpu_checkpointed && !self.ctx.config.gpu.enabled {
                return Err(PreconditionError::GpuNotEnabled.into());
            }
        }
        Ok(stored)
    }

    async fn resolve_source(
        &self,
        request: &RestoreRequest,
        stored: Option<&ProcessState>,
    ) -> EngineResult<Source> {
        if request.remote {
            let (uploader, remote) = match (self.ctx.uploader.clone(), stored.and_then(|s| s.latest_remote())) {
                (Some(uploader), Some(remote)) => (uploader, remote.clone()),
                _ => return Err(PreconditionError::NoUploader.into()),
            };
            let dest = self.ctx.config.restore.scratch_root.join("downloads");
            let path = run_blocking(move || uploader.download(&remote, &dest)).await?;
            if let Err(e) = check_path(&path, false) {
                let _ = fs::remove_file(&path);
                return Err(e.into());
            }
            return Ok(Source::Downloaded(path));
        }

        let path = explicit_path(request)
            .or_else(|| stored.and_then(|s| s.checkpoint_path.clone()))
            .ok_or(PreconditionError::MissingCheckpointPath)?;
        Ok(if request.stream {
            Source::Stream(path)
        } else {
            Source::Archive(path)
        })
    }

    /// Fresh scratch directory with the images, or the streaming directory
    /// with a serve streamer attached to it.
    async fn prepare_scratch(
        &self,
        request: &RestoreRequest,
        source: &Source,
        stored: Option<&ProcessState>,
    ) -> EngineResult<(PathBuf, Option<ImageStreamer>)> {
        match source {
            Source::Stream(dir) => {
                let gpu = stored.is_some_and(|s| s.gpu_checkpointed);
                let streamer =
                    ImageStreamer::spawn(&self.ctx.config.streamer, dir, StreamerMode::Serve, gpu)
                        .await?;
                Ok((dir.clone(), Some(streamer)))
            }
            Source::Archive(archive_path) | Source::Downloaded(archive_path) => {
                let name = match &request.job_id {
                    Some(jid) => jid.to_string(),
                    None => archive_path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "restore".to_string()),
                };
                let scratch = self.ctx.config.restore.scratch_root.join(name);

                match fs::remove_dir_all(&scratch) {
                    Ok(()) => tracing::debug!(dir = %scratch.display(), "Removed stale scratch dir"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(EngineError::io("remove scratch dir", e)),
                }
                let mut builder = DirBuilder::new();
                builder.recursive(true).mode(SCRATCH_DIR_MODE);
                builder
                    .create(&scratch)
                    .map_err(|e| EngineError::io("create scratch dir", e))?;

                let src = archive_path.clone();
                let dest = scratch.clone();
                let extracted = run_blocking(move || {
                    archive::extract_archive(&src, &dest)?;
                    archive::chmod_recursive(&dest, SCRATCH_DIR_MODE)
                })
                .await;
                if let Err(e) = extracted {
                    let _ = fs::remove_dir_all(&scratch);
                    return Err(e);
                }
                Ok((scratch, None))
            }
        }
    }

    async fn run(
        &self,
        request: &RestoreRequest,
        stored: Option<ProcessState>,
        scratch: &Path,
        streamer: Option<ImageStreamer>,
        started: Instant,
    ) -> EngineResult<RestoreResponse> {
        let mut stats = RestoreStats::default();

        let loaded = read_state(scratch, streamer.as_ref())
            .await
            .and_then(|state| {
                if state.gpu_checkpointed && !self.ctx.config.gpu.enabled {
                    return Err(PreconditionError::GpuNotEnabled.into());
                }
                if state.gpu_checkpointed && request.job_id.is_none() {
                    return Err(PreconditionError::GpuRequiresJob { operation: "restore" }.into());
                }
                Ok(state)
            })
            .and_then(|state| {
                let inheritance = self.inheritance(request, &state)?;
                Ok((state, inheritance))
            });
        let (mut state, inheritance) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                if let Some(streamer) = streamer {
                    streamer.kill().await;
                }
                return Err(e);
            }
        };
        // A managed job keeps its identity and history; the images supply
        // the process facts.
        if let Some(stored) = stored {
            state.job_id = stored.job_id;
            state.job_state = stored.job_state;
            state.remote_state = stored.remote_state;
        }

        let gpu = state.gpu_checkpointed;
        let managed = request.job_id.is_some();

        let mut options = CheckpointOptions::new(scratch);
        options.log_file = Some(RESTORE_LOG_FILE.to_string());
        options.log_level = Some(self.ctx.config.criu.log_level);
        options.file_locks = true;
        options.ext_unix_sk = state.process_info.has_unix_sockets();
        options.tcp_established = state.process_info.has_tcp() || request.tcp_established;
        options.tcp_close = request.tcp_close;
        options.shell_job = state.process_info.has_pty();
        options.stream = request.stream;
        options.rst_sibling = managed;
        options.external = request.external.clone();
        options.inherit_fds = inheritance.inherit_fds;
        stats.prepare_ms = started.elapsed().as_millis() as u64;

        // The restored tree reports its pid in these notifications; keep it
        // so a half-restored process can be reaped.
        let restored_pid = Arc::new(AtomicI32::new(0));
        let sidecar_started = Arc::new(AtomicBool::new(false));
        let (gpu_tx, gpu_rx) = mpsc::channel::<(GpuRestoreStats, u64)>();

        let mut hooks = HookSet::new();
        {
            let restored_pid = Arc::clone(&restored_pid);
            hooks.on(HookName::PostRestore, move |ctx| {
                if let Some(pid) = ctx.pid.filter(|p| *p > 0) {
                    restored_pid.store(pid, Ordering::SeqCst);
                }
                Ok(())
            });
        }
        if gpu {
            let handle = tokio::runtime::Handle::current();
            let sidecars = Arc::clone(&self.ctx.sidecars);
            let jid = request
                .job_id
                .as_ref()
                .map(|j| j.to_string())
                .unwrap_or_default();
            let credentials = state.credentials.clone();
            let dir = scratch.to_path_buf();
            let started_flag = Arc::clone(&sidecar_started);
            let restored_pid = Arc::clone(&restored_pid);

            hooks.on(HookName::PreResume, move |ctx| {
                if let Some(pid) = ctx.pid.filter(|p| *p > 0) {
                    restored_pid.store(pid, Ordering::SeqCst);
                }
                let started = Instant::now();
                handle
                    .block_on(async {
                        sidecars.start(&jid, &credentials).await?;
                        started_flag.store(true, Ordering::SeqCst);
                        sidecars.restore(&jid, &dir).await
                    })
                    .map(|gpu_stats| {
                        let _ = gpu_tx.send((gpu_stats, started.elapsed().as_millis() as u64));
                    })
                    .map_err(|e| HookError::Callback(e.to_string()))
            });
        }

        tracing::info!(
            job_id = ?request.job_id,
            dir = %scratch.display(),
            managed = managed,
            gpu = gpu,
            attach = request.attach,
            inherited = inheritance.extra_files.len(),
            "Beginning restore"
        );

        let started = Instant::now();
        let criu = Arc::clone(&self.ctx.criu);
        let extra_files = inheritance.extra_files;
        let log_path = scratch.join(RESTORE_LOG_FILE);
        let restored = run_blocking(move || {
            let borrowed: Vec<_> = extra_files.iter().map(|f| f.as_fd()).collect();
            criu.restore(&options, &mut hooks, &borrowed)
                .map_err(EngineError::from)
        })
        .await;
        stats.criu_ms = started.elapsed().as_millis() as u64;

        if let Ok((gpu_stats, gpu_ms)) = gpu_rx.try_recv() {
            stats.gpu_ms = gpu_ms;
            stats.gpu_copy_mem_ms = gpu_stats.copy_mem_time_ms;
            stats.gpu_replay_calls_ms = gpu_stats.replay_calls_time_ms;
        }

        let pid = match restored.and_then(|pid| Ok(ProcessId::try_from(pid)?)) {
            Ok(pid) => pid,
            Err(e) => {
                reap(restored_pid.load(Ordering::SeqCst));
                if sidecar_started.load(Ordering::SeqCst) {
                    if let Some(jid) = &request.job_id {
                        self.ctx.sidecars.stop(jid.as_str()).await;
                        self.ctx.sidecars.wait(jid.as_str()).await;
                    }
                }
                if let Some(streamer) = streamer {
                    streamer.kill().await;
                }
                return Err(match e {
                    EngineError::Criu(err) => err
                        .with_log_tail(RESTORE_LOG_FILE, &archive::log_tail(&log_path, archive::LOG_TAIL_LINES))
                        .into(),
                    other => other,
                });
            }
        };

        if let Some(streamer) = streamer {
            if let Err(e) = streamer.wait().await {
                tracing::warn!(error = %e, "Serve streamer did not exit cleanly");
            }
        }

        state.pid = pid;
        state.checkpoint_state = CheckpointState::Restored;
        if state.job_state != JobState::Running {
            state.transition_to(JobState::Running)?;
        }

        if let Some(jid) = &request.job_id {
            if let Err(e) = self.ctx.store.put(jid, &state) {
                tracing::error!(job_id = %jid, pid = %pid, error = %e, "Failed to record restored job, killing it");
                reap(pid.value() as i32);
                return Err(e.into());
            }
        }

        tracing::info!(
            job_id = ?request.job_id,
            pid = %pid,
            criu_ms = stats.criu_ms,
            gpu_ms = stats.gpu_ms,
            "Restore complete"
        );

        Ok(RestoreResponse {
            pid,
            message: format!("successfully restored process: {}", pid),
            state,
            stats,
            output_log: inheritance.output_log,
            stdio: request.attach.then_some(inheritance.stdio),
            gpu_sidecar: sidecar_started.load(Ordering::SeqCst),
        })
    }

    /// Map each recorded stdio descriptor onto a pipe or the output log.
    /// Keys are recorded paths without their leading '/'.
    fn inheritance(&self, request: &RestoreRequest, state: &ProcessState) -> EngineResult<Inheritance> {
        let mut inheritance = Inheritance::default();
        let stdio: Vec<_> = state.process_info.stdio().cloned().collect();
        if stdio.is_empty() {
            return Ok(inheritance);
        }

        let pipe = || {
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| EngineError::Syscall {
                syscall: "pipe2",
                message: e.to_string(),
            })
        };

        let log = if request.attach {
            None
        } else {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            let path = self
                .ctx
                .config
                .restore
                .output_log_dir
                .join(format!("checkpointd-output-{}.log", ts));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .mode(OUTPUT_LOG_MODE)
                .open(&path)
                .map_err(|e| EngineError::io("create restore output log", e))?;
            inheritance.output_log = Some(path);
            Some(file)
        };

        for file in stdio {
            let child_end: OwnedFd = match (&log, file.stream) {
                (Some(_), StreamRole::Stdin) => continue,
                (Some(log), _) => log
                    .try_clone()
                    .map_err(|e| EngineError::io("duplicate restore output log", e))?
                    .into(),
                (None, StreamRole::Stdin) => {
                    let (read, write) = pipe()?;
                    inheritance.stdio.stdin = Some(File::from(write));
                    read
                }
                (None, StreamRole::Stdout) => {
                    let (read, write) = pipe()?;
                    inheritance.stdio.stdout = Some(File::from(read));
                    write
                }
                (None, StreamRole::Stderr) => {
                    let (read, write) = pipe()?;
                    inheritance.stdio.stderr = Some(File::from(read));
                    write
                }
                (None, StreamRole::None) => continue,
            };

            let fd = FIRST_INHERITED_FD + inheritance.extra_files.len() as i32;
            inheritance.inherit_fds.push(InheritFd {
                key: file.path.trim_start_matches('/').to_string(),
                fd,
            });
            inheritance.extra_files.push(child_end);
        }
        Ok(inheritance)
    }

    fn record_failure(&self, job_id: Option<&JobId>) {
        let Some(jid) = job_id else { return };
        match self.ctx.store.get(jid) {
            Ok(Some(mut state)) => {
                state.checkpoint_state = CheckpointState::RestoreFailed;
                if let Err(e) = self.ctx.store.put(jid, &state) {
                    tracing::warn!(job_id = %jid, error = %e, "Failed to record restore failure");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(job_id = %jid, error = %e, "Failed to record restore failure"),
        }
    }
}

fn explicit_path(request: &RestoreRequest) -> Option<PathBuf> {
    request
        .checkpoint_path
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
}

fn check_path(path: &Path, stream: bool) -> Result<(), PreconditionError> {
    if !path.exists() {
        return Err(PreconditionError::CheckpointNotFound {
            path: path.to_path_buf(),
        });
    }
    if stream {
        if !path.is_dir() {
            return Err(PreconditionError::NotADirectory {
                path: path.to_path_buf(),
            });
        }
    } else if !path.is_file() || path.extension().map_or(true, |ext| ext != "tar") {
        return Err(PreconditionError::NotAnArchive {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Load the saved state from the scratch directory or the serve streamer.
async fn read_state(scratch: &Path, streamer: Option<&ImageStreamer>) -> EngineResult<ProcessState> {
    let bytes = match streamer {
        Some(streamer) => {
            let socket = streamer.socket_path();
            run_blocking(move || Ok(streamer::receive_file(&socket, CHECKPOINT_STATE_FILE)?)).await?
        }
        None => fs::read(scratch.join(CHECKPOINT_STATE_FILE))
            .map_err(|e| EngineError::io("read checkpoint state", e))?,
    };
    serde_json::from_slice(&bytes).map_err(|e| EngineError::ConfigParse {
        message: format!("{}: {}", CHECKPOINT_STATE_FILE, e),
    })
}

/// Kill and reap a restored process left behind by a failed restore.
fn reap(pid: i32) {
    if pid <= 0 {
        return;
    }
    let pid = Pid::from_raw(pid);
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid = %pid, error = %e, "Failed to kill half-restored process"),
    }
    match waitpid(pid, None) {
        Ok(_) | Err(Errno::ECHILD) => {}
        Err(e) => tracing::warn!(pid = %pid, error = %e, "Failed to reap half-restored process"),
    }
}
