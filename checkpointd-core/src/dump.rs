// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Dump pipeline.
//!
//! prepare (directory, process facts, streamer) → GPU checkpoint → CRIU
//! DUMP → finalize (metadata, archive or streamer drain, store). A failure
//! after the directory exists leaves it in place for inspection.

use std::collections::BTreeMap;
use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::archive;
use crate::context::{run_blocking, EngineContext};
use crate::criu::{CheckpointOptions, HookSet};
use crate::error::{EngineError, EngineResult, JobError, PreconditionError};
use crate::state::{CheckpointState, JobState, ProcessState};
use crate::stats::DumpStats;
use crate::streamer::{self, ImageStreamer, StreamerMode};
use crate::types::{JobId, ProcessId};

pub const CHECKPOINT_STATE_FILE: &str = "checkpoint_state.json";
pub const DESCRIPTORS_FILE: &str = "descriptors.json";
pub const DUMP_LOG_FILE: &str = "dump.log";
/// Created in streaming mode once metadata is written; tells the capture
/// streamer no more files follow.
pub const STREAM_READY_FILE: &str = "ckpt";

const DUMP_DIR_MODE: u32 = 0o700;

/// Caller inputs for one dump.
#[derive(Debug, Clone, Default)]
pub struct DumpRequest {
    /// Target process. Ignored when `job_id` is set.
    pub pid: Option<ProcessId>,
    pub job_id: Option<JobId>,
    /// Parent directory of the checkpoint. Falls back to `dump.dir`.
    pub dir: Option<PathBuf>,
    /// Overrides `dump.leave_running` when set.
    pub leave_running: Option<bool>,
    pub tcp_established: bool,
    pub tcp_close: bool,
    pub tcp_skip_in_flight: bool,
    /// Overrides pty detection when set.
    pub shell_job: Option<bool>,
    pub external: Vec<String>,
    pub stream: bool,
    pub remote: bool,
    pub gpu: bool,
}

#[derive(Debug, Clone)]
pub struct DumpResponse {
    pub message: String,
    /// Archive file, or the checkpoint directory when streaming.
    pub checkpoint_path: PathBuf,
    pub state: ProcessState,
    pub stats: DumpStats,
}

/// Runs dumps against one engine context.
#[derive(Debug, Clone)]
pub struct DumpPipeline {
    ctx: Arc<EngineContext>,
}

impl DumpPipeline {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn dump(&self, request: DumpRequest) -> EngineResult<DumpResponse> {
        self.dump_with_hooks(request, HookSet::new()).await
    }

    /// Dump with caller-supplied CRIU notify hooks.
    pub async fn dump_with_hooks(
        &self,
        request: DumpRequest,
        hooks: HookSet,
    ) -> EngineResult<DumpResponse> {
        let base_dir = self.validate(&request)?;
        let _guard = match &request.job_id {
            Some(jid) => Some(self.ctx.locks.try_acquire(jid)?),
            None => None,
        };

        let mut state = self.resolve(&request)?;
        let gpu = request.gpu || state.gpu;
        if gpu && !self.ctx.config.gpu.enabled {
            return Err(PreconditionError::GpuNotEnabled.into());
        }

        let result = self.run(request, base_dir, &mut state, gpu, hooks).await;
        if let Err(ref e) = result {
            tracing::warn!(job = %state.display_name(), pid = %state.pid, error = %e, "Dump failed");
            if matches!(e, EngineError::Criu(_) | EngineError::Sidecar(_)) {
                state.checkpoint_state = CheckpointState::CheckpointFailed;
                self.persist(&state);
            }
        }
        result
    }

    fn validate(&self, request: &DumpRequest) -> EngineResult<PathBuf> {
        if request.gpu && !self.ctx.config.gpu.enabled {
            return Err(PreconditionError::GpuNotEnabled.into());
        }
        if request.gpu && request.job_id.is_none() {
            return Err(PreconditionError::GpuRequiresJob { operation: "dump" }.into());
        }
        if request.remote && self.ctx.uploader.is_none() {
            return Err(PreconditionError::NoUploader.into());
        }
        if request.job_id.is_none() && request.pid.is_none() {
            return Err(PreconditionError::MissingTarget.into());
        }

        match &request.dir {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(dir.clone()),
            _ => self
                .ctx
                .config
                .dump
                .dir
                .clone()
                .ok_or_else(|| PreconditionError::MissingDumpDir.into()),
        }
    }

    /// Find the record to dump: the stored job, a stored job owning the pid,
    /// or a fresh record for an unmanaged process.
    fn resolve(&self, request: &DumpRequest) -> EngineResult<ProcessState> {
        if let Some(jid) = &request.job_id {
            let state = self
                .ctx
                .store
                .get(jid)?
                .ok_or_else(|| JobError::NotFound { job_id: jid.clone() })?;
            if state.job_state != JobState::Running {
                return Err(PreconditionError::JobNotRunning { job_id: jid.clone() }.into());
            }
            return Ok(state);
        }

        let pid = request.pid.ok_or(PreconditionError::MissingTarget)?;
        let managed = self
            .ctx
            .store
            .list()?
            .into_iter()
            .find(|s| s.pid == pid && s.is_running());
        match managed {
            Some(state) => Ok(state),
            None => {
                let credentials = self.ctx.inspector.credentials(pid)?;
                Ok(ProcessState::new(pid, None, credentials))
            }
        }
    }

    async fn run(
        &self,
        request: DumpRequest,
        base_dir: PathBuf,
        state: &mut ProcessState,
        gpu: bool,
        hooks: HookSet,
    ) -> EngineResult<DumpResponse> {
        let mut stats = DumpStats::default();
        let config = &self.ctx.config;

        // Prepare
        let started = Instant::now();
        state.credentials = self.ctx.inspector.credentials(state.pid)?;
        state.process_info = self.ctx.inspector.process_info(state.pid)?;
        state.gpu = gpu;

        let dir = prepare_dir(&base_dir, state, request.stream)?;
        let streamer = if request.stream {
            Some(ImageStreamer::spawn(&config.streamer, &dir, StreamerMode::Capture, gpu).await?)
        } else {
            None
        };
        stats.prepare_ms = started.elapsed().as_millis() as u64;

        let options = self.options(&request, state, &dir);
        tracing::info!(
            job = %state.display_name(),
            pid = %state.pid,
            dir = %dir.display(),
            leave_running = options.leave_running,
            tcp_established = options.tcp_established,
            shell_job = options.shell_job,
            stream = request.stream,
            gpu = gpu,
            "Beginning dump"
        );

        // GPU
        if gpu {
            let started = Instant::now();
            let jid = state
                .job_id
                .as_ref()
                .ok_or(PreconditionError::GpuRequiresJob { operation: "dump" })?;
            if let Err(e) = self.ctx.sidecars.checkpoint(jid.as_str(), &dir).await {
                kill_streamer(streamer).await;
                return Err(e.into());
            }
            state.gpu_checkpointed = true;
            stats.gpu_ms = started.elapsed().as_millis() as u64;
        }

        // CRIU
        let started = Instant::now();
        let criu = Arc::clone(&self.ctx.criu);
        let leave_running = options.leave_running;
        let log_path = dir.join(DUMP_LOG_FILE);
        let dumped = run_blocking(move || {
            let mut hooks = hooks;
            criu.dump(&options, &mut hooks).map_err(EngineError::from)
        })
        .await;
        if let Err(e) = dumped {
            kill_streamer(streamer).await;
            return Err(match e {
                EngineError::Criu(err) => err
                    .with_log_tail(DUMP_LOG_FILE, &archive::log_tail(&log_path, archive::LOG_TAIL_LINES))
                    .into(),
                other => other,
            });
        }
        stats.criu_ms = started.elapsed().as_millis() as u64;

        // KILLED must be in the store before the exit watcher gets the lock.
        if !leave_running {
            state.transition_to(JobState::Killed)?;
            if let Some(jid) = &state.job_id {
                self.ctx.store.put(jid, state)?;
            }
        }

        // Finalize
        let started = Instant::now();
        let checkpoint_path = if request.stream {
            dir.clone()
        } else {
            tar_path(&dir)
        };
        state.checkpoint_path = Some(checkpoint_path.clone());
        state.checkpoint_state = CheckpointState::Checkpointed;

        stats.checkpoint_size = match streamer {
            Some(streamer) => {
                let socket = streamer.socket_path();
                let files = metadata_files(state)?;
                let ready = dir.join(STREAM_READY_FILE);
                let sent = run_blocking(move || {
                    for (name, body) in files {
                        streamer::send_file(&socket, name, &body)?;
                    }
                    fs::File::create(&ready).map_err(|e| EngineError::io("create ready file", e))?;
                    Ok(())
                })
                .await;
                if let Err(e) = sent {
                    streamer.kill().await;
                    return Err(e);
                }
                streamer.wait().await?;
                archive::lz4_size(&dir)
            }
            None => {
                for (name, body) in metadata_files(state)? {
                    fs::write(dir.join(name), body)
                        .map_err(|e| EngineError::io("write checkpoint metadata", e))?;
                }
                let src = dir.clone();
                let target = checkpoint_path.clone();
                run_blocking(move || archive::archive_dir(&src, &target)).await?
            }
        };

        if request.remote {
            if let Some(uploader) = self.ctx.uploader.clone() {
                let artifact = checkpoint_path.clone();
                let remote = run_blocking(move || uploader.upload(&artifact)).await?;
                state.remote_state.push(remote);
            }
        }

        if let Some(jid) = &state.job_id {
            self.ctx.store.put(jid, state)?;
        }
        stats.finalize_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            job = %state.display_name(),
            pid = %state.pid,
            path = %checkpoint_path.display(),
            size = stats.checkpoint_size,
            criu_ms = stats.criu_ms,
            "Dump complete"
        );

        Ok(DumpResponse {
            message: format!("Dumped process {} to {}", state.pid, checkpoint_path.display()),
            checkpoint_path,
            state: state.clone(),
            stats,
        })
    }

    fn options(&self, request: &DumpRequest, state: &ProcessState, dir: &Path) -> CheckpointOptions {
        let config = &self.ctx.config;
        let info = &state.process_info;

        let mut options = CheckpointOptions::new(dir);
        options.pid = Some(state.pid.value() as i32);
        options.log_file = Some(DUMP_LOG_FILE.to_string());
        options.log_level = Some(config.criu.log_level);
        options.ghost_limit = Some(config.dump.ghost_limit);
        options.file_locks = true;
        options.ext_unix_sk = info.has_unix_sockets();
        options.tcp_established = info.has_tcp() || request.tcp_established;
        options.tcp_close = request.tcp_close;
        options.tcp_skip_in_flight = request.tcp_skip_in_flight;
        options.shell_job = request.shell_job.unwrap_or_else(|| info.has_pty());
        options.leave_running = request.leave_running.unwrap_or(config.dump.leave_running);
        options.external = request.external.clone();
        options.stream = request.stream;
        options
    }

    fn persist(&self, state: &ProcessState) {
        if let Some(jid) = &state.job_id {
            if let Err(e) = self.ctx.store.put(jid, state) {
                tracing::warn!(job_id = %jid, error = %e, "Failed to record dump failure");
            }
        }
    }
}

/// Resolve and create the checkpoint directory, owned by the process's user.
fn prepare_dir(base: &Path, state: &ProcessState, stream: bool) -> EngineResult<PathBuf> {
    let dir = if stream {
        base.to_path_buf()
    } else {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let name = match &state.job_id {
            Some(jid) => jid.to_string(),
            None => state.pid.to_string(),
        };
        base.join(format!("{}_{}", name, nanos))
    };

    let mut builder = DirBuilder::new();
    builder.recursive(true).mode(DUMP_DIR_MODE);
    builder
        .create(&dir)
        .map_err(|e| EngineError::io("create checkpoint dir", e))?;

    let creds = &state.credentials;
    archive::chown_recursive(&dir, creds.uid, creds.gid)?;
    archive::chmod_recursive(&dir, DUMP_DIR_MODE)?;
    Ok(dir)
}

/// `<dir>.tar`, appended rather than replacing anything after a dot in the name.
fn tar_path(dir: &Path) -> PathBuf {
    let mut path = dir.as_os_str().to_owned();
    path.push(".tar");
    PathBuf::from(path)
}

/// Serialized state record and the stdio descriptor map.
fn metadata_files(state: &ProcessState) -> EngineResult<Vec<(&'static str, Vec<u8>)>> {
    let encode = |e: serde_json::Error| EngineError::Syscall {
        syscall: "serialize",
        message: e.to_string(),
    };
    let descriptors: BTreeMap<i32, &str> = state
        .process_info
        .stdio()
        .map(|f| (f.fd, f.path.as_str()))
        .collect();

    Ok(vec![
        (
            CHECKPOINT_STATE_FILE,
            serde_json::to_vec_pretty(state).map_err(encode)?,
        ),
        (
            DESCRIPTORS_FILE,
            serde_json::to_vec_pretty(&descriptors).map_err(encode)?,
        ),
    ])
}

async fn kill_streamer(streamer: Option<ImageStreamer>) {
    if let Some(streamer) = streamer {
        streamer.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::criu::session::tests::{response, Peer};
    use crate::criu::{CriuConnector, HookName};
    use crate::error::ErrorKind;
    use crate::rpc;
    use crate::store::{JobStore, MemoryJobStore};
    use crate::testing::{stdio_inspector, ScriptedCriu};
    use crate::types::Credentials;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn successful_dump(peer: Peer) {
        let req = peer.recv();
        assert_eq!(req.type_(), rpc::Criu_req_type::DUMP);
        let opts = req.opts.as_ref().unwrap();
        assert!(opts.file_locks());
        assert_eq!(opts.log_file(), DUMP_LOG_FILE);
        peer.send(&response(rpc::Criu_req_type::DUMP, true));
    }

    fn context(criu: Arc<dyn CriuConnector>, store: Arc<MemoryJobStore>) -> Arc<EngineContext> {
        EngineContext::new(EngineConfig::default(), criu, stdio_inspector(), store).into_shared()
    }

    fn running_job(store: &MemoryJobStore, jid: &str) -> JobId {
        let jid = JobId::new(jid).unwrap();
        let state = ProcessState::new(
            ProcessId::new(std::process::id()).unwrap(),
            Some(jid.clone()),
            Credentials::current(),
        );
        store.put(&jid, &state).unwrap();
        jid
    }

    #[tokio::test]
    async fn test_dump_leave_running_keeps_state() {
        let out = TempDir::new().unwrap();
        let store = MemoryJobStore::new_shared();
        let jid = running_job(&store, "job1");
        let criu = ScriptedCriu::new(successful_dump);
        let pipeline = DumpPipeline::new(context(criu.clone(), store.clone()));

        let resp = pipeline
            .dump(DumpRequest {
                job_id: Some(jid.clone()),
                dir: Some(out.path().to_path_buf()),
                leave_running: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(resp.message.contains(&std::process::id().to_string()));
        let name = resp.checkpoint_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("job1_") && name.ends_with(".tar"));
        assert!(resp.stats.checkpoint_size > 0);

        let stored = store.get(&jid).unwrap().unwrap();
        assert_eq!(stored.job_state, JobState::Running);
        assert_eq!(stored.checkpoint_state, CheckpointState::Checkpointed);
        assert_eq!(stored.checkpoint_path.as_deref(), Some(resp.checkpoint_path.as_path()));
        assert_eq!(criu.connects.load(Ordering::SeqCst), 1);

        // Metadata sits next to the images before archiving.
        let dir = resp.checkpoint_path.with_extension("");
        let descriptors = fs::read_to_string(dir.join(DESCRIPTORS_FILE)).unwrap();
        assert!(descriptors.contains("/tmp/out.log"));
        assert!(!descriptors.contains("/etc/hosts"));
        let saved: ProcessState =
            serde_json::from_slice(&fs::read(dir.join(CHECKPOINT_STATE_FILE)).unwrap()).unwrap();
        assert_eq!(saved.job_id, Some(jid));
    }

    #[tokio::test]
    async fn test_dump_without_leave_running_kills_job() {
        let out = TempDir::new().unwrap();
        let store = MemoryJobStore::new_shared();
        let jid = running_job(&store, "job2");
        let pipeline = DumpPipeline::new(context(ScriptedCriu::new(successful_dump), store.clone()));

        pipeline
            .dump(DumpRequest {
                job_id: Some(jid.clone()),
                dir: Some(out.path().to_path_buf()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(store.get(&jid).unwrap().unwrap().job_state, JobState::Killed);

        // A killed job cannot be dumped again.
        let err = pipeline
            .dump(DumpRequest {
                job_id: Some(jid),
                dir: Some(out.path().to_path_buf()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn test_criu_failure_keeps_dir_and_attaches_log() {
        let out = TempDir::new().unwrap();
        let store = MemoryJobStore::new_shared();
        let jid = running_job(&store, "job3");
        let criu = ScriptedCriu::new(|peer: Peer| {
            let req = peer.recv();
            // CRIU writes its log into the images directory.
            let dir = std::fs::read_link(format!(
                "/proc/self/fd/{}",
                req.opts.as_ref().unwrap().images_dir_fd()
            ))
            .unwrap();
            fs::write(dir.join(DUMP_LOG_FILE), "Error (criu/cr-dump.c): seize failed\n").unwrap();
            let mut resp = response(rpc::Criu_req_type::DUMP, false);
            resp.set_cr_errno(1);
            resp.set_cr_errmsg("Operation not permitted".to_string());
            peer.send(&resp);
        });
        let pipeline = DumpPipeline::new(context(criu, store.clone()));

        let err = pipeline
            .dump(DumpRequest {
                job_id: Some(jid.clone()),
                dir: Some(out.path().to_path_buf()),
                ..Default::default()
            })
            .await
            .unwrap_err();

        let text = err.to_string();
        assert!(text.contains("errno 1"));
        assert!(text.contains("dump.log content:"));
        assert!(text.contains("seize failed"));

        let left: Vec<_> = fs::read_dir(out.path()).unwrap().collect();
        assert_eq!(left.len(), 1);
        let stored = store.get(&jid).unwrap().unwrap();
        assert_eq!(stored.job_state, JobState::Running);
        assert_eq!(stored.checkpoint_state, CheckpointState::CheckpointFailed);
    }

    #[tokio::test]
    async fn test_preconditions_reject_before_criu() {
        let store = MemoryJobStore::new_shared();
        let jid = running_job(&store, "job4");
        let criu = ScriptedCriu::new(|_peer: Peer| {});
        let pipeline = DumpPipeline::new(context(criu.clone(), store));

        let gpu = pipeline
            .dump(DumpRequest {
                job_id: Some(jid.clone()),
                dir: Some(PathBuf::from("/tmp")),
                gpu: true,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            gpu,
            EngineError::Precondition(PreconditionError::GpuNotEnabled)
        ));

        let no_dir = pipeline
            .dump(DumpRequest {
                job_id: Some(jid),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            no_dir,
            EngineError::Precondition(PreconditionError::MissingDumpDir)
        ));

        let no_target = pipeline
            .dump(DumpRequest {
                dir: Some(PathBuf::from("/tmp")),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(
            no_target,
            EngineError::Precondition(PreconditionError::MissingTarget)
        ));

        assert_eq!(criu.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unmanaged_pid_dump_uses_pid_name() {
        let out = TempDir::new().unwrap();
        let store = MemoryJobStore::new_shared();
        let pipeline = DumpPipeline::new(context(ScriptedCriu::new(successful_dump), store.clone()));
        let pid = ProcessId::new(std::process::id()).unwrap();

        let resp = pipeline
            .dump(DumpRequest {
                pid: Some(pid),
                dir: Some(out.path().to_path_buf()),
                leave_running: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        let name = resp.checkpoint_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(&format!("{}_", pid)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_dump_hooks_run_in_order() {
        let out = TempDir::new().unwrap();
        let store = MemoryJobStore::new_shared();
        let jid = running_job(&store, "job5");
        let criu = ScriptedCriu::new(|peer: Peer| {
            let req = peer.recv();
            assert!(req.opts.as_ref().unwrap().notify_scripts());
            assert!(peer.notify("pre-dump", 0).notify_success());
            assert!(peer.notify("post-dump", 0).notify_success());
            peer.send(&response(rpc::Criu_req_type::DUMP, true));
        });
        let pipeline = DumpPipeline::new(context(criu, store));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookSet::new();
        for name in [HookName::PreDump, HookName::PostDump] {
            let seen = Arc::clone(&seen);
            hooks.on(name, move |ctx| {
                seen.lock().unwrap().push(ctx.name);
                Ok(())
            });
        }

        pipeline
            .dump_with_hooks(
                DumpRequest {
                    job_id: Some(jid),
                    dir: Some(out.path().to_path_buf()),
                    leave_running: Some(true),
                    ..Default::default()
                },
                hooks,
            )
            .await
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![HookName::PreDump, HookName::PostDump]
        );
    }

    #[test]
    fn test_tar_path_keeps_dots() {
        assert_eq!(
            tar_path(Path::new("/tmp/ck/job.v2_17")),
            PathBuf::from("/tmp/ck/job.v2_17.tar")
        );
    }
}
