// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Job lifecycle state and the persisted checkpoint metadata record.
//!
//! Implements the job lifecycle: Running → Killed → Running → Done.
//! Invalid transitions result in StateTransitionError.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::{Credentials, JobId, ProcessId};

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// The job's process is alive.
    Running,

    /// The process was checkpointed without leave-running and is gone.
    Killed,

    /// The process exited on its own.
    Done,
}

impl JobState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Killed => "KILLED",
            Self::Done => "DONE",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        matches!(
            (self, target),
            // From Running
            (Self::Running, Self::Killed) |
            (Self::Running, Self::Done) |
            // From Killed
            (Self::Killed, Self::Running) |
            (Self::Killed, Self::Done) |
            // From Done, restoring an existing checkpoint revives the job
            (Self::Done, Self::Running)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Outcome of the most recent checkpoint or restore against a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointState {
    #[default]
    None,
    Checkpointed,
    CheckpointFailed,
    Restored,
    RestoreFailed,
}

/// Standard stream a descriptor was serving when it was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamRole {
    Stdin,
    Stdout,
    Stderr,
    #[default]
    None,
}

impl StreamRole {
    /// Role of a descriptor by its number in the checkpointed process.
    pub fn from_fd(fd: i32) -> Self {
        match fd {
            0 => Self::Stdin,
            1 => Self::Stdout,
            2 => Self::Stderr,
            _ => Self::None,
        }
    }

    pub fn is_stdio(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// One open file descriptor of the checkpointed process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFile {
    pub fd: i32,
    pub path: String,
    /// Permission bits of the target, e.g. "0644".
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub stream: StreamRole,
}

/// Address half of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    pub ip: String,
    pub port: u32,
}

/// Socket families recorded for connections.
pub const AF_UNIX: u32 = libc::AF_UNIX as u32;
pub const AF_INET: u32 = libc::AF_INET as u32;
pub const AF_INET6: u32 = libc::AF_INET6 as u32;

/// Socket types recorded for connections.
pub const SOCK_STREAM: u32 = libc::SOCK_STREAM as u32;
pub const SOCK_DGRAM: u32 = libc::SOCK_DGRAM as u32;

/// One socket of the checkpointed process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub fd: i32,
    pub family: u32,
    #[serde(rename = "type")]
    pub kind: u32,
    #[serde(default)]
    pub laddr: Addr,
    #[serde(default)]
    pub raddr: Addr,
    #[serde(default)]
    pub status: String,
}

impl Connection {
    pub fn is_tcp(&self) -> bool {
        self.kind == SOCK_STREAM && (self.family == AF_INET || self.family == AF_INET6)
    }

    pub fn is_unix(&self) -> bool {
        self.family == AF_UNIX
    }
}

/// Ambient facts about a process captured at checkpoint time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    #[serde(default)]
    pub open_fds: Vec<OpenFile>,
    #[serde(default)]
    pub open_connections: Vec<Connection>,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub is_running: bool,
}

impl ProcessInfo {
    /// A process attached to a pseudo-terminal must be dumped as a shell job.
    pub fn has_pty(&self) -> bool {
        self.open_fds.iter().any(|f| f.path.contains("pts"))
    }

    pub fn has_tcp(&self) -> bool {
        self.open_connections.iter().any(Connection::is_tcp)
    }

    pub fn has_unix_sockets(&self) -> bool {
        self.open_connections.iter().any(Connection::is_unix)
    }

    /// Descriptors serving stdin, stdout, or stderr.
    pub fn stdio(&self) -> impl Iterator<Item = &OpenFile> {
        self.open_fds.iter().filter(|f| f.stream.is_stdio())
    }
}

/// Record of a checkpoint pushed to remote storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteState {
    pub checkpoint_id: String,
    pub upload_id: String,
    /// Unix seconds.
    pub timestamp: i64,
}

/// The canonical checkpoint metadata record of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub pid: ProcessId,
    pub job_id: Option<JobId>,
    pub job_state: JobState,
    #[serde(default)]
    pub gpu: bool,
    #[serde(default)]
    pub gpu_checkpointed: bool,
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
    #[serde(default)]
    pub checkpoint_state: CheckpointState,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub process_info: ProcessInfo,
    #[serde(default)]
    pub remote_state: Vec<RemoteState>,
}

impl ProcessState {
    /// A freshly observed running process.
    pub fn new(pid: ProcessId, job_id: Option<JobId>, credentials: Credentials) -> Self {
        Self {
            pid,
            job_id,
            job_state: JobState::Running,
            gpu: false,
            gpu_checkpointed: false,
            checkpoint_path: None,
            checkpoint_state: CheckpointState::None,
            credentials,
            process_info: ProcessInfo::default(),
            remote_state: Vec::new(),
        }
    }

    /// Attempt to move the job to a new lifecycle state.
    pub fn transition_to(&mut self, target: JobState) -> Result<(), StateTransitionError> {
        if !self.job_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                job: self.display_name(),
                from: self.job_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            job_id = ?self.job_id,
            pid = self.pid.value(),
            from = self.job_state.name(),
            to = target.name(),
            "Job state transition"
        );

        self.job_state = target;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.job_state == JobState::Running
    }

    /// The most recent remote upload, if any.
    pub fn latest_remote(&self) -> Option<&RemoteState> {
        self.remote_state.iter().max_by_key(|r| r.timestamp)
    }

    /// Job id, or the pid for processes that are not managed jobs.
    pub fn display_name(&self) -> String {
        match &self.job_id {
            Some(jid) => jid.to_string(),
            None => format!("pid-{}", self.pid),
        }
    }
}
