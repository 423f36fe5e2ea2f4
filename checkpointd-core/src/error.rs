// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for checkpointd.
//!
//! Every failure is scoped to the operation that raised it and is returned
//! to the caller as a typed variant. No `Box<dyn Error>`, no `anyhow::Result`.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::JobId;

/// Top-level error type for the checkpoint/restore engine.
#[derive(Debug, Error)]
pub enum EngineError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Caller Errors - Rejected Before Any Subprocess Is Spawned
    // =========================================================================
    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),

    // =========================================================================
    // Job Lifecycle Errors
    // =========================================================================
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    // =========================================================================
    // External Process Errors
    // =========================================================================
    #[error("CRIU error: {0}")]
    Criu(#[from] CriuError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("GPU sidecar error: {0}")]
    Sidecar(#[from] SidecarError),

    #[error("Image streamer error: {0}")]
    Streamer(#[from] StreamerError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("System call failed: {syscall} - {message}")]
    Syscall {
        syscall: &'static str,
        message: String,
    },
}

/// Coarse failure category, used by an outer service layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Precondition,
    Sidecar,
    Resource,
    NotFound,
    Busy,
}

impl EngineError {
    /// Shorthand for wrapping an IO error with a static context.
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Classify the error for callers that only need the category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Criu(_) | Self::Hook(_) | Self::Streamer(_) => ErrorKind::Protocol,
            Self::Precondition(_)
            | Self::HardValidation(_)
            | Self::ConfigNotFound { .. }
            | Self::ConfigParse { .. }
            | Self::InvalidStateTransition(_) => ErrorKind::Precondition,
            Self::Sidecar(_) => ErrorKind::Sidecar,
            Self::Job(JobError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Job(JobError::Busy { .. }) => ErrorKind::Busy,
            Self::Job(_) | Self::Store(_) | Self::Io { .. } | Self::Syscall { .. } => {
                ErrorKind::Resource
            }
        }
    }
}

/// Hard validation errors for configuration and identifiers.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// Caller-supplied arguments that cannot be acted on.
#[derive(Debug, Error)]
pub enum PreconditionError {
    #[error("GPU support is not enabled in this engine")]
    GpuNotEnabled,

    #[error("GPU {operation} requires a job id")]
    GpuRequiresJob { operation: &'static str },

    #[error("No checkpoint directory given and no default dump directory configured")]
    MissingDumpDir,

    #[error("Checkpoint path or job id is required")]
    MissingCheckpointPath,

    #[error("A pid or job id is required")]
    MissingTarget,

    #[error("Checkpoint path does not exist: {path}")]
    CheckpointNotFound { path: PathBuf },

    #[error("Checkpoint archive must be a .tar file: {path}")]
    NotAnArchive { path: PathBuf },

    #[error("Streaming restore requires a directory: {path}")]
    NotADirectory { path: PathBuf },

    #[error("Job {job_id} has no checkpoint")]
    NoCheckpoint { job_id: JobId },

    #[error("Remote checkpoint requested but no uploader is configured")]
    NoUploader,

    #[error("Job {job_id} is not running")]
    JobNotRunning { job_id: JobId },
}

/// Job lifecycle state errors.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for job {job}")]
    InvalidTransition {
        job: String,
        from: &'static str,
        to: &'static str,
    },
}

/// Job bookkeeping errors.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {job_id}")]
    NotFound { job_id: JobId },

    #[error("No job found for pid {pid}")]
    PidNotFound { pid: u32 },

    #[error("Job already exists: {job_id}")]
    AlreadyExists { job_id: JobId },

    #[error("Job {job_id} has another checkpoint operation in flight")]
    Busy { job_id: JobId },

    #[error("Failed to start job {job_id}: {reason}")]
    StartFailed { job_id: JobId, reason: String },
}

/// Persistent job store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to serialize job {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Corrupt job record {key}: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Job store IO failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// CRIU protocol driver errors.
#[derive(Debug, Error)]
pub enum CriuError {
    #[error("CRIU binary not found at expected path")]
    BinaryNotFound,

    #[error("Failed to spawn CRIU worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("CRIU socket error: {reason}")]
    Socket { reason: String },

    #[error("CRIU worker closed the connection")]
    UnexpectedEof,

    #[error("CRIU response does not fit into {size} byte buffer")]
    BufferTooSmall { size: usize },

    #[error("Failed to encode CRIU request: {reason}")]
    Encode { reason: String },

    #[error("Failed to decode CRIU response: {reason}")]
    Decode { reason: String },

    #[error("Unexpected CRIU response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("CRIU {operation} failed (errno {errno}): {message}{log_tail}")]
    OperationFailed {
        operation: &'static str,
        errno: i32,
        message: String,
        log_tail: String,
    },

    #[error("Hook {hook} failed: {source}")]
    HookFailed {
        hook: &'static str,
        #[source]
        source: HookError,
    },

    #[error("CRIU version {actual} is older than required {required}")]
    VersionTooOld { actual: u32, required: u32 },

    #[error("CRIU response for {operation} is missing field {field}")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },
}

impl CriuError {
    /// Attach the tail of the worker's log file to a peer failure.
    pub fn with_log_tail(self, name: &str, tail: &str) -> Self {
        match self {
            Self::OperationFailed {
                operation,
                errno,
                message,
                ..
            } if !tail.is_empty() => Self::OperationFailed {
                operation,
                errno,
                message,
                log_tail: format!("\n{} content:\n{}", name, tail),
            },
            other => other,
        }
    }
}

/// Hook registration and invocation errors.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Unknown hook name: {name}")]
    UnknownHook { name: String },

    #[error("Hook {hook} is missing its descriptor")]
    MissingDescriptor { hook: &'static str },

    #[error("{0}")]
    Callback(String),
}

/// GPU sidecar coordinator errors. All of them imply sidecar teardown.
#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("GPU sidecar binary not found: {path}")]
    BinaryNotFound { path: PathBuf },

    #[error("GPU shared library not found: {path}")]
    SharedLibraryNotFound { path: PathBuf },

    #[error("Failed to spawn GPU sidecar for job {job_id}: {reason}")]
    SpawnFailed { job_id: String, reason: String },

    #[error("GPU sidecar for job {job_id} did not become ready within {timeout_ms}ms")]
    StartupTimeout { job_id: String, timeout_ms: u64 },

    #[error("GPU sidecar for job {job_id} is not registered")]
    NotRegistered { job_id: String },

    #[error("GPU sidecar for job {job_id} is already registered")]
    AlreadyRegistered { job_id: String },

    #[error("GPU sidecar RPC {rpc} transport failed: {reason}")]
    Transport { rpc: &'static str, reason: String },

    #[error("GPU sidecar RPC {rpc} failed: {reason}")]
    RpcFailed { rpc: &'static str, reason: String },
}

/// Image streamer subprocess errors.
#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("Failed to spawn image streamer: {reason}")]
    SpawnFailed { reason: String },

    #[error("Image streamer exited before becoming ready")]
    ExitedEarly,

    #[error("Image streamer handshake on {socket} failed: {reason}")]
    Handshake { socket: PathBuf, reason: String },

    #[error("Image streamer exited with {status}")]
    Failed { status: String },
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;
