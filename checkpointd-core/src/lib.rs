// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpointd Core Library
//!
//! Checkpoint/restore orchestration engine. Drives CRIU over its swrk RPC
//! protocol, dispatches notify hooks, runs the dump and restore pipelines,
//! coordinates per-job GPU sidecars and tracks managed job lifecycles.

// Generated CRIU RPC and image streamer messages (`rpc`, `img_streamer`).
include!(concat!(env!("OUT_DIR"), "/protos/mod.rs"));

pub mod archive;
pub mod config;
pub mod context;
pub mod criu;
pub mod dump;
pub mod error;
pub mod gpu;
pub mod jobs;
pub mod procinfo;
pub mod restore;
pub mod state;
pub mod stats;
pub mod store;
pub mod streamer;
pub mod types;
pub mod upload;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{ConfigLoader, EngineConfig};
pub use context::EngineContext;
pub use criu::{Criu, CriuConnector, HookName, HookSet};
pub use dump::{DumpPipeline, DumpRequest, DumpResponse};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use gpu::SidecarCoordinator;
pub use jobs::{JobManager, StartRequest};
pub use restore::{RestorePipeline, RestoreRequest, RestoreResponse};
pub use state::{CheckpointState, JobState, ProcessState};
pub use store::{FileJobStore, JobStore, MemoryJobStore};
pub use types::{Credentials, JobId, ProcessId};
