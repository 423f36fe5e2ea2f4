// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

use serde::{Deserialize, Serialize};

/// Timings and size of one dump, returned with the dump response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpStats {
    /// Directory setup, process inspection, streamer start.
    pub prepare_ms: u64,
    pub gpu_ms: u64,
    pub criu_ms: u64,
    /// Metadata, archive or streamer drain, store update.
    pub finalize_ms: u64,
    /// Archive size, or total `.lz4` size when streaming.
    pub checkpoint_size: u64,
}

/// Timings of one restore, returned with the restore response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStats {
    /// Scratch directory, extraction, streamer start.
    pub prepare_ms: u64,
    pub criu_ms: u64,
    pub gpu_ms: u64,
    pub gpu_copy_mem_ms: u64,
    pub gpu_replay_calls_ms: u64,
}
