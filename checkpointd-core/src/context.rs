// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Shared engine state handed to the pipelines.
//!
//! Registries that used to be process-wide live here and are passed by
//! reference, so two engines in one process never see each other's jobs.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::EngineConfig;
use crate::criu::{Criu, CriuConnector};
use crate::error::{EngineError, EngineResult, JobError};
use crate::gpu::SidecarCoordinator;
use crate::procinfo::{ProcessInspector, ProcfsInspector};
use crate::store::{FileJobStore, JobStore, MemoryJobStore};
use crate::types::JobId;
use crate::upload::CheckpointUploader;

/// Held for the duration of one dump or restore of a job.
pub type JobGuard = OwnedMutexGuard<()>;

/// One lock per job id. A second operation on a locked job fails instead
/// of queueing.
#[derive(Debug, Default)]
pub struct JobLocks {
    locks: DashMap<JobId, Arc<Mutex<()>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, job_id: &JobId) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(job_id.clone()).or_default().value())
    }

    pub fn try_acquire(&self, job_id: &JobId) -> Result<JobGuard, JobError> {
        self.lock(job_id).try_lock_owned().map_err(|_| JobError::Busy {
            job_id: job_id.clone(),
        })
    }

    /// Wait until any in-flight operation on the job has finished.
    pub async fn acquire(&self, job_id: &JobId) -> JobGuard {
        self.lock(job_id).lock_owned().await
    }
}

/// Everything a pipeline needs: configuration, collaborators and registries.
pub struct EngineContext {
    pub config: EngineConfig,
    pub criu: Arc<dyn CriuConnector>,
    pub inspector: Arc<dyn ProcessInspector>,
    pub store: Arc<dyn JobStore>,
    pub sidecars: Arc<SidecarCoordinator>,
    pub uploader: Option<Arc<dyn CheckpointUploader>>,
    pub locks: JobLocks,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        criu: Arc<dyn CriuConnector>,
        inspector: Arc<dyn ProcessInspector>,
        store: Arc<dyn JobStore>,
    ) -> Self {
        let sidecars = SidecarCoordinator::new_shared(&config.gpu);
        Self {
            config,
            criu,
            inspector,
            store,
            sidecars,
            uploader: None,
            locks: JobLocks::new(),
        }
    }

    /// Wire the production collaborators described by `config`.
    pub fn from_config(config: EngineConfig) -> EngineResult<Self> {
        let criu = Arc::new(Criu::from_config(&config.criu)?);
        let store: Arc<dyn JobStore> = match &config.jobs.store_dir {
            Some(dir) => Arc::new(FileJobStore::open(dir.clone())?),
            None => MemoryJobStore::new_shared(),
        };
        tracing::info!(
            criu = %criu.binary().display(),
            gpu = config.gpu.enabled,
            persistent_store = config.jobs.store_dir.is_some(),
            "Engine context initialized"
        );
        Ok(Self::new(config, criu, Arc::new(ProcfsInspector), store))
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn CheckpointUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Create a new context wrapped in Arc for sharing.
    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("sidecars", &self.sidecars.len())
            .field("uploader", &self.uploader.is_some())
            .finish_non_exhaustive()
    }
}

/// Run blocking work (CRIU sessions, archives, handshakes) off the runtime.
pub(crate) async fn run_blocking<T, F>(f: F) -> EngineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> EngineResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::Syscall {
            syscall: "spawn_blocking",
            message: e.to_string(),
        })?
}
