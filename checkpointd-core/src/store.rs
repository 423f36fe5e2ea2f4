// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Persistent job storage.
//!
//! The engine only needs get/put semantics keyed by job id. Records are
//! stored as JSON so the on-disk and in-memory stores share one encoding.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::StoreError;
use crate::state::ProcessState;
use crate::types::JobId;

/// Get/put storage for job records.
pub trait JobStore: Send + Sync {
    /// Fetch the record for a job, if any.
    fn get(&self, job_id: &JobId) -> Result<Option<ProcessState>, StoreError>;

    /// Insert or replace the record for a job.
    fn put(&self, job_id: &JobId, state: &ProcessState) -> Result<(), StoreError>;

    /// All stored records.
    fn list(&self) -> Result<Vec<ProcessState>, StoreError>;
}

fn encode(key: &JobId, state: &ProcessState) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(state).map_err(|source| StoreError::Serialize {
        key: key.to_string(),
        source,
    })
}

fn decode(key: &str, bytes: &[u8]) -> Result<ProcessState, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Deserialize {
        key: key.to_string(),
        source,
    })
}

/// Thread-safe in-memory job store.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    data: DashMap<JobId, Vec<u8>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new store wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl JobStore for MemoryJobStore {
    fn get(&self, job_id: &JobId) -> Result<Option<ProcessState>, StoreError> {
        match self.data.get(job_id) {
            Some(entry) => decode(job_id.as_str(), entry.value()).map(Some),
            None => Ok(None),
        }
    }

    fn put(&self, job_id: &JobId, state: &ProcessState) -> Result<(), StoreError> {
        let bytes = encode(job_id, state)?;
        self.data.insert(job_id.clone(), bytes);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ProcessState>, StoreError> {
        self.data
            .iter()
            .map(|entry| decode(entry.key().as_str(), entry.value()))
            .collect()
    }
}

/// Job store keeping one JSON file per job in a directory.
///
/// Writes go to a temporary file that is renamed over the record, so a crash
/// mid-write leaves the previous record intact.
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            key: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }
}

impl JobStore for FileJobStore {
    fn get(&self, job_id: &JobId) -> Result<Option<ProcessState>, StoreError> {
        match std::fs::read(self.record_path(job_id)) {
            Ok(bytes) => decode(job_id.as_str(), &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                key: job_id.to_string(),
                source,
            }),
        }
    }

    fn put(&self, job_id: &JobId, state: &ProcessState) -> Result<(), StoreError> {
        let bytes = encode(job_id, state)?;
        let io_err = |source| StoreError::Io {
            key: job_id.to_string(),
            source,
        };

        let tmp = self.dir.join(format!(".{}.json.tmp", job_id));
        std::fs::write(&tmp, bytes).map_err(io_err)?;
        std::fs::rename(&tmp, self.record_path(job_id)).map_err(io_err)
    }

    fn list(&self) -> Result<Vec<ProcessState>, StoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| StoreError::Io {
            key: self.dir.display().to_string(),
            source,
        })?;

        let mut states = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| StoreError::Io {
                    key: self.dir.display().to_string(),
                    source,
                })?
                .path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(|source| StoreError::Io {
                key: name.to_string(),
                source,
            })?;
            states.push(decode(name, &bytes)?);
        }
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::JobState;
    use crate::types::{Credentials, ProcessId};
    use tempfile::TempDir;

    fn record(jid: &str, pid: u32) -> (JobId, ProcessState) {
        let jid = JobId::new(jid).unwrap();
        let state = ProcessState::new(
            ProcessId::new(pid).unwrap(),
            Some(jid.clone()),
            Credentials::default(),
        );
        (jid, state)
    }

    #[test]
    fn test_memory_put_get() {
        let store = MemoryJobStore::new();
        let (jid, mut state) = record("job1", 42);

        assert!(store.get(&jid).unwrap().is_none());
        store.put(&jid, &state).unwrap();
        assert_eq!(store.get(&jid).unwrap().unwrap().pid.value(), 42);

        state.transition_to(JobState::Killed).unwrap();
        store.put(&jid, &state).unwrap();
        assert_eq!(store.get(&jid).unwrap().unwrap().job_state, JobState::Killed);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let (jid, state) = record("job1", 7);

        FileJobStore::open(dir.path()).unwrap().put(&jid, &state).unwrap();

        let reopened = FileJobStore::open(dir.path()).unwrap();
        let loaded = reopened.get(&jid).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(!dir.path().join(".job1.json.tmp").exists());
    }

    #[test]
    fn test_file_store_list_skips_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path()).unwrap();
        let (a, sa) = record("a", 1);
        let (b, sb) = record("b", 2);
        store.put(&a, &sa).unwrap();
        store.put(&b, &sb).unwrap();
        std::fs::write(dir.path().join(".c.json.tmp"), b"{").unwrap();

        let mut pids: Vec<u32> = store.list().unwrap().iter().map(|s| s.pid.value()).collect();
        pids.sort();
        assert_eq!(pids, vec![1, 2]);
    }

    #[test]
    fn test_file_store_corrupt_record() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("bad.json"), b"not json").unwrap();

        let err = store.get(&JobId::new("bad").unwrap()).unwrap_err();
        assert!(matches!(err, StoreError::Deserialize { .. }));
    }

    #[test]
    fn test_concurrent_puts() {
        use std::thread;

        let store = MemoryJobStore::new_shared();
        let mut handles = vec![];

        for i in 0..10 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                let (jid, state) = record(&format!("job-{}", i), 100 + i);
                store.put(&jid, &state).unwrap();
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.list().unwrap().len(), 10);
    }
}
