// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Remote checkpoint storage.
//!
//! Remote mode pushes the finished artifact somewhere else after a dump and
//! pulls it back before a restore. Uploaders run on blocking threads.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{EngineError, EngineResult};
use crate::state::RemoteState;

/// Moves checkpoint artifacts to and from remote storage.
pub trait CheckpointUploader: Send + Sync {
    /// Upload a finished artifact and describe where it went.
    fn upload(&self, artifact: &Path) -> EngineResult<RemoteState>;

    /// Fetch a previously uploaded artifact into `dest_dir` and return its local path.
    fn download(&self, remote: &RemoteState, dest_dir: &Path) -> EngineResult<PathBuf>;
}

/// Uploader that copies artifacts into a directory, e.g. a network mount.
#[derive(Debug, Clone)]
pub struct DirectoryUploader {
    root: PathBuf,
}

impl DirectoryUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl CheckpointUploader for DirectoryUploader {
    fn upload(&self, artifact: &Path) -> EngineResult<RemoteState> {
        let name = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| EngineError::Syscall {
                syscall: "upload",
                message: format!("artifact has no file name: {}", artifact.display()),
            })?
            .to_string();

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let upload_id = format!("{}-{}", name, timestamp);

        fs::create_dir_all(&self.root).map_err(|e| EngineError::io("create upload root", e))?;
        fs::copy(artifact, self.root.join(&upload_id))
            .map_err(|e| EngineError::io("upload checkpoint", e))?;

        tracing::info!(artifact = %artifact.display(), upload_id = %upload_id, "Uploaded checkpoint");
        Ok(RemoteState {
            checkpoint_id: name,
            upload_id,
            timestamp,
        })
    }

    fn download(&self, remote: &RemoteState, dest_dir: &Path) -> EngineResult<PathBuf> {
        fs::create_dir_all(dest_dir).map_err(|e| EngineError::io("create download dir", e))?;
        let dest = dest_dir.join(&remote.checkpoint_id);
        fs::copy(self.root.join(&remote.upload_id), &dest)
            .map_err(|e| EngineError::io("download checkpoint", e))?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_upload_then_download() {
        let local = TempDir::new().unwrap();
        let artifact = local.path().join("job1_1.tar");
        fs::write(&artifact, b"archive").unwrap();

        let remote = TempDir::new().unwrap();
        let uploader = DirectoryUploader::new(remote.path());
        let record = uploader.upload(&artifact).unwrap();
        assert_eq!(record.checkpoint_id, "job1_1.tar");
        assert!(record.timestamp > 0);

        let fetched = TempDir::new().unwrap();
        let path = uploader.download(&record, fetched.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "job1_1.tar");
        assert_eq!(fs::read(path).unwrap(), b"archive");
    }
}
