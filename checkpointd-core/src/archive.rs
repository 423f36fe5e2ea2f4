// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint directory helpers: tar packing, ownership and log tails.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::unistd::{chown, Gid, Uid};

use crate::error::{EngineError, EngineResult};

/// Number of trailing CRIU log lines attached to a failure.
pub const LOG_TAIL_LINES: usize = 64;

/// Pack the contents of `dir` into the tar file `target` and return its size.
pub fn archive_dir(dir: &Path, target: &Path) -> EngineResult<u64> {
    let file = File::create(target).map_err(|e| EngineError::io("create checkpoint archive", e))?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .map_err(|e| EngineError::io("write checkpoint archive", e))?;
    let file = builder
        .into_inner()
        .map_err(|e| EngineError::io("finish checkpoint archive", e))?;
    file.sync_all()
        .map_err(|e| EngineError::io("sync checkpoint archive", e))?;

    let size = fs::metadata(target)
        .map_err(|e| EngineError::io("stat checkpoint archive", e))?
        .len();
    Ok(size)
}

/// Unpack the tar file `archive` into `dest`, keeping recorded permissions.
pub fn extract_archive(archive: &Path, dest: &Path) -> EngineResult<()> {
    let file = File::open(archive).map_err(|e| EngineError::io("open checkpoint archive", e))?;
    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|e| EngineError::io("extract checkpoint archive", e))
}

/// Recursively hand `path` to `uid:gid`.
pub fn chown_recursive(path: &Path, uid: u32, gid: u32) -> EngineResult<()> {
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| {
        EngineError::Syscall {
            syscall: "chown",
            message: format!("{}: {}", path.display(), e),
        }
    })?;

    if path.is_dir() && !path.is_symlink() {
        for entry in fs::read_dir(path).map_err(|e| EngineError::io("read checkpoint dir", e))? {
            let entry = entry.map_err(|e| EngineError::io("read checkpoint dir", e))?;
            chown_recursive(&entry.path(), uid, gid)?;
        }
    }
    Ok(())
}

/// Recursively set `mode` on `path` and everything below it.
pub fn chmod_recursive(path: &Path, mode: u32) -> EngineResult<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| EngineError::io("chmod checkpoint dir", e))?;

    if path.is_dir() && !path.is_symlink() {
        for entry in fs::read_dir(path).map_err(|e| EngineError::io("read checkpoint dir", e))? {
            let entry = entry.map_err(|e| EngineError::io("read checkpoint dir", e))?;
            chmod_recursive(&entry.path(), mode)?;
        }
    }
    Ok(())
}

/// Last `lines` lines of a log file. Missing or unreadable logs yield "".
pub fn log_tail(path: &Path, lines: usize) -> String {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read CRIU log");
            return String::new();
        }
    };

    let mut tail = VecDeque::with_capacity(lines);
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

/// Total size of the `*.lz4` artifacts a capture streamer left in `dir`.
pub fn lz4_size(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "lz4"))
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
