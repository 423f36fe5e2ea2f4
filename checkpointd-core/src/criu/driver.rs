// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CRIU swrk worker launcher.
//!
//! Every operation gets its own worker: `criu swrk <fd>` is spawned with
//! one end of a fresh SOCK_SEQPACKET pair, talks to exactly one session,
//! and exits when the session closes.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use super::hooks::HookSet;
use super::options::CheckpointOptions;
use super::session::{CriuFeatures, Session};
use crate::config::CriuConfig;
use crate::error::CriuError;

/// First descriptor number handed to the worker. Extra files land at 3..,
/// the swrk socket right after them.
const FIRST_EXTRA_FD: RawFd = 3;

/// Something that can open a session with a checkpoint engine.
///
/// The operations below open a fresh session, run one request and always
/// close it again.
pub trait CriuConnector: Send + Sync {
    /// Start a worker. `extra_files` appear in it at descriptors 3.. in order.
    fn connect(&self, extra_files: &[BorrowedFd<'_>]) -> Result<Session, CriuError>;

    fn dump(&self, options: &CheckpointOptions, hooks: &mut HookSet) -> Result<(), CriuError> {
        let mut session = self.connect(&[])?;
        let result = session.dump(options, hooks);
        session.close();
        result
    }

    fn pre_dump(&self, options: &CheckpointOptions, hooks: &mut HookSet) -> Result<(), CriuError> {
        let mut session = self.connect(&[])?;
        let result = session.pre_dump(options, hooks);
        session.close();
        result
    }

    fn restore(
        &self,
        options: &CheckpointOptions,
        hooks: &mut HookSet,
        extra_files: &[BorrowedFd<'_>],
    ) -> Result<i32, CriuError> {
        let mut session = self.connect(extra_files)?;
        let result = session.restore(options, hooks);
        session.close();
        result
    }

    fn version(&self) -> Result<u32, CriuError> {
        let mut session = self.connect(&[])?;
        let result = session.version();
        session.close();
        result
    }

    /// Fail unless the engine is at least `required` (major*10000+minor*100+sublevel).
    fn check_version(&self, required: u32) -> Result<u32, CriuError> {
        let actual = self.version()?;
        if actual < required {
            return Err(CriuError::VersionTooOld { actual, required });
        }
        Ok(actual)
    }

    fn feature_check(&self, requested: CriuFeatures) -> Result<CriuFeatures, CriuError> {
        let mut session = self.connect(&[])?;
        let result = session.feature_check(requested);
        session.close();
        result
    }
}

/// Launches real `criu swrk` workers.
#[derive(Debug, Clone)]
pub struct Criu {
    binary: PathBuf,
}

impl Criu {
    /// Use an explicit binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Use the configured binary, or search the usual locations.
    pub fn from_config(config: &CriuConfig) -> Result<Self, CriuError> {
        match &config.path {
            Some(path) if path.exists() => Ok(Self::new(path)),
            Some(_) => Err(CriuError::BinaryNotFound),
            None => Self::find().map(Self::new),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Find the CRIU binary.
    fn find() -> Result<PathBuf, CriuError> {
        let candidates = [
            "/usr/sbin/criu",
            "/usr/bin/criu",
            "/sbin/criu",
            "/bin/criu",
            "/usr/local/sbin/criu",
            "/usr/local/bin/criu",
        ];

        for path in candidates {
            let p = PathBuf::from(path);
            if p.exists() {
                return Ok(p);
            }
        }

        if let Some(paths) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&paths) {
                let p = dir.join("criu");
                if p.is_file() {
                    return Ok(p);
                }
            }
        }

        Err(CriuError::BinaryNotFound)
    }
}

impl CriuConnector for Criu {
    fn connect(&self, extra_files: &[BorrowedFd<'_>]) -> Result<Session, CriuError> {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| CriuError::Socket {
            reason: format!("socketpair failed: {}", e),
        })?;

        // Sources in target order: extra files first, then the swrk socket.
        // Built here so the child only rewrites it in place.
        let mut sources: Vec<RawFd> = extra_files.iter().map(|fd| fd.as_raw_fd()).collect();
        sources.push(theirs.as_raw_fd());
        let swrk_fd = FIRST_EXTRA_FD + extra_files.len() as RawFd;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("swrk")
            .arg(swrk_fd.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        // SAFETY: only async-signal-safe libc calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                place_fds(&mut sources, FIRST_EXTRA_FD)
            });
        }

        let worker = cmd.spawn().map_err(|e| CriuError::SpawnFailed {
            reason: format!("{}: {}", self.binary.display(), e),
        })?;

        tracing::debug!(
            criu = %self.binary.display(),
            worker_pid = worker.id(),
            swrk_fd = swrk_fd,
            extra_files = extra_files.len(),
            "Spawned CRIU worker"
        );

        // The worker holds its own copy now.
        drop(theirs);
        Ok(Session::new(ours, Some(worker)))
    }
}

/// Move `fds` onto `base..base+n` in the child, clearing close-on-exec.
///
/// Sources already sitting inside the target range at the wrong slot are
/// first duplicated above it so a later dup2 cannot clobber them. `fds` is
/// rewritten in place; nothing here allocates, so it is safe after fork.
unsafe fn place_fds(fds: &mut [RawFd], base: RawFd) -> std::io::Result<()> {
    let n = fds.len() as RawFd;
    let mut next_free = base + n;

    for (i, fd) in fds.iter_mut().enumerate() {
        let target = base + i as RawFd;
        if *fd >= base && *fd < base + n && *fd != target {
            let moved = libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, next_free);
            if moved < 0 {
                return Err(std::io::Error::last_os_error());
            }
            *fd = moved;
            next_free = moved + 1;
        }
    }

    for (i, &fd) in fds.iter().enumerate() {
        let target = base + i as RawFd;
        if fd == target {
            if libc::fcntl(target, libc::F_SETFD, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
        } else if libc::dup2(fd, target) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_configured_binary() {
        let config = CriuConfig {
            path: Some(PathBuf::from("/nonexistent/criu")),
            log_level: 4,
        };
        assert!(matches!(
            Criu::from_config(&config),
            Err(CriuError::BinaryNotFound)
        ));
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let criu = Criu::new("/nonexistent/criu");
        assert!(matches!(
            criu.connect(&[]),
            Err(CriuError::SpawnFailed { .. })
        ));
    }

    #[test]
    fn test_place_fds_moves_sources_out_of_the_way() {
        use std::io::Read;
        use nix::fcntl::OFlag;
        use nix::unistd::pipe2;

        let (r1, w1) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (r2, w2) = pipe2(OFlag::O_CLOEXEC).unwrap();
        // The second source already occupies the first target slot.
        let base = w2.as_raw_fd();
        let mut plan = [w1.as_raw_fd(), w2.as_raw_fd()];

        let script = format!(
            "echo one > /proc/self/fd/{}; echo two > /proc/self/fd/{}",
            base,
            base + 1
        );
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", &script]);
        unsafe {
            cmd.pre_exec(move || place_fds(&mut plan, base));
        }
        let mut child = cmd.spawn().unwrap();
        drop(w1);
        drop(w2);
        assert!(child.wait().unwrap().success());

        let mut one = String::new();
        std::fs::File::from(r1).read_to_string(&mut one).unwrap();
        let mut two = String::new();
        std::fs::File::from(r2).read_to_string(&mut two).unwrap();
        assert_eq!(one, "one\n");
        assert_eq!(two, "two\n");
    }

    #[test]
    fn test_worker_sees_socket_after_extra_files() {
        use std::io::Read;
        use std::os::fd::AsFd;

        // A stand-in worker that reports which descriptors it was given.
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("fake-criu");
        let report = dir.path().join("report");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$1 $2\" > {}\nls /proc/self/fd >> {}\n",
                report.display(),
                report.display()
            ),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let log = std::fs::File::create(dir.path().join("out.log")).unwrap();
        let session = Criu::new(&script).connect(&[log.as_fd()]).unwrap();
        session.close();

        let mut text = String::new();
        std::fs::File::open(&report)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("swrk 4"));
        let fds: Vec<&str> = lines.collect();
        assert!(fds.contains(&"3"));
        assert!(fds.contains(&"4"));
    }
}
