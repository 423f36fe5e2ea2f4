// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Image streamer subprocess and its file handshake.
//!
//! In streaming mode CRIU images never touch the checkpoint directory as
//! plain files. A capture (dump) or serve (restore) streamer owns the
//! directory and exposes a unix socket in it; metadata files are moved
//! through that socket one pipe at a time.

use std::fs::File;
use std::io::{IoSlice, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use protobuf::Message;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::config::StreamerConfig;
use crate::error::StreamerError;
use crate::img_streamer::Img_streamer_request_entry;

pub const CAPTURE_SOCKET_NAME: &str = "ced-capture.sock";
pub const SERVE_SOCKET_NAME: &str = "ced-serve.sock";

/// Direction of a streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerMode {
    /// Receives images from a dump.
    Capture,
    /// Feeds images to a restore.
    Serve,
}

impl StreamerMode {
    pub const fn as_arg(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Serve => "serve",
        }
    }

    pub const fn socket_name(&self) -> &'static str {
        match self {
            Self::Capture => CAPTURE_SOCKET_NAME,
            Self::Serve => SERVE_SOCKET_NAME,
        }
    }
}

/// A running streamer bound to one checkpoint directory.
#[derive(Debug)]
pub struct ImageStreamer {
    child: Child,
    dir: PathBuf,
    mode: StreamerMode,
}

impl ImageStreamer {
    /// Start the streamer and wait until it writes its first line to stderr.
    pub async fn spawn(
        config: &StreamerConfig,
        dir: &Path,
        mode: StreamerMode,
        gpu: bool,
    ) -> Result<Self, StreamerError> {
        let mut cmd = Command::new(&config.path);
        cmd.arg("--dir")
            .arg(dir)
            .arg("--num-pipes")
            .arg(config.num_pipes.to_string());
        if gpu {
            cmd.arg("--gpu");
        }
        cmd.arg(mode.as_arg())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // SAFETY: prctl is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| StreamerError::SpawnFailed {
            reason: format!("{}: {}", config.path.display(), e),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| StreamerError::SpawnFailed {
            reason: "stderr not captured".to_string(),
        })?;

        tracing::debug!(
            dir = %dir.display(),
            mode = mode.as_arg(),
            pid = child.id(),
            "Started image streamer"
        );

        let mut lines = BufReader::new(stderr).lines();
        loop {
            match tokio::time::timeout(config.ready_poll, lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    tracing::debug!(dir = %dir.display(), "streamer: {}", line);
                    break;
                }
                Ok(Ok(None)) | Ok(Err(_)) => {
                    let _ = child.kill().await;
                    return Err(StreamerError::ExitedEarly);
                }
                Err(_) => {
                    if let Ok(Some(_)) = child.try_wait() {
                        return Err(StreamerError::ExitedEarly);
                    }
                }
            }
        }

        let log_dir = dir.display().to_string();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(dir = %log_dir, "streamer: {}", line);
            }
        });

        Ok(Self {
            child,
            dir: dir.to_path_buf(),
            mode,
        })
    }

    pub fn mode(&self) -> StreamerMode {
        self.mode
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Socket the handshake connects to.
    pub fn socket_path(&self) -> PathBuf {
        self.dir.join(self.mode.socket_name())
    }

    /// Wait for the streamer to finish moving images.
    pub async fn wait(mut self) -> Result<(), StreamerError> {
        let status = self.child.wait().await.map_err(|e| StreamerError::Failed {
            status: e.to_string(),
        })?;
        tracing::debug!(dir = %self.dir.display(), status = %status, "Image streamer exited");
        if !status.success() {
            return Err(StreamerError::Failed {
                status: status.to_string(),
            });
        }
        Ok(())
    }

    /// Terminate the streamer.
    pub async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::debug!(dir = %self.dir.display(), error = %e, "Image streamer already gone");
        }
    }
}

/// Open `filename` on the streamer and return our end of its pipe.
///
/// The request is a little-endian length followed by the encoded entry; the
/// streamer's end of a fresh pipe follows as SCM_RIGHTS.
fn open_file(socket: &Path, filename: &str, mode: StreamerMode) -> Result<OwnedFd, StreamerError> {
    let handshake = |reason: String| StreamerError::Handshake {
        socket: socket.to_path_buf(),
        reason,
    };

    let mut conn = UnixStream::connect(socket).map_err(|e| handshake(format!("connect: {}", e)))?;

    let mut entry = Img_streamer_request_entry::new();
    entry.set_filename(filename.to_string());
    let body = entry
        .write_to_bytes()
        .map_err(|e| handshake(format!("encode request: {}", e)))?;

    conn.write_all(&(body.len() as u32).to_le_bytes())
        .and_then(|_| conn.write_all(&body))
        .map_err(|e| handshake(format!("write request for {}: {}", filename, e)))?;

    let (read_end, write_end) =
        nix::unistd::pipe().map_err(|e| handshake(format!("pipe: {}", e)))?;
    let (theirs, ours) = match mode {
        StreamerMode::Capture => (read_end, write_end),
        StreamerMode::Serve => (write_end, read_end),
    };

    let fds = [theirs.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    // Stream sockets drop ancillary data sent without payload.
    let iov = [IoSlice::new(&[0u8])];
    sendmsg::<()>(conn.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(|e| handshake(format!("send descriptor: {}", e)))?;

    Ok(ours)
}

/// Write a whole file through a capture streamer.
pub fn send_file(socket: &Path, filename: &str, data: &[u8]) -> Result<(), StreamerError> {
    let fd = open_file(socket, filename, StreamerMode::Capture)?;
    let mut pipe = File::from(fd);
    pipe.write_all(data).map_err(|e| StreamerError::Handshake {
        socket: socket.to_path_buf(),
        reason: format!("write {}: {}", filename, e),
    })
}

/// Read a whole file from a serve streamer.
pub fn receive_file(socket: &Path, filename: &str) -> Result<Vec<u8>, StreamerError> {
    let fd = open_file(socket, filename, StreamerMode::Serve)?;
    let mut pipe = File::from(fd);
    let mut data = Vec::new();
    pipe.read_to_end(&mut data)
        .map_err(|e| StreamerError::Handshake {
            socket: socket.to_path_buf(),
            reason: format!("read {}: {}", filename, e),
        })?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::IoSliceMut;
    use std::os::fd::FromRawFd;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixListener;
    use std::time::Duration;

    use nix::sys::socket::{recvmsg, ControlMessageOwned};
    use tempfile::TempDir;

    fn config(path: PathBuf) -> StreamerConfig {
        StreamerConfig {
            path,
            ready_poll: Duration::from_millis(2),
            num_pipes: 4,
        }
    }

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("streamer.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Accept one handshake and return the filename and the passed descriptor.
    fn accept_one(listener: &UnixListener) -> (String, OwnedFd) {
        let (mut conn, _) = listener.accept().unwrap();
        let mut len = [0u8; 4];
        conn.read_exact(&mut len).unwrap();
        let mut body = vec![0u8; u32::from_le_bytes(len) as usize];
        conn.read_exact(&mut body).unwrap();
        let entry = Img_streamer_request_entry::parse_from_bytes(&body).unwrap();

        let mut space = nix::cmsg_space!([std::os::fd::RawFd; 1]);
        let mut buf = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<()>(
            conn.as_raw_fd(),
            &mut iov,
            Some(&mut space),
            MsgFlags::empty(),
        )
        .unwrap();
        let fd = msg
            .cmsgs()
            .unwrap()
            .find_map(|c| match c {
                ControlMessageOwned::ScmRights(fds) => fds.first().copied(),
                _ => None,
            })
            .unwrap();
        (entry.filename().to_string(), unsafe { OwnedFd::from_raw_fd(fd) })
    }

    #[test]
    fn test_send_file_through_capture_socket() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join(CAPTURE_SOCKET_NAME);
        let listener = UnixListener::bind(&socket).unwrap();

        let server = std::thread::spawn(move || {
            let (name, fd) = accept_one(&listener);
            let mut data = String::new();
            File::from(fd).read_to_string(&mut data).unwrap();
            (name, data)
        });

        send_file(&socket, "checkpoint_state.json", b"{\"pid\":42}").unwrap();
        let (name, data) = server.join().unwrap();
        assert_eq!(name, "checkpoint_state.json");
        assert_eq!(data, "{\"pid\":42}");
    }

    #[test]
    fn test_receive_file_through_serve_socket() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join(SERVE_SOCKET_NAME);
        let listener = UnixListener::bind(&socket).unwrap();

        let server = std::thread::spawn(move || {
            let (name, fd) = accept_one(&listener);
            File::from(fd).write_all(b"served").unwrap();
            name
        });

        let data = receive_file(&socket, "descriptors.json").unwrap();
        assert_eq!(server.join().unwrap(), "descriptors.json");
        assert_eq!(data, b"served");
    }

    #[test]
    fn test_handshake_without_streamer_fails() {
        let dir = TempDir::new().unwrap();
        let err = send_file(&dir.path().join(CAPTURE_SOCKET_NAME), "x", b"").unwrap_err();
        assert!(matches!(err, StreamerError::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_spawn_waits_for_stderr_and_reports_exit() {
        let dir = TempDir::new().unwrap();
        let args = dir.path().join("args");
        let path = script(
            &dir,
            &format!("echo \"$@\" > {}\necho listening >&2\nsleep 0.1", args.display()),
        );

        let streamer = ImageStreamer::spawn(&config(path), dir.path(), StreamerMode::Capture, true)
            .await
            .unwrap();
        assert_eq!(streamer.socket_path(), dir.path().join(CAPTURE_SOCKET_NAME));
        streamer.wait().await.unwrap();

        let recorded = std::fs::read_to_string(&args).unwrap();
        assert_eq!(
            recorded.trim(),
            format!("--dir {} --num-pipes 4 --gpu capture", dir.path().display())
        );
    }

    #[tokio::test]
    async fn test_silent_exit_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "exit 1");
        let err = ImageStreamer::spawn(&config(path), dir.path(), StreamerMode::Serve, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StreamerError::ExitedEarly));
    }

    #[tokio::test]
    async fn test_failing_streamer_reports_status() {
        let dir = TempDir::new().unwrap();
        let path = script(&dir, "echo up >&2\nexit 3");
        let streamer = ImageStreamer::spawn(&config(path), dir.path(), StreamerMode::Serve, false)
            .await
            .unwrap();
        assert!(matches!(
            streamer.wait().await,
            Err(StreamerError::Failed { .. })
        ));
    }
}
