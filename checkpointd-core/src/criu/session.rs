// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! One conversation with a CRIU swrk worker.
//!
//! Requests and responses are single protobuf messages, one per
//! SOCK_SEQPACKET datagram. NOTIFY responses are not terminal: the script
//! is dispatched to the hook set, acknowledged, and the loop reads on.

use std::fs::File;
use std::io::IoSliceMut;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::Child;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, send, ControlMessageOwned, MsgFlags};
use protobuf::{Message, MessageField};

use super::hooks::{Dispatch, HookName, HookSet};
use super::options::CheckpointOptions;
use crate::error::CriuError;
use crate::rpc;

/// Receive buffer size. A datagram that fills it is treated as truncated.
pub const RESPONSE_BUFFER_SIZE: usize = 10 * 4096;

/// Attempts for a send interrupted by EAGAIN/EINTR.
const SEND_RETRIES: u32 = 5;
const SEND_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Feature bitmap reported by FEATURE_CHECK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CriuFeatures {
    pub mem_track: bool,
    pub lazy_pages: bool,
    pub pidfd_store: bool,
}

impl CriuFeatures {
    fn to_rpc(self) -> rpc::Criu_features {
        let mut features = rpc::Criu_features::new();
        features.set_mem_track(self.mem_track);
        features.set_lazy_pages(self.lazy_pages);
        features.set_pidfd_store(self.pidfd_store);
        features
    }

    fn from_rpc(features: &rpc::Criu_features) -> Self {
        Self {
            mem_track: features.mem_track(),
            lazy_pages: features.lazy_pages(),
            pidfd_store: features.pidfd_store(),
        }
    }
}

/// Wire name of a request type, for errors and logs.
pub fn request_name(kind: rpc::Criu_req_type) -> &'static str {
    use rpc::Criu_req_type::*;
    match kind {
        EMPTY => "EMPTY",
        DUMP => "DUMP",
        RESTORE => "RESTORE",
        CHECK => "CHECK",
        PRE_DUMP => "PRE_DUMP",
        PAGE_SERVER => "PAGE_SERVER",
        NOTIFY => "NOTIFY",
        CPUINFO_DUMP => "CPUINFO_DUMP",
        CPUINFO_CHECK => "CPUINFO_CHECK",
        FEATURE_CHECK => "FEATURE_CHECK",
        VERSION => "VERSION",
        WAIT_PID => "WAIT_PID",
        PAGE_SERVER_CHLD => "PAGE_SERVER_CHLD",
        SINGLE_PRE_DUMP => "SINGLE_PRE_DUMP",
    }
}

/// Collapse a CRIU version message into one comparable number.
pub fn version_number(version: &rpc::Criu_version) -> u32 {
    let mut number = version.major_number() as u32 * 10_000
        + version.minor_number() as u32 * 100
        + version.sublevel() as u32;

    // Development builds report a git id; they are newer than the release.
    if version.has_gitid() {
        number -= number % 100;
        number += 100;
    }
    number
}

/// An open request/response channel to one CRIU worker.
pub struct Session {
    socket: OwnedFd,
    worker: Option<Child>,
    buffer: Vec<u8>,
}

impl Session {
    /// Wrap our end of the socket pair and the worker holding the other end.
    pub fn new(socket: OwnedFd, worker: Option<Child>) -> Self {
        Self {
            socket,
            worker,
            buffer: vec![0u8; RESPONSE_BUFFER_SIZE],
        }
    }

    /// Pid of the worker process, if this session spawned one.
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.as_ref().map(Child::id)
    }

    /// Send a request and run the notify loop until the terminal response.
    pub fn request(
        &mut self,
        kind: rpc::Criu_req_type,
        opts: Option<rpc::Criu_opts>,
        features: Option<rpc::Criu_features>,
        hooks: &mut HookSet,
    ) -> Result<rpc::Criu_resp, CriuError> {
        let mut req = rpc::Criu_req::new();
        req.set_type(kind);
        if let Some(opts) = opts {
            req.opts = MessageField::some(opts);
        }
        if let Some(features) = features {
            req.features = MessageField::some(features);
        }

        tracing::debug!(request = request_name(kind), "Sending CRIU request");
        self.send(&req)?;

        // A failed hook is acknowledged negatively; CRIU then aborts and the
        // hook's own error is what the caller sees.
        let mut hook_failure: Option<CriuError> = None;

        loop {
            let (resp, fds) = match self.recv() {
                Ok(received) => received,
                Err(e) => return Err(hook_failure.unwrap_or(e)),
            };
            let resp_kind = resp.type_();

            if resp_kind == rpc::Criu_req_type::NOTIFY && resp.success() {
                let script = resp.notify.script().to_string();
                let pid = resp.notify.pid.filter(|pid| *pid > 0);

                let acked = match hooks.dispatch(&script, pid, fds.into_iter().next()) {
                    Ok(Dispatch::Ran) | Ok(Dispatch::Skipped) => true,
                    Err(source) => {
                        tracing::warn!(hook = %script, error = %source, "Hook failed");
                        hook_failure = Some(CriuError::HookFailed {
                            hook: HookName::from_script(&script)
                                .map(|h| h.as_str())
                                .unwrap_or("unknown"),
                            source,
                        });
                        false
                    }
                };

                let mut ack = rpc::Criu_req::new();
                ack.set_type(rpc::Criu_req_type::NOTIFY);
                ack.set_notify_success(acked);
                if let Err(e) = self.send(&ack) {
                    return Err(hook_failure.unwrap_or(e));
                }
                continue;
            }

            if let Some(failure) = hook_failure {
                return Err(failure);
            }

            if !resp.success() {
                return Err(CriuError::OperationFailed {
                    operation: request_name(kind),
                    errno: resp.cr_errno(),
                    message: resp.cr_errmsg().to_string(),
                    log_tail: String::new(),
                });
            }

            if resp_kind != kind {
                return Err(CriuError::UnexpectedResponse {
                    expected: request_name(kind),
                    actual: request_name(resp_kind),
                });
            }

            tracing::debug!(request = request_name(kind), "CRIU request completed");
            return Ok(resp);
        }
    }

    /// Run a request that needs an images directory.
    fn request_in_dir(
        &mut self,
        kind: rpc::Criu_req_type,
        options: &CheckpointOptions,
        hooks: &mut HookSet,
    ) -> Result<rpc::Criu_resp, CriuError> {
        let dir = open_dir(&options.images_dir)?;
        let opts = options.to_rpc(dir.as_raw_fd(), !hooks.is_empty());
        let resp = self.request(kind, Some(opts), None, hooks);
        drop(dir);
        resp
    }

    pub fn dump(
        &mut self,
        options: &CheckpointOptions,
        hooks: &mut HookSet,
    ) -> Result<(), CriuError> {
        self.request_in_dir(rpc::Criu_req_type::DUMP, options, hooks)
            .map(|_| ())
    }

    pub fn pre_dump(
        &mut self,
        options: &CheckpointOptions,
        hooks: &mut HookSet,
    ) -> Result<(), CriuError> {
        self.request_in_dir(rpc::Criu_req_type::PRE_DUMP, options, hooks)
            .map(|_| ())
    }

    /// Restore and return the pid of the restored root task.
    pub fn restore(
        &mut self,
        options: &CheckpointOptions,
        hooks: &mut HookSet,
    ) -> Result<i32, CriuError> {
        let resp = self.request_in_dir(rpc::Criu_req_type::RESTORE, options, hooks)?;
        match resp.restore.as_ref() {
            Some(restore) if restore.pid() > 0 => Ok(restore.pid()),
            _ => Err(CriuError::MissingField {
                operation: "RESTORE",
                field: "restore.pid",
            }),
        }
    }

    pub fn version(&mut self) -> Result<u32, CriuError> {
        let resp = self.request(rpc::Criu_req_type::VERSION, None, None, &mut HookSet::new())?;
        match resp.version.as_ref() {
            Some(version) => Ok(version_number(version)),
            None => Err(CriuError::MissingField {
                operation: "VERSION",
                field: "version",
            }),
        }
    }

    pub fn feature_check(&mut self, requested: CriuFeatures) -> Result<CriuFeatures, CriuError> {
        let resp = self.request(
            rpc::Criu_req_type::FEATURE_CHECK,
            None,
            Some(requested.to_rpc()),
            &mut HookSet::new(),
        )?;
        match resp.features.as_ref() {
            Some(features) => Ok(CriuFeatures::from_rpc(features)),
            None => Err(CriuError::MissingField {
                operation: "FEATURE_CHECK",
                field: "features",
            }),
        }
    }

    /// Close the socket and reap the worker. Wait errors are only logged.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Closing our end makes the worker leave its request loop.
        let _ = nix::sys::socket::shutdown(
            self.socket.as_raw_fd(),
            nix::sys::socket::Shutdown::Both,
        );
        if let Some(mut worker) = self.worker.take() {
            match worker.wait() {
                Ok(status) => tracing::debug!(status = %status, "CRIU worker exited"),
                Err(e) => tracing::warn!(error = %e, "Failed to wait for CRIU worker"),
            }
        }
    }

    fn send(&self, req: &rpc::Criu_req) -> Result<(), CriuError> {
        let bytes = req.write_to_bytes().map_err(|e| CriuError::Encode {
            reason: e.to_string(),
        })?;

        let mut attempt = 0;
        loop {
            match send(self.socket.as_raw_fd(), &bytes, MsgFlags::empty()) {
                Ok(_) => return Ok(()),
                Err(Errno::EAGAIN) | Err(Errno::EINTR) if attempt + 1 < SEND_RETRIES => {
                    attempt += 1;
                    thread::sleep(SEND_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(CriuError::Socket {
                        reason: format!("send failed: {}", e),
                    })
                }
            }
        }
    }

    fn recv(&mut self) -> Result<(rpc::Criu_resp, Vec<OwnedFd>), CriuError> {
        let fd = self.socket.as_fd().as_raw_fd();
        let mut cmsg_space = nix::cmsg_space!([RawFd; 4]);

        let (n, fds) = {
            let mut iov = [IoSliceMut::new(&mut self.buffer)];
            let msg = recvmsg::<()>(
                fd,
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )
            .map_err(|e| CriuError::Socket {
                reason: format!("recvmsg failed: {}", e),
            })?;

            let mut fds = Vec::new();
            let cmsgs = msg.cmsgs().map_err(|e| CriuError::Socket {
                reason: format!("control message truncated: {}", e),
            })?;
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    // SAFETY: SCM_RIGHTS installs fresh descriptors owned by us.
                    fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
            }
            (msg.bytes, fds)
        };

        if n == 0 {
            return Err(CriuError::UnexpectedEof);
        }
        if n == self.buffer.len() {
            return Err(CriuError::BufferTooSmall {
                size: self.buffer.len(),
            });
        }

        let resp = rpc::Criu_resp::parse_from_bytes(&self.buffer[..n]).map_err(|e| {
            CriuError::Decode {
                reason: e.to_string(),
            }
        })?;
        Ok((resp, fds))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_dir(path: &Path) -> Result<File, CriuError> {
    File::open(path).map_err(|e| CriuError::Socket {
        reason: format!("cannot open images dir {}: {}", path.display(), e),
    })
}
