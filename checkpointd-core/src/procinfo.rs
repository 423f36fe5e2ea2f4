// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Ambient process facts read from `/proc`.
//!
//! The dump pipeline snapshots open files, sockets and credentials of the
//! target before calling CRIU; the job watchers use liveness polling for
//! processes that are not our children.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;

use procfs::process::{FDTarget, ProcState, Process};

use crate::error::{EngineError, EngineResult};
use crate::state::{Addr, Connection, OpenFile, ProcessInfo, StreamRole};
use crate::state::{AF_INET, AF_INET6, AF_UNIX, SOCK_DGRAM, SOCK_STREAM};
use crate::types::{Credentials, ProcessId};

/// Source of process facts. Swappable so pipelines can run against
/// synthetic processes.
pub trait ProcessInspector: Send + Sync {
    /// Owning uid, gid and supplementary groups.
    fn credentials(&self, pid: ProcessId) -> EngineResult<Credentials>;

    /// Open files, connections, working directory and status.
    fn process_info(&self, pid: ProcessId) -> EngineResult<ProcessInfo>;

    /// False once the process is gone or a zombie.
    fn is_alive(&self, pid: ProcessId) -> bool;
}

/// Inspector backed by procfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsInspector;

impl ProcfsInspector {
    fn open(pid: ProcessId) -> EngineResult<Process> {
        Process::new(pid.value() as i32).map_err(|e| EngineError::Syscall {
            syscall: "open /proc/<pid>",
            message: format!("pid {}: {}", pid, e),
        })
    }
}

fn proc_err(what: &'static str, pid: ProcessId, e: procfs::ProcError) -> EngineError {
    EngineError::Syscall {
        syscall: what,
        message: format!("pid {}: {}", pid, e),
    }
}

/// Parse the `Groups:` line of `/proc/<pid>/status`.
fn parse_groups(status: &str) -> Vec<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Groups:"))
        .map(|rest| {
            rest.split_whitespace()
                .filter_map(|g| g.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

fn addr(socket: std::net::SocketAddr) -> Addr {
    Addr {
        ip: socket.ip().to_string(),
        port: socket.port() as u32,
    }
}

impl ProcessInspector for ProcfsInspector {
    fn credentials(&self, pid: ProcessId) -> EngineResult<Credentials> {
        let process = Self::open(pid)?;
        let status = process
            .status()
            .map_err(|e| proc_err("read /proc/<pid>/status", pid, e))?;

        let raw = std::fs::read_to_string(format!("/proc/{}/status", pid))
            .map_err(|e| EngineError::io("reading process status", e))?;

        Ok(Credentials::new(status.ruid, status.rgid, parse_groups(&raw)))
    }

    fn process_info(&self, pid: ProcessId) -> EngineResult<ProcessInfo> {
        let process = Self::open(pid)?;

        // Socket inode -> fd, resolved against the per-namespace tables below.
        let mut sockets: HashMap<u64, i32> = HashMap::new();
        let mut open_fds = Vec::new();

        let fds = process
            .fd()
            .map_err(|e| proc_err("read /proc/<pid>/fd", pid, e))?;
        for info in fds.flatten() {
            match info.target {
                FDTarget::Path(path) => {
                    let mode = std::fs::metadata(&path)
                        .map(|m| format!("{:04o}", m.permissions().mode() & 0o7777))
                        .unwrap_or_default();
                    open_fds.push(OpenFile {
                        fd: info.fd,
                        path: path.display().to_string(),
                        mode,
                        stream: StreamRole::from_fd(info.fd),
                    });
                }
                FDTarget::Socket(inode) => {
                    sockets.insert(inode, info.fd);
                }
                FDTarget::Pipe(inode) => {
                    open_fds.push(OpenFile {
                        fd: info.fd,
                        path: format!("pipe:[{}]", inode),
                        mode: String::new(),
                        stream: StreamRole::from_fd(info.fd),
                    });
                }
                _ => {}
            }
        }

        let mut open_connections = Vec::new();
        let inet_tables = [
            (AF_INET, process.tcp()),
            (AF_INET6, process.tcp6()),
        ];
        for (family, table) in inet_tables {
            for entry in table.unwrap_or_default() {
                if let Some(&fd) = sockets.get(&entry.inode) {
                    open_connections.push(Connection {
                        fd,
                        family,
                        kind: SOCK_STREAM,
                        laddr: addr(entry.local_address),
                        raddr: addr(entry.remote_address),
                        status: format!("{:?}", entry.state).to_uppercase(),
                    });
                }
            }
        }

        let udp_tables = [(AF_INET, process.udp()), (AF_INET6, process.udp6())];
        for (family, table) in udp_tables {
            for entry in table.unwrap_or_default() {
                if let Some(&fd) = sockets.get(&entry.inode) {
                    open_connections.push(Connection {
                        fd,
                        family,
                        kind: SOCK_DGRAM,
                        laddr: addr(entry.local_address),
                        raddr: addr(entry.remote_address),
                        status: "NONE".to_string(),
                    });
                }
            }
        }

        for entry in process.unix().unwrap_or_default() {
            if let Some(&fd) = sockets.get(&entry.inode) {
                open_connections.push(Connection {
                    fd,
                    family: AF_UNIX,
                    kind: entry.socket_type as u32,
                    laddr: Addr {
                        ip: entry
                            .path
                            .map(|p| p.display().to_string())
                            .unwrap_or_default(),
                        port: 0,
                    },
                    raddr: Addr::default(),
                    status: format!("{:?}", entry.state).to_uppercase(),
                });
            }
        }

        let working_dir = process
            .cwd()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let status = process
            .stat()
            .and_then(|s| s.state())
            .map(|s| format!("{:?}", s).to_lowercase())
            .unwrap_or_default();

        open_fds.sort_by_key(|f| f.fd);
        open_connections.sort_by_key(|c| c.fd);

        Ok(ProcessInfo {
            open_fds,
            open_connections,
            working_dir,
            is_running: self.is_alive(pid),
            status,
        })
    }

    fn is_alive(&self, pid: ProcessId) -> bool {
        let Ok(process) = Process::new(pid.value() as i32) else {
            return false;
        };
        match process.stat().and_then(|s| s.state()) {
            Ok(ProcState::Zombie) | Ok(ProcState::Dead) => false,
            Ok(_) => true,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_groups() {
        let status = "Name:\tbash\nUid:\t1000\t1000\t1000\t1000\nGroups:\t4 24 27 1000 \nVmPeak:\t1 kB\n";
        assert_eq!(parse_groups(status), vec![4, 24, 27, 1000]);
        assert!(parse_groups("Groups:\t\n").is_empty());
        assert!(parse_groups("Name:\tinit\n").is_empty());
    }

    #[test]
    fn test_inspect_self() {
        let pid = ProcessId::new(std::process::id()).unwrap();
        let inspector = ProcfsInspector;

        let creds = inspector.credentials(pid).unwrap();
        assert_eq!(creds.uid, nix::unistd::getuid().as_raw());

        let info = inspector.process_info(pid).unwrap();
        assert!(info.is_running);
        assert!(!info.working_dir.is_empty());
        assert!(inspector.is_alive(pid));
    }

    #[test]
    fn test_inspect_listening_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port() as u32;
        let pid = ProcessId::new(std::process::id()).unwrap();

        let info = ProcfsInspector.process_info(pid).unwrap();
        assert!(info.has_tcp());
        assert!(info
            .open_connections
            .iter()
            .any(|c| c.laddr.port == port && c.status == "LISTEN"));
    }

    #[test]
    fn test_reaped_process_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = ProcessId::new(child.id()).unwrap();
        child.wait().unwrap();
        assert!(!ProcfsInspector.is_alive(pid));
    }
}
