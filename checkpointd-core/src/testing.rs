// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Test doubles shared by the pipeline and job tests.

use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::criu::session::tests::{pair, Peer};
use crate::criu::{CriuConnector, Session};
use crate::error::{CriuError, EngineResult};
use crate::procinfo::ProcessInspector;
use crate::state::{OpenFile, ProcessInfo, StreamRole};
use crate::types::{Credentials, ProcessId};

/// Connector whose peer answers every session with the given script.
pub(crate) struct ScriptedCriu {
    script: Arc<dyn Fn(Peer) + Send + Sync>,
    pub(crate) connects: AtomicUsize,
    /// Number of extra files passed on the last connect.
    pub(crate) extra_files: AtomicUsize,
}

impl ScriptedCriu {
    pub(crate) fn new(script: impl Fn(Peer) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Arc::new(script),
            connects: AtomicUsize::new(0),
            extra_files: AtomicUsize::new(0),
        })
    }
}

impl CriuConnector for ScriptedCriu {
    fn connect(&self, extra_files: &[BorrowedFd<'_>]) -> Result<Session, CriuError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.extra_files.store(extra_files.len(), Ordering::SeqCst);
        let (session, peer) = pair();
        let script = Arc::clone(&self.script);
        std::thread::spawn(move || script(peer));
        Ok(session)
    }
}

/// Inspector reporting fixed facts and the caller's own credentials.
pub(crate) struct FixedInspector {
    pub(crate) info: ProcessInfo,
    pub(crate) alive: bool,
}

impl ProcessInspector for FixedInspector {
    fn credentials(&self, _pid: ProcessId) -> EngineResult<Credentials> {
        Ok(Credentials::current())
    }

    fn process_info(&self, _pid: ProcessId) -> EngineResult<ProcessInfo> {
        Ok(self.info.clone())
    }

    fn is_alive(&self, _pid: ProcessId) -> bool {
        self.alive
    }
}

/// A process writing stdout and stderr to files, with one unrelated fd.
pub(crate) fn stdio_inspector() -> Arc<FixedInspector> {
    let file = |fd: i32, path: &str| OpenFile {
        fd,
        path: path.to_string(),
        mode: "0644".to_string(),
        stream: StreamRole::from_fd(fd),
    };
    Arc::new(FixedInspector {
        info: ProcessInfo {
            open_fds: vec![
                file(1, "/tmp/out.log"),
                file(2, "/tmp/err.log"),
                file(5, "/etc/hosts"),
            ],
            is_running: true,
            ..Default::default()
        },
        alive: true,
    })
}
