// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Protocol-facing options for a single CRIU request.
//!
//! Built fresh per operation from process facts and caller overrides,
//! then lowered into `criu_opts`. Never persisted.

use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::rpc;

/// How CRIU treats cgroups of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupMode {
    Ignore,
    None,
    Props,
    Soft,
    Full,
    Strict,
    Default,
}

impl From<CgroupMode> for rpc::Criu_cg_mode {
    fn from(mode: CgroupMode) -> Self {
        match mode {
            CgroupMode::Ignore => rpc::Criu_cg_mode::IGNORE,
            CgroupMode::None => rpc::Criu_cg_mode::CG_NONE,
            CgroupMode::Props => rpc::Criu_cg_mode::PROPS,
            CgroupMode::Soft => rpc::Criu_cg_mode::SOFT,
            CgroupMode::Full => rpc::Criu_cg_mode::FULL,
            CgroupMode::Strict => rpc::Criu_cg_mode::STRICT,
            CgroupMode::Default => rpc::Criu_cg_mode::DEFAULT,
        }
    }
}

/// A descriptor the restored process inherits instead of reopening a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritFd {
    /// Recorded path without its leading '/'.
    pub key: String,
    /// Descriptor number inside the CRIU worker.
    pub fd: i32,
}

/// Options bag for DUMP, PRE_DUMP and RESTORE requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointOptions {
    /// Directory holding (or receiving) the images.
    pub images_dir: PathBuf,
    /// Target process for dumps.
    pub pid: Option<i32>,
    pub leave_running: bool,
    pub tcp_established: bool,
    pub tcp_close: bool,
    pub tcp_skip_in_flight: bool,
    pub shell_job: bool,
    pub ext_unix_sk: bool,
    pub file_locks: bool,
    /// Externally managed namespaces and resources, e.g. `net[4026531992]:extNet`.
    pub external: Vec<String>,
    pub stream: bool,
    pub freeze_cgroup: Option<String>,
    pub manage_cgroups_mode: Option<CgroupMode>,
    pub log_file: Option<String>,
    pub log_level: Option<i32>,
    pub ghost_limit: Option<u32>,
    /// Restore as a sibling so the restored tree is our child.
    pub rst_sibling: bool,
    pub orphan_pts_master: bool,
    pub inherit_fds: Vec<InheritFd>,
    pub parent_img: Option<String>,
    pub track_mem: bool,
}

impl CheckpointOptions {
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
            ..Default::default()
        }
    }

    /// Lower into the wire message. `images_dir_fd` must stay open until the
    /// request completes.
    pub(crate) fn to_rpc(&self, images_dir_fd: RawFd, notify_scripts: bool) -> rpc::Criu_opts {
        let mut opts = rpc::Criu_opts::new();
        opts.set_images_dir_fd(images_dir_fd);

        if let Some(pid) = self.pid {
            opts.set_pid(pid);
        }
        if let Some(ref log_file) = self.log_file {
            opts.set_log_file(log_file.clone());
        }
        if let Some(level) = self.log_level {
            opts.set_log_level(level);
        }
        if let Some(limit) = self.ghost_limit {
            opts.set_ghost_limit(limit);
        }
        if let Some(ref cgroup) = self.freeze_cgroup {
            opts.set_freeze_cgroup(cgroup.clone());
        }
        if let Some(mode) = self.manage_cgroups_mode {
            opts.set_manage_cgroups(true);
            opts.set_manage_cgroups_mode(mode.into());
        }
        if let Some(ref parent) = self.parent_img {
            opts.set_parent_img(parent.clone());
        }

        opts.set_leave_running(self.leave_running);
        opts.set_tcp_established(self.tcp_established);
        opts.set_tcp_close(self.tcp_close);
        opts.set_tcp_skip_in_flight(self.tcp_skip_in_flight);
        opts.set_shell_job(self.shell_job);
        opts.set_ext_unix_sk(self.ext_unix_sk);
        opts.set_file_locks(self.file_locks);
        opts.set_rst_sibling(self.rst_sibling);
        opts.set_orphan_pts_master(self.orphan_pts_master);
        opts.set_track_mem(self.track_mem);
        opts.set_notify_scripts(notify_scripts);
        if self.stream {
            opts.set_stream(true);
        }

        opts.external = self.external.clone();
        opts.inherit_fd = self
            .inherit_fds
            .iter()
            .map(|inherit| {
                let mut fd = rpc::Inherit_fd::new();
                fd.set_key(inherit.key.clone());
                fd.set_fd(inherit.fd);
                fd
            })
            .collect();

        opts
    }
}
