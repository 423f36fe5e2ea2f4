// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Validated newtypes shared across the engine.
//!
//! Identifiers are checked once at construction so that the pipelines can
//! pass them around without re-validating.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Maximum job id length. Job ids end up in directory names.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Validated job identifier.
/// Must be non-empty, at most 128 characters, and made of alphanumerics,
/// dashes, underscores, or dots. Must not start with a dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Create a new JobId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "job_id",
                value: id,
                reason: "Job ID cannot be empty".to_string(),
            });
        }

        if id.len() > MAX_JOB_ID_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "job_id",
                value: id,
                reason: format!("Job ID exceeds {} characters", MAX_JOB_ID_LEN),
            });
        }

        if id.starts_with('.') {
            return Err(HardValidationError::InvalidFieldValue {
                field: "job_id",
                value: id,
                reason: "Job ID cannot start with '.'".to_string(),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "job_id",
                value: id,
                reason: "Job ID must contain only alphanumeric characters, dashes, underscores, or dots"
                    .to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for JobId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for JobId {
    type Error = HardValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Validated process ID.
/// Must be positive (non-zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ProcessId(u32);

impl ProcessId {
    /// Create a new ProcessId with validation.
    pub fn new(pid: u32) -> Result<Self, HardValidationError> {
        if pid == 0 || pid > i32::MAX as u32 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "process_id",
                value: pid.to_string(),
                reason: "Process ID must be between 1 and i32::MAX".to_string(),
            });
        }
        Ok(Self(pid))
    }

    /// Get the inner PID value.
    pub fn value(&self) -> u32 {
        self.0
    }

    /// PID as the signed type used by nix and the CRIU wire format.
    pub fn as_nix(&self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.0 as i32)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u32> for ProcessId {
    type Error = HardValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<i32> for ProcessId {
    type Error = HardValidationError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        if value <= 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "process_id",
                value: value.to_string(),
                reason: "Process ID must be positive".to_string(),
            });
        }
        Self::new(value as u32)
    }
}

impl From<ProcessId> for u32 {
    fn from(pid: ProcessId) -> Self {
        pid.0
    }
}

/// Owning user, group, and supplementary groups of a process.
/// Sidecars and restored outputs are created under these credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32, groups: Vec<u32>) -> Self {
        Self { uid, gid, groups }
    }

    /// Credentials of the calling process.
    pub fn current() -> Self {
        let groups = nix::unistd::getgroups()
            .map(|groups| groups.into_iter().map(|g| g.as_raw()).collect())
            .unwrap_or_default();
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            groups,
        }
    }

    /// Start the child of `cmd` in a new session under these credentials.
    /// The identity switch is skipped when it would be a no-op.
    pub(crate) fn apply_to(&self, cmd: &mut tokio::process::Command) {
        let current = Self::current();
        let switch = current.uid != self.uid || current.gid != self.gid;
        let uid = self.uid;
        let gid = self.gid;
        let groups: Vec<libc::gid_t> = self.groups.clone();

        // SAFETY: only async-signal-safe libc calls between fork and exec.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if switch
                    && (libc::setgroups(groups.len(), groups.as_ptr()) < 0
                        || libc::setgid(gid) < 0
                        || libc::setuid(uid) < 0)
                {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_valid() {
        assert!(JobId::new("job1").is_ok());
        assert!(JobId::new("cnqk0v3pp9rs73b5e0p0").is_ok());
        assert!(JobId::new("my-job_2.restored").is_ok());
    }

    #[test]
    fn test_job_id_invalid() {
        assert!(JobId::new("").is_err());
        assert!(JobId::new("a".repeat(MAX_JOB_ID_LEN + 1)).is_err());
        assert!(JobId::new("../escape").is_err());
        assert!(JobId::new("job/1").is_err());
        assert!(JobId::new("job 1").is_err());
    }

    #[test]
    fn test_job_id_serde_validates() {
        let id: JobId = serde_json::from_str("\"job1\"").unwrap();
        assert_eq!(id.as_str(), "job1");
        assert!(serde_json::from_str::<JobId>("\"bad/id\"").is_err());
    }

    #[test]
    fn test_process_id_valid() {
        assert!(ProcessId::new(1).is_ok());
        assert!(ProcessId::new(12345).is_ok());
        assert_eq!(ProcessId::try_from(42i32).unwrap().value(), 42);
    }

    #[test]
    fn test_process_id_invalid() {
        assert!(ProcessId::new(0).is_err());
        assert!(ProcessId::try_from(-1i32).is_err());
        assert!(serde_json::from_str::<ProcessId>("0").is_err());
    }
}
