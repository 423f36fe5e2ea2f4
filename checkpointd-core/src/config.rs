// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Every section is optional; missing fields take their defaults. Invalid
//! values result in a HardValidationError before the engine is built.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{EngineError, EngineResult, HardValidationError};

/// Raw CRIU section as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawCriuConfig {
    #[serde(default)]
    path: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: i32,
}

fn default_log_level() -> i32 {
    4
}

impl Default for RawCriuConfig {
    fn default() -> Self {
        Self {
            path: None,
            log_level: default_log_level(),
        }
    }
}

/// Raw dump section.
#[derive(Debug, Deserialize)]
struct RawDumpConfig {
    #[serde(default)]
    dir: Option<String>,
    #[serde(default)]
    leave_running: bool,
    #[serde(default = "default_ghost_limit")]
    ghost_limit: u32,
}

fn default_ghost_limit() -> u32 {
    10_000_000
}

impl Default for RawDumpConfig {
    fn default() -> Self {
        Self {
            dir: None,
            leave_running: false,
            ghost_limit: default_ghost_limit(),
        }
    }
}

/// Raw restore section.
#[derive(Debug, Deserialize)]
struct RawRestoreConfig {
    #[serde(default = "default_scratch_root")]
    scratch_root: String,
    #[serde(default = "default_output_log_dir")]
    output_log_dir: String,
}

fn default_scratch_root() -> String {
    "/tmp/checkpointd_restore".to_string()
}

fn default_output_log_dir() -> String {
    "/var/log".to_string()
}

impl Default for RawRestoreConfig {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            output_log_dir: default_output_log_dir(),
        }
    }
}

/// Raw GPU section.
#[derive(Debug, Deserialize)]
struct RawGpuConfig {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_sidecar_path")]
    sidecar_path: String,
    #[serde(default = "default_shared_lib_path")]
    shared_lib_path: String,
    #[serde(default = "default_startup_timeout_ms")]
    startup_timeout_ms: u64,
}

fn default_sidecar_path() -> String {
    "/usr/local/bin/gpu-controller".to_string()
}

fn default_shared_lib_path() -> String {
    "/usr/local/lib/libgpu-intercept.so".to_string()
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

impl Default for RawGpuConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sidecar_path: default_sidecar_path(),
            shared_lib_path: default_shared_lib_path(),
            startup_timeout_ms: default_startup_timeout_ms(),
        }
    }
}

/// Raw image streamer section.
#[derive(Debug, Deserialize)]
struct RawStreamerConfig {
    #[serde(default = "default_streamer_path")]
    path: String,
    #[serde(default = "default_ready_poll_ms")]
    ready_poll_ms: u64,
    #[serde(default = "default_num_pipes")]
    num_pipes: u32,
}

fn default_streamer_path() -> String {
    "/usr/local/bin/image-streamer".to_string()
}

fn default_ready_poll_ms() -> u64 {
    2
}

fn default_num_pipes() -> u32 {
    4
}

impl Default for RawStreamerConfig {
    fn default() -> Self {
        Self {
            path: default_streamer_path(),
            ready_poll_ms: default_ready_poll_ms(),
            num_pipes: default_num_pipes(),
        }
    }
}

/// Raw job bookkeeping section.
#[derive(Debug, Default, Deserialize)]
struct RawJobsConfig {
    #[serde(default)]
    store_dir: Option<String>,
}

/// Raw root configuration file.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    criu: RawCriuConfig,
    #[serde(default)]
    dump: RawDumpConfig,
    #[serde(default)]
    restore: RawRestoreConfig,
    #[serde(default)]
    gpu: RawGpuConfig,
    #[serde(default)]
    streamer: RawStreamerConfig,
    #[serde(default)]
    jobs: RawJobsConfig,
}

/// Validated CRIU configuration.
#[derive(Debug, Clone)]
pub struct CriuConfig {
    /// Explicit binary; searched in standard locations when absent.
    pub path: Option<PathBuf>,
    pub log_level: i32,
}

/// Validated dump configuration.
#[derive(Debug, Clone)]
pub struct DumpConfig {
    /// Used when a dump request leaves the directory empty.
    pub dir: Option<PathBuf>,
    pub leave_running: bool,
    pub ghost_limit: u32,
}

/// Validated restore configuration.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub scratch_root: PathBuf,
    pub output_log_dir: PathBuf,
}

/// Validated GPU configuration.
#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub enabled: bool,
    pub sidecar_path: PathBuf,
    pub shared_lib_path: PathBuf,
    pub startup_timeout: Duration,
}

/// Validated image streamer configuration.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub path: PathBuf,
    pub ready_poll: Duration,
    pub num_pipes: u32,
}

/// Validated job bookkeeping configuration.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Directory for persisted job records; in-memory when absent.
    pub store_dir: Option<PathBuf>,
}

/// Complete validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub criu: CriuConfig,
    pub dump: DumpConfig,
    pub restore: RestoreConfig,
    pub gpu: GpuConfig,
    pub streamer: StreamerConfig,
    pub jobs: JobsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        ConfigLoader::build(RawConfig::default())
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> EngineResult<EngineConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(EngineError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::io("reading config file", e))?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> EngineResult<EngineConfig> {
        // An empty document is a valid all-defaults config.
        if content.trim().is_empty() {
            return Self::validate(RawConfig::default());
        }

        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| EngineError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    /// Validate raw configuration and convert to validated types.
    fn validate(raw: RawConfig) -> EngineResult<EngineConfig> {
        if !(0..=4).contains(&raw.criu.log_level) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "criu.log_level",
                value: raw.criu.log_level.to_string(),
                reason: "Must be between 0 and 4".to_string(),
            }
            .into());
        }

        if raw.gpu.startup_timeout_ms == 0 || raw.gpu.startup_timeout_ms > 600_000 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "gpu.startup_timeout_ms",
                value: raw.gpu.startup_timeout_ms.to_string(),
                reason: "Must be between 1ms and 10 minutes".to_string(),
            }
            .into());
        }

        if raw.gpu.enabled && raw.gpu.sidecar_path.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "sidecar_path",
                context: "gpu section with enabled: true".to_string(),
            }
            .into());
        }

        if raw.streamer.ready_poll_ms == 0 || raw.streamer.ready_poll_ms > 1000 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "streamer.ready_poll_ms",
                value: raw.streamer.ready_poll_ms.to_string(),
                reason: "Must be between 1 and 1000".to_string(),
            }
            .into());
        }

        if raw.streamer.num_pipes == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "streamer.num_pipes",
                value: "0".to_string(),
                reason: "At least one pipe is required".to_string(),
            }
            .into());
        }

        for (field, value) in [
            ("restore.scratch_root", &raw.restore.scratch_root),
            ("restore.output_log_dir", &raw.restore.output_log_dir),
            ("streamer.path", &raw.streamer.path),
        ] {
            if value.is_empty() {
                return Err(HardValidationError::InvalidFieldValue {
                    field,
                    value: String::new(),
                    reason: "Path cannot be empty".to_string(),
                }
                .into());
            }
        }

        Ok(Self::build(raw))
    }

    /// Convert checked raw values into the typed configuration.
    fn build(raw: RawConfig) -> EngineConfig {
        EngineConfig {
            criu: CriuConfig {
                path: raw.criu.path.filter(|p| !p.is_empty()).map(PathBuf::from),
                log_level: raw.criu.log_level,
            },
            dump: DumpConfig {
                dir: raw.dump.dir.filter(|d| !d.is_empty()).map(PathBuf::from),
                leave_running: raw.dump.leave_running,
                ghost_limit: raw.dump.ghost_limit,
            },
            restore: RestoreConfig {
                scratch_root: PathBuf::from(raw.restore.scratch_root),
                output_log_dir: PathBuf::from(raw.restore.output_log_dir),
            },
            gpu: GpuConfig {
                enabled: raw.gpu.enabled,
                sidecar_path: PathBuf::from(raw.gpu.sidecar_path),
                shared_lib_path: PathBuf::from(raw.gpu.shared_lib_path),
                startup_timeout: Duration::from_millis(raw.gpu.startup_timeout_ms),
            },
            streamer: StreamerConfig {
                path: PathBuf::from(raw.streamer.path),
                ready_poll: Duration::from_millis(raw.streamer.ready_poll_ms),
                num_pipes: raw.streamer.num_pipes,
            },
            jobs: JobsConfig {
                store_dir: raw.jobs.store_dir.filter(|d| !d.is_empty()).map(PathBuf::from),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"
criu:
  path: /usr/sbin/criu
  log_level: 3
dump:
  dir: /var/lib/checkpointd/dumps
  leave_running: true
restore:
  scratch_root: /run/checkpointd/restore
gpu:
  enabled: true
  sidecar_path: /opt/gpu/controller
  startup_timeout_ms: 5000
jobs:
  store_dir: /var/lib/checkpointd/jobs
"#;

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG).unwrap();
        assert_eq!(config.criu.path, Some(PathBuf::from("/usr/sbin/criu")));
        assert_eq!(config.criu.log_level, 3);
        assert!(config.dump.leave_running);
        assert_eq!(
            config.dump.dir,
            Some(PathBuf::from("/var/lib/checkpointd/dumps"))
        );
        assert!(config.gpu.enabled);
        assert_eq!(config.gpu.startup_timeout, Duration::from_secs(5));
        assert_eq!(
            config.jobs.store_dir,
            Some(PathBuf::from("/var/lib/checkpointd/jobs"))
        );
    }

    #[test]
    fn test_defaults_applied() {
        let config = ConfigLoader::load_string("").unwrap();
        assert_eq!(config.criu.log_level, 4);
        assert_eq!(config.dump.ghost_limit, 10_000_000);
        assert!(!config.dump.leave_running);
        assert!(!config.gpu.enabled);
        assert_eq!(config.gpu.startup_timeout, Duration::from_secs(30));
        assert_eq!(config.streamer.ready_poll, Duration::from_millis(2));
        assert!(config.jobs.store_dir.is_none());

        let default = EngineConfig::default();
        assert_eq!(default.restore.scratch_root, config.restore.scratch_root);
    }

    #[test]
    fn test_invalid_log_level() {
        let yaml = r#"
criu:
  log_level: 9
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_zero_startup_timeout() {
        let yaml = r#"
gpu:
  startup_timeout_ms: 0
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_enabled_gpu_needs_sidecar() {
        let yaml = r#"
gpu:
  enabled: true
  sidecar_path: ""
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        let result = ConfigLoader::load_string("criu: [unterminated");
        assert!(matches!(result, Err(EngineError::ConfigParse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::load_file("/nonexistent/checkpointd.yaml");
        assert!(matches!(result, Err(EngineError::ConfigNotFound { .. })));
    }
}
