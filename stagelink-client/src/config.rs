//! Configuration loading
//!
//! Settings come from an optional TOML file
//! (`$XDG_CONFIG_HOME/stagelink/config.toml` unless `--config` names another)
//! with command-line flags layered on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use stagelink_protocol::Endpoint;
use stagelink_utils::{Result, StagelinkError};

use crate::cli::Cli;
use crate::connection::{ChannelRole, RequestPolicy};
use crate::session::SessionSettings;

/// Contents of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub control: ControlConfig,
    pub notify: NotifyConfig,
    pub output: OutputConfig,
    pub session: SessionConfig,
}

/// `[control]` section
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Wait for each reply, in milliseconds
    pub timeout_ms: u64,
    /// Attempts per request before the host counts as unreachable
    pub max_retries: u32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let policy = RequestPolicy::default();
        Self {
            timeout_ms: policy.timeout.as_millis() as u64,
            max_retries: policy.max_retries,
        }
    }
}

/// `[notify]` section
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Local address the notify listener binds
    pub bind: String,
    pub role: ChannelRole,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            bind: Endpoint::ephemeral_loopback().to_string(),
            role: ChannelRole::default(),
        }
    }
}

/// `[output]` section
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    /// The composed document is created by someone else; do not write an
    /// empty one at startup
    pub existing_document: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            existing_document: false,
        }
    }
}

/// `[session]` section
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pause between sync cycles, in milliseconds
    pub render_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            render_interval_ms: 1000,
        }
    }
}

/// Load the configuration file
///
/// Without `explicit`, a missing default file yields the defaults. An
/// explicitly named file must exist.
pub fn load(explicit: Option<&Path>) -> Result<FileConfig> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => (stagelink_utils::config_file(), false),
    };

    if !path.exists() {
        if required {
            return Err(StagelinkError::ConfigNotFound(path));
        }
        debug!(path = %path.display(), "No config file, using defaults");
        return Ok(FileConfig::default());
    }

    let content = std::fs::read_to_string(&path).map_err(|e| StagelinkError::ConfigInvalid {
        path: path.clone(),
        message: e.to_string(),
    })?;
    let config = parse(&content, &path)?;
    debug!(path = %path.display(), "Config file loaded");
    Ok(config)
}

/// Parse configuration text; `path` is only used in errors
pub fn parse(content: &str, path: &Path) -> Result<FileConfig> {
    toml::from_str(content).map_err(|e| StagelinkError::ConfigInvalid {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Merge file values with command-line flags
pub fn resolve(cli: &Cli, file: FileConfig) -> Result<SessionSettings> {
    let control = Endpoint::parse(&cli.control)
        .map_err(|e| StagelinkError::config(format!("control address: {}", e)))?;
    let notify_bind = Endpoint::parse(&file.notify.bind)
        .map_err(|e| StagelinkError::config(format!("notify bind address: {}", e)))?;
    if notify_bind.socket_addr().is_none() {
        return Err(StagelinkError::config(format!(
            "notify bind address must be TCP, got {}",
            notify_bind
        )));
    }

    if file.control.max_retries == 0 {
        return Err(StagelinkError::config("control.max_retries must be at least 1"));
    }
    if file.control.timeout_ms == 0 {
        return Err(StagelinkError::config("control.timeout_ms must be positive"));
    }

    Ok(SessionSettings {
        control,
        notify_bind,
        role: cli.role.unwrap_or(file.notify.role),
        output_dir: cli.output_dir.clone().unwrap_or(file.output.dir),
        existing_document: file.output.existing_document,
        policy: RequestPolicy {
            max_retries: file.control.max_retries,
            timeout: Duration::from_millis(file.control.timeout_ms),
        },
        render_interval: Duration::from_millis(file.session.render_interval_ms),
    })
}
