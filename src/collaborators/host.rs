//! Kernel parameters via `sysctl`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::HostConfig;
use crate::command::{CommandRunner, CommandSpec};
use crate::tool_args::ToolArgs;

pub const SYSCTL_CONF: &str = "/etc/sysctl.conf";

/// Arguments for `sysctl -w key=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysctlWriteArgs {
    pub key: String,
    pub value: String,
}

impl ToolArgs for SysctlWriteArgs {
    fn program(&self) -> &'static str {
        "sysctl"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-w".to_string(), format!("{}={}", self.key, self.value)]
    }

    fn requires_root(&self) -> bool {
        true
    }
}

/// `tee -a <file>`; the caller supplies the appended text on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AppendArgs {
    pub path: PathBuf,
}

impl ToolArgs for AppendArgs {
    fn program(&self) -> &'static str {
        "tee"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-a".to_string(), self.path.display().to_string()]
    }

    fn requires_root(&self) -> bool {
        true
    }
}

/// Read a root-owned config file, treating a missing file as empty.
pub(crate) fn read_config_file(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Whether a sysctl.conf body already assigns `key`.
pub fn sets_key(content: &str, key: &str) -> bool {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.split_once('='))
        .any(|(k, _)| k.trim() == key)
}

#[derive(Debug, Clone)]
pub struct Sysctl<R> {
    runner: R,
    conf_path: PathBuf,
}

impl<R: CommandRunner> Sysctl<R> {
    pub fn new(runner: R) -> Self {
        Self::with_conf(runner, SYSCTL_CONF)
    }

    pub fn with_conf(runner: R, conf_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            conf_path: conf_path.into(),
        }
    }
}

impl<R: CommandRunner> HostConfig for Sysctl<R> {
    fn set_kernel_param(&self, key: &str, value: &str) -> Result<()> {
        let args = SysctlWriteArgs {
            key: key.to_string(),
            value: value.to_string(),
        };
        self.runner
            .run(&args.to_command())?
            .ensure_success(&format!("sysctl -w {}={}", key, value))
    }

    fn persist_kernel_param(&self, key: &str, value: &str) -> Result<()> {
        let content = read_config_file(&self.conf_path)?;
        if sets_key(&content, key) {
            debug!("{} already set in {}", key, self.conf_path.display());
            return Ok(());
        }

        info!("Persisting {}={} in {}", key, value, self.conf_path.display());
        let args = AppendArgs {
            path: self.conf_path.clone(),
        };
        let spec: CommandSpec = args.to_command().stdin(format!("{}={}\n", key, value));
        self.runner
            .run(&spec)?
            .ensure_success(&format!("appending {} to {}", key, self.conf_path.display()))
    }
}
