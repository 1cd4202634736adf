//! MicroK8s control plane.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use super::{ClusterControl, StatusReport};
use crate::command::{CommandRunner, CommandSpec};
use crate::tool_args::ToolArgs;

/// Arguments for `microk8s enable <addon>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableAddonArgs {
    /// Addon with optional argument, e.g. `metallb:10.64.140.43-10.64.140.49`
    pub addon: String,
}

impl ToolArgs for EnableAddonArgs {
    fn program(&self) -> &'static str {
        "microk8s"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["enable".to_string(), self.addon.clone()]
    }
}

#[derive(Debug, Clone)]
pub struct MicroK8s<R> {
    runner: R,
}

impl<R: CommandRunner> MicroK8s<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> ClusterControl for MicroK8s<R> {
    fn wait_ready(&self, timeout: Duration) -> Result<()> {
        info!("Waiting up to {}s for MicroK8s", timeout.as_secs());
        let spec = CommandSpec::new("microk8s").args([
            "status".to_string(),
            "--wait-ready".to_string(),
            "--timeout".to_string(),
            timeout.as_secs().to_string(),
        ]);
        self.runner
            .run(&spec)?
            .ensure_success("microk8s status --wait-ready")
    }

    fn enable_features(&self, features: &[String]) -> Result<()> {
        for addon in features {
            info!("Enabling MicroK8s addon {}", addon);
            let args = EnableAddonArgs {
                addon: addon.clone(),
            };
            self.runner
                .run(&args.to_command().streaming())?
                .ensure_success(&format!("microk8s enable {}", addon))?;
        }
        Ok(())
    }

    fn status(&self) -> Result<StatusReport> {
        let stdout = self
            .runner
            .run(&CommandSpec::new("microk8s").arg("status"))
            .context("Failed to query MicroK8s status")?
            .into_stdout("microk8s status")?;
        Ok(parse_status(&stdout))
    }

    fn kubeconfig(&self) -> Result<String> {
        self.runner
            .run(&CommandSpec::new("microk8s").arg("config"))?
            .into_stdout("microk8s config")
    }
}

/// Parse the human-readable `microk8s status` report.
///
/// ```text
/// microk8s is running
/// addons:
///   enabled:
///     dns                  # (core) CoreDNS
///   disabled:
///     cert-manager         # (core) Cloud native certificate management
/// ```
pub fn parse_status(text: &str) -> StatusReport {
    let mut report = StatusReport::default();
    let mut in_enabled = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with("microk8s is ") {
            report.running = trimmed == "microk8s is running";
            continue;
        }
        match trimmed {
            "enabled:" => in_enabled = true,
            "disabled:" | "addons:" => in_enabled = false,
            _ if in_enabled => {
                if let Some(name) = trimmed.split_whitespace().next() {
                    report.enabled.insert(name.to_string());
                }
            }
            _ => {}
        }
    }

    report
}
