//! Package installation through snapd.

use anyhow::{Context, Result};
use tracing::info;

use super::{PackageInstaller, PackageRef};
use crate::command::{CommandRunner, CommandSpec};
use crate::tool_args::ToolArgs;

/// Arguments for `snap install`.
///
/// | Field     | CLI flag             |
/// |-----------|----------------------|
/// | `name`    | positional           |
/// | `channel` | `--channel=<c>`      |
/// | `classic` | `--classic` when set |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapInstallArgs {
    pub name: String,
    pub channel: String,
    pub classic: bool,
}

impl ToolArgs for SnapInstallArgs {
    fn program(&self) -> &'static str {
        "snap"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "install".to_string(),
            self.name.clone(),
            format!("--channel={}", self.channel),
        ];
        if self.classic {
            args.push("--classic".to_string());
        }
        args
    }

    fn requires_root(&self) -> bool {
        true
    }
}

/// snapd-backed `PackageInstaller`.
#[derive(Debug, Clone)]
pub struct Snap<R> {
    runner: R,
}

impl<R: CommandRunner> Snap<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> PackageInstaller for Snap<R> {
    fn is_installed(&self, name: &str) -> Result<bool> {
        // `snap list <name>` exits non-zero when the snap is absent
        let out = self
            .runner
            .run(&CommandSpec::new("snap").args(["list", name]))
            .with_context(|| format!("Failed to query snap {}", name))?;
        Ok(out.success)
    }

    fn install(&self, package: &PackageRef, channel: &str) -> Result<()> {
        let args = SnapInstallArgs {
            name: package.name.clone(),
            channel: channel.to_string(),
            classic: package.classic,
        };
        info!("Installing snap {} from {}", package.name, channel);
        self.runner
            .run(&args.to_command().streaming())?
            .ensure_success(&format!("snap install {}", package.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::command::testing::ScriptedRunner;

    #[test]
    fn test_install_args_mapping() {
        let args = SnapInstallArgs {
            name: "microk8s".to_string(),
            channel: "1.28/stable".to_string(),
            classic: true,
        };
        assert_eq!(
            args.to_cli_args(),
            vec!["install", "microk8s", "--channel=1.28/stable", "--classic"]
        );
        assert!(args.to_command().privileged);
    }

    #[test]
    fn test_is_installed_uses_exit_status() {
        let runner = ScriptedRunner::new()
            .on("snap list juju", CommandOutput::failed(1, "error: no matching snaps"))
            .on("snap list microk8s", CommandOutput::ok("Name Version\nmicrok8s v1.28"));
        let snap = Snap::new(&runner);

        assert!(snap.is_installed("microk8s").unwrap());
        assert!(!snap.is_installed("juju").unwrap());
    }

    #[test]
    fn test_install_failure_is_error() {
        let runner = ScriptedRunner::new().on(
            "snap install",
            CommandOutput::failed(1, "error: cannot install \"juju\""),
        );
        let snap = Snap::new(&runner);

        let err = snap
            .install(&PackageRef::new("juju"), "3.4/stable")
            .unwrap_err();
        assert!(err.to_string().contains("cannot install"));
        assert_eq!(runner.lines(), vec!["snap install juju --channel=3.4/stable"]);
    }
}
