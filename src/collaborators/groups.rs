//! Unix group membership via `id` and `usermod`.

use anyhow::{Context, Result};

use super::GroupMembership;
use crate::command::{CommandRunner, CommandSpec};
use crate::tool_args::ToolArgs;

/// Arguments for `usermod -a -G <group> <user>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsermodArgs {
    pub user: String,
    pub group: String,
}

impl ToolArgs for UsermodArgs {
    fn program(&self) -> &'static str {
        "usermod"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-a".to_string(),
            "-G".to_string(),
            self.group.clone(),
            self.user.clone(),
        ]
    }

    fn requires_root(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct UnixGroups<R> {
    runner: R,
    /// Effective user is root; no group is needed to drive root-owned tools
    is_root: bool,
    /// Invoking user when running under sudo
    sudo_user: Option<String>,
}

impl<R: CommandRunner> UnixGroups<R> {
    pub fn new(runner: R) -> Self {
        let sudo_user = std::env::var("SUDO_USER").ok();
        Self::with_identity(runner, nix::unistd::geteuid().is_root(), sudo_user)
    }

    pub fn with_identity(runner: R, is_root: bool, sudo_user: Option<String>) -> Self {
        Self {
            runner,
            is_root,
            sudo_user: sudo_user.filter(|user| !user.is_empty() && user != "root"),
        }
    }

    fn group_names(&self, user: Option<&str>) -> Result<Vec<String>> {
        let mut spec = CommandSpec::new("id").arg("-nG");
        if let Some(user) = user {
            spec = spec.arg(user);
        }
        let stdout = self.runner.run(&spec)?.into_stdout("id -nG")?;
        Ok(stdout.split_whitespace().map(str::to_string).collect())
    }
}

impl<R: CommandRunner> GroupMembership for UnixGroups<R> {
    fn current_user(&self) -> Result<String> {
        // Running under sudo still provisions for the invoking user
        if let Some(user) = &self.sudo_user {
            return Ok(user.clone());
        }
        let stdout = self
            .runner
            .run(&CommandSpec::new("id").arg("-un"))?
            .into_stdout("id -un")?;
        let user = stdout.trim();
        anyhow::ensure!(!user.is_empty(), "id -un printed no user name");
        Ok(user.to_string())
    }

    fn current_user_in_group(&self, group: &str) -> Result<bool> {
        if self.is_root {
            return Ok(true);
        }
        Ok(self
            .group_names(None)
            .context("Failed to read session groups")?
            .iter()
            .any(|g| g == group))
    }

    fn user_in_group(&self, user: &str, group: &str) -> Result<bool> {
        Ok(self
            .group_names(Some(user))
            .with_context(|| format!("Failed to read groups of {}", user))?
            .iter()
            .any(|g| g == group))
    }

    fn add_user_to_group(&self, user: &str, group: &str) -> Result<()> {
        let args = UsermodArgs {
            user: user.to_string(),
            group: group.to_string(),
        };
        self.runner
            .run(&args.to_command())?
            .ensure_success(&format!("adding {} to group {}", user, group))
    }
}
