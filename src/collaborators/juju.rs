//! Juju deployment orchestrator.
//!
//! Existence checks read `--format json` output so each step can tell
//! whether its work was already done by an earlier, interrupted run.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use super::{AppRef, DeployOptions, Orchestrator};
use crate::command::{CommandRunner, CommandSpec};
use crate::tool_args::ToolArgs;

/// Query used by `juju wait-for` to decide a model has settled.
const ALL_UNITS_ACTIVE: &str = r#"forEach(units, unit => unit.workload-status == "active")"#;

/// Arguments for `juju add-k8s <cloud> --client` (kubeconfig on stdin).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddK8sArgs {
    pub cloud: String,
}

impl ToolArgs for AddK8sArgs {
    fn program(&self) -> &'static str {
        "juju"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "add-k8s".to_string(),
            self.cloud.clone(),
            "--client".to_string(),
        ]
    }
}

/// Arguments for `juju bootstrap <cloud> <controller>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapArgs {
    pub cloud: String,
    pub controller: String,
}

impl ToolArgs for BootstrapArgs {
    fn program(&self) -> &'static str {
        "juju"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "bootstrap".to_string(),
            self.cloud.clone(),
            self.controller.clone(),
        ]
    }
}

/// Arguments for `juju deploy`.
///
/// | Field     | CLI flag           |
/// |-----------|--------------------|
/// | `app`     | positional         |
/// | `model`   | `--model <m>`      |
/// | `channel` | `--channel=<c>`    |
/// | `trust`   | `--trust` when set |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployArgs {
    pub app: String,
    pub model: String,
    pub channel: String,
    pub trust: bool,
}

impl ToolArgs for DeployArgs {
    fn program(&self) -> &'static str {
        "juju"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "deploy".to_string(),
            self.app.clone(),
            "--model".to_string(),
            self.model.clone(),
            format!("--channel={}", self.channel),
        ];
        if self.trust {
            args.push("--trust".to_string());
        }
        args
    }
}

#[derive(Debug, Deserialize)]
struct ControllersJson {
    #[serde(default)]
    controllers: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ModelsJson {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(rename = "short-name", default)]
    short_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusJson {
    #[serde(default)]
    applications: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Juju<R> {
    runner: R,
}

impl<R: CommandRunner> Juju<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    fn query_json<T: for<'de> Deserialize<'de>>(&self, spec: CommandSpec) -> Result<T> {
        let label = spec.to_string();
        let stdout = self.runner.run(&spec)?.into_stdout(&label)?;
        serde_json::from_str(&stdout).with_context(|| format!("Unexpected output from `{}`", label))
    }
}

impl<R: CommandRunner> Orchestrator for Juju<R> {
    fn cloud_exists(&self, cloud: &str) -> Result<bool> {
        let clouds: BTreeMap<String, serde_json::Value> = self.query_json(
            CommandSpec::new("juju").args(["clouds", "--client", "--format", "json"]),
        )?;
        Ok(clouds.contains_key(cloud))
    }

    fn cloud_register(&self, cloud: &str, kubeconfig: &str) -> Result<()> {
        info!("Registering Kubernetes cloud {} with Juju", cloud);
        let args = AddK8sArgs {
            cloud: cloud.to_string(),
        };
        self.runner
            .run(&args.to_command().stdin(kubeconfig))?
            .ensure_success(&format!("juju add-k8s {}", cloud))
    }

    fn controller_exists(&self, controller: &str) -> Result<bool> {
        let spec = CommandSpec::new("juju").args(["controllers", "--format", "json"]);
        let out = self.runner.run(&spec)?;
        // A fresh client reports "No controllers registered" as an error
        if !out.success && out.stderr.contains("No controllers") {
            return Ok(false);
        }
        let stdout = out.into_stdout("juju controllers")?;
        let parsed: ControllersJson =
            serde_json::from_str(&stdout).context("Unexpected output from `juju controllers`")?;
        Ok(parsed.controllers.contains_key(controller))
    }

    fn bootstrap_controller(&self, cloud: &str, controller: &str) -> Result<()> {
        info!("Bootstrapping Juju controller {} on {}", controller, cloud);
        let args = BootstrapArgs {
            cloud: cloud.to_string(),
            controller: controller.to_string(),
        };
        self.runner
            .run(&args.to_command().streaming())?
            .ensure_success(&format!("juju bootstrap {} {}", cloud, controller))
    }

    fn workspace_exists(&self, model: &str) -> Result<bool> {
        let models: ModelsJson =
            self.query_json(CommandSpec::new("juju").args(["models", "--format", "json"]))?;
        Ok(models.models.iter().any(|m| {
            m.short_name.as_deref() == Some(model)
                || m.name.rsplit('/').next() == Some(model)
        }))
    }

    fn create_workspace(&self, model: &str) -> Result<()> {
        let spec = CommandSpec::new("juju")
            .args(["add-model", model])
            .mutating();
        self.runner
            .run(&spec)?
            .ensure_success(&format!("juju add-model {}", model))
    }

    fn deploy(&self, app: &AppRef, options: &DeployOptions) -> Result<()> {
        info!("Deploying {} ({}) into {}", app.name, app.channel, options.model);
        let args = DeployArgs {
            app: app.name.clone(),
            model: options.model.clone(),
            channel: app.channel.clone(),
            trust: options.trust,
        };
        self.runner
            .run(&args.to_command().streaming())?
            .ensure_success(&format!("juju deploy {}", app.name))
    }

    fn query_deployed_apps(&self, model: &str) -> Result<BTreeSet<String>> {
        let status: StatusJson = self.query_json(
            CommandSpec::new("juju").args(["status", "--model", model, "--format", "json"]),
        )?;
        Ok(status.applications.into_keys().collect())
    }

    fn configure(&self, model: &str, app: &str, settings: &[(String, String)]) -> Result<()> {
        let mut spec = CommandSpec::new("juju")
            .args(["config", "--model", model, app])
            .args(settings.iter().map(|(k, v)| format!("{}={}", k, v)))
            .mutating();
        if settings.iter().any(|(k, _)| is_secret_key(k)) {
            spec = spec.sensitive();
        }
        self.runner
            .run(&spec)?
            .ensure_success(&format!("juju config {}", app))
    }

    fn wait_for_workspace(&self, model: &str, timeout: Duration) -> Result<()> {
        info!(
            "Waiting up to {} minutes for every unit in {} to become active",
            timeout.as_secs() / 60,
            model
        );
        let spec = CommandSpec::new("juju")
            .args(["wait-for", "model", model, "--query", ALL_UNITS_ACTIVE])
            .arg("--timeout")
            .arg(format!("{}s", timeout.as_secs()))
            .streaming();
        self.runner
            .run(&spec)?
            .ensure_success(&format!("juju wait-for model {}", model))
    }
}

/// Config keys whose values must not reach the log.
fn is_secret_key(key: &str) -> bool {
    ["password", "secret", "token"]
        .iter()
        .any(|word| key.contains(word))
}
