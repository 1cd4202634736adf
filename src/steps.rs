//! The ML platform provisioning sequence.
//!
//! # Design
//!
//! Every step is a plain function over `Platform`, which bundles the
//! configuration with one boxed capability per collaborator. Steps start
//! with a cheap "already done?" check so a re-run after a failure or a
//! pause only repeats side effects that never completed. Declaration order
//! in `default_sequence` is the marker order: renaming or reordering steps
//! invalidates existing progress files.

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::collaborators::{
    AppRef, BlockDevices, ClusterControl, DeployOptions, DiskManager, GroupMembership,
    HostConfig, Juju, MicroK8s, Orchestrator, PackageInstaller, PackageRef, Snap, Sysctl,
    UnixGroups,
};
use crate::command::SystemRunner;
use crate::config::SetupConfig;
use crate::sequencer::{SequenceError, Step, StepOutcome, StepSequence};

/// Application whose presence means the bundle was already deployed.
pub const BUNDLE_SENTINEL_APP: &str = "kubeflow-dashboard";

/// Applications whose `public-url` must match the dashboard address.
const PUBLIC_URL_APPS: [&str; 2] = ["dex-auth", "oidc-gatekeeper"];

/// Everything a provisioning step can reach.
pub struct Platform {
    pub config: SetupConfig,
    pub packages: Box<dyn PackageInstaller>,
    pub groups: Box<dyn GroupMembership>,
    pub cluster: Box<dyn ClusterControl>,
    pub orchestrator: Box<dyn Orchestrator>,
    pub host: Box<dyn HostConfig>,
    pub disks: Box<dyn DiskManager>,
}

impl Platform {
    /// Collaborators backed by the real host tools.
    pub fn system(config: SetupConfig, dry_run: bool) -> Self {
        let runner = SystemRunner::new(dry_run);
        Self {
            config,
            packages: Box::new(Snap::new(runner.clone())),
            groups: Box::new(UnixGroups::new(runner.clone())),
            cluster: Box::new(MicroK8s::new(runner.clone())),
            orchestrator: Box::new(Juju::new(runner.clone())),
            host: Box::new(Sysctl::new(runner.clone())),
            disks: Box::new(BlockDevices::new(runner)),
        }
    }
}

/// The full installation procedure, in execution order.
pub fn default_sequence() -> Result<StepSequence<Platform>, SequenceError> {
    StepSequence::new(vec![
        Step::new(
            "install-microk8s",
            "Install the MicroK8s snap",
            install_microk8s,
        ),
        Step::new(
            "join-microk8s-group",
            "Give the current user access to the microk8s CLI",
            join_microk8s_group,
        ),
        Step::new(
            "wait-microk8s",
            "Wait for the MicroK8s control plane",
            wait_microk8s,
        ),
        Step::new(
            "enable-addons",
            "Enable MicroK8s addons, metallb included",
            enable_addons,
        ),
        Step::new(
            "setup-data-disk",
            "Partition, format and mount a blank data disk if one is attached",
            setup_data_disk,
        ),
        Step::new("install-juju", "Install the Juju snap", install_juju),
        Step::new(
            "register-cloud",
            "Register MicroK8s as a Juju cloud",
            register_cloud,
        ),
        Step::new(
            "bootstrap-controller",
            "Bootstrap the Juju controller",
            bootstrap_controller,
        ),
        Step::new("add-model", "Create the Kubeflow model", add_model),
        Step::new(
            "tune-kernel",
            "Raise inotify limits and persist them",
            tune_kernel,
        ),
        Step::new(
            "deploy-kubeflow",
            "Deploy the Kubeflow bundle",
            deploy_kubeflow,
        ),
        Step::new(
            "configure-dashboard",
            "Set dashboard credentials and public URL",
            configure_dashboard,
        ),
        Step::new(
            "wait-kubeflow",
            "Wait for every Kubeflow unit to become active",
            wait_kubeflow,
        ),
    ])
}

/// Operator message printed once the sequence has completed.
pub fn completion_message(config: &SetupConfig) -> String {
    format!(
        "Kubeflow is ready.\n  Dashboard: {}\n  Username:  {}",
        config.dashboard_url(),
        config.dashboard.username
    )
}

fn install_snap(platform: &Platform, package: PackageRef, channel: &str) -> Result<StepOutcome> {
    if platform.packages.is_installed(&package.name)? {
        info!("{} is already installed", package.name);
        return Ok(StepOutcome::Done);
    }
    platform.packages.install(&package, channel)?;
    Ok(StepOutcome::Done)
}

fn install_microk8s(platform: &Platform) -> Result<StepOutcome> {
    install_snap(
        platform,
        PackageRef::classic("microk8s"),
        &platform.config.microk8s_channel,
    )
}

fn join_microk8s_group(platform: &Platform) -> Result<StepOutcome> {
    let group = &platform.config.microk8s_group;
    let session_has_access = platform.groups.current_user_in_group(group)?;

    let user = platform.groups.current_user()?;
    if !platform.groups.user_in_group(&user, group)? {
        info!("Adding {} to group {}", user, group);
        platform.groups.add_user_to_group(&user, group)?;
    }
    if session_has_access {
        return Ok(StepOutcome::Done);
    }
    info!("{} is in group {} but this session is not", user, group);

    Ok(StepOutcome::pause(format!(
        "User {} was added to the {} group. Log out and back in (or run `newgrp {}`), then re-run mlnode to continue.",
        user, group, group
    )))
}

fn wait_microk8s(platform: &Platform) -> Result<StepOutcome> {
    platform.cluster.wait_ready(platform.config.ready_timeout())?;
    Ok(StepOutcome::Done)
}

fn enable_addons(platform: &Platform) -> Result<StepOutcome> {
    let status = platform.cluster.status()?;
    let pending: Vec<String> = platform
        .config
        .addon_list()
        .into_iter()
        .filter(|addon| !status.is_enabled(addon))
        .collect();

    if pending.is_empty() {
        info!("All addons already enabled");
        return Ok(StepOutcome::Done);
    }
    platform.cluster.enable_features(&pending)?;
    Ok(StepOutcome::Done)
}

fn setup_data_disk(platform: &Platform) -> Result<StepOutcome> {
    let disk = &platform.config.data_disk;
    if platform.disks.is_mounted(&disk.mount_point)? {
        info!("{} is already mounted", disk.mount_point.display());
        return Ok(StepOutcome::Done);
    }

    let Some(device) = platform
        .disks
        .find_unmounted_block_device(&disk.candidates)?
    else {
        let candidates: Vec<String> = disk
            .candidates
            .iter()
            .map(|c| c.display().to_string())
            .collect();
        return Ok(StepOutcome::skipped(format!(
            "no blank data disk found among {}",
            candidates.join(", ")
        )));
    };

    info!(
        "Preparing {} as {} on {}",
        device.display(),
        disk.filesystem,
        disk.mount_point.display()
    );
    let partition = platform.disks.partition(&device)?;
    platform
        .disks
        .format_filesystem(&partition, disk.filesystem)?;
    platform.disks.mount(&partition, &disk.mount_point)?;
    platform
        .disks
        .persist_mount_entry(&partition, &disk.mount_point, disk.filesystem)?;
    Ok(StepOutcome::Done)
}

fn install_juju(platform: &Platform) -> Result<StepOutcome> {
    install_snap(
        platform,
        PackageRef::new("juju"),
        &platform.config.juju_channel,
    )
}

fn register_cloud(platform: &Platform) -> Result<StepOutcome> {
    let cloud = &platform.config.cloud_name;
    if platform.orchestrator.cloud_exists(cloud)? {
        info!("Cloud {} is already registered", cloud);
        return Ok(StepOutcome::Done);
    }
    let kubeconfig = platform
        .cluster
        .kubeconfig()
        .context("Failed to read the MicroK8s kubeconfig")?;
    platform.orchestrator.cloud_register(cloud, &kubeconfig)?;
    Ok(StepOutcome::Done)
}

fn bootstrap_controller(platform: &Platform) -> Result<StepOutcome> {
    let config = &platform.config;
    if platform.orchestrator.controller_exists(&config.controller_name)? {
        info!("Controller {} already exists", config.controller_name);
        return Ok(StepOutcome::Done);
    }
    platform
        .orchestrator
        .bootstrap_controller(&config.cloud_name, &config.controller_name)?;
    Ok(StepOutcome::Done)
}

fn add_model(platform: &Platform) -> Result<StepOutcome> {
    let model = &platform.config.model_name;
    if platform.orchestrator.workspace_exists(model)? {
        info!("Model {} already exists", model);
        return Ok(StepOutcome::Done);
    }
    platform.orchestrator.create_workspace(model)?;
    Ok(StepOutcome::Done)
}

fn tune_kernel(platform: &Platform) -> Result<StepOutcome> {
    for (key, value) in &platform.config.kernel_params {
        platform.host.set_kernel_param(key, value)?;
        platform.host.persist_kernel_param(key, value)?;
    }
    Ok(StepOutcome::Done)
}

fn deploy_kubeflow(platform: &Platform) -> Result<StepOutcome> {
    let config = &platform.config;
    let deployed = platform.orchestrator.query_deployed_apps(&config.model_name)?;
    if deployed.contains(BUNDLE_SENTINEL_APP) {
        info!("{} is already deployed in {}", config.bundle, config.model_name);
        return Ok(StepOutcome::Done);
    }

    let app = AppRef {
        name: config.bundle.clone(),
        channel: config.bundle_channel.clone(),
    };
    let options = DeployOptions {
        model: config.model_name.clone(),
        trust: true,
    };
    platform.orchestrator.deploy(&app, &options)?;
    Ok(StepOutcome::Done)
}

fn configure_dashboard(platform: &Platform) -> Result<StepOutcome> {
    let config = &platform.config;
    let dashboard = &config.dashboard;
    if dashboard.password == "admin" {
        warn!("Dashboard password is the default; set dashboard.password in the config file");
    }

    let url = config.dashboard_url();
    for app in PUBLIC_URL_APPS {
        platform.orchestrator.configure(
            &config.model_name,
            app,
            &[("public-url".to_string(), url.clone())],
        )?;
    }

    platform.orchestrator.configure(
        &config.model_name,
        &dashboard.auth_app,
        &[
            ("static-username".to_string(), dashboard.username.clone()),
            ("static-password".to_string(), dashboard.password.clone()),
        ],
    )?;
    Ok(StepOutcome::Done)
}

fn wait_kubeflow(platform: &Platform) -> Result<StepOutcome> {
    platform
        .orchestrator
        .wait_for_workspace(&platform.config.model_name, platform.config.deploy_timeout())?;
    Ok(StepOutcome::Done)
}
