//! Capabilities the provisioning steps drive.
//!
//! Each trait is one external collaborator: the package installer, Unix
//! groups, the MicroK8s control plane, the Juju orchestrator, kernel
//! parameters and block devices. Steps only see these traits; the
//! command-backed implementations live in the submodules and every one of
//! them goes through a `CommandRunner`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

pub mod disk;
pub mod groups;
pub mod host;
pub mod juju;
pub mod microk8s;
pub mod snap;

pub use disk::{BlockDevices, Filesystem};
pub use groups::UnixGroups;
pub use host::Sysctl;
pub use juju::Juju;
pub use microk8s::MicroK8s;
pub use snap::Snap;

/// A package to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub name: String,
    /// Snap classic confinement
    pub classic: bool,
}

impl PackageRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classic: false,
        }
    }

    pub fn classic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            classic: true,
        }
    }
}

pub trait PackageInstaller {
    fn is_installed(&self, name: &str) -> Result<bool>;
    fn install(&self, package: &PackageRef, channel: &str) -> Result<()>;
}

pub trait GroupMembership {
    /// Login name of the invoking user.
    fn current_user(&self) -> Result<String>;

    /// Whether the *current session* carries `group`.
    ///
    /// This differs from `user_in_group` right after `add_user_to_group`:
    /// the group database already lists the user, but the running session
    /// only picks the group up after a new login.
    fn current_user_in_group(&self, group: &str) -> Result<bool>;

    /// Whether the group database lists `user` as a member of `group`.
    fn user_in_group(&self, user: &str, group: &str) -> Result<bool>;

    fn add_user_to_group(&self, user: &str, group: &str) -> Result<()>;
}

/// Snapshot of the cluster as reported by its status command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub running: bool,
    /// Enabled feature/addon names
    pub enabled: BTreeSet<String>,
}

impl StatusReport {
    /// Whether `feature` is enabled. Arguments after `:` (as in
    /// `metallb:10.0.0.1-10.0.0.9`) are ignored.
    pub fn is_enabled(&self, feature: &str) -> bool {
        let name = feature.split(':').next().unwrap_or(feature);
        self.enabled.contains(name)
    }
}

pub trait ClusterControl {
    /// Block until the control plane reports ready, failing after `timeout`.
    fn wait_ready(&self, timeout: Duration) -> Result<()>;
    fn enable_features(&self, features: &[String]) -> Result<()>;
    fn status(&self) -> Result<StatusReport>;
    /// Client kubeconfig for the cluster.
    fn kubeconfig(&self) -> Result<String>;
}

/// An application (bundle or charm) to deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRef {
    pub name: String,
    pub channel: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOptions {
    pub model: String,
    /// Grant the application cluster-level credentials
    pub trust: bool,
}

pub trait Orchestrator {
    fn cloud_exists(&self, cloud: &str) -> Result<bool>;
    /// Register the Kubernetes cluster described by `kubeconfig` as `cloud`.
    fn cloud_register(&self, cloud: &str, kubeconfig: &str) -> Result<()>;

    fn controller_exists(&self, controller: &str) -> Result<bool>;
    fn bootstrap_controller(&self, cloud: &str, controller: &str) -> Result<()>;

    fn workspace_exists(&self, model: &str) -> Result<bool>;
    fn create_workspace(&self, model: &str) -> Result<()>;

    fn deploy(&self, app: &AppRef, options: &DeployOptions) -> Result<()>;
    fn query_deployed_apps(&self, model: &str) -> Result<BTreeSet<String>>;

    /// Set configuration keys on a deployed application.
    fn configure(&self, model: &str, app: &str, settings: &[(String, String)]) -> Result<()>;

    /// Block until every unit in `model` is active, failing after `timeout`.
    fn wait_for_workspace(&self, model: &str, timeout: Duration) -> Result<()>;
}

pub trait HostConfig {
    fn set_kernel_param(&self, key: &str, value: &str) -> Result<()>;
    /// Record `key = value` in the persistent sysctl config unless the key is
    /// already set there.
    fn persist_kernel_param(&self, key: &str, value: &str) -> Result<()>;
}

pub trait DiskManager {
    /// First candidate that exists, is a whole disk, has no partitions and is
    /// not mounted.
    fn find_unmounted_block_device(&self, candidates: &[PathBuf]) -> Result<Option<PathBuf>>;

    /// Whether anything is mounted at `target`.
    fn is_mounted(&self, target: &Path) -> Result<bool>;

    /// Create a single partition spanning `device`; returns the partition path.
    fn partition(&self, device: &Path) -> Result<PathBuf>;

    fn format_filesystem(&self, partition: &Path, fs: Filesystem) -> Result<()>;

    fn mount(&self, partition: &Path, target: &Path) -> Result<()>;

    /// Add an fstab entry for `partition` at `target` unless `target` already has one.
    fn persist_mount_entry(&self, partition: &Path, target: &Path, fs: Filesystem) -> Result<()>;
}
