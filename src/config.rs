//! Setup configuration
//!
//! Every knob of the provisioning run lives in `SetupConfig`. The defaults
//! reproduce the stock single-node Kubeflow install, so no config file is
//! needed; a JSON file may override any subset of fields.

use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collaborators::Filesystem;
use crate::error::{Result, SetupError};

/// File name of the progress marker under `$HOME`.
pub const MARKER_FILE_NAME: &str = ".mlnode_setup_progress";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    // Container orchestration runtime
    pub microk8s_channel: String,
    /// Group granting access to the microk8s CLI
    pub microk8s_group: String,
    pub addons: Vec<String>,
    /// Address pool handed to the metallb addon, `first-last`
    pub metallb_range: String,
    pub ready_timeout_secs: u64,

    // Deployment orchestrator
    pub juju_channel: String,
    pub cloud_name: String,
    pub controller_name: String,
    pub model_name: String,

    // ML toolkit
    pub bundle: String,
    pub bundle_channel: String,
    pub deploy_timeout_secs: u64,
    pub dashboard: DashboardConfig,

    // Host
    pub data_disk: DataDiskConfig,
    pub kernel_params: BTreeMap<String, String>,

    /// Progress marker location; defaults to `$HOME/.mlnode_setup_progress`
    pub marker_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Application holding the static login
    pub auth_app: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataDiskConfig {
    /// Devices probed in order for a blank data disk
    pub candidates: Vec<PathBuf>,
    pub mount_point: PathBuf,
    pub filesystem: Filesystem,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            microk8s_channel: "1.28/stable".to_string(),
            microk8s_group: "microk8s".to_string(),
            addons: ["dns", "hostpath-storage", "rbac"]
                .map(String::from)
                .to_vec(),
            metallb_range: "10.64.140.43-10.64.140.49".to_string(),
            ready_timeout_secs: 600,
            juju_channel: "3.4/stable".to_string(),
            cloud_name: "mlnode-k8s".to_string(),
            controller_name: "mlnode".to_string(),
            model_name: "kubeflow".to_string(),
            bundle: "kubeflow".to_string(),
            bundle_channel: "1.8/stable".to_string(),
            deploy_timeout_secs: 3600,
            dashboard: DashboardConfig::default(),
            data_disk: DataDiskConfig::default(),
            kernel_params: [
                ("fs.inotify.max_user_instances", "1280"),
                ("fs.inotify.max_user_watches", "655360"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            marker_path: None,
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            auth_app: "dex-auth".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }
}

impl Default for DataDiskConfig {
    fn default() -> Self {
        Self {
            candidates: ["/dev/sdc", "/dev/nvme1n1"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            mount_point: PathBuf::from("/data"),
            filesystem: Filesystem::Ext4,
        }
    }
}

impl SetupConfig {
    /// Load a (possibly partial) configuration from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            SetupError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            SetupError::config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Save the configuration as pretty JSON.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json + "\n")?;
        Ok(())
    }

    /// Check every field the provisioning steps rely on.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("microk8s_channel", &self.microk8s_channel),
            ("microk8s_group", &self.microk8s_group),
            ("juju_channel", &self.juju_channel),
            ("cloud_name", &self.cloud_name),
            ("controller_name", &self.controller_name),
            ("model_name", &self.model_name),
            ("bundle", &self.bundle),
            ("bundle_channel", &self.bundle_channel),
            ("dashboard.auth_app", &self.dashboard.auth_app),
            ("dashboard.username", &self.dashboard.username),
            ("dashboard.password", &self.dashboard.password),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(SetupError::validation(format!("{} must not be empty", field)));
            }
            if value.contains(char::is_whitespace) {
                return Err(SetupError::validation(format!(
                    "{} must not contain whitespace",
                    field
                )));
            }
        }

        if self.addons.is_empty() {
            return Err(SetupError::validation("addons must list at least one addon"));
        }
        if let Some(bad) = self.addons.iter().find(|a| a.trim().is_empty()) {
            return Err(SetupError::validation(format!("invalid addon {:?}", bad)));
        }

        self.metallb_bounds()?;

        if self.ready_timeout_secs == 0 || self.deploy_timeout_secs == 0 {
            return Err(SetupError::validation("timeouts must be positive"));
        }

        if !self.data_disk.mount_point.is_absolute() {
            return Err(SetupError::validation(format!(
                "data_disk.mount_point must be absolute, got {}",
                self.data_disk.mount_point.display()
            )));
        }
        if let Some(bad) = self
            .data_disk
            .candidates
            .iter()
            .find(|c| !c.starts_with("/dev/"))
        {
            return Err(SetupError::validation(format!(
                "data disk candidate {} is not under /dev",
                bad.display()
            )));
        }

        if let Some((key, _)) = self
            .kernel_params
            .iter()
            .find(|(k, v)| k.trim().is_empty() || k.contains('=') || v.trim().is_empty())
        {
            return Err(SetupError::validation(format!(
                "invalid kernel parameter {:?}",
                key
            )));
        }

        Ok(())
    }

    /// First and last address of the metallb pool.
    pub fn metallb_bounds(&self) -> Result<(Ipv4Addr, Ipv4Addr)> {
        let invalid = || {
            SetupError::validation(format!(
                "metallb_range must look like 10.64.140.43-10.64.140.49, got {:?}",
                self.metallb_range
            ))
        };
        let (first, last) = self.metallb_range.split_once('-').ok_or_else(invalid)?;
        let first: Ipv4Addr = first.trim().parse().map_err(|_| invalid())?;
        let last: Ipv4Addr = last.trim().parse().map_err(|_| invalid())?;
        if first > last {
            return Err(invalid());
        }
        Ok((first, last))
    }

    /// Addons to enable, metallb included with its address pool.
    pub fn addon_list(&self) -> Vec<String> {
        let mut addons = self.addons.clone();
        addons.push(format!("metallb:{}", self.metallb_range));
        addons
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }

    /// URL of the ML dashboard once the ingress gateway holds the first
    /// metallb address.
    pub fn dashboard_url(&self) -> String {
        match self.metallb_bounds() {
            Ok((first, _)) => format!("http://{}.nip.io", first),
            Err(_) => "http://<ingress address>.nip.io".to_string(),
        }
    }

    /// Marker location: explicit override, then config, then `$HOME`.
    pub fn resolve_marker_path(&self, overridden: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = overridden.or(self.marker_path.as_deref()) {
            return Ok(path.to_path_buf());
        }
        let home = std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                SetupError::config("HOME is not set; pass --state-file to locate the progress file")
            })?;
        Ok(PathBuf::from(home).join(MARKER_FILE_NAME))
    }
}
