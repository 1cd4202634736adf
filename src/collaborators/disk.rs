//! Data disk discovery, partitioning, formatting and mounting.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tracing::{debug, info, warn};

use super::DiskManager;
use super::host::{AppendArgs, read_config_file};
use crate::command::{CommandRunner, CommandSpec};
use crate::tool_args::ToolArgs;

pub const FSTAB: &str = "/etc/fstab";

/// Filesystem created on the data disk.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Filesystem {
    #[default]
    Ext4,
    Xfs,
}

impl Filesystem {
    /// Flag that lets mkfs overwrite an existing signature.
    fn force_flag(self) -> &'static str {
        match self {
            Self::Ext4 => "-F",
            Self::Xfs => "-f",
        }
    }
}

/// Arguments for `parted -s <device> mklabel gpt mkpart primary 0% 100%`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartedArgs {
    pub device: PathBuf,
}

impl ToolArgs for PartedArgs {
    fn program(&self) -> &'static str {
        "parted"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["-s".to_string(), self.device.display().to_string()];
        args.extend(["mklabel", "gpt", "mkpart", "primary", "0%", "100%"].map(String::from));
        args
    }

    fn requires_root(&self) -> bool {
        true
    }
}

/// Arguments for `mkfs.<fs> <force> <partition>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkfsArgs {
    pub partition: PathBuf,
    pub filesystem: Filesystem,
}

impl ToolArgs for MkfsArgs {
    fn program(&self) -> &'static str {
        match self.filesystem {
            Filesystem::Ext4 => "mkfs.ext4",
            Filesystem::Xfs => "mkfs.xfs",
        }
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            self.filesystem.force_flag().to_string(),
            self.partition.display().to_string(),
        ]
    }

    fn requires_root(&self) -> bool {
        true
    }
}

/// Arguments for `mount <partition> <target>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArgs {
    pub partition: PathBuf,
    pub target: PathBuf,
}

impl ToolArgs for MountArgs {
    fn program(&self) -> &'static str {
        "mount"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            self.partition.display().to_string(),
            self.target.display().to_string(),
        ]
    }

    fn requires_root(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct LsblkJson {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

#[derive(Debug, Deserialize)]
struct BlockDevice {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mountpoint: Option<String>,
    /// Filesystem signature on the whole device, if any
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

impl BlockDevice {
    fn is_blank_disk(&self) -> bool {
        self.kind == "disk"
            && self.mountpoint.is_none()
            && self.fstype.is_none()
            && self.children.is_empty()
    }
}

/// Path of the first partition on `device`.
///
/// Devices whose name ends in a digit (`nvme0n1`, `mmcblk0`, `loop3`) get a
/// `p` separator.
pub fn partition_path(device: &Path) -> PathBuf {
    let name = device.display().to_string();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p1", name))
    } else {
        PathBuf::from(format!("{}1", name))
    }
}

/// Whether an fstab body already mounts something at `target`.
pub fn fstab_has_target(content: &str, target: &Path) -> bool {
    let target = target.display().to_string();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| mount_point == target)
}

#[derive(Debug, Clone)]
pub struct BlockDevices<R> {
    runner: R,
    fstab_path: PathBuf,
}

impl<R: CommandRunner> BlockDevices<R> {
    pub fn new(runner: R) -> Self {
        Self::with_fstab(runner, FSTAB)
    }

    pub fn with_fstab(runner: R, fstab_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            fstab_path: fstab_path.into(),
        }
    }

    fn uuid_of(&self, partition: &Path) -> Result<Option<String>> {
        let spec = CommandSpec::new("blkid")
            .args(["-s", "UUID", "-o", "value"])
            .arg(partition.display().to_string())
            .privileged();
        let out = self.runner.run(&spec)?;
        let uuid = out.stdout.trim();
        Ok((out.success && !uuid.is_empty()).then(|| uuid.to_string()))
    }
}

impl<R: CommandRunner> DiskManager for BlockDevices<R> {
    fn find_unmounted_block_device(&self, candidates: &[PathBuf]) -> Result<Option<PathBuf>> {
        let spec = CommandSpec::new("lsblk").args(["--json", "--paths", "-o", "NAME,TYPE,MOUNTPOINT,FSTYPE"]);
        let stdout = self.runner.run(&spec)?.into_stdout("lsblk")?;
        let listing: LsblkJson =
            serde_json::from_str(&stdout).context("Unexpected output from `lsblk --json`")?;

        for candidate in candidates {
            let wanted = candidate.display().to_string();
            match listing.blockdevices.iter().find(|d| d.name == wanted) {
                Some(dev) if dev.is_blank_disk() => return Ok(Some(candidate.clone())),
                Some(_) => debug!("{} is partitioned, formatted or mounted, skipping", wanted),
                None => debug!("{} not present", wanted),
            }
        }
        Ok(None)
    }

    fn is_mounted(&self, target: &Path) -> Result<bool> {
        let spec = CommandSpec::new("findmnt")
            .args(["-n", "-o", "TARGET", "--mountpoint"])
            .arg(target.display().to_string());
        Ok(self.runner.run(&spec)?.success)
    }

    fn partition(&self, device: &Path) -> Result<PathBuf> {
        info!("Partitioning {}", device.display());
        let args = PartedArgs {
            device: device.to_path_buf(),
        };
        self.runner
            .run(&args.to_command())?
            .ensure_success(&format!("parted {}", device.display()))?;

        // Wait for udev to create the partition node
        self.runner
            .run(&CommandSpec::new("udevadm").arg("settle"))?
            .ensure_success("udevadm settle")?;

        Ok(partition_path(device))
    }

    fn format_filesystem(&self, partition: &Path, fs: Filesystem) -> Result<()> {
        info!("Creating {} on {}", fs, partition.display());
        let args = MkfsArgs {
            partition: partition.to_path_buf(),
            filesystem: fs,
        };
        self.runner
            .run(&args.to_command())?
            .ensure_success(&format!("mkfs.{} {}", fs, partition.display()))
    }

    fn mount(&self, partition: &Path, target: &Path) -> Result<()> {
        let mkdir = CommandSpec::new("mkdir")
            .arg("-p")
            .arg(target.display().to_string())
            .privileged()
            .mutating();
        self.runner
            .run(&mkdir)?
            .ensure_success(&format!("mkdir -p {}", target.display()))?;

        let args = MountArgs {
            partition: partition.to_path_buf(),
            target: target.to_path_buf(),
        };
        self.runner
            .run(&args.to_command())?
            .ensure_success(&format!("mount {}", partition.display()))
    }

    fn persist_mount_entry(&self, partition: &Path, target: &Path, fs: Filesystem) -> Result<()> {
        let content = read_config_file(&self.fstab_path)?;
        if fstab_has_target(&content, target) {
            debug!("{} already has an entry for {}", self.fstab_path.display(), target.display());
            return Ok(());
        }

        let source = match self.uuid_of(partition)? {
            Some(uuid) => format!("UUID={}", uuid),
            None => {
                warn!("No filesystem UUID for {}, using the device path in fstab", partition.display());
                partition.display().to_string()
            }
        };
        let entry = format!("{} {} {} defaults,nofail 0 2\n", source, target.display(), fs);

        let args = AppendArgs {
            path: self.fstab_path.clone(),
        };
        self.runner
            .run(&args.to_command().stdin(entry))?
            .ensure_success(&format!("appending to {}", self.fstab_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::command::testing::ScriptedRunner;
    use tempfile::NamedTempFile;

    const LSBLK: &str = r#"{
       "blockdevices": [
          {"name": "/dev/sda", "type": "disk", "mountpoint": null,
             "children": [{"name": "/dev/sda1", "type": "part", "mountpoint": "/"}]},
          {"name": "/dev/sdb", "type": "disk", "mountpoint": "/mnt"},
          {"name": "/dev/sdc", "type": "disk", "mountpoint": null, "fstype": null},
          {"name": "/dev/sdd", "type": "disk", "mountpoint": null, "fstype": "ext4"},
          {"name": "/dev/sr0", "type": "rom", "mountpoint": null}
       ]
    }"#;

    #[test]
    fn test_partition_path() {
        assert_eq!(partition_path(Path::new("/dev/sdc")), PathBuf::from("/dev/sdc1"));
        assert_eq!(
            partition_path(Path::new("/dev/nvme1n1")),
            PathBuf::from("/dev/nvme1n1p1")
        );
    }

    #[test]
    fn test_filesystem_strings() {
        assert_eq!(Filesystem::Ext4.to_string(), "ext4");
        assert_eq!("XFS".parse::<Filesystem>().unwrap(), Filesystem::Xfs);
        assert!("zfs".parse::<Filesystem>().is_err());
    }

    #[test]
    fn test_find_skips_used_and_missing_devices() {
        let runner = ScriptedRunner::new().on("lsblk", CommandOutput::ok(LSBLK));
        let disks = BlockDevices::new(&runner);

        let candidates: Vec<PathBuf> = ["/dev/sda", "/dev/sdb", "/dev/nvme1n1", "/dev/sdc"]
            .into_iter()
            .map(PathBuf::from)
            .collect();
        let found = disks.find_unmounted_block_device(&candidates).unwrap();
        assert_eq!(found, Some(PathBuf::from("/dev/sdc")));
    }

    #[test]
    fn test_find_returns_none_without_blank_disk() {
        let runner = ScriptedRunner::new().on("lsblk", CommandOutput::ok(LSBLK));
        let disks = BlockDevices::new(&runner);
        let found = disks
            .find_unmounted_block_device(&[PathBuf::from("/dev/sr0"), PathBuf::from("/dev/sda")])
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_find_skips_formatted_whole_disk() {
        let runner = ScriptedRunner::new().on("lsblk", CommandOutput::ok(LSBLK));
        let disks = BlockDevices::new(&runner);

        let found = disks
            .find_unmounted_block_device(&[PathBuf::from("/dev/sdd"), PathBuf::from("/dev/sdc")])
            .unwrap();

        assert_eq!(found, Some(PathBuf::from("/dev/sdc")));
        assert_eq!(
            runner.lines(),
            vec!["lsblk --json --paths -o NAME,TYPE,MOUNTPOINT,FSTYPE"]
        );
    }

    #[test]
    fn test_partition_runs_parted_then_settle() {
        let runner = ScriptedRunner::new();
        let disks = BlockDevices::new(&runner);

        let part = disks.partition(Path::new("/dev/sdc")).unwrap();

        assert_eq!(part, PathBuf::from("/dev/sdc1"));
        assert_eq!(
            runner.lines(),
            vec![
                "parted -s /dev/sdc mklabel gpt mkpart primary 0% 100%",
                "udevadm settle"
            ]
        );
    }

    #[test]
    fn test_fstab_entry_uses_uuid() {
        let fstab = NamedTempFile::new().unwrap();
        std::fs::write(fstab.path(), "UUID=abc / ext4 defaults 0 1\n").unwrap();
        let runner = ScriptedRunner::new().on("blkid", CommandOutput::ok("1234-abcd\n"));
        let disks = BlockDevices::with_fstab(&runner, fstab.path());

        disks
            .persist_mount_entry(Path::new("/dev/sdc1"), Path::new("/data"), Filesystem::Ext4)
            .unwrap();

        let calls = runner.calls();
        let append = calls.last().unwrap();
        assert_eq!(append.program, "tee");
        assert_eq!(
            append.stdin.as_deref(),
            Some("UUID=1234-abcd /data ext4 defaults,nofail 0 2\n")
        );
    }

    #[test]
    fn test_fstab_entry_not_duplicated() {
        let fstab = NamedTempFile::new().unwrap();
        std::fs::write(fstab.path(), "UUID=1234 /data ext4 defaults,nofail 0 2\n").unwrap();
        let runner = ScriptedRunner::new();
        let disks = BlockDevices::with_fstab(&runner, fstab.path());

        disks
            .persist_mount_entry(Path::new("/dev/sdc1"), Path::new("/data"), Filesystem::Ext4)
            .unwrap();

        assert!(runner.calls().is_empty());
    }
}
