use super::bind_mount::{MOUNTINFO, MountInfo, parse_mountinfo};
use crate::files::{DEFAULT_DIR_MODE, mkdir_all};
use crate::runner;
use anyhow::{Context as _, Result};
use assets::Cancellation;
use converge::{Changes, Context, Delta, Field, LocalTarget};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEVICE_POLL: Duration = Duration::from_secs(1);
const DEFAULT_FILESYSTEM: &str = "ext4";

/// A block device formatted if blank and mounted at `mountpoint`.
#[derive(Debug, Clone, Default)]
pub struct MountDisk {
    pub name: String,
    pub device: String,
    pub mountpoint: Option<String>,
}

impl MountDisk {
    pub fn new(name: &str, device: &str, mountpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            device: device.to_string(),
            mountpoint: Some(mountpoint.to_string()),
        }
    }
}

/// Block until `device` exists, then resolve any symlinks.
pub fn wait_for_device(device: &Path, cancel: &Cancellation, poll: Duration) -> Result<PathBuf> {
    loop {
        if device.exists() {
            return fs::canonicalize(device)
                .with_context(|| format!("error resolving device {}", device.display()));
        }
        log::info!("waiting for device {} to be attached", device.display());
        cancel.sleep(poll)?;
    }
}

/// Whether the canonical `device` is mounted at `mountpoint`.
///
/// The kernel may report a device-mapper volume as `/dev/mapper/<name>`
/// while the canonical path is `/dev/dm-N`, so sources are resolved too.
fn is_mounted(mounts: &[MountInfo], device: &Path, mountpoint: &str) -> bool {
    mounts.iter().any(|m| {
        m.mountpoint == mountpoint
            && fs::canonicalize(&m.source).unwrap_or_else(|_| PathBuf::from(&m.source)) == device
    })
}

fn filesystem_type(device: &Path) -> Result<Option<String>> {
    let device = device.to_string_lossy();
    let (ok, output) = runner::run_capture(&["blkid", "-o", "value", "-s", "TYPE", device.as_ref()])?;
    let fstype = output.trim();
    Ok((ok && !fstype.is_empty()).then(|| fstype.to_string()))
}

impl Delta for MountDisk {
    const KIND: &'static str = "MountDisk";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![Field::opt("Mountpoint", self.mountpoint.clone())]
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        let Some(mountpoint) = &self.mountpoint else {
            return Ok(None);
        };
        let Ok(device) = fs::canonicalize(&self.device) else {
            return Ok(None);
        };
        let content = fs::read_to_string(MOUNTINFO).with_context(|| format!("error reading {MOUNTINFO}"))?;
        let mounted = is_mounted(&parse_mountinfo(&content)?, &device, mountpoint);
        Ok(mounted.then(|| self.clone()))
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        let Some(mountpoint) = &self.mountpoint else {
            return Ok(());
        };
        let device = wait_for_device(Path::new(&self.device), ctx.cancel(), DEVICE_POLL)?;
        let device_str = device.to_string_lossy().into_owned();

        match filesystem_type(&device)? {
            Some(fstype) => log::debug!("{device_str} already formatted as {fstype}"),
            None => {
                log::info!("formatting {device_str} as {DEFAULT_FILESYSTEM}");
                runner::run(&["mkfs.ext4", "-F", device_str.as_str()])?;
            }
        }

        mkdir_all(Path::new(mountpoint), DEFAULT_DIR_MODE)?;
        log::info!("mounting {device_str} at {mountpoint}");
        runner::run(&["mount", device_str.as_str(), mountpoint.as_str()])?;
        Ok(())
    }
}
