//! Where task renders go.

mod cloudinit;
mod dryrun;
mod inventory;
mod local;

pub use cloudinit::{CloudConfig, CloudConfigFile, CloudInitTarget, Mode};
pub use dryrun::DryRunTarget;
pub use inventory::InventoryTarget;
pub use local::LocalTarget;

use crate::task::TaskMap;
use std::fmt;

/// Stale state a task found and wants removed.
pub trait Deletion: Send + Sync + fmt::Debug {
    /// Kind of the task that found it.
    fn task_kind(&self) -> &str;

    /// What will be deleted, for reports.
    fn item(&self) -> String;

    fn delete(&self, target: &LocalTarget) -> anyhow::Result<()>;
}

/// The active back-end of a run.
#[derive(Debug)]
pub enum Target {
    Local(LocalTarget),
    CloudInit(CloudInitTarget),
    DryRun(DryRunTarget),
    Inventory(InventoryTarget),
}

impl Target {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::CloudInit(_) => "cloud-init",
            Self::DryRun(_) => "dry-run",
            Self::Inventory(_) => "inventory",
        }
    }

    /// Whether renders only get recorded.
    pub fn is_recording(&self) -> bool {
        matches!(self, Self::DryRun(_) | Self::Inventory(_))
    }

    pub fn delete(&self, deletion: Box<dyn Deletion>) -> anyhow::Result<()> {
        match self {
            Self::Local(target) => {
                log::info!("deleting {} {}", deletion.task_kind(), deletion.item());
                deletion.delete(target)
            }
            Self::CloudInit(_) => {
                log::debug!(
                    "ignoring deletion of {} on a fresh machine",
                    deletion.item()
                );
                Ok(())
            }
            Self::DryRun(target) => {
                target.record_deletion(deletion.as_ref());
                Ok(())
            }
            Self::Inventory(target) => {
                target.record_deletion(deletion.as_ref());
                Ok(())
            }
        }
    }

    /// Flush whatever the target accumulated during the run.
    pub fn finish(&self, tasks: &TaskMap) -> anyhow::Result<()> {
        log::debug!("finishing {} target after {} tasks", self.name(), tasks.len());
        match self {
            Self::Local(_) | Self::Inventory(_) => Ok(()),
            Self::CloudInit(target) => target.finish(),
            Self::DryRun(target) => target.finish(),
        }
    }
}
