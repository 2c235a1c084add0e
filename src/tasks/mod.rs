//! The node task catalog.
//!
//! Every type here implements [`converge::Delta`]: it can observe the host,
//! describe itself as comparable fields, and render changes to the local
//! machine or a cloud-init document.

pub mod apt_source;
pub mod archive;
pub mod bind_mount;
pub mod bootstrap_client;
pub mod chattr;
pub mod file;
pub mod hosts;
pub mod issue_cert;
pub mod kubeconfig;
pub mod load_image;
pub mod mount_disk;
pub mod package;
pub mod prefix;
pub mod pull_image;
pub mod service;
pub mod update_packages;
pub mod user;

pub use apt_source::AptSource;
pub use archive::Archive;
pub use bind_mount::BindMount;
pub use bootstrap_client::BootstrapClient;
pub use chattr::Chattr;
pub use file::{File, FileType};
pub use hosts::{HostRecord, UpdateEtcHosts};
pub use issue_cert::IssueCert;
pub use kubeconfig::KubeConfig;
pub use load_image::LoadImage;
pub use mount_disk::MountDisk;
pub use package::Package;
pub use prefix::Prefix;
pub use pull_image::{ContainerRuntime, PullImage};
pub use service::Service;
pub use update_packages::UpdatePackages;
pub use user::{Group, User};

use anyhow::{Result, bail};
use assets::ResourceRef;
use converge::{Context, Delta, TAG_DEBIAN_FAMILY, TAG_REDHAT_FAMILY, TaskKey, TaskMap};
use std::path::Path;

/// Package family of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    Debian,
    RedHat,
}

pub fn distro(ctx: &Context<'_>) -> Result<Distro> {
    if ctx.has_tag(TAG_DEBIAN_FAMILY) {
        Ok(Distro::Debian)
    } else if ctx.has_tag(TAG_REDHAT_FAMILY) {
        Ok(Distro::RedHat)
    } else {
        bail!("unsupported package system: host has neither {TAG_DEBIAN_FAMILY} nor {TAG_REDHAT_FAMILY}")
    }
}

pub(crate) fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}

/// Keys of every task of one type.
pub(crate) fn keys_of<D: Delta>(tasks: &TaskMap) -> Vec<TaskKey> {
    tasks
        .of_kind::<D>()
        .map(|t| TaskKey::new(D::KIND, t.name()))
        .collect()
}

/// Directory `File` tasks that create an ancestor of `path`.
pub(crate) fn creates_dir_parents(path: &str, tasks: &TaskMap) -> Vec<TaskKey> {
    let path = Path::new(path);
    tasks
        .of_kind::<File>()
        .filter(|f| f.creates_dir())
        .filter(|f| {
            let dir = Path::new(f.path.trim_end_matches('/'));
            path != dir && path.starts_with(dir)
        })
        .map(|f| TaskKey::new(File::KIND, f.name()))
        .collect()
}

/// The producer of a task-dependent resource, when it is in the map.
pub(crate) fn resource_dependency(resource: Option<&ResourceRef>, tasks: &TaskMap) -> Option<TaskKey> {
    let raw = resource?.task_dependency()?;
    match TaskKey::parse(&raw) {
        Ok(key) if tasks.contains(&key) => Some(key),
        Ok(key) => {
            log::warn!("resource depends on unknown task {key}");
            None
        }
        Err(e) => {
            log::warn!("{e}");
            None
        }
    }
}

/// Add `key` when the task exists, warning otherwise.
pub(crate) fn push_if_present(deps: &mut Vec<TaskKey>, key: TaskKey, tasks: &TaskMap) {
    if tasks.contains(&key) {
        deps.push(key);
    } else {
        log::warn!("unable to find task {key}");
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_dir_parents() {
        let mut tasks = TaskMap::default();
        tasks.insert(File::directory("/etc/kubernetes", None)).unwrap();
        tasks.insert(File::directory("/etc/kubernetes/manifests", None)).unwrap();
        tasks.insert(File::directory("/var/lib", None)).unwrap();

        let deps = creates_dir_parents("/etc/kubernetes/manifests/etcd.yaml", &tasks);
        let names: Vec<_> = deps.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, vec!["/etc/kubernetes", "/etc/kubernetes/manifests"]);
        assert!(creates_dir_parents("/etc/kubernetes", &tasks).is_empty());
    }

    #[test]
    fn test_resource_dependency() {
        let mut tasks = TaskMap::default();
        tasks.insert(File::directory("/srv", None)).unwrap();
        let produced = assets::TaskDependentResource::new("File//srv").shared();
        assert_eq!(
            resource_dependency(Some(&produced), &tasks),
            Some(TaskKey::new("File", "/srv"))
        );
        let missing = assets::TaskDependentResource::new("IssueCert/kubelet").shared();
        assert_eq!(resource_dependency(Some(&missing), &tasks), None);
    }
}
