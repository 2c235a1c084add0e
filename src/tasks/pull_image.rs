use super::args;
use crate::runner;
use crate::tasks::Service;
use anyhow::Result;
use converge::{Changes, CloudInitTarget, Context, Delta, Field, LocalTarget, Mode, TaskKey, TaskMap};
use serde::Deserialize;

/// Namespace kubelet images live in under containerd.
const CONTAINERD_NAMESPACE: &str = "k8s.io";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    #[default]
    Containerd,
    Docker,
}

impl ContainerRuntime {
    /// Name of the systemd service that runs this runtime.
    pub fn service_name(self) -> &'static str {
        match self {
            Self::Containerd => "containerd.service",
            Self::Docker => "docker.service",
        }
    }

    pub fn pull_command(self, image: &str) -> Vec<String> {
        match self {
            Self::Containerd => args(&["ctr", "--namespace", CONTAINERD_NAMESPACE, "images", "pull", &normalize_image(image)]),
            Self::Docker => args(&["docker", "pull", image]),
        }
    }

    pub fn list_command(self) -> Vec<String> {
        match self {
            Self::Containerd => args(&["ctr", "--namespace", CONTAINERD_NAMESPACE, "images", "ls", "-q"]),
            Self::Docker => args(&["docker", "images", "--format", "{{.Repository}}:{{.Tag}}"]),
        }
    }

    pub fn import_command(self, tarball: &str) -> Vec<String> {
        match self {
            Self::Containerd => args(&["ctr", "--namespace", CONTAINERD_NAMESPACE, "images", "import", tarball]),
            Self::Docker => args(&["docker", "load", "-i", tarball]),
        }
    }

    /// Whether `image` appears in the output of [`ContainerRuntime::list_command`].
    pub fn listing_contains(self, listing: &str, image: &str) -> bool {
        let wanted = match self {
            Self::Containerd => normalize_image(image),
            Self::Docker => image.to_string(),
        };
        listing.lines().map(str::trim).any(|line| line == wanted)
    }
}

/// Fully qualify a short image reference the way containerd expects.
///
/// `nginx:1.25` becomes `docker.io/library/nginx:1.25`; references that
/// already name a registry are returned unchanged.
pub fn normalize_image(image: &str) -> String {
    let (first, _) = image.split_once('/').unwrap_or(("", image));
    let has_registry = first.contains('.') || first.contains(':') || first == "localhost";
    let mut out = if has_registry {
        image.to_string()
    } else if image.contains('/') {
        format!("docker.io/{image}")
    } else {
        format!("docker.io/library/{image}")
    };
    let last = out.rsplit('/').next().unwrap_or_default();
    if !last.contains(':') && !last.contains('@') {
        out.push_str(":latest");
    }
    out
}

/// An image pulled into the node's container runtime.
#[derive(Debug, Clone, Default)]
pub struct PullImage {
    /// Image reference.
    pub name: String,
    pub runtime: ContainerRuntime,
}

impl PullImage {
    pub fn new(image: &str, runtime: ContainerRuntime) -> Self {
        Self {
            name: image.to_string(),
            runtime,
        }
    }
}

/// The runtime's service task, if the map has one.
pub(crate) fn runtime_service(runtime: ContainerRuntime, tasks: &TaskMap) -> Option<TaskKey> {
    let key = TaskKey::new(Service::KIND, runtime.service_name());
    tasks.contains(&key).then_some(key)
}

impl Delta for PullImage {
    const KIND: &'static str = "PullImage";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        Vec::new()
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        Some(runtime_service(self.runtime, tasks).into_iter().collect())
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        let (ok, listing) = runner::run_capture(&self.runtime.list_command())?;
        if !ok {
            log::debug!("unable to list images: {}", listing.trim());
            return Ok(None);
        }
        Ok(self.runtime.listing_contains(&listing, &self.name).then(|| self.clone()))
    }

    fn render_local(
        &self,
        _target: &LocalTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        log::info!("pulling image {}", self.name);
        runner::run(&self.runtime.pull_command(&self.name))?;
        Ok(())
    }

    fn render_cloud_init(
        &self,
        target: &CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        target.add_command(Mode::Once, self.runtime.pull_command(&self.name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_image() {
        assert_eq!(normalize_image("nginx:1.25"), "docker.io/library/nginx:1.25");
        assert_eq!(normalize_image("nginx"), "docker.io/library/nginx:latest");
        assert_eq!(normalize_image("calico/node:v3.26"), "docker.io/calico/node:v3.26");
        assert_eq!(normalize_image("registry.k8s.io/pause:3.9"), "registry.k8s.io/pause:3.9");
        assert_eq!(normalize_image("localhost:5000/app"), "localhost:5000/app:latest");
    }

    #[test]
    fn test_commands() {
        assert_eq!(
            ContainerRuntime::Containerd.pull_command("pause:3.9"),
            vec!["ctr", "--namespace", "k8s.io", "images", "pull", "docker.io/library/pause:3.9"]
        );
        assert_eq!(ContainerRuntime::Docker.pull_command("pause:3.9"), vec!["docker", "pull", "pause:3.9"]);
        assert_eq!(ContainerRuntime::Docker.import_command("/tmp/a.tar"), vec!["docker", "load", "-i", "/tmp/a.tar"]);
    }

    #[test]
    fn test_listing_contains() {
        let listing = "docker.io/library/pause:3.9\nregistry.k8s.io/kube-proxy:v1.29.0\n";
        assert!(ContainerRuntime::Containerd.listing_contains(listing, "pause:3.9"));
        assert!(!ContainerRuntime::Containerd.listing_contains(listing, "pause:3.8"));
        assert!(ContainerRuntime::Docker.listing_contains("pause:3.9\n", "pause:3.9"));
    }

    #[test]
    fn test_depends_on_runtime_service() {
        let mut tasks = TaskMap::default();
        tasks.insert(Service::new("containerd.service", "[Unit]\n")).unwrap();
        let task = PullImage::new("pause:3.9", ContainerRuntime::Containerd);
        assert_eq!(
            task.dependencies(&tasks).unwrap(),
            vec![TaskKey::new("Service", "containerd.service")]
        );
        let docker = PullImage::new("pause:3.9", ContainerRuntime::Docker);
        assert!(docker.dependencies(&tasks).unwrap().is_empty());
    }
}
