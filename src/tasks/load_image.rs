use super::pull_image::runtime_service;
use crate::files::{DEFAULT_DIR_MODE, mkdir_all};
use crate::runner;
use crate::tasks::ContainerRuntime;
use anyhow::{Context as _, Result};
use assets::Hash;
use converge::{Changes, CloudInitTarget, Context, Delta, Field, LocalTarget, Mode, TaskKey, TaskMap};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

/// An image tarball imported into the container runtime.
#[derive(Debug, Clone, Default)]
pub struct LoadImage {
    pub name: String,
    /// URLs or local paths, tried in order.
    pub sources: Vec<String>,
    pub hash: Option<String>,
    pub runtime: ContainerRuntime,
    /// Directory holding import markers.
    pub marker_dir: PathBuf,
}

impl LoadImage {
    pub fn new(name: &str, sources: Vec<String>, hash: Option<&str>, marker_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            sources,
            hash: hash.map(str::to_string),
            marker_dir: marker_dir.into(),
            ..Default::default()
        }
    }

    fn marker_path(&self) -> PathBuf {
        self.marker_dir.join(format!("image-{}.hash", self.name))
    }

    fn read_marker(&self) -> Result<Option<String>> {
        let path = self.marker_path();
        match fs::read_to_string(&path) {
            Ok(data) => Ok(Some(data.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("error reading {}", path.display())),
        }
    }
}

impl Delta for LoadImage {
    const KIND: &'static str = "LoadImage";

    fn name(&self) -> String {
        self.name.clone()
    }

    fn fields(&self) -> Vec<Field> {
        vec![Field::opt("Hash", self.hash.clone())]
    }

    fn dependencies(&self, tasks: &TaskMap) -> Option<Vec<TaskKey>> {
        Some(runtime_service(self.runtime, tasks).into_iter().collect())
    }

    fn find(&self, _ctx: &Context<'_>) -> Result<Option<Self>> {
        let Some(recorded) = self.read_marker()? else {
            return Ok(None);
        };
        Ok(Some(Self {
            hash: self.hash.as_ref().map(|_| recorded),
            ..self.clone()
        }))
    }

    fn render_local(
        &self,
        target: &LocalTarget,
        ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        let expected = self
            .hash
            .as_deref()
            .map(Hash::parse)
            .transpose()
            .with_context(|| format!("invalid hash for image {}", self.name))?;
        let download = target.cache_dir().join("images").join(format!("{}.tar", self.name));
        let hash = ctx.services.fetcher().fetch(&self.sources, &download, expected.as_ref())?;

        log::info!("importing image {}", self.name);
        runner::run(&self.runtime.import_command(&download.to_string_lossy()))?;

        mkdir_all(&self.marker_dir, DEFAULT_DIR_MODE)?;
        let recorded = self.hash.clone().unwrap_or_else(|| hash.to_string());
        fs::write(self.marker_path(), recorded)
            .with_context(|| format!("error writing import marker for {}", self.name))
    }

    fn render_cloud_init(
        &self,
        target: &CloudInitTarget,
        _ctx: &Context<'_>,
        _actual: Option<&Self>,
        _changes: &Changes,
    ) -> Result<()> {
        let Some(url) = self.sources.first() else {
            anyhow::bail!("image {} has no source", self.name);
        };
        let download = format!("/tmp/nodeup-image-{}.tar", self.name);
        target.add_download_command(Mode::Once, url, &download);
        target.add_command(Mode::Once, self.runtime.import_command(&download));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testing::context;
    use converge::{Services, Target, build_changes};
    use tempfile::TempDir;

    #[test]
    fn test_marker_drives_find() {
        let dir = TempDir::new().unwrap();
        let hash = "sha256:0000000000000000000000000000000000000000000000000000000000000000";
        let task = LoadImage::new("pause", vec!["https://example.com/pause.tar".into()], Some(hash), dir.path());
        let target = Target::Local(LocalTarget::new(dir.path(), dir.path()));
        let tasks = TaskMap::default();
        let services = Services::default();
        let ctx = context(&target, &tasks, &services);

        assert!(task.find(&ctx).unwrap().is_none());

        fs::write(dir.path().join("image-pause.hash"), "sha256:1111\n").unwrap();
        let actual = task.find(&ctx).unwrap().unwrap();
        let changes = build_changes(Some(&actual), &task).unwrap();
        assert!(changes.has("Hash"));

        fs::write(dir.path().join("image-pause.hash"), hash).unwrap();
        let actual = task.find(&ctx).unwrap().unwrap();
        assert!(build_changes(Some(&actual), &task).unwrap().is_empty());
    }

    #[test]
    fn test_cloud_init_imports() {
        let target = CloudInitTarget::new();
        let tasks = TaskMap::default();
        let services = Services::default();
        let wrapped = Target::DryRun(converge::DryRunTarget::new());
        let ctx = context(&wrapped, &tasks, &services);
        let mut task = LoadImage::new("pause", vec!["https://example.com/pause.tar".into()], None, "/var/lib/nodeup");
        task.runtime = ContainerRuntime::Docker;
        task.render_cloud_init(&target, &ctx, None, &Changes::default()).unwrap();
        let runcmd = target.config().runcmd;
        assert!(runcmd.iter().any(|c| c.first().map(String::as_str) == Some("docker")));
    }
}
